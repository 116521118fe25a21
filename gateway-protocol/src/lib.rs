//! Wire types shared by the gateway and its clients, plus the codec for the
//! agent's marker-prefixed stdout protocol.

mod codec;
mod event;
mod messages;

pub use codec::DecodeError;
pub use codec::DecodedLine;
pub use codec::EVENT_MARKER;
pub use codec::decode_line;
pub use codec::encode_event;
pub use codec::encode_line;
pub use event::AgentEvent;
pub use event::EventKind;
pub use messages::ClientMessage;
pub use messages::ControlMessage;
pub use messages::ExitReport;
pub use messages::ExitStatusKind;
pub use messages::FrameError;
pub use messages::ServerMessage;
pub use messages::TaskParams;
