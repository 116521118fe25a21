use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use base64::Engine;
use rand::RngCore;
use rand::rng;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::AuthError;
use crate::ids::UserId;

const TOKEN_ENTROPY_BYTES: usize = 32;

/// A single-use credential that lets a socket prove which user it belongs to.
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub value: String,
    pub user_id: UserId,
    pub issued_at: Instant,
    pub expires_at: Instant,
    pub consumed: bool,
}

impl AuthToken {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Shared token table. `validate` checks and consumes under one lock, so
/// concurrent callers presenting the same value see exactly one success.
#[derive(Debug)]
pub struct TokenIssuer {
    ttl: Duration,
    tokens: Mutex<HashMap<String, AuthToken>>,
}

impl TokenIssuer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn issue(&self, user_id: UserId) -> AuthToken {
        let mut buf = [0u8; TOKEN_ENTROPY_BYTES];
        rng().fill_bytes(&mut buf);
        let value = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf);
        let issued_at = Instant::now();
        let token = AuthToken {
            value: value.clone(),
            user_id,
            issued_at,
            expires_at: issued_at + self.ttl,
            consumed: false,
        };
        self.lock().insert(value, token.clone());
        debug!(user_id = %token.user_id, "issued socket token");
        token
    }

    pub fn validate(&self, value: &str) -> Result<UserId, AuthError> {
        let now = Instant::now();
        let mut tokens = self.lock();
        let Some(token) = tokens.get_mut(value) else {
            return Err(AuthError::TokenNotFound);
        };
        if token.is_expired(now) {
            tokens.remove(value);
            return Err(AuthError::TokenExpired);
        }
        if token.consumed {
            return Err(AuthError::TokenAlreadyConsumed);
        }
        token.consumed = true;
        Ok(token.user_id.clone())
    }

    /// Drops every token past its expiry. Consumed tokens are kept until then
    /// so a replay is reported as `TokenAlreadyConsumed`.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut tokens = self.lock();
        let before = tokens.len();
        tokens.retain(|_, token| !token.is_expired(now));
        before - tokens.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let issuer = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = issuer.sweep();
                        if evicted > 0 {
                            debug!(evicted, "swept expired socket tokens");
                        }
                    }
                }
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AuthToken>> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
