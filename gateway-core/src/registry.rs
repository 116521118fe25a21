use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use chrono::DateTime;
use chrono::Utc;

use crate::error::AuthError;
use crate::ids::ConnectionId;
use crate::ids::UserId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredSession {
    pub connection_id: ConnectionId,
    pub connected_at: DateTime<Utc>,
}

/// At most one authenticated socket per user.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: Mutex<HashMap<UserId, RegisteredSession>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `connection_id` to `user_id`, rejecting the new connection when
    /// another one is already live for that user.
    pub fn register(&self, user_id: UserId, connection_id: ConnectionId) -> Result<(), AuthError> {
        let mut sessions = self.lock();
        if sessions.contains_key(&user_id) {
            return Err(AuthError::SessionAlreadyActive);
        }
        sessions.insert(
            user_id,
            RegisteredSession {
                connection_id,
                connected_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Removes the entry only if it still belongs to `connection_id`.
    pub fn unregister(&self, user_id: &UserId, connection_id: ConnectionId) -> bool {
        let mut sessions = self.lock();
        match sessions.get(user_id) {
            Some(entry) if entry.connection_id == connection_id => {
                sessions.remove(user_id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, user_id: &UserId) -> Option<RegisteredSession> {
        self.lock().get(user_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, RegisteredSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn second_connection_for_user_is_rejected() {
        let registry = ConnectionRegistry::new();
        let first = ConnectionId::new();
        registry
            .register(UserId::new("alice"), first)
            .expect("first registration");
        assert_eq!(
            registry.register(UserId::new("alice"), ConnectionId::new()),
            Err(AuthError::SessionAlreadyActive)
        );
        assert_eq!(
            registry
                .get(&UserId::new("alice"))
                .map(|entry| entry.connection_id),
            Some(first)
        );
    }

    #[test]
    fn different_users_do_not_conflict() {
        let registry = ConnectionRegistry::new();
        registry
            .register(UserId::new("alice"), ConnectionId::new())
            .expect("alice");
        registry
            .register(UserId::new("bob"), ConnectionId::new())
            .expect("bob");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unregister_ignores_stale_connection_ids() {
        let registry = ConnectionRegistry::new();
        let user = UserId::new("alice");
        let live = ConnectionId::new();
        registry.register(user.clone(), live).expect("register");

        assert!(!registry.unregister(&user, ConnectionId::new()));
        assert!(registry.get(&user).is_some());

        assert!(registry.unregister(&user, live));
        assert!(registry.is_empty());
        registry
            .register(user, ConnectionId::new())
            .expect("slot is free again");
    }
}
