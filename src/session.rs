use crate::queue::ConflictAction;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Opaque id for one connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSettings {
    /// Remembered "apply to all" answer, used to seed new queues.
    pub conflict_action: Option<ConflictAction>,
}

#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<SessionId, SessionSettings>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self) -> SessionId {
        let id = SessionId(Uuid::new_v4());
        self.sessions.lock().insert(id, SessionSettings::default());
        id
    }

    pub fn get(&self, id: SessionId) -> Option<SessionSettings> {
        self.sessions.lock().get(&id).copied()
    }

    /// Returns false when the session is gone.
    pub fn set_conflict_action(&self, id: SessionId, action: Option<ConflictAction>) -> bool {
        match self.sessions.lock().get_mut(&id) {
            Some(settings) => {
                settings.conflict_action = action;
                true
            }
            None => false,
        }
    }

    pub fn discard(&self, id: SessionId) {
        self.sessions.lock().remove(&id);
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
