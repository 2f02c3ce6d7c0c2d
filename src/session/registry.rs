use super::{ClientSession, SessionId, SessionShared};
use std::collections::HashMap;
use std::sync::{Mutex, Weak};

/// Sessions opened by one client that have not ended yet.
///
/// Holds weak references only: dropping every handle to a session still
/// releases it.
#[derive(Default)]
pub(crate) struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, Weak<SessionShared>>>,
}

impl SessionRegistry {
    pub(crate) fn register(&self, id: SessionId, session: Weak<SessionShared>) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.insert(id, session);
    }

    pub(crate) fn unregister(&self, id: &SessionId) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.remove(id);
    }

    /// Live sessions; entries whose handles are all gone are pruned.
    pub(crate) fn live(&self) -> Vec<ClientSession> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.retain(|_, weak| weak.strong_count() > 0);
        sessions
            .values()
            .filter_map(Weak::upgrade)
            .map(ClientSession::from_shared)
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        let sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        sessions.values().filter(|weak| weak.strong_count() > 0).count()
    }
}
