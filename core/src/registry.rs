//! Process-wide table of active sessions.
//!
//! Every operation runs under one lock, so two concurrent starts for the same
//! id can never both succeed. Entries go through two phases: a start first
//! *reserves* its resolved id, before any transport exists, and later
//! *commits* the running session. Reservations are invisible to lookups and
//! stops, and are released automatically when the start fails.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::application::Session;
use crate::domain::{SessionId, SessionInfo};
use crate::error::{Error, Result};

enum Entry {
    Reserved(Uuid),
    Active(Arc<Session>),
}

#[derive(Default)]
struct Inner {
    entries: HashMap<SessionId, Entry>,
    /// Caller-facing target ids that resolved to a different session id.
    aliases: HashMap<SessionId, SessionId>,
}

impl Inner {
    fn is_taken(&self, id: &SessionId) -> bool {
        self.entries.contains_key(id) || self.aliases.contains_key(id)
    }

    fn canonical<'a>(&'a self, id: &'a SessionId) -> &'a SessionId {
        self.aliases.get(id).unwrap_or(id)
    }

    fn active(&self, id: &SessionId) -> Option<&Arc<Session>> {
        match self.entries.get(self.canonical(id)) {
            Some(Entry::Active(session)) => Some(session),
            _ => None,
        }
    }

    fn remove(&mut self, id: &SessionId) -> Option<Arc<Session>> {
        let removed = match self.entries.remove(id) {
            Some(Entry::Active(session)) => session,
            Some(reserved) => {
                self.entries.insert(id.clone(), reserved);
                return None;
            }
            None => return None,
        };
        self.aliases.retain(|_, target| target != id);
        Some(removed)
    }
}

/// Registry of forwarding sessions keyed by `(namespace, pod, port)`.
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a running session. Fails if its id is already taken.
    pub fn register(&self, session: Arc<Session>) -> Result<()> {
        let mut inner = self.inner.lock();
        let id = session.id().clone();
        if inner.is_taken(&id) {
            return Err(Error::AlreadyExists(id.to_string()));
        }
        inner.entries.insert(id, Entry::Active(session));
        Ok(())
    }

    /// Fail with `AlreadyExists` if `id` names a session, alias or reservation.
    pub fn ensure_available(&self, id: &SessionId) -> Result<()> {
        if self.inner.lock().is_taken(id) {
            return Err(Error::AlreadyExists(id.to_string()));
        }
        Ok(())
    }

    /// Claim `id`, and optionally an alias for it, for a start in progress.
    pub fn reserve(self: &Arc<Self>, id: SessionId, alias: Option<SessionId>) -> Result<Reservation> {
        let mut inner = self.inner.lock();
        if inner.is_taken(&id) {
            return Err(Error::AlreadyExists(id.to_string()));
        }
        let alias = alias.filter(|alias| *alias != id);
        if let Some(alias) = &alias {
            if inner.is_taken(alias) {
                return Err(Error::AlreadyExists(alias.to_string()));
            }
            inner.aliases.insert(alias.clone(), id.clone());
        }

        let token = Uuid::new_v4();
        inner.entries.insert(id.clone(), Entry::Reserved(token));
        debug!(session = %id, "session id reserved");
        Ok(Reservation {
            registry: Arc::clone(self),
            id,
            alias,
            token,
            committed: false,
        })
    }

    /// Find an active session by its id or by the target id it was started with.
    pub fn lookup(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.inner.lock().active(id).cloned()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.lock().active(id).is_some()
    }

    /// Remove a session and its aliases. Unknown ids are a no-op.
    pub fn unregister(&self, id: &SessionId) -> Option<Arc<Session>> {
        let mut inner = self.inner.lock();
        let canonical = inner.canonical(id).clone();
        inner.remove(&canonical)
    }

    /// Remove `session` only if it is still the one registered under its id.
    pub fn remove_session(&self, session: &Arc<Session>) -> bool {
        let mut inner = self.inner.lock();
        let registered = matches!(
            inner.entries.get(session.id()),
            Some(Entry::Active(current)) if Arc::ptr_eq(current, session)
        );
        registered && inner.remove(session.id()).is_some()
    }

    /// Every active session, in id order.
    pub fn active_sessions(&self) -> Vec<Arc<Session>> {
        let mut sessions: Vec<_> = self
            .inner
            .lock()
            .entries
            .values()
            .filter_map(|entry| match entry {
                Entry::Active(session) => Some(Arc::clone(session)),
                Entry::Reserved(_) => None,
            })
            .collect();
        sessions.sort_by(|a, b| a.id().cmp(b.id()));
        sessions
    }

    /// Snapshots of every active session, in id order.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.active_sessions()
            .iter()
            .map(|session| session.info())
            .collect()
    }

    /// Number of active sessions.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .entries
            .values()
            .filter(|entry| matches!(entry, Entry::Active(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A claimed session id. Dropping it without [`commit`](Self::commit)
/// releases the id and its alias.
pub struct Reservation {
    registry: Arc<SessionRegistry>,
    id: SessionId,
    alias: Option<SessionId>,
    token: Uuid,
    committed: bool,
}

impl Reservation {
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Make `session` visible under the reserved id.
    pub fn commit(mut self, session: Arc<Session>) {
        let mut inner = self.registry.inner.lock();
        inner.entries.insert(self.id.clone(), Entry::Active(session));
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut inner = self.registry.inner.lock();
        if matches!(inner.entries.get(&self.id), Some(Entry::Reserved(token)) if *token == self.token)
        {
            inner.entries.remove(&self.id);
        }
        if let Some(alias) = &self.alias {
            if inner.aliases.get(alias) == Some(&self.id) {
                inner.aliases.remove(alias);
            }
        }
        debug!(session = %self.id, "reservation released");
    }
}
