//! Session ownership and routing.
//!
//! The manager owns every [`Session`]. The default session is a dedicated
//! field rather than a reserved map key, so it exists for the whole manager
//! lifetime and cannot be removed by id.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::Limits;
use crate::error::{Error, Result};
use crate::session::Session;

/// Id under which the default session is addressed.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Keyed collection of sessions with a protected default.
pub struct SessionManager {
    default: Session,
    named: Mutex<HashMap<String, Session>>,
    env_overrides: HashMap<String, String>,
    initial_cwd: PathBuf,
    limits: Limits,
}

impl SessionManager {
    /// Creates a manager whose sessions start in the process working
    /// directory with the process environment.
    pub fn new(limits: Limits) -> Self {
        Self::with_env(limits, HashMap::new())
    }

    /// Creates a manager whose sessions carry the given environment
    /// overrides on top of the process environment.
    pub fn with_env(limits: Limits, env_overrides: HashMap<String, String>) -> Self {
        let initial_cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let default = Session::new(
            DEFAULT_SESSION_ID,
            initial_cwd.clone(),
            &env_overrides,
            limits,
        );
        Self {
            default,
            named: Mutex::new(HashMap::new()),
            env_overrides,
            initial_cwd,
            limits,
        }
    }

    /// Returns the session for `id`, lazily creating it. `None` or an empty
    /// id resolves to the default session.
    pub fn session(&self, id: Option<&str>) -> Session {
        let id = match id {
            None | Some("") => return self.default.clone(),
            Some(id) if id == DEFAULT_SESSION_ID => return self.default.clone(),
            Some(id) => id,
        };
        let mut named = self.named.lock();
        if let Some(session) = named.get(id) {
            return session.clone();
        }
        debug!(session = %id, "creating session");
        let session = Session::new(
            id,
            self.initial_cwd.clone(),
            &self.env_overrides,
            self.limits,
        );
        named.insert(id.to_string(), session.clone());
        session
    }

    /// The default session, always available.
    pub fn default_session(&self) -> Session {
        self.default.clone()
    }

    /// Ids of all live sessions, the default first.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids = vec![self.default.id().to_string()];
        ids.extend(self.named.lock().keys().cloned());
        ids
    }

    /// Removes a named session after killing its background processes.
    ///
    /// # Errors
    /// Returns [`Error::DefaultSessionProtected`] for the default session
    /// and [`Error::UnknownSession`] for an id that was never created.
    pub fn remove_session(&self, id: &str) -> Result<()> {
        if id == DEFAULT_SESSION_ID {
            return Err(Error::DefaultSessionProtected);
        }
        let removed = self.named.lock().remove(id);
        match removed {
            Some(session) => {
                session.kill_all_background();
                info!(session = %id, "session removed");
                Ok(())
            }
            None => Err(Error::UnknownSession(id.to_string())),
        }
    }

    /// Kills background processes across every session. The sessions
    /// themselves stay usable.
    pub fn shutdown(&self) {
        self.default.kill_all_background();
        for session in self.named.lock().values() {
            session.kill_all_background();
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(Limits::default())
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.session_ids())
            .finish_non_exhaustive()
    }
}

/// Shared handle used by tool implementations.
pub type SharedSessions = Arc<SessionManager>;
