//! Capability registry
//!
//! Holds the process-wide user binding and the cross-component capabilities
//! that would otherwise require circular imports: the current-user slot, the
//! personalized-file list, and the flush hooks run at logout. Components
//! register their flush hooks at startup; logout runs them all.

use parking_lot::{Mutex, RwLock};

use crate::now_ms;

/// The user currently bound to this process.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user_id: String,
    /// Opaque token minted by upstream; passed through, never inspected.
    pub token: String,
    /// Highest session id upstream had assigned this user at login.
    pub last_upstream_session_id: u64,
    pub logged_in_at_ms: i64,
}

type FlushHook = Box<dyn Fn() + Send + Sync>;

/// Process-wide capability registry.
#[derive(Default)]
pub struct Registry {
    current_user: RwLock<Option<CurrentUser>>,
    personalized_files: RwLock<Vec<String>>,
    flush_hooks: Mutex<Vec<FlushHook>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the current user. Replaces any prior binding.
    pub fn bind_user(
        &self,
        user_id: impl Into<String>,
        token: impl Into<String>,
        last_upstream_session_id: u64,
        personalized_files: Vec<String>,
    ) {
        *self.current_user.write() = Some(CurrentUser {
            user_id: user_id.into(),
            token: token.into(),
            last_upstream_session_id,
            logged_in_at_ms: now_ms(),
        });
        *self.personalized_files.write() = personalized_files;
    }

    pub fn current_user(&self) -> Option<CurrentUser> {
        self.current_user.read().clone()
    }

    pub fn current_user_id(&self) -> Option<String> {
        self.current_user.read().as_ref().map(|u| u.user_id.clone())
    }

    /// Token for upstream calls, if a user is bound.
    pub fn current_token(&self) -> Option<String> {
        self.current_user.read().as_ref().map(|u| u.token.clone())
    }

    pub fn personalized_files(&self) -> Vec<String> {
        self.personalized_files.read().clone()
    }

    pub fn set_personalized_files(&self, files: Vec<String>) {
        *self.personalized_files.write() = files;
    }

    /// Register a hook to run during the logout flush.
    pub fn on_flush(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.flush_hooks.lock().push(Box::new(hook));
    }

    /// Total flush: run every registered hook, then clear the user slot and
    /// the personalized-file list. This is the authoritative reset.
    pub fn flush_all(&self) {
        let hooks = self.flush_hooks.lock();
        for hook in hooks.iter() {
            hook();
        }
        drop(hooks);
        *self.current_user.write() = None;
        self.personalized_files.write().clear();
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("current_user", &self.current_user.read())
            .field("flush_hooks", &self.flush_hooks.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_bind_and_read_user() {
        let registry = Registry::new();
        assert!(registry.current_user().is_none());

        registry.bind_user("u1", "tok", 18, vec!["notes.md".to_string()]);
        let user = registry.current_user().unwrap();
        assert_eq!(user.user_id, "u1");
        assert_eq!(user.last_upstream_session_id, 18);
        assert_eq!(registry.personalized_files(), vec!["notes.md".to_string()]);
    }

    #[test]
    fn test_flush_runs_hooks_and_clears_slot() {
        let registry = Registry::new();
        registry.bind_user("u1", "tok", 0, vec!["a".to_string()]);

        let counter = Arc::new(AtomicUsize::new(0));
        let c1 = counter.clone();
        let c2 = counter.clone();
        registry.on_flush(move || {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        registry.on_flush(move || {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        registry.flush_all();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(registry.current_user().is_none());
        assert!(registry.personalized_files().is_empty());
    }

    #[test]
    fn test_rebind_replaces_user() {
        let registry = Registry::new();
        registry.bind_user("u1", "tok1", 5, vec![]);
        registry.bind_user("u2", "tok2", 9, vec![]);
        let user = registry.current_user().unwrap();
        assert_eq!(user.user_id, "u2");
        assert_eq!(user.last_upstream_session_id, 9);
    }
}
