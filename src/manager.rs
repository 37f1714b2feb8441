use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::SessionOptions;
use crate::connect::{self, AuthBroker};
use crate::error::ConnectError;
use crate::ids::SessionId;
use crate::session::SshSession;

/// One source of passwords, tried in priority order. Providers must answer
/// from the manager's worker thread and must not call back into the
/// manager.
pub trait PasswordProvider: Send + Sync {
    /// `what_for` is "keyPhrase" or "password". `None` passes the question
    /// on to the next provider.
    fn get_password(&self, what_for: &str, prompt: &str) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
pub struct PasswordCacheEntry {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub password: Option<String>,
}

/// Registry of active sessions plus the authentication plumbing: a
/// priority-ordered password provider chain, a per-(user, host, port)
/// password cache, and a single connect worker.
pub struct SessionManager {
    sessions: Mutex<HashMap<SessionId, Arc<SshSession>>>,
    providers: Mutex<BTreeMap<i32, Arc<dyn PasswordProvider>>>,
    password_cache: Mutex<Vec<PasswordCacheEntry>>,
    session_adder: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            providers: Mutex::new(BTreeMap::new()),
            password_cache: Mutex::new(Vec::new()),
            session_adder: Mutex::new(None),
        }
    }

    /// Lower priorities are asked first.
    pub fn register_password_provider(
        &self,
        priority: i32,
        provider: Arc<dyn PasswordProvider>,
    ) {
        self.providers.lock().unwrap().insert(priority, provider);
    }

    pub fn remove_password_provider(&self, priority: i32) -> bool {
        self.providers.lock().unwrap().remove(&priority).is_some()
    }

    /// Walks the provider chain in priority order; the first provider with
    /// an answer wins, exhaustion yields no password.
    pub fn ask_password(&self, what_for: &str, prompt: &str) -> Option<String> {
        let providers: Vec<_> = self.providers.lock().unwrap().values().cloned().collect();
        for provider in providers {
            if let Some(password) = provider.get_password(what_for, prompt) {
                return Some(password);
            }
        }
        None
    }

    /// Connects and authenticates on the manager's worker thread; the new
    /// session is registered before `on_done` fires. The callback must not
    /// call back into the manager.
    pub fn add_session(
        self: &Arc<Self>,
        options: SessionOptions,
        on_done: impl FnOnce(Result<SessionId, ConnectError>) + Send + 'static,
    ) {
        self.join_session_adder();

        let manager = Arc::clone(self);
        *self.session_adder.lock().unwrap() = Some(std::thread::spawn(move || {
            let result = connect::establish(&options, manager.as_ref() as &dyn AuthBroker).map(
                |native| {
                    let id = SessionId::generate();
                    let session = Arc::new(SshSession::new(id.clone(), native));
                    session.start();
                    manager
                        .sessions
                        .lock()
                        .unwrap()
                        .insert(id.clone(), session);
                    id
                },
            );

            match &result {
                Ok(id) => log::info!("session '{}' connected to {}", id.value(), options.host),
                Err(e) => log::error!("failed to connect to {}: {e}", options.host),
            }
            on_done(result);
        }));
    }

    /// Waits for an in-flight `add_session` to settle.
    pub fn join_session_adder(&self) {
        let handle = self.session_adder.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    pub fn session(&self, id: &SessionId) -> Option<Arc<SshSession>> {
        self.sessions.lock().unwrap().get(id).cloned()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }

    /// Stops the session and drops it from the registry.
    pub fn remove_session(&self, id: &SessionId) -> bool {
        let session = self.sessions.lock().unwrap().remove(id);
        match session {
            Some(session) => {
                session.stop();
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let sessions: Vec<_> = {
            let mut map = self.sessions.lock().unwrap();
            map.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.stop();
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthBroker for SessionManager {
    fn ask_password(&self, what_for: &str, prompt: &str) -> Option<String> {
        SessionManager::ask_password(self, what_for, prompt)
    }

    fn cached_password(&self, user: &str, host: &str, port: u16) -> Option<String> {
        let cache = self.password_cache.lock().unwrap();
        cache
            .iter()
            .find(|entry| {
                entry.user.as_deref() == Some(user)
                    && entry.host == host
                    && entry.port == Some(port)
            })
            .and_then(|entry| entry.password.clone())
    }

    fn store_password(&self, user: &str, host: &str, port: u16, password: &str) {
        self.password_cache.lock().unwrap().push(PasswordCacheEntry {
            user: Some(user.to_string()),
            host: host.to_string(),
            port: Some(port),
            password: Some(password.to_string()),
        });
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.join_session_adder();
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider {
        answer: Option<&'static str>,
        asked: Mutex<Vec<String>>,
    }

    impl FixedProvider {
        fn new(answer: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                answer,
                asked: Mutex::new(Vec::new()),
            })
        }
    }

    impl PasswordProvider for FixedProvider {
        fn get_password(&self, what_for: &str, _prompt: &str) -> Option<String> {
            self.asked.lock().unwrap().push(what_for.to_string());
            self.answer.map(str::to_string)
        }
    }

    #[test]
    fn provider_chain_is_walked_in_priority_order() {
        let manager = SessionManager::new();
        let declining = FixedProvider::new(None);
        let answering = FixedProvider::new(Some("secret"));
        let shadowed = FixedProvider::new(Some("never"));

        manager.register_password_provider(0, declining.clone());
        manager.register_password_provider(1, answering.clone());
        manager.register_password_provider(2, shadowed.clone());

        assert_eq!(
            manager.ask_password("password", "Password: "),
            Some("secret".to_string())
        );
        assert_eq!(declining.asked.lock().unwrap().len(), 1);
        assert_eq!(answering.asked.lock().unwrap().len(), 1);
        assert!(shadowed.asked.lock().unwrap().is_empty());
    }

    #[test]
    fn exhausted_chain_yields_no_password() {
        let manager = SessionManager::new();
        manager.register_password_provider(0, FixedProvider::new(None));
        assert_eq!(manager.ask_password("password", "Password: "), None);
    }

    #[test]
    fn password_cache_matches_on_user_host_and_port() {
        let manager = SessionManager::new();
        manager.store_password("u", "h", 22, "pw");

        assert_eq!(manager.cached_password("u", "h", 22), Some("pw".into()));
        assert_eq!(manager.cached_password("u", "h", 23), None);
        assert_eq!(manager.cached_password("v", "h", 22), None);
    }

    #[test]
    fn removing_an_unknown_provider_reports_false() {
        let manager = SessionManager::new();
        manager.register_password_provider(5, FixedProvider::new(None));
        assert!(manager.remove_password_provider(5));
        assert!(!manager.remove_password_provider(5));
    }
}
