use std::sync::{Arc, Mutex};

use crate::util::lock_unpoisoned;

/// Storage for the session's access and refresh tokens.
///
/// Persistence (cookies, keychains, files) belongs to the implementor. The
/// client only reads and writes through these methods.
pub trait CredentialStore: Send + Sync {
    fn access_token(&self) -> Option<String>;

    fn refresh_token(&self) -> Option<String>;

    /// `persistent` mirrors the "remember me" choice made at login.
    fn set_access_token(&self, token: &str, persistent: bool);

    /// Written at login and whenever the refresh endpoint rotates the
    /// refresh token.
    fn set_refresh_token(&self, token: &str, persistent: bool);

    fn clear_all(&self);
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credential {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Credential")
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl Credential {
    pub fn new(access_token: impl Into<String>, refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: Some(access_token.into()),
            refresh_token: Some(refresh_token.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }
}

#[derive(Debug, Default)]
struct MemoryCredentialState {
    credential: Credential,
    persistent: bool,
}

/// Process-local store. Nothing survives a restart.
#[derive(Clone, Debug, Default)]
pub struct MemoryCredentialStore {
    state: Arc<Mutex<MemoryCredentialState>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: Credential) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryCredentialState {
                credential,
                persistent: false,
            })),
        }
    }

    pub fn snapshot(&self) -> Credential {
        lock_unpoisoned(&self.state).credential.clone()
    }

    pub fn is_persistent(&self) -> bool {
        lock_unpoisoned(&self.state).persistent
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn access_token(&self) -> Option<String> {
        lock_unpoisoned(&self.state).credential.access_token.clone()
    }

    fn refresh_token(&self) -> Option<String> {
        lock_unpoisoned(&self.state).credential.refresh_token.clone()
    }

    fn set_access_token(&self, token: &str, persistent: bool) {
        let mut state = lock_unpoisoned(&self.state);
        state.credential.access_token = Some(token.to_owned());
        state.persistent = persistent;
    }

    fn set_refresh_token(&self, token: &str, persistent: bool) {
        let mut state = lock_unpoisoned(&self.state);
        state.credential.refresh_token = Some(token.to_owned());
        state.persistent = persistent;
    }

    fn clear_all(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.credential = Credential::default();
        state.persistent = false;
    }
}
