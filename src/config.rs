use std::time::Duration;

use serde::Deserialize;

use crate::classify::DEFAULT_AUTH_FAILURE_STATUS;
use crate::coordinator::DEFAULT_REFRESH_TIMEOUT;
use crate::refresh::DEFAULT_REFRESH_PATH;
use crate::transport::DEFAULT_MAX_RESPONSE_BODY_BYTES;

pub(crate) const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_CLIENT_NAME: &str = "authx";

/// File- or env-loadable settings, applied with
/// [`AuthClientBuilder::config`](crate::AuthClientBuilder::config).
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct AuthClientConfig {
    pub client_name: String,
    pub request_timeout_ms: u64,
    pub refresh_timeout_ms: u64,
    pub refresh_path: String,
    pub persist_refreshed_token: bool,
    pub max_response_body_bytes: usize,
    pub auth_failure_statuses: Vec<u16>,
}

impl Default for AuthClientConfig {
    fn default() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT.as_millis() as u64,
            refresh_timeout_ms: DEFAULT_REFRESH_TIMEOUT.as_millis() as u64,
            refresh_path: DEFAULT_REFRESH_PATH.to_owned(),
            persist_refreshed_token: true,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            auth_failure_statuses: vec![DEFAULT_AUTH_FAILURE_STATUS],
        }
    }
}

impl AuthClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }
}
