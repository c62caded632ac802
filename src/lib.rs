//! `authx` is an HTTP client for session-authenticated APIs with transparent,
//! single-flight access-token refresh.
//!
//! Every request carries the stored access token as a bearer credential. When
//! the server answers 401, the client refreshes the token once, no matter how
//! many requests failed concurrently, and replays each failed request exactly
//! once with the new token. If the refresh fails, credentials are cleared and
//! the session-ended signal fires a single time.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use authx::prelude::AuthClient;
//! use serde::Deserialize;
//!
//! #[derive(Debug, Deserialize)]
//! struct Profile {
//!     id: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = AuthClient::builder("https://api.example.com")
//!         .client_name("my-app")
//!         .request_timeout(Duration::from_secs(3))
//!         .refresh_timeout(Duration::from_secs(5))
//!         .try_build()?;
//!
//!     client.establish_session("access-token", "refresh-token", true);
//!
//!     let profile: Profile = client.get("/v1/me").send_json().await?;
//!     println!("profile id={}", profile.id);
//!     Ok(())
//! }
//! ```
//!
//! # Failure Handling
//!
//! - Non-401 failures reach the caller untouched; they never trigger a refresh.
//! - A request is replayed at most once. A 401 on the replay ends the session.
//! - `logout()` and `shutdown()` release requests waiting on a refresh with
//!   [`Error::RefreshCancelled`].

mod augment;
mod classify;
mod client;
mod config;
mod coordinator;
mod credentials;
mod error;
mod metrics;
mod observe;
mod refresh;
mod replay;
mod request;
mod response;
mod session;
mod transport;
mod util;

pub use crate::classify::{Classification, classify, classify_status};
pub use crate::client::{AuthClient, AuthClientBuilder};
pub use crate::config::AuthClientConfig;
pub use crate::credentials::{Credential, CredentialStore, MemoryCredentialStore};
pub use crate::error::{AuthFailureReason, Error, ErrorCode, TransportErrorKind};
pub use crate::metrics::AuthMetricsSnapshot;
pub use crate::observe::AuthObserver;
pub use crate::refresh::{HttpRefreshEndpoint, RefreshEndpoint, RefreshError, RefreshedToken};
pub use crate::request::{Attempt, RequestBuilder};
pub use crate::response::Response;
pub use crate::session::SessionEndReason;
pub use crate::transport::{HyperTransport, Transport};

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        AuthClient, AuthClientBuilder, AuthClientConfig, AuthFailureReason, AuthMetricsSnapshot,
        AuthObserver, Credential, CredentialStore, Error, ErrorCode, MemoryCredentialStore,
        RefreshEndpoint, RefreshedToken, Response, Result, SessionEndReason, Transport,
    };
}
