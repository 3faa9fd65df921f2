//! Credentials and access tokens for Gen3 data commons
//!
//! A commons accepts requests signed with a short-lived access token. Those
//! tokens come from one of two places:
//!
//! * an API key, downloaded from the commons as a JSON credential file and
//!   exchanged with the commons for access tokens, or
//! * the workspace token service, which issues tokens on behalf of a user
//!   already signed in to a workspace, without any local secret.
//!
//! [`AuthConfig`] describes where to look. [`AuthSession`] resolves it into a
//! token source, derives the commons endpoint from the credentials, and signs
//! requests with a cached token. A token rejected with `401 Unauthorized` or
//! `403 Forbidden` is dropped, and the rejected request may be replayed once
//! with a fresh one.
//!
//! ```no_run
//! use gen3_tokens::{AuthConfig, AuthSession};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AuthConfig::from_env().with_refresh_file("my-commons");
//! let session = AuthSession::new(config).await?;
//!
//! let client = reqwest::Client::new();
//! let request = client
//!     .get(format!("{}/user/user", session.endpoint()))
//!     .build()?;
//!
//! let response = session.execute(&client, request).await?;
//! println!("{}", response.text().await?);
//! # Ok(())
//! # }
//! ```
//!
//! Tokens are never logged in full. [`ApiKey`] and [`AccessToken`] only
//! reveal a short prefix when formatted with the alternate flag.
//!
//! # Features
//!
//! * `rustls-tls` (default): use `rustls` for HTTPS connections.
//! * `default-tls`: use the platform TLS implementation instead.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod claims;
mod config;
pub mod credentials;
mod error;
pub mod session;
pub mod sources;

pub use braids::*;
pub use claims::MalformedTokenError;
pub use config::{AuthConfig, API_KEY_VAR, CREDENTIALS_DIR_NAME, DEFAULT_NAMESPACE, NAMESPACE_VAR};
pub use credentials::{BrokerMode, ConfigError, CredentialKind, CredentialSource, KeyCredential};
pub use error::AuthError;
pub use session::{AuthSession, ResponseAction, ResponseHistory, SendError, SessionState};
pub use sources::{AsyncTokenSource, TokenRequestError, TokenSource};
