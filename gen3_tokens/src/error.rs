//! Session construction errors

use thiserror::Error;

use crate::{claims::MalformedTokenError, sources::TokenRequestError, ConfigError};

/// A session could not be constructed
#[derive(Debug, Error)]
pub enum AuthError {
    /// The local credential configuration is contradictory or unreadable
    #[error("invalid credential configuration")]
    Config(#[from] ConfigError),

    /// The endpoint could not be derived from the available token
    #[error("unable to determine the commons endpoint")]
    MalformedToken(#[from] MalformedTokenError),

    /// The workspace token service could not provide the bootstrap token
    #[error("unable to bootstrap a session from the workspace token service")]
    BrokerUnavailable(#[source] TokenRequestError),
}
