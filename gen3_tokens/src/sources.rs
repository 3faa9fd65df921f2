//! Token sources

use async_trait::async_trait;
use thiserror::Error;

use crate::AccessToken;

pub mod broker;
pub mod key_exchange;
mod response;

pub use broker::BrokerTokenSource;
pub use key_exchange::KeyExchangeTokenSource;
pub use response::{InvalidTokenResponse, ResponseFault};

/// An asynchronous source for access tokens
#[async_trait]
pub trait AsyncTokenSource: Send + Sync {
    /// Requests a fresh access token from the source
    async fn request_token(&mut self) -> Result<AccessToken, TokenRequestError>;
}

/// An error while attempting to obtain an access token
#[derive(Debug, Error)]
pub enum TokenRequestError {
    /// The commons refused to exchange the API key, or answered unusably
    #[error("unable to exchange API key for an access token")]
    TokenExchange(#[source] InvalidTokenResponse),

    /// The workspace token service refused the request, or answered unusably
    #[error("workspace token service unavailable")]
    BrokerUnavailable(#[source] InvalidTokenResponse),

    /// The issued token cannot be sent in an `Authorization` header
    #[error("issued access token contains characters not allowed in a header")]
    UnusableToken,
}

impl TokenRequestError {
    /// The offending response, if the error came from one
    pub fn response(&self) -> Option<&InvalidTokenResponse> {
        match self {
            Self::TokenExchange(r) | Self::BrokerUnavailable(r) => Some(r),
            Self::UnusableToken => None,
        }
    }
}

/// The token source selected for a session
#[derive(Debug)]
pub enum TokenSource {
    /// Exchanges an API key with the commons
    KeyExchange(KeyExchangeTokenSource),
    /// Fetches tokens from the workspace token service
    Broker(BrokerTokenSource),
}

#[async_trait]
impl AsyncTokenSource for TokenSource {
    async fn request_token(&mut self) -> Result<AccessToken, TokenRequestError> {
        match self {
            Self::KeyExchange(source) => source.request_token().await,
            Self::Broker(source) => source.request_token().await,
        }
    }
}

impl From<KeyExchangeTokenSource> for TokenSource {
    fn from(source: KeyExchangeTokenSource) -> Self {
        Self::KeyExchange(source)
    }
}

impl From<BrokerTokenSource> for TokenSource {
    fn from(source: BrokerTokenSource) -> Self {
        Self::Broker(source)
    }
}
