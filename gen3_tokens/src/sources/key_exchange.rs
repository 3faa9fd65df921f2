//! A token source that exchanges an API key with the commons

use async_trait::async_trait;
use reqwest::Url;

use super::{response, AsyncTokenSource, TokenRequestError};
use crate::{claims, AccessToken, KeyCredential};

/// Path of the key exchange route, relative to the commons endpoint
pub const ACCESS_TOKEN_PATH: &str = "/user/credentials/cdis/access_token";

/// Field of the key exchange response holding the access token
const ACCESS_TOKEN_FIELD: &str = "access_token";

/// Exchanges a long-lived API key for short-lived access tokens
#[derive(Debug, Clone)]
pub struct KeyExchangeTokenSource {
    client: reqwest::Client,
    token_url: Url,
    credential: KeyCredential,
}

impl KeyExchangeTokenSource {
    /// Constructs a new key exchange source posting to `token_url`
    pub fn new(client: reqwest::Client, token_url: Url, credential: KeyCredential) -> Self {
        Self {
            client,
            token_url,
            credential,
        }
    }

    /// Constructs a new key exchange source for the commons at `endpoint`
    pub fn for_endpoint(
        client: reqwest::Client,
        endpoint: &str,
        credential: KeyCredential,
    ) -> Result<Self, claims::MalformedTokenError> {
        let token_url = Url::parse(&format!("{}{}", endpoint, ACCESS_TOKEN_PATH))
            .map_err(|e| claims::invalid_issuer(endpoint, Some(e.into())))?;
        Ok(Self::new(client, token_url, credential))
    }

    /// The URL that keys are exchanged at
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }
}

#[async_trait]
impl AsyncTokenSource for KeyExchangeTokenSource {
    #[tracing::instrument(err, skip(self), fields(token_url = %self.token_url))]
    async fn request_token(&mut self) -> Result<AccessToken, TokenRequestError> {
        tracing::trace!("exchanging API key for access token");

        let resp = self
            .client
            .post(self.token_url.clone())
            .json(&self.credential)
            .send()
            .await
            .map_err(|e| {
                TokenRequestError::TokenExchange(response::send_failed(self.token_url.clone(), e))
            })?;

        let token = response::read_token_field(resp, ACCESS_TOKEN_FIELD)
            .await
            .map_err(TokenRequestError::TokenExchange)?;

        tracing::info!("received new access token from key exchange");
        Ok(token)
    }
}
