//! A token source backed by the workspace token service
//!
//! Inside a workspace, the token service running in the workspace's namespace
//! issues access tokens on behalf of the already-authenticated user. No local
//! secret is involved.

use async_trait::async_trait;
use reqwest::Url;

use super::{response, AsyncTokenSource, TokenRequestError};
use crate::{AccessToken, ConfigError, IdpName};

/// Field of the token service response holding the access token
const TOKEN_FIELD: &str = "token";

/// The cluster-local address of the workspace token service in `namespace`
pub fn broker_url(namespace: &str) -> String {
    format!(
        "http://workspace-token-service.{}.svc.cluster.local",
        namespace
    )
}

/// Fetches access tokens from the workspace token service
#[derive(Debug, Clone)]
pub struct BrokerTokenSource {
    client: reqwest::Client,
    base_url: Url,
    idp: Option<IdpName>,
}

impl BrokerTokenSource {
    /// Constructs a source for the token service in `namespace`
    pub fn for_namespace(
        client: reqwest::Client,
        namespace: &str,
        idp: Option<IdpName>,
    ) -> Result<Self, ConfigError> {
        let base_url = Url::parse(&broker_url(namespace)).map_err(|_| {
            ConfigError::InvalidNamespace {
                namespace: namespace.to_owned(),
            }
        })?;
        Ok(Self::new(client, base_url, idp))
    }

    /// Constructs a source for the token service at `base_url`
    pub fn new(client: reqwest::Client, base_url: Url, idp: Option<IdpName>) -> Self {
        Self {
            client,
            base_url,
            idp,
        }
    }

    /// The identity provider tokens are requested for
    pub fn idp(&self) -> Option<&IdpName> {
        self.idp.as_ref()
    }

    /// The base URL of the token service
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// The URL tokens are fetched from, including the identity provider hint
    pub fn token_url(&self) -> Url {
        let mut url = self.route("token/");
        if let Some(idp) = &self.idp {
            url.query_pairs_mut().append_pair("idp", idp.as_str());
        }
        url
    }

    fn route(&self, route: &str) -> Url {
        let mut url = self.base_url.clone();
        let path = format!("{}/{}", url.path().trim_end_matches('/'), route);
        url.set_path(&path);
        url.set_query(None);
        url
    }

    /// Lists the identity providers the token service can issue tokens for
    ///
    /// The response is returned as the service sent it.
    #[tracing::instrument(err, skip(self), fields(base_url = %self.base_url))]
    pub async fn list_idps(&self) -> Result<serde_json::Value, TokenRequestError> {
        let url = self.route("external_oidc");

        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| TokenRequestError::BrokerUnavailable(response::send_failed(url, e)))?;

        response::read_json(resp)
            .await
            .map_err(TokenRequestError::BrokerUnavailable)
    }
}

#[async_trait]
impl AsyncTokenSource for BrokerTokenSource {
    #[tracing::instrument(err, skip(self), fields(base_url = %self.base_url, idp = ?self.idp))]
    async fn request_token(&mut self) -> Result<AccessToken, TokenRequestError> {
        let url = self.token_url();
        tracing::trace!("requesting token from workspace token service");

        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| TokenRequestError::BrokerUnavailable(response::send_failed(url, e)))?;

        let token = response::read_token_field(resp, TOKEN_FIELD)
            .await
            .map_err(TokenRequestError::BrokerUnavailable)?;

        tracing::info!("received new access token from workspace token service");
        Ok(token)
    }
}
