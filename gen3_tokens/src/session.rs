//! Authenticated sessions against a commons

use std::future::Future;

use bytes::{BufMut, Bytes, BytesMut};
use reqwest::{
    header::{self, HeaderMap, HeaderValue},
    Request, Response, StatusCode, Url,
};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::{
    claims,
    credentials::{self, CredentialKind, CredentialSource},
    sources::{AsyncTokenSource, BrokerTokenSource, KeyExchangeTokenSource, TokenRequestError, TokenSource},
    AccessToken, AuthConfig, AuthError,
};

/// Whether a session currently holds an access token
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// No access token is cached; the next signing attempt fetches one
    Unauthenticated,
    /// An access token is cached and will be used until it is rejected
    Authenticated,
}

#[derive(Debug)]
struct CachedToken {
    token: AccessToken,
    authorization: HeaderValue,
}

impl CachedToken {
    fn new(token: AccessToken) -> Result<Self, TokenRequestError> {
        let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
        header_value.put_slice(b"bearer ");
        header_value.put_slice(token.as_str().as_bytes());
        let mut authorization = HeaderValue::from_maybe_shared(header_value.freeze())
            .map_err(|_| TokenRequestError::UnusableToken)?;
        authorization.set_sensitive(true);
        Ok(Self {
            token,
            authorization,
        })
    }
}

#[derive(Debug)]
struct TokenCache<S> {
    source: S,
    current: Option<CachedToken>,
}

/// An authenticated session against a single commons
///
/// The session signs outgoing requests with a cached access token, fetching
/// one from its token source when none is cached. When a signed request is
/// rejected with `401 Unauthorized` or `403 Forbidden`, the cached token is
/// dropped and the request may be replayed once with a fresh token.
///
/// Fetching, invalidating, and signing share one lock, held while a token is
/// being fetched. Concurrent callers that find the cache empty wait for the
/// single fetch in flight rather than starting their own.
#[derive(Debug)]
pub struct AuthSession<S = TokenSource> {
    endpoint: String,
    cache: Mutex<TokenCache<S>>,
}

impl AuthSession<TokenSource> {
    /// Constructs a session using a default HTTP client
    pub async fn new(config: AuthConfig) -> Result<Self, AuthError> {
        Self::with_client(config, reqwest::Client::new()).await
    }

    /// Constructs a session that makes its token requests with `client`
    ///
    /// Credentials are resolved and the endpoint derived immediately. In
    /// broker mode this costs one request to the workspace token service,
    /// and the token obtained is kept for the first signed request.
    #[tracing::instrument(err, skip(config, client), fields(namespace = config.namespace()))]
    pub async fn with_client(config: AuthConfig, client: reqwest::Client) -> Result<Self, AuthError> {
        match credentials::resolve(&config).await? {
            CredentialSource::Key(credential) => {
                let endpoint = credential.endpoint()?;
                check_expected_endpoint(&config, &endpoint);

                let source = KeyExchangeTokenSource::for_endpoint(client, &endpoint, credential)?;
                tracing::info!(%endpoint, "session will exchange API key for access tokens");
                Ok(Self::from_source(endpoint, source.into()))
            }
            CredentialSource::Broker(mode) => {
                let mut source = match config.broker_url() {
                    Some(url) => BrokerTokenSource::new(client, url.clone(), mode.idp),
                    None => BrokerTokenSource::for_namespace(client, &mode.namespace, mode.idp)?,
                };

                let token = source
                    .request_token()
                    .await
                    .map_err(AuthError::BrokerUnavailable)?;
                let endpoint = claims::endpoint_from_token(token.as_str())?;
                check_expected_endpoint(&config, &endpoint);

                let bootstrap = CachedToken::new(token).map_err(AuthError::BrokerUnavailable)?;
                tracing::info!(%endpoint, "session will use workspace token service");

                Ok(Self {
                    endpoint,
                    cache: Mutex::new(TokenCache {
                        source: source.into(),
                        current: Some(bootstrap),
                    }),
                })
            }
        }
    }

    /// The kind of credential backing this session
    pub async fn credential_kind(&self) -> CredentialKind {
        match self.cache.lock().await.source {
            TokenSource::KeyExchange(_) => CredentialKind::ApiKey,
            TokenSource::Broker(_) => CredentialKind::Broker,
        }
    }
}

fn check_expected_endpoint(config: &AuthConfig, endpoint: &str) {
    if let Some(expected) = config.endpoint() {
        if expected.trim_end_matches('/') != endpoint {
            tracing::warn!(
                expected,
                endpoint,
                "configured endpoint differs from the one named by the credentials; using the credentials"
            );
        }
    }
}

impl<S: AsyncTokenSource> AuthSession<S> {
    /// Constructs a session for `endpoint` that draws tokens from `source`
    ///
    /// The session starts out unauthenticated.
    pub fn from_source(endpoint: impl Into<String>, source: S) -> Self {
        Self {
            endpoint: endpoint.into(),
            cache: Mutex::new(TokenCache {
                source,
                current: None,
            }),
        }
    }

    /// The base endpoint of the commons this session talks to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Whether an access token is currently cached
    pub async fn state(&self) -> SessionState {
        if self.cache.lock().await.current.is_some() {
            SessionState::Authenticated
        } else {
            SessionState::Unauthenticated
        }
    }

    /// Gets the cached access token, fetching one if none is cached
    pub async fn access_token(&self) -> Result<AccessToken, TokenRequestError> {
        self.with_current(|current| current.token.clone()).await
    }

    async fn authorization(&self) -> Result<HeaderValue, TokenRequestError> {
        self.with_current(|current| current.authorization.clone()).await
    }

    async fn with_current<T>(
        &self,
        f: impl FnOnce(&CachedToken) -> T,
    ) -> Result<T, TokenRequestError> {
        let mut cache = self.cache.lock().await;

        if let Some(current) = &cache.current {
            return Ok(f(current));
        }

        tracing::debug!("no cached access token, requesting one");
        let token = cache.source.request_token().await?;
        let current = cache.current.insert(CachedToken::new(token)?);
        Ok(f(current))
    }

    /// Drops the cached access token
    pub async fn invalidate(&self) {
        if self.cache.lock().await.current.take().is_some() {
            tracing::debug!("dropped cached access token");
        }
    }

    /// Drops the cached access token if it is the one that was rejected
    ///
    /// A token refreshed by another caller since the rejected request was
    /// signed is kept.
    async fn invalidate_rejected(&self, rejected: &HeaderValue) {
        let mut cache = self.cache.lock().await;
        match &cache.current {
            Some(current) if &current.authorization == rejected => {
                cache.current = None;
                tracing::debug!("dropped rejected access token");
            }
            Some(_) => tracing::debug!("rejected access token was already replaced"),
            None => {}
        }
    }

    /// Sets the `Authorization` header of `request` to the current access token
    pub async fn sign(&self, request: &mut Request) -> Result<(), TokenRequestError> {
        let authorization = self.authorization().await?;
        request
            .headers_mut()
            .insert(header::AUTHORIZATION, authorization);
        Ok(())
    }

    /// Inspects the response to a signed request
    ///
    /// Responses other than `401 Unauthorized` and `403 Forbidden` are
    /// accepted as they are. A rejection drains the rejected response, drops
    /// the token that was used, and prepares a freshly signed copy of the
    /// request to be sent once. `request` is the copy to replay; without one
    /// the rejection is accepted as it is.
    pub async fn on_response(
        &self,
        response: Response,
        request: Option<Request>,
    ) -> Result<ResponseAction, TokenRequestError> {
        let status = response.status();
        if status != StatusCode::UNAUTHORIZED && status != StatusCode::FORBIDDEN {
            return Ok(ResponseAction::Accept(response));
        }

        let Some(mut request) = request else {
            tracing::warn!(
                response.status = status.as_u16(),
                "request was rejected but cannot be replayed"
            );
            return Ok(ResponseAction::Accept(response));
        };

        tracing::info!(
            response.status = status.as_u16(),
            request.url = %request.url(),
            "request was rejected, refreshing access token"
        );

        let history = ResponseHistory::drain(response).await;

        match request.headers().get(header::AUTHORIZATION) {
            Some(rejected) => self.invalidate_rejected(rejected).await,
            None => self.invalidate().await,
        }

        self.sign(&mut request).await?;

        Ok(ResponseAction::Resend(Resend { request, history }))
    }

    /// Sends `request` with `client`, replaying it once if it is rejected
    pub async fn execute(
        &self,
        client: &reqwest::Client,
        mut request: Request,
    ) -> Result<Response, SendError> {
        self.sign(&mut request).await?;
        let replay = request.try_clone();
        let response = client.execute(request).await?;

        match self.on_response(response, replay).await? {
            ResponseAction::Accept(response) => Ok(response),
            ResponseAction::Resend(resend) => Ok(resend.send_with(|req| client.execute(req)).await?),
        }
    }
}

/// What to do with the response to a signed request
#[derive(Debug)]
pub enum ResponseAction {
    /// Hand the response to the caller
    Accept(Response),
    /// Send a re-signed copy of the request, once
    Resend(Resend),
}

/// A re-signed request to be sent in place of a rejected one
#[derive(Debug)]
pub struct Resend {
    request: Request,
    history: ResponseHistory,
}

impl Resend {
    /// The re-signed request
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// The rejected response that prompted the replay
    pub fn rejected(&self) -> Option<&RejectedResponse> {
        self.history.0.last()
    }

    /// Sends the request with `send` and records the rejected response in
    /// the history of whatever comes back
    ///
    /// No further replay happens, whatever the outcome.
    pub async fn send_with<F, Fut, E>(self, send: F) -> Result<Response, E>
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Result<Response, E>>,
    {
        let mut response = send(self.request).await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            tracing::warn!(
                response.status = status.as_u16(),
                "request rejected again after refreshing access token"
            );
        }

        response.extensions_mut().insert(self.history);
        Ok(response)
    }
}

/// A response that was rejected and replaced by a replayed request
#[derive(Clone, Debug)]
pub struct RejectedResponse {
    status: StatusCode,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
}

impl RejectedResponse {
    /// The status of the rejected response
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The URL of the rejected request
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The headers of the rejected response
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The body of the rejected response
    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Rejected responses that preceded a response, oldest first
#[derive(Clone, Debug, Default)]
pub struct ResponseHistory(Vec<RejectedResponse>);

impl ResponseHistory {
    async fn drain(mut response: Response) -> Self {
        let mut history = response
            .extensions_mut()
            .remove::<ResponseHistory>()
            .unwrap_or_default();

        let status = response.status();
        let url = response.url().clone();
        let headers = response.headers().clone();
        // Reading to the end releases the connection for reuse
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(error) => {
                tracing::debug!(%error, "unable to read body of rejected response");
                Bytes::new()
            }
        };

        history.0.push(RejectedResponse {
            status,
            url,
            headers,
            body,
        });
        history
    }

    /// The rejected responses that preceded `response`, oldest first
    pub fn of(response: &Response) -> &[RejectedResponse] {
        response
            .extensions()
            .get::<ResponseHistory>()
            .map(|h| h.0.as_slice())
            .unwrap_or(&[])
    }
}

/// An error while sending a request through a session
#[derive(Debug, Error)]
pub enum SendError {
    /// No access token could be obtained
    #[error("unable to obtain an access token")]
    Token(#[from] TokenRequestError),
    /// The request itself failed
    #[error("error sending request")]
    Transport(#[from] reqwest::Error),
}
