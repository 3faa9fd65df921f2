//! Middleware to sign outgoing requests for a Gen3 data commons
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AuthMiddleware`] in the middleware stack to sign each
//! outbound request with the access token held by an [`AuthSession`].
//!
//! A request rejected with `401 Unauthorized` or `403 Forbidden` causes the
//! session to drop its token. The request is then signed with a fresh token
//! and sent once more. The response to that second attempt is returned
//! whatever its status, and the rejected response is available through
//! [`ResponseHistory::of()`].
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place and the request will not be replayed, allowing overrides to be
//! specified as required.
//!
//! ```no_run
//! use gen3_reqwest::AuthMiddleware;
//! use gen3_tokens::{AuthConfig, AuthSession};
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = AuthSession::new(AuthConfig::from_env()).await?;
//! let endpoint = session.endpoint().to_owned();
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AuthMiddleware::new(session))
//!     .build();
//!
//! let resp = client
//!     .get(format!("{}/user/user", endpoint))
//!     .send()
//!     .await?;
//! # drop(resp);
//! # Ok(())
//! # }
//! ```
//!
//! Requests whose body cannot be cloned, such as streaming uploads, are
//! signed but never replayed.
//!
//! By default, only requests to the session's own commons are signed.
//! Requests to any other origin, such as presigned storage URLs, pass through
//! untouched. A custom predicate can widen or narrow that rule.
//!
//! ```
//! use gen3_reqwest::{AuthMiddleware, ExactHostMatch, SameOrigin};
//! use predicates::prelude::PredicateBooleanExt;
//! # use gen3_tokens::{AccessToken, AsyncTokenSource, AuthSession, TokenRequestError};
//! # struct Const;
//! # #[async_trait::async_trait]
//! # impl AsyncTokenSource for Const {
//! #     async fn request_token(&mut self) -> Result<AccessToken, TokenRequestError> {
//! #         Ok(AccessToken::from_static("token"))
//! #     }
//! # }
//! # let session = AuthSession::from_source("https://commons.example.org", Const);
//!
//! AuthMiddleware::new(session).with_predicate(
//!     SameOrigin::new("https://commons.example.org")
//!         .or(ExactHostMatch::new("fence.example.org")),
//! );
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{fmt, sync::Arc};

use gen3_tokens::{session::ResponseAction, AsyncTokenSource, AuthSession, TokenSource};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response, Url};
use reqwest_middleware::{Error, Middleware, Next, Result};

pub use gen3_tokens::ResponseHistory;

/// A middleware that signs outgoing requests and refreshes rejected tokens
#[derive(Debug)]
pub struct AuthMiddleware<S = TokenSource, P = SameOrigin> {
    session: Arc<AuthSession<S>>,
    predicate: P,
}

impl<S, P: Clone> Clone for AuthMiddleware<S, P> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            predicate: self.predicate.clone(),
        }
    }
}

impl<S: AsyncTokenSource> AuthMiddleware<S, SameOrigin> {
    /// Construct a new middleware from a session
    ///
    /// By default, this middleware will only sign requests sent to the
    /// origin of the session's endpoint. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(session: AuthSession<S>) -> Self {
        Self::from_shared(Arc::new(session))
    }

    /// Construct a new middleware from a session shared with other users
    pub fn from_shared(session: Arc<AuthSession<S>>) -> Self {
        let predicate = SameOrigin::new(session.endpoint());
        Self { session, predicate }
    }
}

impl<S, P> AuthMiddleware<S, P> {
    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<Q>(self, predicate: Q) -> AuthMiddleware<S, Q> {
        AuthMiddleware {
            session: self.session,
            predicate,
        }
    }

    /// The session used to sign requests
    pub fn session(&self) -> &Arc<AuthSession<S>> {
        &self.session
    }
}

#[async_trait::async_trait]
impl<S, P> Middleware for AuthMiddleware<S, P>
where
    S: AsyncTokenSource + 'static,
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) {
            tracing::trace!(
                request.url = %req.url(),
                "request is not for this commons, leaving it unsigned"
            );
            return next.run(req, extensions).await;
        }

        if req.headers().contains_key(header::AUTHORIZATION) {
            tracing::trace!("request already carries authorization, leaving it in place");
            return next.run(req, extensions).await;
        }

        self.session.sign(&mut req).await.map_err(Error::middleware)?;

        let replay = req.try_clone();
        if replay.is_none() {
            tracing::debug!("request body cannot be cloned, it will not be replayed");
        }

        let resp = next.clone().run(req, extensions).await?;

        match self
            .session
            .on_response(resp, replay)
            .await
            .map_err(Error::middleware)?
        {
            ResponseAction::Accept(resp) => Ok(resp),
            ResponseAction::Resend(resend) => {
                resend
                    .send_with(move |req| next.run(req, extensions))
                    .await
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Origin {
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl Origin {
    fn of(url: &Url) -> Option<Self> {
        Some(Self {
            scheme: url.scheme().to_owned(),
            host: url.host_str()?.to_owned(),
            port: url.port_or_known_default(),
        })
    }
}

/// Only sign requests sent to the same scheme, host, and port as an endpoint
#[derive(Clone, Debug)]
pub struct SameOrigin {
    origin: Option<Origin>,
}

impl SameOrigin {
    /// Construct a new predicate from an endpoint URL
    ///
    /// An endpoint that is not an absolute URL with a host matches no request.
    pub fn new(endpoint: &str) -> Self {
        let origin = Url::parse(endpoint).ok().and_then(|url| Origin::of(&url));
        if origin.is_none() {
            tracing::warn!(endpoint, "endpoint has no origin, no requests will be signed");
        }
        Self { origin }
    }
}

impl Predicate<Request> for SameOrigin {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        self.origin.is_some() && Origin::of(req.url()) == self.origin
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "origin",
                    req.url().origin().ascii_serialization(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for SameOrigin {}
impl fmt::Display for SameOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.origin {
            Some(origin) => {
                write!(f, "origin == {}://{}", origin.scheme, origin.host)?;
                if let Some(port) = origin.port {
                    write!(f, ":{}", port)?;
                }
                Ok(())
            }
            None => f.write_str("never"),
        }
    }
}

/// Only sign requests sent to the exact host specified
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host string
    pub fn new<H>(host: H) -> Self
    where
        H: ToString,
    {
        Self {
            host: host.to_string(),
        }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "host",
                    req.url()
                        .host_str()
                        .unwrap_or("<no host>")
                        .to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host == ")?;
        f.write_str(&self.host)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use gen3_tokens::{AccessToken, TokenRequestError};
    use reqwest::Client;
    use reqwest_middleware::ClientBuilder;

    use super::*;

    const ENDPOINT: &str = "https://commons.example.org";

    #[derive(Default)]
    struct CountingSource {
        issued: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl AsyncTokenSource for CountingSource {
        async fn request_token(
            &mut self,
        ) -> std::result::Result<AccessToken, TokenRequestError> {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(AccessToken::new(format!("token-{}", n)))
        }
    }

    struct FailingSource;

    #[async_trait::async_trait]
    impl AsyncTokenSource for FailingSource {
        async fn request_token(
            &mut self,
        ) -> std::result::Result<AccessToken, TokenRequestError> {
            Err(TokenRequestError::UnusableToken)
        }
    }

    /// Answers the first `rejections` requests with `401`, then `200`
    struct Commons {
        rejections: usize,
        status: u16,
        seen: Mutex<Vec<Option<String>>>,
    }

    impl Commons {
        fn rejecting(rejections: usize) -> Self {
            Self {
                rejections,
                status: 401,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn answering(status: u16) -> Self {
            Self {
                rejections: usize::MAX,
                status,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn seen(&self) -> Vec<Option<String>> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Middleware for Commons {
        async fn handle(
            &self,
            req: Request,
            _: &mut http::Extensions,
            _: Next<'_>,
        ) -> Result<Response> {
            let authorization = req.headers().get(header::AUTHORIZATION).map(|v| {
                v.to_str()
                    .expect("authorization header was not valid UTF-8")
                    .to_owned()
            });

            let mut seen = self.seen.lock().unwrap();
            seen.push(authorization);

            let status = if seen.len() <= self.rejections {
                self.status
            } else {
                200
            };

            Ok(http::Response::builder()
                .status(status)
                .body(format!("attempt {}", seen.len()))
                .unwrap()
                .into())
        }
    }

    fn prepare_middleware() -> (AuthMiddleware<CountingSource>, Arc<AtomicUsize>) {
        let source = CountingSource::default();
        let issued = source.issued.clone();
        (
            AuthMiddleware::new(AuthSession::from_source(ENDPOINT, source)),
            issued,
        )
    }

    fn client_with<S, P>(
        middleware: AuthMiddleware<S, P>,
        commons: Arc<Commons>,
    ) -> reqwest_middleware::ClientWithMiddleware
    where
        S: AsyncTokenSource + 'static,
        P: Predicate<Request> + Send + Sync + 'static,
    {
        ClientBuilder::new(Client::default())
            .with(middleware)
            .with_arc(commons)
            .build()
    }

    mod when_request_does_not_have_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_attaches_bearer_token() {
            let (middleware, issued) = prepare_middleware();
            let commons = Arc::new(Commons::rejecting(0));
            let client = client_with(middleware, commons.clone());

            let resp = client.get(format!("{}/user/user", ENDPOINT)).send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::OK);
            assert_eq!(commons.seen(), vec![Some("bearer token-1".to_owned())]);
            assert_eq!(issued.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn middleware_reuses_the_cached_token() {
            let (middleware, issued) = prepare_middleware();
            let commons = Arc::new(Commons::rejecting(0));
            let client = client_with(middleware, commons.clone());

            for _ in 0..3 {
                client.get(ENDPOINT).send().await.unwrap();
            }

            assert_eq!(commons.seen().len(), 3);
            assert_eq!(issued.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn other_failures_are_passed_through() {
            let (middleware, issued) = prepare_middleware();
            let commons = Arc::new(Commons::answering(500));
            let client = client_with(middleware, commons.clone());

            let resp = client.get(ENDPOINT).send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
            assert_eq!(commons.seen().len(), 1);
            assert_eq!(issued.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn token_failures_are_middleware_errors() {
            let middleware = AuthMiddleware::new(AuthSession::from_source(ENDPOINT, FailingSource));
            let commons = Arc::new(Commons::rejecting(0));
            let client = client_with(middleware, commons.clone());

            let err = client.get(ENDPOINT).send().await.unwrap_err();

            assert!(matches!(err, Error::Middleware(_)));
            assert!(commons.seen().is_empty());
        }

        mod and_the_token_is_rejected_once {
            use super::*;

            #[tokio::test]
            async fn middleware_replays_with_a_fresh_token() {
                let (middleware, issued) = prepare_middleware();
                let commons = Arc::new(Commons::rejecting(1));
                let client = client_with(middleware, commons.clone());

                let resp = client.get(ENDPOINT).send().await.unwrap();

                assert_eq!(resp.status(), http::StatusCode::OK);
                assert_eq!(
                    commons.seen(),
                    vec![
                        Some("bearer token-1".to_owned()),
                        Some("bearer token-2".to_owned())
                    ]
                );
                assert_eq!(issued.load(Ordering::SeqCst), 2);

                let history = ResponseHistory::of(&resp);
                assert_eq!(history.len(), 1);
                assert_eq!(history[0].status(), http::StatusCode::UNAUTHORIZED);
                assert_eq!(history[0].body().as_ref(), b"attempt 1");
            }

            #[tokio::test]
            async fn forbidden_is_treated_the_same() {
                let (middleware, issued) = prepare_middleware();
                let commons = Arc::new(Commons {
                    status: 403,
                    ..Commons::rejecting(1)
                });
                let client = client_with(middleware, commons.clone());

                let resp = client.get(ENDPOINT).send().await.unwrap();

                assert_eq!(resp.status(), http::StatusCode::OK);
                assert_eq!(issued.load(Ordering::SeqCst), 2);
            }
        }

        mod and_the_token_is_always_rejected {
            use super::*;

            #[tokio::test]
            async fn middleware_gives_up_after_one_replay() {
                let (middleware, issued) = prepare_middleware();
                let commons = Arc::new(Commons::answering(401));
                let client = client_with(middleware, commons.clone());

                let resp = client.get(ENDPOINT).send().await.unwrap();

                assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);
                assert_eq!(resp.text().await.unwrap(), "attempt 2");
                assert_eq!(commons.seen().len(), 2);
                assert_eq!(issued.load(Ordering::SeqCst), 2);
            }
        }
    }

    mod when_request_has_a_body_that_cannot_be_cloned {
        use futures::stream;
        use reqwest::Body;

        use super::*;

        #[tokio::test]
        async fn middleware_signs_once_and_does_not_replay() {
            let (middleware, issued) = prepare_middleware();
            let commons = Arc::new(Commons::answering(401));
            let client = client_with(middleware, commons.clone());

            let chunks: Vec<std::result::Result<&'static str, std::io::Error>> =
                vec![Ok("manifest "), Ok("upload")];
            let resp = client
                .post(format!("{}/index/index", ENDPOINT))
                .body(Body::wrap_stream(stream::iter(chunks)))
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);
            assert!(ResponseHistory::of(&resp).is_empty());
            assert_eq!(commons.seen(), vec![Some("bearer token-1".to_owned())]);
            assert_eq!(issued.load(Ordering::SeqCst), 1);
        }
    }

    mod when_request_is_for_another_origin {
        use super::*;

        const PRESIGNED_URL: &str =
            "http://bucket.s3.amazonaws.com/obj?X-Amz-Signature=abc";

        #[tokio::test]
        async fn middleware_with_defaults_leaves_it_unsigned() {
            let (middleware, issued) = prepare_middleware();
            let commons = Arc::new(Commons::rejecting(0));
            let client = client_with(middleware, commons.clone());

            client.get(PRESIGNED_URL).send().await.unwrap();

            assert_eq!(commons.seen(), vec![None]);
            assert_eq!(issued.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn middleware_with_defaults_does_not_replay_rejections() {
            let (middleware, issued) = prepare_middleware();
            let session = middleware.session().clone();
            let commons = Arc::new(Commons::answering(403));
            let client = client_with(middleware, commons.clone());

            session.access_token().await.unwrap();
            let resp = client.get(PRESIGNED_URL).send().await.unwrap();

            assert_eq!(resp.status(), http::StatusCode::FORBIDDEN);
            assert_eq!(commons.seen(), vec![None]);
            assert_eq!(issued.load(Ordering::SeqCst), 1);
            assert_eq!(
                session.state().await,
                gen3_tokens::SessionState::Authenticated
            );
        }

        #[tokio::test]
        async fn same_host_over_another_scheme_is_another_origin() {
            let (middleware, issued) = prepare_middleware();
            let commons = Arc::new(Commons::rejecting(0));
            let client = client_with(middleware, commons.clone());

            client
                .get("http://commons.example.org/user/user")
                .send()
                .await
                .unwrap();

            assert_eq!(commons.seen(), vec![None]);
            assert_eq!(issued.load(Ordering::SeqCst), 0);
        }

        mod and_predicate_evaluates_to_attach {
            use super::*;

            #[tokio::test]
            async fn middleware_attaches_access_token() {
                let (middleware, _) = prepare_middleware();
                let middleware = middleware.with_predicate(
                    SameOrigin::new(ENDPOINT).or(ExactHostMatch::new("bucket.s3.amazonaws.com")),
                );
                let commons = Arc::new(Commons::rejecting(0));
                let client = client_with(middleware, commons.clone());

                client.get(PRESIGNED_URL).send().await.unwrap();

                assert_eq!(commons.seen(), vec![Some("bearer token-1".to_owned())]);
            }
        }

        mod and_predicate_evaluates_to_ignore {
            use super::*;

            #[tokio::test]
            async fn middleware_does_not_attach_access_token_to_the_commons() {
                let (middleware, issued) = prepare_middleware();
                let middleware = middleware.with_predicate(predicate::never());
                let commons = Arc::new(Commons::rejecting(0));
                let client = client_with(middleware, commons.clone());

                client.get(ENDPOINT).send().await.unwrap();

                assert_eq!(commons.seen(), vec![None]);
                assert_eq!(issued.load(Ordering::SeqCst), 0);
            }
        }
    }

    mod same_origin {
        use super::*;

        fn get(url: &str) -> Request {
            Request::new(reqwest::Method::GET, url.parse().unwrap())
        }

        #[test]
        fn matches_paths_and_an_explicit_default_port() {
            let predicate = SameOrigin::new("https://commons.example.org");
            assert!(predicate.eval(&get("https://commons.example.org/user/user")));
            assert!(predicate.eval(&get("https://commons.example.org:443/index")));
        }

        #[test]
        fn rejects_other_hosts_and_ports() {
            let predicate = SameOrigin::new("http://host:8080");
            assert!(predicate.eval(&get("http://host:8080/x")));
            assert!(!predicate.eval(&get("http://host/x")));
            assert!(!predicate.eval(&get("http://other:8080/x")));
        }

        #[test]
        fn an_endpoint_without_an_origin_matches_nothing() {
            let predicate = SameOrigin::new("not a url");
            assert!(!predicate.eval(&get("https://commons.example.org/")));
            assert_eq!(predicate.to_string(), "never");
        }
    }

    mod when_request_has_an_authorization_header {
        use super::*;

        #[tokio::test]
        async fn middleware_leaves_it_in_place() {
            let (middleware, issued) = prepare_middleware();
            let commons = Arc::new(Commons::rejecting(0));
            let client = client_with(middleware, commons.clone());

            client
                .get(ENDPOINT)
                .header(header::AUTHORIZATION, "bearer caller-supplied")
                .send()
                .await
                .unwrap();

            assert_eq!(commons.seen(), vec![Some("bearer caller-supplied".to_owned())]);
            assert_eq!(issued.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn middleware_does_not_replay_rejections() {
            let (middleware, issued) = prepare_middleware();
            let commons = Arc::new(Commons::answering(401));
            let client = client_with(middleware, commons.clone());

            let resp = client
                .get(ENDPOINT)
                .header(header::AUTHORIZATION, "bearer caller-supplied")
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), http::StatusCode::UNAUTHORIZED);
            assert_eq!(commons.seen().len(), 1);
            assert_eq!(issued.load(Ordering::SeqCst), 0);
        }
    }
}
