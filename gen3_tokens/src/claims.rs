//! Inspection of signed tokens
//!
//! Tokens are decoded without verifying their signatures. Verification is the
//! job of the service that issued them; this crate only needs the claims to
//! work out which commons a token belongs to.

use std::error::Error as StdError;

use base64::{engine::general_purpose::URL_SAFE, Engine};
use reqwest::Url;
use serde_json::Value;
use thiserror::Error;

/// The claim set carried in a token's payload segment
pub type Claims = serde_json::Map<String, Value>;

/// A token could not be decoded, or does not name its issuer
#[derive(Debug, Error)]
pub enum MalformedTokenError {
    /// The token does not have the `header.payload.signature` structure
    #[error("token has {0} segment(s), expected header.payload.signature")]
    MissingSegments(usize),

    /// The payload segment is not valid base64url
    #[error("token payload is not valid base64url")]
    Payload(#[source] base64::DecodeError),

    /// The payload segment does not hold a JSON object
    #[error("token payload is not a JSON object")]
    Claims(#[source] serde_json::Error),

    /// The claims have no string `iss` claim
    #[error("token has no issuer claim")]
    MissingIssuer,

    /// The issuer could not be turned into an origin endpoint
    #[error("issuer '{issuer}' is not an absolute URL with a host")]
    InvalidIssuer {
        /// The offending issuer
        issuer: String,
        /// The underlying parse error, if any
        #[source]
        source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    },
}

pub(crate) fn invalid_issuer(
    issuer: impl Into<String>,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
) -> MalformedTokenError {
    MalformedTokenError::InvalidIssuer {
        issuer: issuer.into(),
        source,
    }
}

/// Decodes the claims of a signed token
///
/// Surrounding whitespace is ignored, so tokens read straight from a file or
/// standard input can be passed as-is. Missing base64 padding is restored
/// before decoding.
pub fn decode(token: &str) -> Result<Claims, MalformedTokenError> {
    let segments: Vec<&str> = token.trim().split('.').collect();
    if segments.len() < 3 {
        return Err(MalformedTokenError::MissingSegments(segments.len()));
    }

    let payload = segments[1];
    let mut padded = String::with_capacity(payload.len() + 3);
    padded.push_str(payload);
    while padded.len() % 4 != 0 {
        padded.push('=');
    }

    let raw = URL_SAFE
        .decode(padded.as_bytes())
        .map_err(MalformedTokenError::Payload)?;

    serde_json::from_slice(&raw).map_err(MalformedTokenError::Claims)
}

/// Derives the origin endpoint of the commons that issued a token
///
/// The result is `scheme://host` with `:port` appended only when the issuer
/// names a port explicitly. Any path on the issuer is discarded.
pub fn endpoint_from_token(token: &str) -> Result<String, MalformedTokenError> {
    let claims = decode(token)?;
    let issuer = claims
        .get("iss")
        .and_then(Value::as_str)
        .ok_or(MalformedTokenError::MissingIssuer)?;

    endpoint_from_issuer(issuer)
}

pub(crate) fn endpoint_from_issuer(issuer: &str) -> Result<String, MalformedTokenError> {
    let url = Url::parse(issuer).map_err(|e| invalid_issuer(issuer, Some(e.into())))?;
    let host = url.host_str().ok_or_else(|| invalid_issuer(issuer, None))?;

    let endpoint = match explicit_port(issuer, &url) {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    };

    Ok(endpoint)
}

/// The port written in the issuer, including a scheme's default port
///
/// `Url` forgets a port that equals the scheme default, so the authority text
/// is checked for it.
fn explicit_port(issuer: &str, url: &Url) -> Option<u16> {
    if let Some(port) = url.port() {
        return Some(port);
    }

    let default = url.port_or_known_default()?;
    let (_, rest) = issuer.trim().split_once("://")?;
    let authority = rest.split(&['/', '?', '#'][..]).next()?;
    let host_port = authority.rsplit('@').next()?;
    let after_host = host_port
        .rsplit_once(']')
        .map_or(host_port, |(_, after)| after);
    let (_, port) = after_host.rsplit_once(':')?;

    (port.parse::<u16>().ok() == Some(default)).then_some(default)
}
