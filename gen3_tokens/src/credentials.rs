//! Credential resolution
//!
//! A session draws its tokens from exactly one place. [`resolve()`] applies
//! a fixed precedence over the configured inputs to decide which:
//!
//! 1. A credentials file and an in-memory credential together are rejected.
//! 2. With no file, credential, or identity provider, the default
//!    credentials file from the environment is used, if there is one.
//! 3. A file of the form `idp://wts/<idp>` selects the workspace token
//!    service for that identity provider. Any other value that is not an
//!    existing file and contains no path separator is looked up in the
//!    credentials directory, with `.json` appended if needed.
//! 4. With neither a file nor an in-memory credential left, the workspace
//!    token service is used.
//! 5. Otherwise the credentials file is read and parsed.

use std::{
    io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{claims, ApiKey, ApiKeyRef, AuthConfig, IdpName};

/// Prefix of a credentials file value that selects an identity provider instead
pub const IDP_PREFIX: &str = "idp://wts/";

/// A downloaded API key
///
/// Fields other than `api_key` are kept as they were found and are sent back
/// verbatim when exchanging the key for an access token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyCredential {
    api_key: ApiKey,
    #[serde(flatten)]
    extra: serde_json::Map<String, serde_json::Value>,
}

impl KeyCredential {
    /// Constructs a credential from a bare API key
    pub fn new(api_key: ApiKey) -> Self {
        Self {
            api_key,
            extra: serde_json::Map::new(),
        }
    }

    /// Parses a credential from the JSON downloaded from a commons profile page
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// The API key
    pub fn api_key(&self) -> &ApiKeyRef {
        &self.api_key
    }

    /// Any additional fields, such as `key_id`
    pub fn extra(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.extra
    }

    /// The endpoint of the commons that issued the API key
    pub fn endpoint(&self) -> Result<String, claims::MalformedTokenError> {
        claims::endpoint_from_token(self.api_key.as_str())
    }
}

/// Tokens are to be fetched from the workspace token service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerMode {
    /// The namespace the workspace token service runs in
    pub namespace: String,
    /// The identity provider to request tokens for
    pub idp: Option<IdpName>,
}

/// The single source of tokens chosen for a session
#[derive(Clone, Debug)]
pub enum CredentialSource {
    /// Exchange a long-lived API key for access tokens
    Key(KeyCredential),
    /// Fetch access tokens from the workspace token service
    Broker(BrokerMode),
}

impl CredentialSource {
    /// Which kind of source this is
    pub fn kind(&self) -> CredentialKind {
        match self {
            Self::Key(_) => CredentialKind::ApiKey,
            Self::Broker(_) => CredentialKind::Broker,
        }
    }
}

/// The kind of credential backing a session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialKind {
    /// A long-lived API key
    ApiKey,
    /// The workspace token service
    Broker,
}

/// The local credential configuration is unusable
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Both a credentials file and an in-memory credential were given
    #[error("only one of a refresh file and a refresh token can be specified")]
    AmbiguousSource,

    /// The credentials file could not be read
    #[error("couldn't read credentials file {}", .path.display())]
    Read {
        /// The file that was read
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The credentials file does not hold a usable credential
    #[error("couldn't parse credentials file {}", .path.display())]
    Parse {
        /// The file that was parsed
        path: PathBuf,
        /// The underlying parse error
        #[source]
        source: serde_json::Error,
    },

    /// The workspace token service address could not be built
    #[error("'{namespace}' does not form a valid workspace token service address")]
    InvalidNamespace {
        /// The offending namespace
        namespace: String,
    },
}

/// Decides which credential source a configuration selects, loading it if it is a file
#[tracing::instrument(
    err,
    skip(config),
    fields(
        has_refresh_file = config.refresh_file().is_some(),
        has_refresh_token = config.refresh_token().is_some(),
        idp = ?config.idp(),
    ),
)]
pub async fn resolve(config: &AuthConfig) -> Result<CredentialSource, ConfigError> {
    if config.refresh_file().is_some() && config.refresh_token().is_some() {
        return Err(ConfigError::AmbiguousSource);
    }

    let mut idp = config.idp().cloned();
    let mut refresh_file = config.refresh_file().map(ToOwned::to_owned);

    if refresh_file.is_none() && config.refresh_token().is_none() && idp.is_none() {
        refresh_file = config.default_refresh_file().map(ToOwned::to_owned);
        if let Some(path) = &refresh_file {
            tracing::debug!(%path, "using default credentials file");
        }
    }

    let mut refresh_path = None;
    if let Some(file) = refresh_file {
        if idp.is_some() {
            refresh_path = Some(PathBuf::from(file));
        } else if let Some(name) = file.strip_prefix(IDP_PREFIX) {
            tracing::debug!(idp = name, "credentials file names an identity provider");
            idp = Some(IdpName::new(name.to_owned()));
        } else {
            refresh_path = Some(locate(&file, config.credentials_dir()).await);
        }
    }

    if let Some(credential) = config.refresh_token() {
        return Ok(CredentialSource::Key(credential.clone()));
    }

    match refresh_path {
        Some(path) => load(path).await.map(CredentialSource::Key),
        None => {
            tracing::debug!(
                namespace = config.namespace(),
                "no local credential, using workspace token service"
            );
            Ok(CredentialSource::Broker(BrokerMode {
                namespace: config.namespace().to_owned(),
                idp,
            }))
        }
    }
}

async fn locate(file: &str, credentials_dir: Option<&Path>) -> PathBuf {
    let given = PathBuf::from(file);
    if is_file(&given).await || file.contains('/') || file.contains('\\') {
        return given;
    }

    let Some(dir) = credentials_dir else {
        return given;
    };

    let mut candidate = dir.join(file);
    if !is_file(&candidate).await && !file.ends_with(".json") {
        candidate = dir.join(format!("{}.json", file));
    }

    tracing::debug!(path = %candidate.display(), "resolved short credentials name");
    candidate
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn load(path: PathBuf) -> Result<KeyCredential, ConfigError> {
    let data = match tokio::fs::read_to_string(&path).await {
        Ok(data) => data,
        Err(source) => return Err(ConfigError::Read { path, source }),
    };

    match KeyCredential::from_json(&data) {
        Ok(credential) => {
            tracing::debug!(path = %path.display(), "loaded credentials file");
            Ok(credential)
        }
        Err(source) => Err(ConfigError::Parse { path, source }),
    }
}
