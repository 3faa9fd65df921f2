//! Session configuration
//!
//! All ambient inputs are captured once, when the configuration is built.
//! Changing the environment afterwards has no effect on a configuration or
//! on a session built from it.

use std::path::{Path, PathBuf};

use reqwest::Url;

use crate::{credentials::KeyCredential, IdpName};

/// Environment variable naming the workspace namespace
pub const NAMESPACE_VAR: &str = "NAMESPACE";

/// Environment variable naming the default credentials file
pub const API_KEY_VAR: &str = "GEN3_API_KEY";

/// Namespace used when none is configured
pub const DEFAULT_NAMESPACE: &str = "default";

/// Directory under the user's home holding downloaded credentials
pub const CREDENTIALS_DIR_NAME: &str = ".gen3";

/// Inputs used to construct an [`AuthSession`][crate::AuthSession]
///
/// ```
/// use gen3_tokens::{AuthConfig, IdpName};
///
/// let config = AuthConfig::new()
///     .with_namespace("jupyter-pods")
///     .with_idp(IdpName::from_static("google"));
///
/// assert_eq!(config.namespace(), "jupyter-pods");
/// ```
#[derive(Clone, Debug)]
pub struct AuthConfig {
    endpoint: Option<String>,
    refresh_file: Option<String>,
    refresh_token: Option<KeyCredential>,
    idp: Option<IdpName>,
    namespace: String,
    default_refresh_file: Option<String>,
    credentials_dir: Option<PathBuf>,
    broker_url: Option<Url>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthConfig {
    /// Constructs a configuration that ignores the environment
    ///
    /// The namespace is `default`, there is no default credentials file, and
    /// short credential names resolve against `~/.gen3`.
    pub fn new() -> Self {
        Self {
            endpoint: None,
            refresh_file: None,
            refresh_token: None,
            idp: None,
            namespace: DEFAULT_NAMESPACE.to_owned(),
            default_refresh_file: None,
            credentials_dir: dirs::home_dir().map(|home| home.join(CREDENTIALS_DIR_NAME)),
            broker_url: None,
        }
    }

    /// Constructs a configuration from the process environment
    ///
    /// Reads `NAMESPACE` and `GEN3_API_KEY` exactly once.
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_vars<F>(var: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new();
        if let Some(namespace) = var(NAMESPACE_VAR).filter(|ns| !ns.is_empty()) {
            config.namespace = namespace;
        }
        config.default_refresh_file = var(API_KEY_VAR).filter(|path| !path.is_empty());
        config
    }

    /// Sets the expected commons endpoint
    ///
    /// The endpoint a session talks to is always the one named by its
    /// credentials. A differing value here is reported but not used.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Sets the credentials file
    ///
    /// Besides a path, this accepts a short name resolved against the
    /// credentials directory (`name` or `name.json`), or `idp://wts/<idp>` to
    /// use the workspace token service with the given identity provider.
    pub fn with_refresh_file(mut self, refresh_file: impl Into<String>) -> Self {
        self.refresh_file = Some(refresh_file.into());
        self
    }

    /// Sets an in-memory credential
    pub fn with_refresh_token(mut self, credential: KeyCredential) -> Self {
        self.refresh_token = Some(credential);
        self
    }

    /// Sets the identity provider to request tokens for from the workspace token service
    pub fn with_idp(mut self, idp: IdpName) -> Self {
        self.idp = Some(idp);
        self
    }

    /// Sets the namespace of the workspace token service
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the credentials file used when no other credential source is given
    pub fn with_default_refresh_file(mut self, refresh_file: impl Into<String>) -> Self {
        self.default_refresh_file = Some(refresh_file.into());
        self
    }

    /// Sets the directory that short credential names resolve against
    pub fn with_credentials_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.credentials_dir = Some(dir.into());
        self
    }

    /// Overrides the base URL of the workspace token service
    ///
    /// By default this is derived from the namespace.
    pub fn with_broker_url(mut self, url: Url) -> Self {
        self.broker_url = Some(url);
        self
    }

    /// The expected commons endpoint, if one was given
    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }

    /// The credentials file, as given
    pub fn refresh_file(&self) -> Option<&str> {
        self.refresh_file.as_deref()
    }

    /// The in-memory credential, if one was given
    pub fn refresh_token(&self) -> Option<&KeyCredential> {
        self.refresh_token.as_ref()
    }

    /// The identity provider hint, if one was given
    pub fn idp(&self) -> Option<&IdpName> {
        self.idp.as_ref()
    }

    /// The namespace of the workspace token service
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The fallback credentials file, if any
    pub fn default_refresh_file(&self) -> Option<&str> {
        self.default_refresh_file.as_deref()
    }

    /// The directory that short credential names resolve against
    pub fn credentials_dir(&self) -> Option<&Path> {
        self.credentials_dir.as_deref()
    }

    /// The workspace token service base URL override, if any
    pub fn broker_url(&self) -> Option<&Url> {
        self.broker_url.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = AuthConfig::from_vars(vars(&[]));
        assert_eq!(config.namespace(), DEFAULT_NAMESPACE);
        assert_eq!(config.default_refresh_file(), None);
        assert_eq!(config.idp(), None);
    }

    #[test]
    fn short_names_resolve_under_the_home_directory() {
        let config = AuthConfig::new();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                config.credentials_dir(),
                Some(home.join(CREDENTIALS_DIR_NAME).as_path())
            );
        }
    }

    #[test]
    fn captures_namespace_and_default_file() {
        let config = AuthConfig::from_vars(vars(&[
            (NAMESPACE_VAR, "jupyter-pods"),
            (API_KEY_VAR, "/secrets/credentials.json"),
        ]));
        assert_eq!(config.namespace(), "jupyter-pods");
        assert_eq!(
            config.default_refresh_file(),
            Some("/secrets/credentials.json")
        );
    }

    #[test]
    fn empty_variables_count_as_unset() {
        let config = AuthConfig::from_vars(vars(&[(NAMESPACE_VAR, ""), (API_KEY_VAR, "")]));
        assert_eq!(config.namespace(), DEFAULT_NAMESPACE);
        assert_eq!(config.default_refresh_file(), None);
    }

    #[test]
    fn builder_overrides_environment() {
        let config = AuthConfig::from_vars(vars(&[(NAMESPACE_VAR, "jupyter-pods")]))
            .with_namespace("other")
            .with_credentials_dir("/tmp/creds");
        assert_eq!(config.namespace(), "other");
        assert_eq!(config.credentials_dir(), Some(Path::new("/tmp/creds")));
    }
}
