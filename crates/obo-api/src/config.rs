//! API configuration.
//!
//! Built once from environment variables at startup. Defaults point at the
//! local `mock-idp`, so the service runs out of the box in development.

use std::time::Duration;

use obo_models::{AuthStrategy, DownstreamTarget, SearchSettings, TargetKind};
use obo_relay::{OidcSettings, Operation, SecretStore};

/// Target names wired to the routes.
pub const PROFILE: &str = "profile";
/// Group memberships.
pub const GROUPS: &str = "groups";
/// Search with the configured [`AuthStrategy`].
pub const SEARCH: &str = "search";
/// Search with the shared key and a caller-built group filter.
pub const SEARCH_KEY: &str = "search-key";

/// A variable that is set but unusable.
#[derive(Debug, thiserror::Error)]
#[error("invalid value {value:?} for {var}: {reason}")]
pub struct ConfigError {
    /// Variable name.
    pub var: &'static str,
    /// Offending value.
    pub value: String,
    /// What was expected.
    pub reason: String,
}

/// Search service settings.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub endpoint: String,
    pub index: String,
    pub api_version: String,
    pub scope: String,
    pub api_key: Option<String>,
    /// Strategy of the `search` target; `search-key` always uses the key.
    pub auth_mode: AuthStrategy,
    pub group_filter_field: String,
}

/// Global configuration, passed to the router as shared state.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub oidc: OidcSettings,
    pub graph_base_url: String,
    pub graph_scope: String,
    pub search: SearchConfig,
    pub downstream_timeout: Duration,
    pub retry_backoff: Duration,
    pub cors_origins: Vec<String>,
}

impl AppConfig {
    /// Build the configuration from environment variables.
    ///
    /// | Variable                    | Default                                   |
    /// |-----------------------------|-------------------------------------------|
    /// | `API_HOST`                  | `0.0.0.0`                                 |
    /// | `API_PORT`                  | `5000`                                    |
    /// | `IDP_AUTHORITY`             | from `IDP_TENANT_ID`, else `http://localhost:4000` |
    /// | `IDP_TENANT_ID`             | none                                      |
    /// | `IDP_CLIENT_ID`             | `obo-relay`                               |
    /// | `IDP_CLIENT_SECRET`         | `obo-relay-dev-secret`                    |
    /// | `IDP_AUDIENCE`              | `api://{client_id},{client_id}`           |
    /// | `GRAPH_BASE_URL`            | `http://localhost:4000/v1.0`              |
    /// | `GRAPH_SCOPE`               | `https://graph.microsoft.com/User.Read`   |
    /// | `SEARCH_ENDPOINT`           | `http://localhost:4000`                   |
    /// | `SEARCH_INDEX`              | `documents`                               |
    /// | `SEARCH_API_VERSION`        | `2025-11-01-preview`                      |
    /// | `SEARCH_SCOPE`              | `https://search.azure.com/.default`       |
    /// | `SEARCH_API_KEY`            | none                                      |
    /// | `SEARCH_AUTH_MODE`          | `OBO` (`OBO` or `API_KEY`)                |
    /// | `SEARCH_GROUP_FILTER_FIELD` | `security_groups`                         |
    /// | `DOWNSTREAM_TIMEOUT_SECS`   | `10`                                      |
    /// | `EXCHANGE_RETRY_BACKOFF_MS` | `250`                                     |
    /// | `CORS_ORIGINS`              | `http://localhost:3000`                   |
    ///
    /// # Errors
    ///
    /// [`ConfigError`] when a numeric variable or the auth mode does not parse,
    /// or when `CORS_ORIGINS` contains the `*` wildcard.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// [`from_env`](Self::from_env) over an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// See [`from_env`](Self::from_env).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let or = |name: &str, default: &str| var(name).unwrap_or_else(|| default.to_string());

        let client_id = or("IDP_CLIENT_ID", "obo-relay");
        let authority = var("IDP_AUTHORITY").unwrap_or_else(|| match var("IDP_TENANT_ID") {
            Some(tenant) => format!("https://login.microsoftonline.com/{tenant}/v2.0"),
            None => "http://localhost:4000".to_string(),
        });
        let audiences = match var("IDP_AUDIENCE") {
            Some(list) => split_list(&list),
            None => vec![format!("api://{client_id}"), client_id.clone()],
        };

        let cors_raw = or("CORS_ORIGINS", "http://localhost:3000");
        let cors_origins = split_list(&cors_raw);
        if cors_origins.iter().any(|origin| origin == "*") {
            return Err(ConfigError {
                var: "CORS_ORIGINS",
                value: cors_raw,
                reason: "credentialed CORS needs explicit origins, not \"*\"".into(),
            });
        }

        let auth_mode_raw = or("SEARCH_AUTH_MODE", "OBO");
        let auth_mode = AuthStrategy::parse(&auth_mode_raw).map_err(|e| ConfigError {
            var: "SEARCH_AUTH_MODE",
            value: auth_mode_raw.clone(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            host: or("API_HOST", "0.0.0.0"),
            port: parse(&var, "API_PORT", 5000)?,
            oidc: OidcSettings {
                authority,
                client_id,
                client_secret: or("IDP_CLIENT_SECRET", "obo-relay-dev-secret"),
                audiences,
            },
            graph_base_url: or("GRAPH_BASE_URL", "http://localhost:4000/v1.0"),
            graph_scope: or("GRAPH_SCOPE", "https://graph.microsoft.com/User.Read"),
            search: SearchConfig {
                endpoint: or("SEARCH_ENDPOINT", "http://localhost:4000"),
                index: or("SEARCH_INDEX", "documents"),
                api_version: or("SEARCH_API_VERSION", "2025-11-01-preview"),
                scope: or("SEARCH_SCOPE", "https://search.azure.com/.default"),
                api_key: var("SEARCH_API_KEY"),
                auth_mode,
                group_filter_field: or("SEARCH_GROUP_FILTER_FIELD", "security_groups"),
            },
            downstream_timeout: Duration::from_secs(parse(&var, "DOWNSTREAM_TIMEOUT_SECS", 10)?),
            retry_backoff: Duration::from_millis(parse(&var, "EXCHANGE_RETRY_BACKOFF_MS", 250)?),
            cors_origins,
        })
    }

    /// The downstream resources the routes fan out to.
    pub fn targets(&self) -> Vec<DownstreamTarget> {
        let search = |name: &str, strategy: AuthStrategy| {
            let filtered = strategy == AuthStrategy::SharedSecret;
            let settings = SearchSettings {
                index: self.search.index.clone(),
                api_version: self.search.api_version.clone(),
                group_filter_field: filtered.then(|| self.search.group_filter_field.clone()),
                ..SearchSettings::default()
            };
            let target = DownstreamTarget::new(name, &self.search.endpoint, TargetKind::Search(settings), strategy)
                .with_scope(&self.search.scope)
                .with_timeout(self.downstream_timeout);
            if filtered { target } else { target.propagating_identity() }
        };

        vec![
            DownstreamTarget::new(PROFILE, &self.graph_base_url, TargetKind::Profile, AuthStrategy::Delegated)
                .with_scope(&self.graph_scope)
                .with_timeout(self.downstream_timeout),
            DownstreamTarget::new(GROUPS, &self.graph_base_url, TargetKind::Groups, AuthStrategy::Delegated)
                .with_scope(&self.graph_scope)
                .with_timeout(self.downstream_timeout),
            search(SEARCH, self.search.auth_mode),
            search(SEARCH_KEY, AuthStrategy::SharedSecret),
        ]
    }

    /// Operations served by the routes.
    pub fn operations() -> Vec<Operation> {
        vec![
            Operation::new("hello").require(PROFILE).optional(GROUPS),
            Operation::new("search").require(SEARCH),
            Operation::new("search-simple").require(SEARCH_KEY),
            Operation::new("search-compare").optional(SEARCH).optional(SEARCH_KEY),
        ]
    }

    /// Shared keys by target.
    pub fn secrets(&self) -> SecretStore {
        let key = self.search.api_key.as_deref().unwrap_or_default();
        SecretStore::new().with_key(SEARCH, key).with_key(SEARCH_KEY, key)
    }
}

fn parse<T: std::str::FromStr>(
    var: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match var(name) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError {
            var: name,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
