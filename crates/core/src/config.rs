//! TOML-based configuration system for ldapsync.
//!
//! Sensitive values (the bind password) are stored as `_env` fields that
//! reference environment variable names. The actual secrets are resolved at
//! runtime via [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;
use crate::ldap::{DirectoryModel, Flavor};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Source directory settings.
    pub ldap: LdapConfig,

    /// Destination database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Synchronization behaviour settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Daemon settings.
    #[serde(default)]
    pub daemon: DaemonConfig,
}

// ---------------------------------------------------------------------------
// LDAP
// ---------------------------------------------------------------------------

/// How to authenticate to the directory.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BindMethod {
    /// Simple bind with a DN and password.
    #[default]
    Simple,
    /// SASL EXTERNAL (client certificate or `ldapi://` peer credentials).
    External,
    /// No authentication.
    Anonymous,
}

/// Source directory connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    /// Server URL (`ldap://`, `ldaps://` or `ldapi://`).
    pub url: String,

    /// DNS domain; the search base defaults to its `dc=` form.
    #[serde(default)]
    pub domain: Option<String>,

    /// Explicit search base.
    #[serde(default)]
    pub base: Option<String>,

    #[serde(default)]
    pub bind: BindMethod,

    /// Bind DN for simple binds.
    #[serde(default)]
    pub bind_dn: Option<String>,

    /// Environment variable holding the bind password.
    #[serde(default)]
    pub password_env: Option<String>,

    /// Directory vendor / schema family.
    #[serde(default)]
    pub flavor: Flavor,

    /// Override of the flavor's user object class.
    #[serde(default)]
    pub user_object_class: Option<String>,

    /// Override of the flavor's group object class.
    #[serde(default)]
    pub group_object_class: Option<String>,

    /// Connection timeout in seconds (default 30).
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Resolved bind password (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub bind_password: Option<String>,
}

fn default_timeout() -> u64 {
    30
}

impl LdapConfig {
    /// Search base: the explicit `base`, else derived from `domain`.
    pub fn base_dn(&self) -> String {
        match (&self.base, &self.domain) {
            (Some(base), _) => base.clone(),
            (None, Some(domain)) => domain_to_base(domain),
            (None, None) => String::new(),
        }
    }

    /// Directory policy for the configured flavor and overrides.
    pub fn directory_model(&self) -> DirectoryModel {
        DirectoryModel::new(self.flavor).with_object_classes(
            self.user_object_class.as_deref(),
            self.group_object_class.as_deref(),
        )
    }
}

/// `example.com` -> `dc=example,dc=com`
pub fn domain_to_base(domain: &str) -> String {
    domain
        .split('.')
        .filter(|part| !part.is_empty())
        .map(|part| format!("dc={part}"))
        .collect::<Vec<_>>()
        .join(",")
}

// ---------------------------------------------------------------------------
// Database
// ---------------------------------------------------------------------------

/// Destination database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/ldapsync/ldapsync.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// Sync
// ---------------------------------------------------------------------------

/// Synchronization settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Optional append-only log of every committed cookie.
    #[serde(default)]
    pub cookie_file: Option<PathBuf>,

    /// Daemon matching policy: identifiers only, never names.
    #[serde(default)]
    pub strict: bool,

    /// Daemon deletion policy: remove rows instead of disabling them.
    #[serde(default)]
    pub delete: bool,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional log file; rotated daily.
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// First reconnect delay after a failure.
    #[serde(default = "default_retry_initial")]
    pub retry_initial_secs: u64,

    /// Upper bound of the reconnect delay.
    #[serde(default = "default_retry_max")]
    pub retry_max_secs: u64,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_retry_initial() -> u64 {
    5
}
fn default_retry_max() -> u64 {
    300
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
            retry_initial_secs: default_retry_initial(),
            retry_max_secs: default_retry_max(),
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Sample configuration written by `ldapsync init`.
pub const SAMPLE_CONFIG: &str = r#"# ldapsync configuration

[ldap]
url = "ldap://ldap.example.com"
domain = "example.com"
# base = "dc=example,dc=com"
bind = "simple"
bind_dn = "cn=sync,dc=example,dc=com"
password_env = "LDAP_PASSWORD"
flavor = "rfc4519"
# user_object_class = "person"
# group_object_class = "groupOfNames"
timeout_secs = 30

[database]
path = "/var/lib/ldapsync/ldapsync.db"

[sync]
# cookie_file = "/var/lib/ldapsync/cookies.txt"
strict = false
delete = false

[daemon]
log_level = "info"
# log_file = "/var/log/ldapsync/ldapsync.log"
retry_initial_secs = 5
retry_max_secs = 300
"#;

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables.
    ///
    /// A missing variable only logs a warning; use
    /// [`require_secrets`](Self::require_secrets) before connecting.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        if let Some(ref env_name) = self.ldap.password_env {
            self.ldap.bind_password = resolve_optional_env(env_name, "ldap.password_env");
        }
        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Fail if a secret needed to bind is unresolved.
    pub fn require_secrets(&self) -> Result<(), ConfigError> {
        if self.ldap.bind == BindMethod::Simple && self.ldap.bind_password.is_none() {
            if let Some(ref env_name) = self.ldap.password_env {
                return Err(ConfigError::EnvVarMissing {
                    var: env_name.clone(),
                    field: "ldap.password_env".into(),
                });
            }
        }
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = &self.ldap.url;
        if url.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ldap.url".into(),
                detail: "LDAP URL must not be empty".into(),
            });
        }
        if !["ldap://", "ldaps://", "ldapi://"]
            .iter()
            .any(|scheme| url.starts_with(scheme))
        {
            return Err(ConfigError::InvalidValue {
                field: "ldap.url".into(),
                detail: format!("unsupported URL scheme in '{url}'"),
            });
        }
        if self.ldap.base_dn().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "ldap.base".into(),
                detail: "either ldap.base or ldap.domain must be set".into(),
            });
        }
        if self.ldap.bind == BindMethod::Simple && self.ldap.bind_dn.is_none() {
            return Err(ConfigError::InvalidValue {
                field: "ldap.bind_dn".into(),
                detail: "simple bind requires a bind DN".into(),
            });
        }
        if self.ldap.timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "ldap.timeout_secs".into(),
                detail: "timeout must be > 0".into(),
            });
        }
        if !LOG_LEVELS.contains(&self.daemon.log_level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "daemon.log_level".into(),
                detail: format!("expected one of {}", LOG_LEVELS.join(", ")),
            });
        }
        if self.daemon.retry_initial_secs == 0
            || self.daemon.retry_max_secs < self.daemon.retry_initial_secs
        {
            return Err(ConfigError::InvalidValue {
                field: "daemon.retry_max_secs".into(),
                detail: "retry delays must satisfy 0 < initial <= max".into(),
            });
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_sample_config() {
        let config: AppConfig = toml::from_str(SAMPLE_CONFIG).expect("failed to parse toml");
        assert_eq!(config.ldap.url, "ldap://ldap.example.com");
        assert_eq!(config.ldap.base_dn(), "dc=example,dc=com");
        assert_eq!(config.ldap.flavor, Flavor::Rfc4519);
        assert_eq!(config.ldap.bind, BindMethod::Simple);
        assert!(config.sync.cookie_file.is_none());
        assert!(!config.sync.strict && !config.sync.delete);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(SAMPLE_CONFIG.as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.daemon.log_level, "info");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_defaults_and_overrides() {
        let minimal = r#"
[ldap]
url = "ldapi://%2fvar%2frun%2fslapd%2fldapi"
base = "o=corp"
bind = "external"
flavor = "freeipa"
user_object_class = "posixAccount"
"#;
        let config: AppConfig = toml::from_str(minimal).unwrap();
        config.validate().unwrap();
        assert_eq!(config.ldap.base_dn(), "o=corp");
        assert_eq!(config.ldap.timeout_secs, 30);
        assert_eq!(config.database.path, PathBuf::from("/var/lib/ldapsync/ldapsync.db"));
        assert_eq!(config.daemon.retry_max_secs, 300);

        let model = config.ldap.directory_model();
        assert_eq!(model.user.object_class, "posixAccount");
        assert_eq!(model.group.object_class, "ipaUserGroup");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config: AppConfig = toml::from_str(SAMPLE_CONFIG).unwrap();
        config.ldap.url = "http://ldap.example.com".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "ldap.url"
        ));

        let mut config: AppConfig = toml::from_str(SAMPLE_CONFIG).unwrap();
        config.ldap.domain = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "ldap.base"
        ));

        let mut config: AppConfig = toml::from_str(SAMPLE_CONFIG).unwrap();
        config.ldap.bind_dn = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "ldap.bind_dn"
        ));

        let mut config: AppConfig = toml::from_str(SAMPLE_CONFIG).unwrap();
        config.daemon.retry_max_secs = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("LDAPSYNC_TEST_PW", "s3cret");

        let mut config: AppConfig = toml::from_str(SAMPLE_CONFIG).unwrap();
        config.ldap.password_env = Some("LDAPSYNC_TEST_PW".into());
        config.resolve_env_vars().unwrap();
        assert_eq!(config.ldap.bind_password.as_deref(), Some("s3cret"));
        config.require_secrets().unwrap();

        config.ldap.password_env = Some("LDAPSYNC_TEST_UNSET_PW".into());
        config.resolve_env_vars().unwrap();
        assert!(matches!(
            config.require_secrets(),
            Err(ConfigError::EnvVarMissing { ref var, .. }) if var == "LDAPSYNC_TEST_UNSET_PW"
        ));

        std::env::remove_var("LDAPSYNC_TEST_PW");
    }

    #[test]
    fn test_domain_to_base() {
        assert_eq!(domain_to_base("example.com"), "dc=example,dc=com");
        assert_eq!(domain_to_base("corp.example.org."), "dc=corp,dc=example,dc=org");
    }
}
