use crate::session::{StorageKeys, DEFAULT_EXPIRY_KEY, DEFAULT_ROLE_KEY, DEFAULT_TOKEN_KEY};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_API_BASE: &str = "http://localhost:8080/api";

fn default_timeout_ms() -> u64 {
    30_000
}

/// A validation error in the configuration
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]: {}", self.field, self.message)
    }
}

/// HTTP transport settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct HttpConfig {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Where and how the session is persisted
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct SessionConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub token_key: Option<String>,
    #[serde(default)]
    pub expiry_key: Option<String>,
    #[serde(default)]
    pub role_key: Option<String>,
    /// Re-check expiry before each request (default: true)
    #[serde(default)]
    pub recheck_on_fetch: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct JournalConfig {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GuardConfig {
    #[serde(default)]
    pub entry_point: Option<String>,
}

/// Main configuration structure. Every field is optional so layers can be
/// merged; the accessor methods apply defaults.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api_base: Option<String>,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub journal: JournalConfig,
    #[serde(default)]
    pub guard: GuardConfig,
}

/// `~/.uniportal`, if a home directory exists
pub fn user_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".uniportal"))
}

/// Strip trailing slashes and a login endpoint pasted in by mistake
pub fn normalize_api_base(raw: &str) -> String {
    let base = raw.trim().trim_end_matches('/');
    let base = base
        .strip_suffix("/auth/login")
        .or_else(|| base.strip_suffix("/login"))
        .unwrap_or(base);
    base.trim_end_matches('/').to_string()
}

impl Config {
    /// Load configuration from default paths
    /// Priority: local (.uniportal/config.local.toml) > project (.uniportal/config.toml) > user (~/.uniportal/config.toml)
    pub fn load() -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = user_dir() {
            let user_config = dir.join("config.toml");
            if user_config.exists() {
                config.merge(Self::load_from(&user_config)?);
            }
        }

        let project_config = Path::new(".uniportal").join("config.toml");
        if project_config.exists() {
            config.merge(Self::load_from(&project_config)?);
        }

        // Local overrides, should be gitignored
        let local_config = Path::new(".uniportal").join("config.local.toml");
        if local_config.exists() {
            config.merge(Self::load_from(&local_config)?);
        }

        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Merge another config into this one (other takes priority where set)
    pub fn merge(&mut self, other: Config) {
        if other.api_base.is_some() {
            self.api_base = other.api_base;
        }

        if other.http.timeout_ms.is_some() {
            self.http.timeout_ms = other.http.timeout_ms;
        }

        if other.session.path.is_some() {
            self.session.path = other.session.path;
        }
        if other.session.token_key.is_some() {
            self.session.token_key = other.session.token_key;
        }
        if other.session.expiry_key.is_some() {
            self.session.expiry_key = other.session.expiry_key;
        }
        if other.session.role_key.is_some() {
            self.session.role_key = other.session.role_key;
        }
        if other.session.recheck_on_fetch.is_some() {
            self.session.recheck_on_fetch = other.session.recheck_on_fetch;
        }

        if other.journal.enabled.is_some() {
            self.journal.enabled = other.journal.enabled;
        }
        if other.journal.path.is_some() {
            self.journal.path = other.journal.path;
        }

        if other.guard.entry_point.is_some() {
            self.guard.entry_point = other.guard.entry_point;
        }
    }

    pub fn api_base(&self) -> String {
        normalize_api_base(self.api_base.as_deref().unwrap_or(DEFAULT_API_BASE))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.http.timeout_ms.unwrap_or_else(default_timeout_ms))
    }

    /// Session file, defaulting to `~/.uniportal/session.json`
    pub fn session_path(&self) -> PathBuf {
        self.session.path.clone().unwrap_or_else(|| {
            user_dir()
                .unwrap_or_else(|| PathBuf::from(".uniportal"))
                .join("session.json")
        })
    }

    pub fn storage_keys(&self) -> StorageKeys {
        StorageKeys {
            token: self
                .session
                .token_key
                .clone()
                .unwrap_or_else(|| DEFAULT_TOKEN_KEY.to_string()),
            expiry: self
                .session
                .expiry_key
                .clone()
                .unwrap_or_else(|| DEFAULT_EXPIRY_KEY.to_string()),
            role: self
                .session
                .role_key
                .clone()
                .unwrap_or_else(|| DEFAULT_ROLE_KEY.to_string()),
        }
    }

    pub fn recheck_on_fetch(&self) -> bool {
        self.session.recheck_on_fetch.unwrap_or(true)
    }

    /// Journal file, or None when journaling is disabled
    pub fn journal_path(&self) -> Option<PathBuf> {
        if !self.journal.enabled.unwrap_or(true) {
            return None;
        }
        Some(self.journal.path.clone().unwrap_or_else(|| {
            user_dir()
                .unwrap_or_else(|| PathBuf::from(".uniportal"))
                .join("journal.jsonl")
        }))
    }

    pub fn entry_point(&self) -> String {
        self.guard
            .entry_point
            .clone()
            .unwrap_or_else(|| crate::guard::DEFAULT_ENTRY_POINT.to_string())
    }

    /// Validate configuration and return any errors found
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let api_base = self.api_base();
        if !(api_base.starts_with("http://") || api_base.starts_with("https://")) {
            errors.push(ValidationError {
                field: "api_base".to_string(),
                message: format!("Expected an http(s) URL, got '{}'", api_base),
            });
        }

        if self.http.timeout_ms == Some(0) {
            errors.push(ValidationError {
                field: "http.timeout_ms".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        let keys = self.storage_keys();
        for (field, key) in [
            ("session.token_key", &keys.token),
            ("session.expiry_key", &keys.expiry),
            ("session.role_key", &keys.role),
        ] {
            if key.trim().is_empty() {
                errors.push(ValidationError {
                    field: field.to_string(),
                    message: "Key must not be empty".to_string(),
                });
            }
        }
        if keys.token == keys.expiry || keys.token == keys.role || keys.expiry == keys.role {
            errors.push(ValidationError {
                field: "session".to_string(),
                message: "Storage keys must be distinct".to_string(),
            });
        }

        if !self.entry_point().starts_with('/') {
            errors.push(ValidationError {
                field: "guard.entry_point".to_string(),
                message: format!("Must start with '/', got '{}'", self.entry_point()),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api_base(), "http://localhost:8080/api");
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert_eq!(config.storage_keys(), StorageKeys::default());
        assert!(config.recheck_on_fetch());
        assert_eq!(config.entry_point(), "/login");
        assert!(config.session_path().ends_with("session.json"));
        assert!(config.journal_path().unwrap().ends_with("journal.jsonl"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_normalize_api_base() {
        assert_eq!(
            normalize_api_base("http://localhost:8080/api/"),
            "http://localhost:8080/api"
        );
        assert_eq!(
            normalize_api_base("http://localhost:8080/api/auth/login"),
            "http://localhost:8080/api"
        );
        assert_eq!(
            normalize_api_base(" https://erp.example.edu/api/login "),
            "https://erp.example.edu/api"
        );
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
api_base = "https://erp.example.edu/api"

[http]
timeout_ms = 5000

[session]
path = "/tmp/uniportal-session.json"
recheck_on_fetch = false

[journal]
enabled = false

[guard]
entry_point = "/"
"#,
        )
        .unwrap();

        assert_eq!(config.api_base(), "https://erp.example.edu/api");
        assert_eq!(config.timeout(), Duration::from_millis(5000));
        assert_eq!(
            config.session_path(),
            PathBuf::from("/tmp/uniportal-session.json")
        );
        assert!(!config.recheck_on_fetch());
        assert!(config.journal_path().is_none());
        assert_eq!(config.entry_point(), "/");
    }

    #[test]
    fn test_merge_prefers_set_values() {
        let mut base: Config = toml::from_str(
            r#"
api_base = "http://user.local/api"
[http]
timeout_ms = 1000
[session]
token_key = "tok"
"#,
        )
        .unwrap();
        let project: Config = toml::from_str(
            r#"
api_base = "http://project.local/api"
[session]
recheck_on_fetch = false
"#,
        )
        .unwrap();

        base.merge(project);
        assert_eq!(base.api_base(), "http://project.local/api");
        assert_eq!(base.timeout(), Duration::from_millis(1000));
        assert_eq!(base.storage_keys().token, "tok");
        assert!(!base.recheck_on_fetch());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "api_base = \"http://10.0.0.5:8080/api\"\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.api_base(), "http://10.0.0.5:8080/api");

        std::fs::write(&path, "api_base = [").unwrap();
        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn test_validate_bad_api_base() {
        let config = Config {
            api_base: Some("localhost:8080".to_string()),
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].field.contains("api_base"));
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = Config::default();
        config.http.timeout_ms = Some(0);
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "http.timeout_ms");
    }

    #[test]
    fn test_validate_duplicate_keys() {
        let mut config = Config::default();
        config.session.expiry_key = Some("app_token".to_string());
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("distinct"));
    }

    #[test]
    fn test_validate_entry_point() {
        let mut config = Config::default();
        config.guard.entry_point = Some("login".to_string());
        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().starts_with("[guard.entry_point]"));
    }
}
