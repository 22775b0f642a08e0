use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::completion::DEFAULT_POLL_INTERVAL;
use crate::pagination::DEFAULT_PAGE_SIZE;
use crate::query_service::QueryTarget;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TlsMode {
    Disabled,
    #[default]
    Prefer,
    Require,
}

/// Where the query service lives. Only consulted by service adapters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServiceEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub tls_mode: TlsMode,
    /// Result sets an adapter may hold in memory before evicting the least recently used.
    pub buffered_executions: usize,
}

impl Default for ServiceEndpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            tls_mode: TlsMode::Prefer,
            buffered_executions: 32,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QuerySettings {
    pub region: Option<String>,
    pub profile: Option<String>,
    pub database: String,
    pub output_location: Option<String>,
    pub workgroup: String,
    pub page_size: usize,
    pub poll_interval_ms: u64,
    pub export_dir: Option<PathBuf>,
    pub service: ServiceEndpoint,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            region: None,
            profile: None,
            database: "default".to_string(),
            output_location: None,
            workgroup: "primary".to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            poll_interval_ms: u64::try_from(DEFAULT_POLL_INTERVAL.as_millis()).unwrap_or(1_500),
            export_dir: None,
            service: ServiceEndpoint::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("config directory is unavailable for this platform")]
    ConfigDirUnavailable,
    #[error("failed to read settings file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl QuerySettings {
    pub fn load_default() -> Result<Self, SettingsError> {
        Self::load_from_path(default_settings_path()?)
    }

    /// Missing or blank files yield defaults.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    #[must_use]
    pub fn query_target(&self) -> QueryTarget {
        QueryTarget {
            database: self.database.clone(),
            output_location: self.output_location.clone(),
            workgroup: self.workgroup.clone(),
        }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

pub fn default_settings_path() -> Result<PathBuf, SettingsError> {
    if let Some(custom) = env::var_os("QUARRY_CONFIG_DIR") {
        return Ok(PathBuf::from(custom).join("settings.toml"));
    }

    let base_dir = if cfg!(target_os = "windows") {
        env::var_os("APPDATA")
            .map(PathBuf::from)
            .ok_or(SettingsError::ConfigDirUnavailable)?
    } else if let Some(xdg_config_home) = env::var_os("XDG_CONFIG_HOME") {
        PathBuf::from(xdg_config_home)
    } else {
        let home = env::var_os("HOME").ok_or(SettingsError::ConfigDirUnavailable)?;
        PathBuf::from(home).join(".config")
    };

    Ok(base_dir.join("quarry").join("settings.toml"))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::{QuerySettings, SettingsError, TlsMode};

    #[test]
    fn missing_file_loads_defaults() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let settings = QuerySettings::load_from_path(temp_dir.path().join("settings.toml"))
            .expect("defaults should load");

        assert_eq!(settings, QuerySettings::default());
        assert_eq!(settings.page_size, 100);
        assert_eq!(settings.poll_interval(), Duration::from_millis(1_500));
        assert!(settings.query_target().output_location.is_none());
    }

    #[test]
    fn parses_partial_settings_over_defaults() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("settings.toml");
        fs::write(
            &path,
            r#"
region = "eu-west-1"
database = "sales"
output_location = "s3://bucket/results/"
page_size = 50

[service]
host = "db.internal"
tls_mode = "require"
"#,
        )
        .expect("failed to write settings");

        let settings = QuerySettings::load_from_path(&path).expect("settings should parse");

        assert_eq!(settings.region.as_deref(), Some("eu-west-1"));
        assert_eq!(settings.workgroup, "primary");
        assert_eq!(settings.page_size, 50);
        assert_eq!(settings.service.host, "db.internal");
        assert_eq!(settings.service.port, 3306);
        assert_eq!(settings.service.tls_mode, TlsMode::Require);
        assert_eq!(settings.service.buffered_executions, 32);

        let target = settings.query_target();
        assert_eq!(target.database, "sales");
        assert_eq!(
            target.output_location.as_deref(),
            Some("s3://bucket/results/")
        );
    }

    #[test]
    fn malformed_file_reports_parse_error() {
        let temp_dir = TempDir::new().expect("failed to create temp directory");
        let path = temp_dir.path().join("settings.toml");
        fs::write(&path, "page_size = \"many\"").expect("failed to write settings");

        let error = QuerySettings::load_from_path(&path).expect_err("parse should fail");
        assert!(matches!(error, SettingsError::Parse { .. }));
    }
}
