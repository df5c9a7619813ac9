//! Site-wide settings
//!
//! Settings are loaded from a TOML file. Every section is optional and
//! falls back to built-in defaults.
//!
//! # Resolution Priority
//!
//! 1. `--settings` flag or `PGCONVERGE_SETTINGS` environment variable
//! 2. `XDG_CONFIG_HOME/pgconverge/settings.toml` (if set)
//! 3. `~/.config/pgconverge/settings.toml`
//! 4. Built-in defaults
//!
//! Paths may start with `~`, which is expanded when loading. Templated
//! paths use `{version}` and `{name}` placeholders.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable for the settings file override
pub const ENV_SETTINGS: &str = "PGCONVERGE_SETTINGS";

const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub postgresql: PostgresqlSettings,
    pub roles: RolesSettings,
    pub service_manager: ServiceManagerSettings,
    pub engine: EngineSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<PrometheusSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pgbackrest: Option<PgBackRestSettings>,
}

// ============================================================================
// PostgreSQL
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PostgresqlSettings {
    /// Root directory holding `{version}/{name}/data`
    pub root: PathBuf,
    /// Directory of PostgreSQL binaries, templated by `{version}`
    pub bindir: String,
    /// Version used when a manifest does not name one
    pub default_version: Option<String>,
    /// Versions available on this host, newest first
    pub versions: Vec<String>,
    pub socket_directory: PathBuf,
    pub surole: SuRole,
    /// Role used by standbys to stream from their primary, created on
    /// every started primary
    pub replrole: Option<String>,
    pub initdb: InitdbSettings,
    pub auth: AuthSettings,
    /// Restart instances without asking when a change requires it
    pub restart_on_changes: bool,
}

impl Default for PostgresqlSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/pgconverge"),
            bindir: "/usr/lib/postgresql/{version}/bin".to_string(),
            default_version: None,
            versions: ["17", "16", "15", "14", "13"]
                .into_iter()
                .map(String::from)
                .collect(),
            socket_directory: PathBuf::from("/run/postgresql"),
            surole: SuRole::default(),
            replrole: None,
            initdb: InitdbSettings::default(),
            auth: AuthSettings::default(),
            restart_on_changes: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SuRole {
    pub name: String,
    /// Store the super-user password in the password file
    pub pgpass: bool,
}

impl Default for SuRole {
    fn default() -> Self {
        Self {
            name: "postgres".to_string(),
            pgpass: false,
        }
    }
}

/// Site defaults for new clusters, each overridable per manifest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InitdbSettings {
    pub data_checksums: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthSettings {
    /// Authentication method for local-socket connections
    pub local: String,
    /// Authentication method for TCP/IP connections
    pub host: String,
    /// Password file holding role entries
    pub passfile: PathBuf,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            local: "trust".to_string(),
            host: "scram-sha-256".to_string(),
            passfile: PathBuf::from("~/.pgpass"),
        }
    }
}

// ============================================================================
// Roles
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RolesSettings {
    /// Connection limit applied to roles that do not set one
    pub connection_limit: Option<i32>,
}

// ============================================================================
// Service manager
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceManagerSettings {
    /// Use the per-user systemd instance (`systemctl --user`)
    pub user: bool,
    /// Prefix system-wide calls with sudo
    pub sudo: bool,
    /// Directory receiving unit files
    pub unit_path: PathBuf,
}

impl Default for ServiceManagerSettings {
    fn default() -> Self {
        Self {
            user: true,
            sudo: false,
            unit_path: PathBuf::from("~/.config/systemd/user"),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSettings {
    /// Instances reconciled concurrently
    pub jobs: usize,
    /// Directory holding per-instance lock files
    pub lock_dir: PathBuf,
    /// Bound for one SQL statement, in seconds
    pub statement_timeout: u64,
    /// Bound for one service-manager or instance-control call, in seconds
    pub service_timeout: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            jobs: 4,
            lock_dir: PathBuf::from("~/.local/state/pgconverge/locks"),
            statement_timeout: 30,
            service_timeout: 120,
        }
    }
}

impl EngineSettings {
    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout)
    }

    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.service_timeout)
    }
}

// ============================================================================
// Satellites
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrometheusSettings {
    pub execpath: PathBuf,
    /// Environment file of the exporter, templated by `{version}` and `{name}`
    pub configpath: String,
    pub default_port: u16,
}

impl Default for PrometheusSettings {
    fn default() -> Self {
        Self {
            execpath: PathBuf::from("/usr/bin/prometheus-postgres-exporter"),
            configpath: "~/.config/pgconverge/prometheus/postgres_exporter-{version}-{name}.conf"
                .to_string(),
            default_port: 9187,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PgBackRestSettings {
    pub execpath: PathBuf,
    /// Configuration file, templated by `{version}` and `{name}`
    pub configpath: String,
    /// Backup repository root
    pub repository: PathBuf,
}

impl Default for PgBackRestSettings {
    fn default() -> Self {
        Self {
            execpath: PathBuf::from("/usr/bin/pgbackrest"),
            configpath: "~/.config/pgconverge/pgbackrest/pgbackrest-{version}-{name}.conf"
                .to_string(),
            repository: PathBuf::from("~/.local/share/pgconverge/backups"),
        }
    }
}

// ============================================================================
// Loading
// ============================================================================

impl Settings {
    /// Load settings, returning them with the file they came from.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        let path = match explicit {
            Some(p) => Some(p.to_path_buf()),
            None => default_path().filter(|p| p.exists()),
        };

        let Some(path) = path else {
            log::debug!("No settings file found, using defaults");
            return Ok((Self::default().expanded(), None));
        };

        log::debug!("Loading settings from {}", path.display());
        let settings = Self::from_file(&path)?;
        Ok((settings, Some(path)))
    }

    /// Parse a settings file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let settings: Self = toml::from_str(&content)
            .with_context(|| format!("Invalid settings in {}", path.display()))?;
        Ok(settings.expanded())
    }

    /// Expand `~` in every path
    pub fn expanded(mut self) -> Self {
        let pg = &mut self.postgresql;
        pg.root = expand_path(&pg.root);
        pg.socket_directory = expand_path(&pg.socket_directory);
        pg.auth.passfile = expand_path(&pg.auth.passfile);
        self.service_manager.unit_path = expand_path(&self.service_manager.unit_path);
        self.engine.lock_dir = expand_path(&self.engine.lock_dir);
        if let Some(prom) = &mut self.prometheus {
            prom.execpath = expand_path(&prom.execpath);
            prom.configpath = shellexpand::tilde(&prom.configpath).into_owned();
        }
        if let Some(br) = &mut self.pgbackrest {
            br.execpath = expand_path(&br.execpath);
            br.configpath = shellexpand::tilde(&br.configpath).into_owned();
            br.repository = expand_path(&br.repository);
        }
        self
    }

    /// Data directory of an instance
    pub fn datadir(&self, version: &str, name: &str) -> PathBuf {
        self.postgresql.root.join(version).join(name).join("data")
    }

    /// Binary directory for a version
    pub fn bindir(&self, version: &str) -> PathBuf {
        PathBuf::from(self.postgresql.bindir.replace("{version}", version))
    }
}

/// Default settings file location
pub fn default_path() -> Option<PathBuf> {
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        return Some(
            PathBuf::from(xdg_config)
                .join("pgconverge")
                .join(SETTINGS_FILE),
        );
    }
    dirs::home_dir().map(|home| home.join(".config").join("pgconverge").join(SETTINGS_FILE))
}

/// Substitute `{version}` and `{name}` in a path template
pub fn render_template(template: &str, version: &str, name: &str) -> PathBuf {
    PathBuf::from(
        template
            .replace("{version}", version)
            .replace("{name}", name),
    )
}

/// Expand a path with `~`
pub fn expand_path(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&s).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_parse_from_empty_file() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.postgresql.surole.name, "postgres");
        assert_eq!(settings.engine.jobs, 4);
        assert!(settings.prometheus.is_none());
    }

    #[test]
    fn test_sections_enable_satellites() {
        let settings: Settings = toml::from_str(
            r#"
            [postgresql]
            root = "/srv/pg"
            default_version = "16"
            replrole = "replication"

            [postgresql.initdb]
            data_checksums = true
            locale = "C.UTF-8"

            [roles]
            connection_limit = 50

            [prometheus]
            default_port = 9200
            "#,
        )
        .unwrap();
        assert_eq!(settings.postgresql.root, PathBuf::from("/srv/pg"));
        assert_eq!(settings.postgresql.replrole.as_deref(), Some("replication"));
        assert!(settings.postgresql.initdb.data_checksums);
        assert_eq!(settings.postgresql.initdb.locale.as_deref(), Some("C.UTF-8"));
        assert_eq!(settings.postgresql.initdb.encoding, None);
        assert_eq!(settings.roles.connection_limit, Some(50));
        assert_eq!(settings.prometheus.unwrap().default_port, 9200);
        assert!(settings.pgbackrest.is_none());
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        assert!(toml::from_str::<Settings>("[engine]\nworkers = 3").is_err());
    }

    #[test]
    fn test_from_file_expands_tilde() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "[engine]\nlock_dir = \"~/locks\"\n").unwrap();
        let settings = Settings::from_file(&path).unwrap();
        assert!(!settings.engine.lock_dir.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn test_paths() {
        let settings = Settings::default();
        assert_eq!(
            settings.datadir("16", "main"),
            PathBuf::from("/var/lib/pgconverge/16/main/data")
        );
        assert_eq!(
            settings.bindir("16"),
            PathBuf::from("/usr/lib/postgresql/16/bin")
        );
        assert_eq!(
            render_template("/etc/exporter-{version}-{name}.conf", "16", "main"),
            PathBuf::from("/etc/exporter-16-main.conf")
        );
    }
}
