//! Service manager contract and its systemd implementation
//!
//! The engine only talks to [`ServiceManager`]; which supervisor sits
//! behind it is a site setting.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use thiserror::Error;

use crate::model::{InstanceRef, SatelliteKind};
use crate::runner::{RunError, probe, run_with_timeout};
use crate::settings::Settings;

const UNIT_PREFIX: &str = "pgconverge";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Could not write unit file {path}: {source}")]
    UnitFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("unit {0} is not installed")]
    NotInstalled(String),
}

impl From<ServiceError> for converge::Error {
    fn from(err: ServiceError) -> Self {
        if let ServiceError::Run(run) = &err
            && let Some(timeout) = run.timeout()
        {
            return Self::Timeout(timeout);
        }
        Self::execution(err)
    }
}

/// A supervised unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    /// Full unit name, e.g. `pgconverge-postgresql@16-main.service`
    pub name: String,
    pub description: String,
    pub exec_start: String,
    pub environment_file: Option<PathBuf>,
    /// Run periodically instead of continuously (`OnCalendar=` spec)
    pub schedule: Option<String>,
}

impl Unit {
    /// The PostgreSQL server of an instance
    pub fn postgresql(instance: &InstanceRef) -> Self {
        Self {
            name: format!("{UNIT_PREFIX}-postgresql@{}.service", instance.qualname()),
            description: format!("PostgreSQL {}", instance.label()),
            exec_start: format!(
                "{} -D {}",
                instance.bindir.join("postgres").display(),
                instance.datadir.display()
            ),
            environment_file: None,
            schedule: None,
        }
    }

    /// The unit driving a satellite of an instance
    pub fn satellite(
        kind: SatelliteKind,
        instance: &InstanceRef,
        execpath: &Path,
        configpath: &Path,
    ) -> Self {
        match kind {
            SatelliteKind::Prometheus => Self {
                name: format!(
                    "{UNIT_PREFIX}-postgres_exporter@{}.service",
                    instance.qualname()
                ),
                description: format!("Prometheus exporter for PostgreSQL {}", instance.label()),
                exec_start: execpath.display().to_string(),
                environment_file: Some(configpath.to_path_buf()),
                schedule: None,
            },
            SatelliteKind::Pgbackrest => Self {
                name: format!("{UNIT_PREFIX}-backup@{}.timer", instance.qualname()),
                description: format!("Backup of PostgreSQL {}", instance.label()),
                exec_start: format!(
                    "{} --config={} --stanza={} backup",
                    execpath.display(),
                    configpath.display(),
                    instance.qualname()
                ),
                environment_file: None,
                schedule: Some("daily".to_string()),
            },
        }
    }

    /// Unit files to install, as `(file name, content)`
    pub fn files(&self) -> Vec<(String, String)> {
        let Some(schedule) = &self.schedule else {
            return vec![(self.name.clone(), self.service_body("simple"))];
        };
        let stem = self.name.trim_end_matches(".timer");
        let timer = format!(
            "[Unit]\nDescription={}\n\n[Timer]\nOnCalendar={}\nPersistent=true\n\n[Install]\nWantedBy=timers.target\n",
            self.description, schedule
        );
        vec![
            (format!("{stem}.service"), self.service_body("oneshot")),
            (self.name.clone(), timer),
        ]
    }

    fn service_body(&self, kind: &str) -> String {
        let mut body = format!(
            "[Unit]\nDescription={}\nAfter=network.target\n\n[Service]\nType={}\n",
            self.description, kind
        );
        if let Some(env) = &self.environment_file {
            let _ = writeln!(body, "EnvironmentFile={}", env.display());
        }
        let _ = writeln!(body, "ExecStart={}", self.exec_start);
        if kind == "simple" {
            body.push_str("KillMode=mixed\nKillSignal=SIGINT\nTimeoutSec=0\n");
        }
        if self.schedule.is_none() {
            body.push_str("\n[Install]\nWantedBy=default.target\n");
        }
        body
    }
}

/// Process supervisor operations
pub trait ServiceManager: Send {
    /// Write the unit and enable it
    fn install(&self, unit: &Unit) -> Result<(), ServiceError>;

    fn start(&self, unit: &Unit) -> Result<(), ServiceError>;

    fn stop(&self, unit: &Unit) -> Result<(), ServiceError>;

    fn is_running(&self, unit: &Unit) -> Result<bool, ServiceError>;

    /// Disable the unit and delete its files
    fn uninstall(&self, unit: &Unit) -> Result<(), ServiceError>;

    fn is_installed(&self, unit: &Unit) -> Result<bool, ServiceError>;

    fn restart(&self, unit: &Unit) -> Result<(), ServiceError> {
        self.stop(unit)?;
        self.start(unit)
    }
}

/// `systemctl` backed service manager
pub struct SystemdServiceManager {
    user: bool,
    sudo: bool,
    unit_path: PathBuf,
    timeout: Duration,
}

impl SystemdServiceManager {
    pub fn new(settings: &Settings) -> Self {
        let sm = &settings.service_manager;
        Self {
            user: sm.user,
            sudo: sm.sudo,
            unit_path: sm.unit_path.clone(),
            timeout: settings.engine.service_timeout(),
        }
    }

    fn systemctl(&self) -> Command {
        let mut cmd = if self.sudo && !self.user {
            let mut cmd = Command::new("sudo");
            cmd.args(["-n", "systemctl"]);
            cmd
        } else {
            Command::new("systemctl")
        };
        if self.user {
            cmd.arg("--user");
        }
        cmd
    }

    fn run(&self, args: &[&str]) -> Result<(), ServiceError> {
        let mut cmd = self.systemctl();
        cmd.args(args);
        run_with_timeout(&mut cmd, None, self.timeout)?;
        Ok(())
    }

    fn probe(&self, args: &[&str]) -> Result<bool, ServiceError> {
        let mut cmd = self.systemctl();
        cmd.args(args);
        Ok(probe(&mut cmd, self.timeout)?)
    }
}

impl ServiceManager for SystemdServiceManager {
    fn install(&self, unit: &Unit) -> Result<(), ServiceError> {
        fs::create_dir_all(&self.unit_path).map_err(|source| ServiceError::UnitFile {
            path: self.unit_path.clone(),
            source,
        })?;
        for (file, content) in unit.files() {
            let path = self.unit_path.join(file);
            log::debug!("Writing unit file {}", path.display());
            fs::write(&path, content).map_err(|source| ServiceError::UnitFile { path, source })?;
        }
        self.run(&["daemon-reload"])?;
        self.run(&["enable", &unit.name])
    }

    fn start(&self, unit: &Unit) -> Result<(), ServiceError> {
        self.run(&["start", &unit.name])
    }

    fn stop(&self, unit: &Unit) -> Result<(), ServiceError> {
        self.run(&["stop", &unit.name])
    }

    fn is_running(&self, unit: &Unit) -> Result<bool, ServiceError> {
        self.probe(&["is-active", "--quiet", &unit.name])
    }

    fn uninstall(&self, unit: &Unit) -> Result<(), ServiceError> {
        if !self.is_installed(unit)? {
            return Err(ServiceError::NotInstalled(unit.name.clone()));
        }
        self.run(&["disable", &unit.name])?;
        for (file, _) in unit.files() {
            let path = self.unit_path.join(file);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(ServiceError::UnitFile { path, source }),
            }
        }
        self.run(&["daemon-reload"])
    }

    fn is_installed(&self, unit: &Unit) -> Result<bool, ServiceError> {
        Ok(self.unit_path.join(&unit.name).is_file())
    }

    fn restart(&self, unit: &Unit) -> Result<(), ServiceError> {
        self.run(&["restart", &unit.name])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance() -> InstanceRef {
        InstanceRef::new(&Settings::default(), "16", "main", 5432)
    }

    #[test]
    fn test_postgresql_unit() {
        let unit = Unit::postgresql(&instance());
        assert_eq!(unit.name, "pgconverge-postgresql@16-main.service");
        let files = unit.files();
        assert_eq!(files.len(), 1);
        assert!(files[0].1.contains(
            "ExecStart=/usr/lib/postgresql/16/bin/postgres -D /var/lib/pgconverge/16/main/data"
        ));
        assert!(files[0].1.contains("WantedBy=default.target"));
    }

    #[test]
    fn test_exporter_unit_reads_environment_file() {
        let unit = Unit::satellite(
            SatelliteKind::Prometheus,
            &instance(),
            Path::new("/usr/bin/exporter"),
            Path::new("/etc/exporter.conf"),
        );
        assert_eq!(unit.name, "pgconverge-postgres_exporter@16-main.service");
        assert!(unit.files()[0].1.contains("EnvironmentFile=/etc/exporter.conf"));
    }

    #[test]
    fn test_backup_timer_has_service() {
        let unit = Unit::satellite(
            SatelliteKind::Pgbackrest,
            &instance(),
            Path::new("/usr/bin/pgbackrest"),
            Path::new("/etc/pgbackrest.conf"),
        );
        let files = unit.files();
        assert_eq!(files[0].0, "pgconverge-backup@16-main.service");
        assert!(files[0].1.contains("Type=oneshot"));
        assert!(files[0].1.contains("--stanza=16-main backup"));
        assert_eq!(files[1].0, "pgconverge-backup@16-main.timer");
        assert!(files[1].1.contains("OnCalendar=daily"));
    }

    #[test]
    fn test_is_installed_checks_unit_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.service_manager.unit_path = dir.path().to_path_buf();
        let sm = SystemdServiceManager::new(&settings);
        let unit = Unit::postgresql(&instance());
        assert!(!sm.is_installed(&unit).unwrap());
        fs::write(dir.path().join(&unit.name), "").unwrap();
        assert!(sm.is_installed(&unit).unwrap());
    }
}
