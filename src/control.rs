//! Instance control: data directories and PostgreSQL server programs
//!
//! Creation (`initdb` or `pg_basebackup`), configuration writes, reload,
//! promotion and removal. Starting and stopping go through the service
//! manager instead.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use thiserror::Error;

use crate::conf;
use crate::model::{InstanceRef, Secret, StandbyActual};
use crate::runner::{RunError, run_with_timeout};
use crate::settings::Settings;

const STANDBY_SIGNAL: &str = "standby.signal";
const PG_VERSION: &str = "PG_VERSION";
const POSTMASTER_PID: &str = "postmaster.pid";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Run(#[from] RunError),

    #[error("instance {0} does not exist")]
    Missing(String),
}

impl ControlError {
    fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<ControlError> for converge::Error {
    fn from(err: ControlError) -> Self {
        match err {
            ControlError::Run(run) => match run.timeout() {
                Some(timeout) => Self::Timeout(timeout),
                None => Self::execution(run),
            },
            other => Self::execution(other),
        }
    }
}

/// How a new instance is created
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    pub surole: String,
    pub surole_password: Option<Secret>,
    pub auth_local: String,
    pub auth_host: String,
    pub data_checksums: bool,
    pub locale: Option<String>,
    pub encoding: Option<String>,
    /// Clone from a primary instead of running initdb
    pub standby: Option<StandbyInit>,
}

#[derive(Debug, Clone)]
pub struct StandbyInit {
    pub conninfo: String,
    pub password: Option<Secret>,
    pub slot: Option<String>,
}

/// Operations on instances that do not go through SQL or the service manager
pub trait InstanceControl: Send {
    /// Instances found on this host, as `(version, name)`
    fn list(&self) -> Result<Vec<(String, String)>, ControlError>;

    fn exists(&self, instance: &InstanceRef) -> bool;

    /// Effective configuration parameters
    fn read_config(&self, instance: &InstanceRef) -> Result<BTreeMap<String, String>, ControlError>;

    /// Streaming linkage, `None` for a primary
    fn standby(&self, instance: &InstanceRef) -> Result<Option<StandbyActual>, ControlError>;

    fn init(&self, instance: &InstanceRef, opts: &InitOptions) -> Result<(), ControlError>;

    /// Set or remove one parameter so that it is the effective value
    fn write_config(
        &self,
        instance: &InstanceRef,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), ControlError>;

    fn reload(&self, instance: &InstanceRef) -> Result<(), ControlError>;

    fn promote(&self, instance: &InstanceRef) -> Result<(), ControlError>;

    /// Delete the data directory
    fn remove(&self, instance: &InstanceRef) -> Result<(), ControlError>;
}

/// Control backed by the local filesystem and PostgreSQL binaries
pub struct LocalControl {
    root: PathBuf,
    timeout: Duration,
}

impl LocalControl {
    pub fn new(settings: &Settings) -> Self {
        Self {
            root: settings.postgresql.root.clone(),
            timeout: settings.engine.service_timeout(),
        }
    }

    fn pg_ctl(&self, instance: &InstanceRef, args: &[&str]) -> Result<(), ControlError> {
        let mut cmd = Command::new(instance.bindir.join("pg_ctl"));
        cmd.args(args).arg("-D").arg(&instance.datadir);
        run_with_timeout(&mut cmd, None, self.timeout)?;
        Ok(())
    }

    fn initdb(&self, instance: &InstanceRef, opts: &InitOptions) -> Result<(), ControlError> {
        let mut cmd = Command::new(instance.bindir.join("initdb"));
        cmd.arg("-D").arg(&instance.datadir).args(initdb_args(opts));

        // The password goes through a private file, not the command line.
        let pwfile = instance
            .datadir
            .parent()
            .map(|p| p.join(".pwfile"))
            .unwrap_or_else(|| PathBuf::from(".pwfile"));
        if let Some(password) = &opts.surole_password {
            write_private(&pwfile, password.expose())
                .map_err(|e| ControlError::io("Could not write", &pwfile, e))?;
            cmd.arg(format!("--pwfile={}", pwfile.display()));
        }
        let result = run_with_timeout(&mut cmd, None, self.timeout);
        if opts.surole_password.is_some() {
            let _ = fs::remove_file(&pwfile);
        }
        result?;
        Ok(())
    }

    fn basebackup(&self, instance: &InstanceRef, standby: &StandbyInit) -> Result<(), ControlError> {
        let mut cmd = Command::new(instance.bindir.join("pg_basebackup"));
        cmd.arg("-D")
            .arg(&instance.datadir)
            .args(["-d", &standby.conninfo])
            .args(["-X", "stream", "--no-password"]);
        if let Some(slot) = &standby.slot {
            cmd.args(["-S", slot]);
        }
        if let Some(password) = &standby.password {
            cmd.env("PGPASSWORD", password.expose());
        }
        run_with_timeout(&mut cmd, None, self.timeout)?;

        let signal = instance.datadir.join(STANDBY_SIGNAL);
        fs::write(&signal, "").map_err(|e| ControlError::io("Could not write", &signal, e))?;
        self.write_config(
            instance,
            "primary_conninfo",
            Some(&with_password(&standby.conninfo, standby.password.as_ref())),
        )?;
        if let Some(slot) = &standby.slot {
            self.write_config(instance, "primary_slot_name", Some(slot))?;
        }
        Ok(())
    }
}

impl InstanceControl for LocalControl {
    fn list(&self) -> Result<Vec<(String, String)>, ControlError> {
        list_instances(&self.root)
    }

    fn exists(&self, instance: &InstanceRef) -> bool {
        instance.datadir.join(PG_VERSION).is_file()
    }

    fn read_config(&self, instance: &InstanceRef) -> Result<BTreeMap<String, String>, ControlError> {
        conf::read(&instance.datadir)
            .map_err(|e| ControlError::io("Could not read", &instance.datadir, e))
    }

    fn standby(&self, instance: &InstanceRef) -> Result<Option<StandbyActual>, ControlError> {
        if !instance.datadir.join(STANDBY_SIGNAL).exists() {
            return Ok(None);
        }
        let config = self.read_config(instance)?;
        Ok(Some(StandbyActual {
            conninfo: strip_password(
                config
                    .get("primary_conninfo")
                    .map(String::as_str)
                    .unwrap_or_default(),
            ),
            slot: config
                .get("primary_slot_name")
                .filter(|s| !s.is_empty())
                .cloned(),
        }))
    }

    fn init(&self, instance: &InstanceRef, opts: &InitOptions) -> Result<(), ControlError> {
        log::info!("Creating instance {}", instance.label());
        if let Some(parent) = instance.datadir.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ControlError::io("Could not create", parent, e))?;
        }
        match &opts.standby {
            Some(standby) => self.basebackup(instance, standby)?,
            None => self.initdb(instance, opts)?,
        }
        self.write_config(
            instance,
            "unix_socket_directories",
            Some(&instance.socket_dir.to_string_lossy()),
        )
    }

    fn write_config(
        &self,
        instance: &InstanceRef,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), ControlError> {
        if !self.exists(instance) {
            return Err(ControlError::Missing(instance.label()));
        }
        conf::write(&instance.datadir, key, value)
            .map_err(|e| ControlError::io("Could not update", &instance.datadir, e))
    }

    fn reload(&self, instance: &InstanceRef) -> Result<(), ControlError> {
        self.pg_ctl(instance, &["reload", "-s"])
    }

    fn promote(&self, instance: &InstanceRef) -> Result<(), ControlError> {
        self.pg_ctl(instance, &["promote", "-w", "-s"])
    }

    fn remove(&self, instance: &InstanceRef) -> Result<(), ControlError> {
        let Some(dir) = instance.datadir.parent() else {
            return Err(ControlError::Missing(instance.label()));
        };
        log::info!("Removing {}", dir.display());
        match fs::remove_dir_all(dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(ControlError::Missing(instance.label()))
            }
            Err(e) => Err(ControlError::io("Could not remove", dir, e)),
        }
    }
}

/// `initdb` options other than the data directory and the password file
fn initdb_args(opts: &InitOptions) -> Vec<String> {
    let mut args = vec![
        "-U".to_string(),
        opts.surole.clone(),
        format!("--auth-local={}", opts.auth_local),
        format!("--auth-host={}", opts.auth_host),
    ];
    if opts.data_checksums {
        args.push("--data-checksums".to_string());
    }
    if let Some(locale) = &opts.locale {
        args.push(format!("--locale={locale}"));
    }
    if let Some(encoding) = &opts.encoding {
        args.push(format!("--encoding={encoding}"));
    }
    args
}

/// Scan `root/{version}/{name}/data` for initialized data directories.
pub fn list_instances(root: &Path) -> Result<Vec<(String, String)>, ControlError> {
    let mut found = Vec::new();
    let versions = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(ControlError::io("Could not read", root, e)),
    };
    for version in versions.flatten() {
        let Ok(names) = fs::read_dir(version.path()) else {
            continue;
        };
        for name in names.flatten() {
            if name.path().join("data").join(PG_VERSION).is_file() {
                found.push((
                    version.file_name().to_string_lossy().into_owned(),
                    name.file_name().to_string_lossy().into_owned(),
                ));
            }
        }
    }
    found.sort();
    log::debug!("Found {} instance(s) under {}", found.len(), root.display());
    Ok(found)
}

/// Port the server is listening on, from `postmaster.pid` (fourth line).
pub fn running_port(datadir: &Path) -> Option<u16> {
    let content = fs::read_to_string(datadir.join(POSTMASTER_PID)).ok()?;
    content.lines().nth(3)?.trim().parse().ok()
}

/// Remove the password from a connection string.
pub fn strip_password(conninfo: &str) -> String {
    if let Some((scheme, rest)) = conninfo.split_once("://") {
        let (authority, tail) = match rest.find(['/', '?']) {
            Some(i) => rest.split_at(i),
            None => (rest, ""),
        };
        let authority = match authority.rsplit_once('@') {
            Some((userinfo, host)) => {
                let user = userinfo.split(':').next().unwrap_or_default();
                format!("{user}@{host}")
            }
            None => authority.to_string(),
        };
        let tail = match tail.split_once('?') {
            Some((path, query)) => {
                let params: Vec<&str> = query
                    .split('&')
                    .filter(|kv| !kv.starts_with("password="))
                    .collect();
                if params.is_empty() {
                    path.to_string()
                } else {
                    format!("{}?{}", path, params.join("&"))
                }
            }
            None => tail.to_string(),
        };
        return format!("{scheme}://{authority}{tail}");
    }
    keyword_entries(conninfo)
        .into_iter()
        .filter(|(key, _)| *key != "password")
        .map(|(_, entry)| entry)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether a connection string carries a password.
pub fn has_password(conninfo: &str) -> bool {
    if let Some((_, rest)) = conninfo.split_once("://") {
        let (authority, tail) = match rest.find(['/', '?']) {
            Some(i) => rest.split_at(i),
            None => (rest, ""),
        };
        let in_userinfo = authority
            .rsplit_once('@')
            .is_some_and(|(userinfo, _)| userinfo.contains(':'));
        let in_query = tail
            .split_once('?')
            .is_some_and(|(_, query)| query.split('&').any(|kv| kv.starts_with("password=")));
        return in_userinfo || in_query;
    }
    keyword_entries(conninfo)
        .iter()
        .any(|(key, _)| *key == "password")
}

/// Add a password to a connection string that has none.
pub fn with_password(conninfo: &str, password: Option<&Secret>) -> String {
    let Some(password) = password else {
        return conninfo.to_string();
    };
    let value = password.expose();
    if conninfo.contains("://") {
        let sep = if conninfo.contains('?') { '&' } else { '?' };
        return format!("{conninfo}{sep}password={}", urlencoding::encode(value));
    }
    let quoted = value.replace('\\', "\\\\").replace('\'', "\\'");
    format!("{conninfo} password='{quoted}'")
}

/// Split a `keyword = value` connection string into `(keyword, entry)`
/// pairs, each entry being the raw text of one setting.
///
/// Values may be single-quoted and use backslash escapes; spaces are
/// allowed around `=`.
fn keyword_entries(conninfo: &str) -> Vec<(&str, &str)> {
    let bytes = conninfo.as_bytes();
    let skip_spaces = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        i
    };
    let mut entries = Vec::new();
    let mut i = skip_spaces(0);
    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && bytes[i] != b'=' && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        let key = &conninfo[start..i];
        i = skip_spaces(i);
        if i < bytes.len() && bytes[i] == b'=' {
            i = skip_spaces(i + 1);
            let quoted = i < bytes.len() && bytes[i] == b'\'';
            if quoted {
                i += 1;
            }
            while i < bytes.len() {
                match bytes[i] {
                    b'\\' => i += 2,
                    b'\'' if quoted => {
                        i += 1;
                        break;
                    }
                    c if !quoted && c.is_ascii_whitespace() => break,
                    _ => i += 1,
                }
            }
        }
        let end = i.min(bytes.len());
        entries.push((key, &conninfo[start..end]));
        i = skip_spaces(end);
    }
    entries
}

/// Write a file readable only by its owner, creating parent directories.
pub fn write_private(path: &Path, content: &str) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(content.as_bytes())
}
