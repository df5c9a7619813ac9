//! Manifest and inspected-document types
//!
//! Manifests are the user-supplied desired state of an instance with its
//! nested roles, databases, replication slots and satellites. Optional
//! attributes are [`Field`]s so that an unspecified value is told apart
//! from an explicit `null`.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use converge::Field;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::settings::Settings;

// ============================================================================
// Secret
// ============================================================================

/// A password. Never printed, never serialized in clear.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The clear-text value, for the one place that needs it
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(**********)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("**********")
    }
}

impl Serialize for Secret {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("**********")
    }
}

// ============================================================================
// States
// ============================================================================

/// Runtime state of an instance or a satellite service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Started,
    Stopped,
    Absent,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Absent => "absent",
        })
    }
}

/// Existence of a catalog object
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    #[default]
    Present,
    Absent,
}

impl Presence {
    fn is_present(&self) -> bool {
        *self == Self::Present
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StandbyStatus {
    #[default]
    Demoted,
    Promoted,
}

// ============================================================================
// Instance manifest
// ============================================================================

/// A configuration value; numbers and booleans are accepted as written.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SettingValue(pub String);

impl<'de> Deserialize<'de> for SettingValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Bool(bool),
            Int(i64),
            Float(f64),
            Str(String),
        }
        Ok(Self(match Raw::deserialize(deserializer)? {
            Raw::Bool(true) => "on".to_string(),
            Raw::Bool(false) => "off".to_string(),
            Raw::Int(i) => i.to_string(),
            Raw::Float(f) => f.to_string(),
            Raw::Str(s) => s,
        }))
    }
}

impl Serialize for SettingValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl From<&str> for SettingValue {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Streaming replication linkage of a standby instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Standby {
    /// Connection string to the primary, without password
    #[serde(rename = "for")]
    pub primary_conninfo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Secret>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
    #[serde(default)]
    pub status: StandbyStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstanceManifest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Field::is_unset")]
    pub ssl: Field<bool>,
    /// `postgresql.conf` overrides; a `null` value removes the key
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, Option<SettingValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_on_changes: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surole_password: Option<Secret>,
    /// Password of the site replication role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replrole_password: Option<Secret>,
    /// Cluster creation options, the site defaults apply when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_checksums: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub standby: Option<Standby>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replication_slots: Vec<SlotManifest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<RoleManifest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub databases: Vec<DatabaseManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<SatelliteManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgbackrest: Option<SatelliteManifest>,
}

impl InstanceManifest {
    /// A manifest with only a name, everything else unspecified
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            state: RunState::Started,
            port: None,
            ssl: Field::Unset,
            settings: BTreeMap::new(),
            restart_on_changes: None,
            surole_password: None,
            replrole_password: None,
            data_checksums: None,
            locale: None,
            encoding: None,
            standby: None,
            replication_slots: Vec::new(),
            roles: Vec::new(),
            databases: Vec::new(),
            prometheus: None,
            pgbackrest: None,
        }
    }

    /// Short label, `version/name` once the version is known
    pub fn label(&self) -> String {
        match &self.version {
            Some(v) => format!("{}/{}", v, self.name),
            None => self.name.clone(),
        }
    }
}

/// Replication slot, written either as a bare name or as a mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "NamedRepr")]
pub struct SlotManifest {
    pub name: String,
    pub state: Presence,
}

/// Database extension, written either as a bare name or as a mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "NamedRepr")]
pub struct ExtensionManifest {
    pub name: String,
    pub state: Presence,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NamedRepr {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        state: Presence,
    },
}

impl NamedRepr {
    fn into_parts(self) -> (String, Presence) {
        match self {
            Self::Name(name) => (name, Presence::Present),
            Self::Full { name, state } => (name, state),
        }
    }
}

impl From<NamedRepr> for SlotManifest {
    fn from(repr: NamedRepr) -> Self {
        let (name, state) = repr.into_parts();
        Self { name, state }
    }
}

impl From<NamedRepr> for ExtensionManifest {
    fn from(repr: NamedRepr) -> Self {
        let (name, state) = repr.into_parts();
        Self { name, state }
    }
}

// ============================================================================
// Roles
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoleManifest {
    pub name: String,
    #[serde(default)]
    pub state: Presence,
    #[serde(default, skip_serializing_if = "Field::is_unset")]
    pub login: Field<bool>,
    #[serde(default, skip_serializing_if = "Field::is_unset")]
    pub superuser: Field<bool>,
    #[serde(default, skip_serializing_if = "Field::is_unset")]
    pub inherit: Field<bool>,
    #[serde(default, skip_serializing_if = "Field::is_unset")]
    pub replication: Field<bool>,
    #[serde(default, skip_serializing_if = "Field::is_unset")]
    pub createdb: Field<bool>,
    #[serde(default, skip_serializing_if = "Field::is_unset")]
    pub createrole: Field<bool>,
    /// `null` removes the limit
    #[serde(default, skip_serializing_if = "Field::is_unset")]
    pub connection_limit: Field<i32>,
    /// `null` makes the password valid forever
    #[serde(default, skip_serializing_if = "Field::is_unset")]
    pub valid_until: Field<DateTime<Utc>>,
    /// Write-only; `null` removes the password
    #[serde(default, skip_serializing_if = "Field::is_unset")]
    pub password: Field<Secret>,
    /// Keep an entry for this role in the password file
    #[serde(default, skip_serializing_if = "Field::is_unset")]
    pub pgpass: Field<bool>,
    /// Exact set of roles this role is a member of; `null` empties it
    #[serde(default, skip_serializing_if = "Field::is_unset")]
    pub in_roles: Field<Vec<String>>,
}

impl RoleManifest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn is_present(&self) -> bool {
        self.state.is_present()
    }
}

// ============================================================================
// Databases
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    Connect,
    Create,
    Temporary,
}

impl Privilege {
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Create => "CREATE",
            Self::Temporary => "TEMPORARY",
        }
    }
}

/// Exact database privileges of one role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrantManifest {
    pub role: String,
    #[serde(default)]
    pub privileges: BTreeSet<Privilege>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseManifest {
    pub name: String,
    #[serde(default)]
    pub state: Presence,
    #[serde(default, skip_serializing_if = "Field::is_unset")]
    pub owner: Field<String>,
    /// Per-database settings; `null` resets them all, a `null` value resets one
    #[serde(default, skip_serializing_if = "Field::is_unset")]
    pub settings: Field<BTreeMap<String, Option<SettingValue>>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<ExtensionManifest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grants: Vec<GrantManifest>,
}

impl DatabaseManifest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn is_present(&self) -> bool {
        self.state.is_present()
    }

    /// Roles referenced as owner or grantee
    pub fn referenced_roles(&self) -> impl Iterator<Item = &str> {
        self.owner
            .value()
            .map(String::as_str)
            .into_iter()
            .chain(self.grants.iter().map(|g| g.role.as_str()))
    }
}

// ============================================================================
// Satellites
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SatelliteKind {
    Prometheus,
    Pgbackrest,
}

impl SatelliteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prometheus => "prometheus",
            Self::Pgbackrest => "pgbackrest",
        }
    }
}

impl fmt::Display for SatelliteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SatelliteManifest {
    #[serde(default)]
    pub state: RunState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Secret>,
}

// ============================================================================
// Instance identity
// ============================================================================

/// Resolved identity and locations of one instance on this host
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceRef {
    pub version: String,
    pub name: String,
    pub port: u16,
    pub datadir: PathBuf,
    pub bindir: PathBuf,
    pub socket_dir: PathBuf,
}

impl InstanceRef {
    pub fn new(settings: &Settings, version: &str, name: &str, port: u16) -> Self {
        Self {
            version: version.to_string(),
            name: name.to_string(),
            port,
            datadir: settings.datadir(version, name),
            bindir: settings.bindir(version),
            socket_dir: settings.postgresql.socket_directory.clone(),
        }
    }

    /// `version-name`, unique on a host
    pub fn qualname(&self) -> String {
        format!("{}-{}", self.version, self.name)
    }

    /// `version/name`, for display
    pub fn label(&self) -> String {
        format!("{}/{}", self.version, self.name)
    }
}

// ============================================================================
// Inspected documents
// ============================================================================

/// Streaming linkage read from an instance's configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StandbyActual {
    /// Connection string to the primary, password removed
    pub conninfo: String,
    pub slot: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceActual {
    /// `Started` or `Stopped`
    pub state: RunState,
    pub unit_installed: bool,
    pub port: Option<u16>,
    /// Active configuration parameters
    pub config: BTreeMap<String, String>,
    pub standby: Option<StandbyActual>,
    /// `pg_settings.context` of the parameters the manifest mentions
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub contexts: BTreeMap<String, String>,
}

impl InstanceActual {
    pub fn is_running(&self) -> bool {
        self.state == RunState::Started
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleActual {
    pub name: String,
    pub login: bool,
    pub superuser: bool,
    pub inherit: bool,
    pub replication: bool,
    pub createdb: bool,
    pub createrole: bool,
    pub connection_limit: Option<i32>,
    pub valid_until: Option<DateTime<Utc>>,
    /// Presence is observable, the value is not
    pub has_password: bool,
    #[serde(default)]
    pub in_roles: BTreeSet<String>,
    #[serde(default)]
    pub pgpass: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseActual {
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default)]
    pub extensions: BTreeSet<String>,
    #[serde(default)]
    pub grants: BTreeMap<String, BTreeSet<Privilege>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SatelliteActual {
    pub config: Option<String>,
    pub installed: bool,
    pub running: bool,
}

// ============================================================================
// Loading
// ============================================================================

/// Parse a manifest file; the format follows the extension.
pub fn load_manifest(path: &Path) -> Result<InstanceManifest> {
    let content =
        fs::read_to_string(path).with_context(|| format!("Could not read {}", path.display()))?;
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    let manifest = match ext {
        "yaml" | "yml" => serde_yaml::from_str(&content).map_err(anyhow::Error::from),
        "json" => serde_json::from_str(&content).map_err(anyhow::Error::from),
        "toml" => toml::from_str(&content).map_err(anyhow::Error::from),
        other => bail!(
            "Unsupported manifest format '{}' for {} (expected yaml, json or toml)",
            other,
            path.display()
        ),
    };
    manifest.with_context(|| format!("Invalid manifest {}", path.display()))
}
