//! PostgreSQL resources and their atomic actions

use converge::{Change, ChangeSet, ImpactLevel, Outcome, Resource, ResourceKey, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;

use super::{PgContext, differ, executor, inspector};
use crate::catalog::Statement;
use crate::model::{
    DatabaseActual, DatabaseManifest, InstanceActual, InstanceManifest, RoleActual,
    RoleManifest, SatelliteActual, SatelliteKind, SatelliteManifest, Secret, SlotManifest,
};
use crate::service::Unit;

/// Instance-level desired state; nested objects are separate resources.
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub manifest: InstanceManifest,
    pub unit: Unit,
}

#[derive(Debug, Clone)]
pub struct DatabaseSpec {
    pub manifest: DatabaseManifest,
    /// Role that owns the database when the manifest names no owner
    pub creator: String,
}

/// A satellite with its rendered configuration
#[derive(Debug, Clone)]
pub struct SatelliteSpec {
    pub kind: SatelliteKind,
    /// Label of the instance the satellite serves
    pub instance: String,
    pub manifest: SatelliteManifest,
    pub configpath: PathBuf,
    pub config: Secret,
    pub unit: Unit,
}

#[derive(Debug, Clone)]
pub enum PgResource {
    Instance(InstanceSpec),
    Role(RoleManifest),
    /// Role memberships, applied once every role exists
    Membership(RoleManifest),
    Database(DatabaseSpec),
    Slot(SlotManifest),
    Satellite(SatelliteSpec),
}

/// Inspected document of a [`PgResource`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum PgActual {
    Instance(InstanceActual),
    Role(RoleActual),
    Membership(BTreeSet<String>),
    Database(DatabaseActual),
    Slot,
    Satellite(SatelliteActual),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOp {
    Install,
    Start,
    Stop,
    Uninstall,
}

/// One collaborator call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Sql(Statement),
    InitInstance,
    WriteConf {
        key: String,
        value: Option<String>,
    },
    WriteConninfo {
        conninfo: String,
        password: Option<Secret>,
    },
    Promote,
    /// A change that cannot be carried out; fails when applied
    Reject(String),
    RemoveData,
    Service {
        op: ServiceOp,
        unit: Unit,
    },
    WriteFile {
        path: PathBuf,
        content: Secret,
    },
    RemoveFile {
        path: PathBuf,
    },
    Pgpass {
        role: String,
        password: Option<Secret>,
    },
}

impl PgResource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Instance(_) => "instance",
            Self::Role(_) => "role",
            Self::Membership(_) => "membership",
            Self::Database(_) => "database",
            Self::Slot(_) => "replication_slot",
            Self::Satellite(s) => s.kind.as_str(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Self::Instance(s) => s.manifest.label(),
            Self::Role(r) | Self::Membership(r) => r.name.clone(),
            Self::Database(d) => d.manifest.name.clone(),
            Self::Slot(s) => s.name.clone(),
            Self::Satellite(s) => s.instance.clone(),
        }
    }
}

impl<'a> Resource<PgContext<'a>> for PgResource {
    type Actual = PgActual;
    type Action = Action;

    fn key(&self) -> ResourceKey {
        ResourceKey::new(self.kind(), self.name())
    }

    fn description(&self) -> String {
        match self {
            Self::Instance(s) => format!("Instance {} ({})", s.manifest.label(), s.manifest.state),
            Self::Role(r) => format!("Role {}", r.name),
            Self::Membership(r) => format!("Memberships of {}", r.name),
            Self::Database(d) => format!("Database {}", d.manifest.name),
            Self::Slot(s) => format!("Replication slot {}", s.name),
            Self::Satellite(s) => format!("{} ({})", s.kind, s.manifest.state),
        }
    }

    fn inspect(&self, ctx: &mut PgContext<'a>) -> Result<Option<PgActual>> {
        inspector::inspect(self, ctx)
    }

    fn diff(&self, actual: Option<&PgActual>) -> ChangeSet<Action> {
        differ::diff(self, actual)
    }

    fn apply(&self, change: &Change<Action>, ctx: &mut PgContext<'a>) -> Result<Outcome> {
        executor::apply(self, change, ctx)
    }

    fn settle(
        &self,
        impact: ImpactLevel,
        actual: Option<&PgActual>,
        ctx: &mut PgContext<'a>,
    ) -> Result<Option<String>> {
        executor::settle(self, impact, actual, ctx)
    }
}
