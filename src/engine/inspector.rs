//! Inspection of live objects into comparable documents
//!
//! Inspection never changes anything. An object that does not exist is
//! `Ok(None)`; only failures to observe are errors.

use converge::{Error, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;

use super::PgContext;
use super::resource::{InstanceSpec, PgActual, PgResource, SatelliteSpec};
use crate::catalog::{Query, Statement, fetch_rows};
use crate::control;
use crate::model::{
    DatabaseActual, InstanceActual, Privilege, RoleActual, RunState, SatelliteActual,
    SlotManifest,
};
use crate::pgpass;
use crate::service::Unit;

/// Parameters whose context is always looked up
const STANDBY_PARAMETERS: [&str; 2] = ["primary_conninfo", "primary_slot_name"];

#[derive(Deserialize)]
pub struct NameRow {
    pub name: String,
}

#[derive(Deserialize)]
struct ContextRow {
    name: String,
    context: String,
}

#[derive(Deserialize)]
struct GrantRow {
    role: String,
    privilege: Privilege,
}

pub fn inspect(resource: &PgResource, ctx: &mut PgContext<'_>) -> Result<Option<PgActual>> {
    match resource {
        PgResource::Instance(spec) => Ok(instance(spec, ctx)?.map(PgActual::Instance)),
        PgResource::Satellite(spec) => Ok(satellite(spec, ctx)?.map(PgActual::Satellite)),
        other => {
            if !catalog_reachable(other, ctx)? {
                return Ok(None);
            }
            match other {
                PgResource::Role(role) => Ok(self::role(&role.name, ctx)?.map(PgActual::Role)),
                PgResource::Membership(role) => {
                    Ok(self::role(&role.name, ctx)?.map(|r| PgActual::Membership(r.in_roles)))
                }
                PgResource::Database(spec) => {
                    let desired = &spec.manifest;
                    let found = database(
                        &desired.name,
                        !desired.extensions.is_empty(),
                        !desired.grants.is_empty(),
                        ctx,
                    )?;
                    Ok(found.map(PgActual::Database))
                }
                PgResource::Slot(slot) => Ok(self::slot(slot, ctx)?.then_some(PgActual::Slot)),
                PgResource::Instance(_) | PgResource::Satellite(_) => Ok(None),
            }
        }
    }
}

/// Whether catalog objects can be inspected. Without an instance there
/// is nothing to find; a stopped instance only hides objects that are
/// meant to be dropped anyway.
fn catalog_reachable(resource: &PgResource, ctx: &mut PgContext<'_>) -> Result<bool> {
    if !ctx.control.exists(&ctx.instance) {
        return Ok(false);
    }
    if ctx.services.is_running(&Unit::postgresql(&ctx.instance))? {
        return Ok(true);
    }
    let present = match resource {
        PgResource::Role(r) | PgResource::Membership(r) => r.is_present(),
        PgResource::Database(d) => d.manifest.is_present(),
        PgResource::Slot(s) => s.state == crate::model::Presence::Present,
        PgResource::Instance(_) | PgResource::Satellite(_) => true,
    };
    if present {
        return Err(Error::Execution(format!(
            "instance {} is not running",
            ctx.instance.label()
        )));
    }
    Ok(false)
}

// ============================================================================
// Instance
// ============================================================================

pub fn instance(spec: &InstanceSpec, ctx: &mut PgContext<'_>) -> Result<Option<InstanceActual>> {
    if !ctx.control.exists(&ctx.instance) {
        return Ok(None);
    }

    let mut config = ctx.control.read_config(&ctx.instance)?;
    if let Some(conninfo) = config.get_mut("primary_conninfo") {
        *conninfo = control::strip_password(conninfo);
    }
    let port = config.get("port").and_then(|p| p.parse().ok());
    let unit_installed = ctx.services.is_installed(&spec.unit)?;
    let running = ctx.services.is_running(&spec.unit)?;
    let standby = ctx.control.standby(&ctx.instance)?;

    let mut contexts = BTreeMap::new();
    if running && spec.manifest.state == RunState::Started {
        let names: Vec<&str> = spec
            .manifest
            .settings
            .keys()
            .map(String::as_str)
            .chain(STANDBY_PARAMETERS)
            .collect();
        let stmt = Statement::new(Query::InstanceSettings).with_var("names", names.join(","));
        for row in fetch_rows::<ContextRow>(ctx.session.as_mut(), &stmt)? {
            contexts.insert(row.name, row.context);
        }
    }

    Ok(Some(InstanceActual {
        state: if running {
            RunState::Started
        } else {
            RunState::Stopped
        },
        unit_installed,
        port,
        config,
        standby,
        contexts,
    }))
}

// ============================================================================
// Catalog objects
// ============================================================================

pub fn role(name: &str, ctx: &mut PgContext<'_>) -> Result<Option<RoleActual>> {
    let stmt = Statement::new(Query::RoleInspect).with_var("name", name);
    let Some(mut actual) = fetch_rows::<RoleActual>(ctx.session.as_mut(), &stmt)?
        .into_iter()
        .next()
    else {
        return Ok(None);
    };

    let passfile = &ctx.settings.postgresql.auth.passfile;
    let content = pgpass::read(passfile).map_err(|e| {
        Error::Execution(format!("Could not read {}: {}", passfile.display(), e))
    })?;
    actual.pgpass = pgpass::find(&content, ctx.instance.port, name).is_some();
    Ok(Some(actual))
}

/// Inspect a database; extensions and grants only when asked for.
pub fn database(
    name: &str,
    with_extensions: bool,
    with_grants: bool,
    ctx: &mut PgContext<'_>,
) -> Result<Option<DatabaseActual>> {
    let stmt = Statement::new(Query::DatabaseInspect).with_var("name", name);
    let Some(mut actual) = fetch_rows::<DatabaseActual>(ctx.session.as_mut(), &stmt)?
        .into_iter()
        .next()
    else {
        return Ok(None);
    };

    // Extensions live inside the database and need a connection to it.
    if with_extensions {
        let stmt = Statement::new(Query::DatabaseExtensions).on_database(name);
        actual.extensions = fetch_rows::<NameRow>(ctx.session.as_mut(), &stmt)?
            .into_iter()
            .map(|r| r.name)
            .collect();
    }

    if with_grants {
        let stmt = Statement::new(Query::DatabaseGrants).with_var("name", name);
        let mut grants: BTreeMap<String, BTreeSet<Privilege>> = BTreeMap::new();
        for row in fetch_rows::<GrantRow>(ctx.session.as_mut(), &stmt)? {
            grants.entry(row.role).or_default().insert(row.privilege);
        }
        actual.grants = grants;
    }

    Ok(Some(actual))
}

fn slot(slot: &SlotManifest, ctx: &mut PgContext<'_>) -> Result<bool> {
    let stmt = Statement::new(Query::SlotInspect).with_var("name", &slot.name);
    Ok(!ctx.session.fetch(&stmt)?.is_empty())
}

// ============================================================================
// Satellites
// ============================================================================

fn satellite(spec: &SatelliteSpec, ctx: &mut PgContext<'_>) -> Result<Option<SatelliteActual>> {
    let config = match fs::read_to_string(&spec.configpath) {
        Ok(content) => Some(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => {
            return Err(Error::Execution(format!(
                "Could not read {}: {}",
                spec.configpath.display(),
                e
            )));
        }
    };
    let installed = ctx.services.is_installed(&spec.unit)?;
    let running = installed && ctx.services.is_running(&spec.unit)?;

    if config.is_none() && !installed {
        return Ok(None);
    }
    Ok(Some(SatelliteActual {
        config,
        installed,
        running,
    }))
}
