//! Atomic change application and post-change settling
//!
//! Each [`Action`] maps to exactly one collaborator call.

use converge::{Change, Error, ImpactLevel, Outcome, Result};
use std::fs;
use std::io;
use std::path::Path;

use super::PgContext;
use super::resource::{Action, InstanceSpec, PgActual, PgResource, ServiceOp};
use crate::control::{self, ControlError, InitOptions, StandbyInit};
use crate::model::{RunState, Secret};
use crate::pgpass;
use crate::service::{ServiceError, Unit};

pub fn apply(
    resource: &PgResource,
    change: &Change<Action>,
    ctx: &mut PgContext<'_>,
) -> Result<Outcome> {
    match &change.action {
        Action::Sql(stmt) => ctx
            .session
            .execute(stmt)
            .map_err(|e| e.into_error(resource.kind(), &resource.name()))?,
        Action::InitInstance => {
            let PgResource::Instance(spec) = resource else {
                return Err(Error::execution("only instances can be initialized"));
            };
            init_instance(spec, ctx)?;
        }
        Action::WriteConf { key, value } => {
            ctx.control
                .write_config(&ctx.instance, key, value.as_deref())
                .map_err(|e| control_error(e, resource))?;
        }
        Action::WriteConninfo { conninfo, password } => {
            let conninfo = control::with_password(conninfo, password.as_ref());
            ctx.control
                .write_config(&ctx.instance, "primary_conninfo", Some(&conninfo))
                .map_err(|e| control_error(e, resource))?;
        }
        Action::Promote => ctx
            .control
            .promote(&ctx.instance)
            .map_err(|e| control_error(e, resource))?,
        Action::Reject(reason) => return Err(Error::Execution(reason.clone())),
        Action::RemoveData => ctx
            .control
            .remove(&ctx.instance)
            .map_err(|e| control_error(e, resource))?,
        Action::Service { op, unit } => service(*op, unit, ctx)?,
        Action::WriteFile { path, content } => control::write_private(path, content.expose())
            .map_err(|e| io_error("Could not write", path, &e))?,
        Action::RemoveFile { path } => match fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Outcome::Unchanged),
            Err(e) => return Err(io_error("Could not remove", path, &e)),
        },
        Action::Pgpass { role, password } => update_pgpass(ctx, role, password.as_ref())?,
    }
    Ok(Outcome::Changed)
}

fn control_error(err: ControlError, resource: &PgResource) -> Error {
    match err {
        ControlError::Missing(_) => Error::not_found(resource.kind(), resource.name()),
        other => other.into(),
    }
}

fn io_error(action: &str, path: &Path, err: &io::Error) -> Error {
    Error::Execution(format!("{} {}: {}", action, path.display(), err))
}

fn service(op: ServiceOp, unit: &Unit, ctx: &mut PgContext<'_>) -> Result<()> {
    let result = match op {
        ServiceOp::Install => ctx.services.install(unit),
        ServiceOp::Start => ctx.services.start(unit),
        ServiceOp::Stop => ctx.services.stop(unit),
        ServiceOp::Uninstall => ctx.services.uninstall(unit),
    };
    result.map_err(|e| match e {
        ServiceError::NotInstalled(name) => Error::not_found("unit", name),
        other => other.into(),
    })
}

fn init_instance(spec: &InstanceSpec, ctx: &mut PgContext<'_>) -> Result<()> {
    let settings = ctx.settings;
    let pg = &settings.postgresql;
    let manifest = &spec.manifest;
    let opts = InitOptions {
        surole: pg.surole.name.clone(),
        surole_password: manifest.surole_password.clone(),
        auth_local: pg.auth.local.clone(),
        auth_host: pg.auth.host.clone(),
        data_checksums: manifest.data_checksums.unwrap_or(pg.initdb.data_checksums),
        locale: manifest.locale.clone().or_else(|| pg.initdb.locale.clone()),
        encoding: manifest.encoding.clone().or_else(|| pg.initdb.encoding.clone()),
        standby: manifest.standby.as_ref().map(|s| StandbyInit {
            conninfo: s.primary_conninfo.clone(),
            password: s.password.clone(),
            slot: s.slot.clone(),
        }),
    };
    ctx.control.init(&ctx.instance, &opts)?;

    if pg.surole.pgpass
        && let Some(password) = &manifest.surole_password
    {
        let surole = pg.surole.name.clone();
        update_pgpass(ctx, &surole, Some(password))?;
    }
    Ok(())
}

/// Add (with a password) or remove the entry of a role on this instance.
fn update_pgpass(ctx: &PgContext<'_>, role: &str, password: Option<&Secret>) -> Result<()> {
    let path = &ctx.settings.postgresql.auth.passfile;
    let port = ctx.instance.port;
    let content = pgpass::read(path).map_err(|e| io_error("Could not read", path, &e))?;
    let updated = match password {
        Some(password) => pgpass::upsert(
            &content,
            &pgpass::Entry {
                port,
                role: role.to_string(),
                password: password.clone(),
            },
        ),
        None => pgpass::remove(&content, port, role),
    };
    if updated == content {
        return Ok(());
    }
    pgpass::write(path, &updated).map_err(|e| io_error("Could not write", path, &e))
}

/// Make applied changes effective: reload or restart the server.
pub fn settle(
    resource: &PgResource,
    impact: ImpactLevel,
    _actual: Option<&PgActual>,
    ctx: &mut PgContext<'_>,
) -> Result<Option<String>> {
    match resource {
        PgResource::Instance(spec) if spec.manifest.state == RunState::Started => match impact {
            ImpactLevel::None => Ok(None),
            ImpactLevel::Reload => {
                ctx.control.reload(&ctx.instance)?;
                Ok(Some("reloaded".to_string()))
            }
            ImpactLevel::Restart => {
                let prompt = format!(
                    "Instance {} needs a restart for changes to take effect. Restart now?",
                    ctx.instance.label()
                );
                if ctx.restart_on_changes || ctx.confirm.confirm(&prompt) {
                    ctx.services.restart(&spec.unit)?;
                    Ok(Some("restarted".to_string()))
                } else {
                    log::warn!("{}: restart pending", ctx.instance.label());
                    Ok(Some("restart pending".to_string()))
                }
            }
        },
        PgResource::Satellite(spec) if impact == ImpactLevel::Restart => {
            ctx.services.restart(&spec.unit)?;
            Ok(Some("restarted".to_string()))
        }
        _ => Ok(None),
    }
}
