//! Reconciliation engine for PostgreSQL instances
//!
//! One run per instance manifest:
//! 1. Normalizing - resolve version and defaults, reject invalid manifests
//! 2. Planning - order the instance and its nested resources
//! 3. Executing - inspect, diff and apply each resource in plan order
//!
//! Independent instances run concurrently; each instance's plan runs
//! sequentially, holding the host lock for that instance.

pub mod differ;
pub mod executor;
pub mod inspector;
pub mod planner;
pub mod resource;

#[cfg(test)]
pub(crate) mod fake;

use converge::{
    AutoConfirm, AutoDecline, CancelToken, ConfirmCallback, Error, ExecuteOptions, NoProgress,
    ProgressCallback, Report, ResourceKey, Resource, run_parallel,
};
use serde::Serialize;

use crate::catalog::{PsqlSession, Query, Session, Statement, fetch_rows};
use crate::control::{InstanceControl, LocalControl};
use crate::lock::InstanceLock;
use crate::model::{
    DatabaseActual, DatabaseManifest, InstanceActual, InstanceManifest, InstanceRef, Presence,
    RoleActual, RoleManifest, RunState,
};
use crate::normalize::normalize;
use crate::service::{ServiceManager, SystemdServiceManager, Unit};
use crate::settings::Settings;
use crate::ui;

use inspector::NameRow;
pub use resource::{PgActual, PgResource};

/// Port of an instance that sets none
pub const DEFAULT_PORT: u16 = 5432;

/// Everything a resource needs to reach the live system
pub struct PgContext<'a> {
    pub settings: &'a Settings,
    pub instance: InstanceRef,
    pub session: Box<dyn Session>,
    pub services: Box<dyn ServiceManager>,
    pub control: Box<dyn InstanceControl>,
    pub confirm: Box<dyn ConfirmCallback>,
    /// Restart without asking when a change requires it
    pub restart_on_changes: bool,
}

/// Factory for the collaborators of one run
pub trait Host: Sync {
    fn session(&self, settings: &Settings, instance: &InstanceRef) -> Box<dyn Session>;

    fn services(&self, settings: &Settings) -> Box<dyn ServiceManager>;

    fn control(&self, settings: &Settings) -> Box<dyn InstanceControl>;
}

/// The local machine: `psql`, systemd and the PostgreSQL binaries
pub struct SystemHost;

impl Host for SystemHost {
    fn session(&self, settings: &Settings, instance: &InstanceRef) -> Box<dyn Session> {
        Box::new(PsqlSession::new(
            instance.clone(),
            settings.postgresql.surole.name.clone(),
            settings.postgresql.auth.passfile.clone(),
            settings.engine.statement_timeout(),
        ))
    }

    fn services(&self, settings: &Settings) -> Box<dyn ServiceManager> {
        Box::new(SystemdServiceManager::new(settings))
    }

    fn control(&self, settings: &Settings) -> Box<dyn InstanceControl> {
        Box::new(LocalControl::new(settings))
    }
}

/// How yes/no questions are answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Answer yes (`--yes`)
    Assume,
    /// Ask on the terminal
    Interactive,
    /// Answer no
    Decline,
}

impl Confirmation {
    fn callback(self) -> Box<dyn ConfirmCallback> {
        match self {
            Self::Assume => Box::new(AutoConfirm),
            Self::Interactive => Box::new(ui::PromptConfirm),
            Self::Decline => Box::new(AutoDecline),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub execute: ExecuteOptions,
    pub confirmation: Confirmation,
    /// Show a spinner while resources are processed
    pub progress: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            execute: ExecuteOptions::default(),
            confirmation: Confirmation::Decline,
            progress: false,
        }
    }
}

/// Resolve identity and port of a normalized manifest's instance.
fn locate(
    control: &dyn InstanceControl,
    settings: &Settings,
    desired: &mut InstanceManifest,
) -> InstanceRef {
    let version = desired.version.clone().unwrap_or_default();
    let probe = InstanceRef::new(settings, &version, &desired.name, DEFAULT_PORT);
    let exists = control.exists(&probe);
    let configured = if exists {
        control
            .read_config(&probe)
            .ok()
            .and_then(|c| c.get("port").and_then(|p| p.parse().ok()))
    } else {
        None
    };
    let port = desired.port.or(configured).unwrap_or(DEFAULT_PORT);
    // An existing instance keeps whatever port it runs on unless told otherwise.
    if !exists {
        desired.port = Some(port);
    }
    InstanceRef::new(settings, &version, &desired.name, port)
}

/// Reconcile one instance manifest. Never fails as a whole: problems are
/// reported on the resource they belong to.
pub fn reconcile(
    host: &dyn Host,
    settings: &Settings,
    manifest: &InstanceManifest,
    opts: &EngineOptions,
    cancel: &CancelToken,
) -> Report {
    let key = ResourceKey::new("instance", manifest.label());
    let control = host.control(settings);

    let existing = match control.list() {
        Ok(existing) => existing,
        Err(e) => return Report::rejected(manifest.label(), key, &Error::from(e)),
    };
    let mut desired = match normalize(manifest, settings, &existing) {
        Ok(desired) => desired,
        Err(e) => {
            log::warn!("{}: {}", manifest.label(), e);
            return Report::rejected(manifest.label(), key, &e);
        }
    };
    let target = desired.label();
    let key = ResourceKey::new("instance", &target);

    let instance = locate(control.as_ref(), settings, &mut desired);
    let _lock = match InstanceLock::acquire(&settings.engine.lock_dir, &instance.qualname()) {
        Ok(lock) => lock,
        Err(e) => return Report::rejected(target, key, &Error::from(e)),
    };

    let mut ctx = PgContext {
        settings,
        session: host.session(settings, &instance),
        services: host.services(settings),
        control,
        confirm: opts.confirmation.callback(),
        restart_on_changes: desired
            .restart_on_changes
            .unwrap_or(settings.postgresql.restart_on_changes),
        instance,
    };

    if desired.state == RunState::Absent && ctx.control.exists(&ctx.instance) {
        if let Err(e) = add_inventory(&mut desired, &mut ctx) {
            return Report::rejected(target, key, &e);
        }
        let prompt = format!("Drop instance {target} and all its data?");
        if !opts.execute.dry_run && !ctx.confirm.confirm(&prompt) {
            log::warn!("{target}: drop not confirmed");
            return Report::rejected(target, key, &Error::Cancelled);
        }
    }

    let plan = match planner::plan(&desired, settings, &ctx.instance) {
        Ok(plan) => plan,
        Err(e) => return Report::rejected(target, key, &Error::validation(e.to_string())),
    };
    log::debug!("{}: {} resources planned", target, plan.len());

    let mut progress: Box<dyn ProgressCallback> = if opts.progress {
        Box::new(ui::SpinnerProgress::new())
    } else {
        Box::new(NoProgress)
    };
    converge::execute(
        &target,
        plan,
        &mut ctx,
        &opts.execute,
        progress.as_mut(),
        cancel,
    )
}

/// Reconcile independent instances on a bounded worker pool, keeping
/// input order in the returned reports.
pub fn reconcile_all(
    host: &dyn Host,
    settings: &Settings,
    manifests: &[InstanceManifest],
    opts: &EngineOptions,
    cancel: &CancelToken,
) -> Vec<Report> {
    run_parallel(manifests.iter().collect(), opts.execute.jobs, |m| {
        reconcile(host, settings, m, opts, cancel)
    })
}

/// Replace the nested objects of a dropped instance by everything it
/// holds, so that they are dropped in order before the instance.
fn add_inventory(desired: &mut InstanceManifest, ctx: &mut PgContext<'_>) -> converge::Result<()> {
    if !ctx.services.is_running(&Unit::postgresql(&ctx.instance))? {
        return Ok(());
    }
    let databases = fetch_rows::<NameRow>(ctx.session.as_mut(), &Statement::new(Query::DatabaseList))?;
    for NameRow { name } in databases {
        if !desired.databases.iter().any(|d| d.name == name) {
            desired.databases.push(DatabaseManifest {
                state: Presence::Absent,
                ..DatabaseManifest::named(name)
            });
        }
    }
    let roles = fetch_rows::<NameRow>(ctx.session.as_mut(), &Statement::new(Query::RoleList))?;
    for NameRow { name } in roles {
        if !desired.roles.iter().any(|r| r.name == name) {
            desired.roles.push(RoleManifest {
                state: Presence::Absent,
                ..RoleManifest::named(name)
            });
        }
    }
    Ok(())
}

// ============================================================================
// Inspection
// ============================================================================

/// What to inspect within an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Instance,
    Role(String),
    Database(String),
}

/// Inspected state of an instance, for display
#[derive(Debug, Serialize)]
pub struct Inventory {
    pub instance: InstanceRef,
    pub actual: InstanceActual,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<RoleActual>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub databases: Vec<DatabaseActual>,
}

/// Inspect an existing instance, or one object in it.
pub fn inspect(
    host: &dyn Host,
    settings: &Settings,
    name: &str,
    version: Option<&str>,
    object: &Object,
) -> converge::Result<Inventory> {
    let mut manifest = InstanceManifest::named(name);
    manifest.version = version.map(String::from);
    let control = host.control(settings);
    let existing = control.list()?;
    let mut desired = normalize(&manifest, settings, &existing)?;
    let instance = locate(control.as_ref(), settings, &mut desired);

    let mut ctx = PgContext {
        settings,
        session: host.session(settings, &instance),
        services: host.services(settings),
        control,
        confirm: Box::new(AutoDecline),
        restart_on_changes: false,
        instance: instance.clone(),
    };
    let resource = PgResource::Instance(resource::InstanceSpec {
        unit: Unit::postgresql(&instance),
        manifest: desired,
    });
    let Some(PgActual::Instance(actual)) = resource.inspect(&mut ctx)? else {
        return Err(Error::not_found("instance", instance.label()));
    };

    let mut inventory = Inventory {
        instance,
        roles: Vec::new(),
        databases: Vec::new(),
        actual,
    };
    let running = inventory.actual.is_running();
    match object {
        Object::Instance if running => {
            let stmt = Statement::new(Query::RoleList);
            for NameRow { name } in fetch_rows::<NameRow>(ctx.session.as_mut(), &stmt)? {
                inventory.roles.extend(inspector::role(&name, &mut ctx)?);
            }
            let stmt = Statement::new(Query::DatabaseList);
            for NameRow { name } in fetch_rows::<NameRow>(ctx.session.as_mut(), &stmt)? {
                inventory
                    .databases
                    .extend(inspector::database(&name, false, false, &mut ctx)?);
            }
        }
        Object::Instance => {}
        _ if !running => {
            return Err(Error::Execution(format!(
                "instance {} is not running",
                inventory.instance.label()
            )));
        }
        Object::Role(name) => {
            let role = inspector::role(name, &mut ctx)?
                .ok_or_else(|| Error::not_found("role", name.as_str()))?;
            inventory.roles.push(role);
        }
        Object::Database(name) => {
            let db = inspector::database(name, true, true, &mut ctx)?
                .ok_or_else(|| Error::not_found("database", name.as_str()))?;
            inventory.databases.push(db);
        }
    }
    Ok(inventory)
}
