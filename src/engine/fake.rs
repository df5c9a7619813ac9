//! In-memory host for engine tests
//!
//! Interprets catalog statements against a small model of instances,
//! roles and databases, and records every mutating call.

use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::Host;
use crate::catalog::{Query, Session, SessionError, Statement};
use crate::control::{
    ControlError, InitOptions, InstanceControl, strip_password, with_password,
};
use crate::model::{InstanceRef, Privilege, RoleActual, StandbyActual};
use crate::runner::RunError;
use crate::service::{ServiceError, ServiceManager, Unit};
use crate::settings::Settings;

/// Parameters that need a restart
const POSTMASTER: [&str; 4] = ["port", "shared_buffers", "max_connections", "wal_level"];

#[derive(Debug, Clone, Default)]
pub struct FakeDatabase {
    pub owner: String,
    pub settings: BTreeMap<String, String>,
    pub extensions: BTreeSet<String>,
    /// `None` until the first GRANT or REVOKE, like `datacl`
    pub acl: Option<BTreeMap<String, BTreeSet<Privilege>>>,
}

impl FakeDatabase {
    fn grants(&self) -> BTreeMap<String, BTreeSet<Privilege>> {
        self.acl.clone().unwrap_or_else(|| {
            BTreeMap::from([
                (
                    self.owner.clone(),
                    BTreeSet::from([Privilege::Connect, Privilege::Create, Privilege::Temporary]),
                ),
                (
                    "public".to_string(),
                    BTreeSet::from([Privilege::Connect, Privilege::Temporary]),
                ),
            ])
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeInstance {
    pub config: BTreeMap<String, String>,
    pub standby: bool,
    pub roles: BTreeMap<String, RoleActual>,
    pub databases: BTreeMap<String, FakeDatabase>,
    pub slots: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, Default)]
struct UnitState {
    installed: bool,
    running: bool,
}

#[derive(Debug, Default)]
pub struct FakeState {
    instances: BTreeMap<String, FakeInstance>,
    units: BTreeMap<String, UnitState>,
    calls: Vec<String>,
    fail: BTreeSet<String>,
}

impl FakeState {
    /// Record a call, failing if it was set up to fail.
    fn call(&mut self, label: String) -> Result<(), String> {
        let failing = self.fail.contains(&label);
        self.calls.push(label.clone());
        if failing {
            Err(format!("injected failure of {label}"))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<FakeState>>,
}

impl FakeHost {
    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Make a call labelled like `role_create:bob` or `start:<unit>` fail.
    pub fn fail_on(&self, label: &str) {
        self.lock().fail.insert(label.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    pub fn instance_exists(&self, qualname: &str) -> bool {
        self.lock().instances.contains_key(qualname)
    }

    pub fn is_standby(&self, qualname: &str) -> bool {
        self.lock()
            .instances
            .get(qualname)
            .is_some_and(|i| i.standby)
    }

    pub fn role(&self, qualname: &str, name: &str) -> Option<RoleActual> {
        self.lock()
            .instances
            .get(qualname)
            .and_then(|i| i.roles.get(name).cloned())
    }

    pub fn with_role(&self, qualname: &str, name: &str, f: impl FnOnce(&mut RoleActual)) {
        let mut state = self.lock();
        let role = state
            .instances
            .get_mut(qualname)
            .and_then(|i| i.roles.get_mut(name))
            .unwrap();
        f(role);
    }

    pub fn database_owner(&self, qualname: &str, name: &str) -> Option<String> {
        self.lock()
            .instances
            .get(qualname)
            .and_then(|i| i.databases.get(name))
            .map(|db| db.owner.clone())
    }

    pub fn database_exists(&self, qualname: &str, name: &str) -> bool {
        self.lock()
            .instances
            .get(qualname)
            .is_some_and(|i| i.databases.contains_key(name))
    }
}

impl Host for FakeHost {
    fn session(&self, _settings: &Settings, instance: &InstanceRef) -> Box<dyn Session> {
        Box::new(FakeSession {
            state: self.state.clone(),
            qualname: instance.qualname(),
        })
    }

    fn services(&self, _settings: &Settings) -> Box<dyn ServiceManager> {
        Box::new(FakeServices {
            state: self.state.clone(),
        })
    }

    fn control(&self, _settings: &Settings) -> Box<dyn InstanceControl> {
        Box::new(FakeControl {
            state: self.state.clone(),
        })
    }
}

fn new_role(name: &str) -> RoleActual {
    RoleActual {
        name: name.to_string(),
        login: false,
        superuser: false,
        inherit: true,
        replication: false,
        createdb: false,
        createrole: false,
        connection_limit: None,
        valid_until: None,
        has_password: false,
        in_roles: BTreeSet::new(),
        pgpass: false,
    }
}

// ============================================================================
// Session
// ============================================================================

struct FakeSession {
    state: Arc<Mutex<FakeState>>,
    qualname: String,
}

fn sql_error(message: impl Into<String>) -> SessionError {
    SessionError::Sql {
        sqlstate: "XX000".to_string(),
        message: message.into(),
    }
}

fn var<'s>(stmt: &'s Statement, name: &str) -> Result<&'s str, SessionError> {
    stmt.var(name)
        .ok_or_else(|| sql_error(format!("variable {name} is not bound")))
}

/// Apply a `CREATE ROLE`/`ALTER ROLE` option clause.
fn apply_options(role: &mut RoleActual, stmt: &Statement) -> Result<(), SessionError> {
    let options = stmt.clause("options").unwrap_or_default();
    let mut tokens = options.split_whitespace();
    while let Some(token) = tokens.next() {
        match token {
            "LOGIN" => role.login = true,
            "NOLOGIN" => role.login = false,
            "SUPERUSER" => role.superuser = true,
            "NOSUPERUSER" => role.superuser = false,
            "INHERIT" => role.inherit = true,
            "NOINHERIT" => role.inherit = false,
            "REPLICATION" => role.replication = true,
            "NOREPLICATION" => role.replication = false,
            "CREATEDB" => role.createdb = true,
            "NOCREATEDB" => role.createdb = false,
            "CREATEROLE" => role.createrole = true,
            "NOCREATEROLE" => role.createrole = false,
            "CONNECTION" => {
                tokens.next();
                let limit: i32 = tokens
                    .next()
                    .and_then(|l| l.parse().ok())
                    .ok_or_else(|| sql_error("bad connection limit"))?;
                role.connection_limit = (limit >= 0).then_some(limit);
            }
            "VALID" => {
                tokens.next();
                role.valid_until = match tokens.next() {
                    Some("'infinity'") => None,
                    Some(":'valid_until'") => Some(
                        var(stmt, "valid_until")?
                            .parse::<DateTime<Utc>>()
                            .map_err(|e| sql_error(e.to_string()))?,
                    ),
                    other => return Err(sql_error(format!("bad VALID UNTIL {other:?}"))),
                };
            }
            "PASSWORD" => {
                role.has_password = match tokens.next() {
                    Some("NULL") => false,
                    Some(":'password'") if stmt.secret("password").is_some() => true,
                    other => return Err(sql_error(format!("bad PASSWORD {other:?}"))),
                };
            }
            other => return Err(sql_error(format!("unknown role option {other}"))),
        }
    }
    Ok(())
}

fn privileges(stmt: &Statement) -> BTreeSet<Privilege> {
    stmt.clause("privileges")
        .unwrap_or_default()
        .split(',')
        .filter_map(|p| match p.trim() {
            "CONNECT" => Some(Privilege::Connect),
            "CREATE" => Some(Privilege::Create),
            "TEMPORARY" => Some(Privilege::Temporary),
            _ => None,
        })
        .collect()
}

fn role_row(role: &RoleActual) -> Value {
    json!({
        "name": role.name,
        "login": role.login,
        "superuser": role.superuser,
        "inherit": role.inherit,
        "replication": role.replication,
        "createdb": role.createdb,
        "createrole": role.createrole,
        "connection_limit": role.connection_limit,
        "valid_until": role.valid_until.map(|v| v.to_rfc3339()),
        "has_password": role.has_password,
        "in_roles": role.in_roles,
    })
}

impl FakeSession {
    /// Interpret a statement; only changes are recorded as calls.
    fn run(&self, stmt: &Statement, change: bool) -> Result<Vec<Value>, SessionError> {
        let mut state = self.state.lock().unwrap();
        if change {
            let label = format!(
                "{}:{}",
                stmt.query().name(),
                stmt.var("name").unwrap_or_default()
            );
            state.call(label).map_err(sql_error)?;
        }
        let instance = state
            .instances
            .get_mut(&self.qualname)
            .ok_or_else(|| sql_error("connection refused"))?;
        let mut rows = Vec::new();

        match stmt.query() {
            Query::RoleInspect => {
                rows.extend(instance.roles.get(var(stmt, "name")?).map(role_row));
            }
            Query::RoleList => {
                for name in instance.roles.keys() {
                    if !name.starts_with("pg_") && name != "postgres" {
                        rows.push(json!({ "name": name }));
                    }
                }
            }
            Query::RoleCreate => {
                let name = var(stmt, "name")?;
                if instance.roles.contains_key(name) {
                    return Err(sql_error(format!("role \"{name}\" already exists")));
                }
                let mut role = new_role(name);
                apply_options(&mut role, stmt)?;
                instance.roles.insert(name.to_string(), role);
            }
            Query::RoleAlter => {
                let name = var(stmt, "name")?;
                let role = instance
                    .roles
                    .get_mut(name)
                    .ok_or_else(|| SessionError::Missing(name.to_string()))?;
                apply_options(role, stmt)?;
            }
            Query::RoleDrop => {
                let name = var(stmt, "name")?;
                if instance.databases.values().any(|d| d.owner == name) {
                    return Err(sql_error(format!("role \"{name}\" owns a database")));
                }
                instance
                    .roles
                    .remove(name)
                    .ok_or_else(|| SessionError::Missing(name.to_string()))?;
                for role in instance.roles.values_mut() {
                    role.in_roles.remove(name);
                }
            }
            Query::RoleGrant | Query::RoleRevoke => {
                let parent = var(stmt, "parent")?.to_string();
                let name = var(stmt, "name")?;
                if !instance.roles.contains_key(&parent) {
                    return Err(SessionError::Missing(parent));
                }
                let role = instance
                    .roles
                    .get_mut(name)
                    .ok_or_else(|| SessionError::Missing(name.to_string()))?;
                if stmt.query() == Query::RoleGrant {
                    role.in_roles.insert(parent);
                } else {
                    role.in_roles.remove(&parent);
                }
            }
            Query::DatabaseInspect => {
                if let Some(db) = instance.databases.get(var(stmt, "name")?) {
                    rows.push(json!({
                        "name": var(stmt, "name")?,
                        "owner": db.owner,
                        "settings": db.settings,
                    }));
                }
            }
            Query::DatabaseList => {
                for name in instance.databases.keys() {
                    if name != "postgres" {
                        rows.push(json!({ "name": name }));
                    }
                }
            }
            Query::DatabaseExtensions => {
                let db = stmt.database().unwrap_or("postgres");
                let db = instance
                    .databases
                    .get(db)
                    .ok_or_else(|| SessionError::Missing(db.to_string()))?;
                for name in &db.extensions {
                    rows.push(json!({ "name": name }));
                }
            }
            Query::DatabaseGrants => {
                if let Some(db) = instance.databases.get(var(stmt, "name")?) {
                    for (role, privileges) in db.grants() {
                        for privilege in privileges {
                            rows.push(json!({ "role": role, "privilege": privilege }));
                        }
                    }
                }
            }
            Query::DatabaseCreate => {
                let name = var(stmt, "name")?;
                if instance.databases.contains_key(name) {
                    return Err(sql_error(format!("database \"{name}\" already exists")));
                }
                let owner = stmt.var("owner").unwrap_or("postgres");
                if !instance.roles.contains_key(owner) {
                    return Err(SessionError::Missing(owner.to_string()));
                }
                instance.databases.insert(
                    name.to_string(),
                    FakeDatabase {
                        owner: owner.to_string(),
                        extensions: BTreeSet::from(["plpgsql".to_string()]),
                        ..FakeDatabase::default()
                    },
                );
            }
            Query::DatabaseDrop => {
                let name = var(stmt, "name")?;
                instance
                    .databases
                    .remove(name)
                    .ok_or_else(|| SessionError::Missing(name.to_string()))?;
            }
            query => {
                let name = stmt.database().unwrap_or(var(stmt, "name").unwrap_or("postgres"));
                if matches!(
                    query,
                    Query::InstanceSettings
                        | Query::SlotInspect
                        | Query::SlotCreate
                        | Query::SlotDrop
                ) {
                    return Self::instance_query(instance, stmt);
                }
                let db = instance
                    .databases
                    .get_mut(name)
                    .ok_or_else(|| SessionError::Missing(name.to_string()))?;
                Self::database_change(db, stmt)?;
            }
        }
        Ok(rows)
    }

    fn database_change(db: &mut FakeDatabase, stmt: &Statement) -> Result<(), SessionError> {
        match stmt.query() {
            Query::DatabaseAlterOwner => db.owner = var(stmt, "owner")?.to_string(),
            Query::DatabaseSet => {
                db.settings.insert(
                    var(stmt, "setting")?.to_string(),
                    var(stmt, "value")?.to_string(),
                );
            }
            Query::DatabaseReset => {
                db.settings.remove(var(stmt, "setting")?);
            }
            Query::DatabaseResetAll => db.settings.clear(),
            Query::DatabaseGrant | Query::DatabaseRevoke => {
                let mut acl = db.grants();
                let entry = acl.entry(var(stmt, "role")?.to_string()).or_default();
                for privilege in privileges(stmt) {
                    if stmt.query() == Query::DatabaseGrant {
                        entry.insert(privilege);
                    } else {
                        entry.remove(&privilege);
                    }
                }
                acl.retain(|_, p| !p.is_empty());
                db.acl = Some(acl);
            }
            Query::ExtensionCreate => {
                db.extensions.insert(var(stmt, "extension")?.to_string());
            }
            Query::ExtensionDrop => {
                let name = var(stmt, "extension")?;
                if !db.extensions.remove(name) {
                    return Err(SessionError::Missing(name.to_string()));
                }
            }
            other => return Err(sql_error(format!("unexpected {}", other.name()))),
        }
        Ok(())
    }

    fn instance_query(
        instance: &mut FakeInstance,
        stmt: &Statement,
    ) -> Result<Vec<Value>, SessionError> {
        let mut rows = Vec::new();
        match stmt.query() {
            Query::InstanceSettings => {
                for name in var(stmt, "names")?.split(',').filter(|n| !n.is_empty()) {
                    let context = if POSTMASTER.contains(&name) {
                        "postmaster"
                    } else {
                        "sighup"
                    };
                    rows.push(json!({ "name": name, "context": context }));
                }
            }
            Query::SlotInspect => {
                let name = var(stmt, "name")?;
                if instance.slots.contains(name) {
                    rows.push(json!({ "name": name }));
                }
            }
            Query::SlotCreate => {
                instance.slots.insert(var(stmt, "name")?.to_string());
            }
            Query::SlotDrop => {
                let name = var(stmt, "name")?;
                if !instance.slots.remove(name) {
                    return Err(SessionError::Missing(name.to_string()));
                }
            }
            other => return Err(sql_error(format!("unexpected {}", other.name()))),
        }
        Ok(rows)
    }
}

impl Session for FakeSession {
    fn fetch(&mut self, stmt: &Statement) -> Result<Vec<Value>, SessionError> {
        self.run(stmt, false)
    }

    fn execute(&mut self, stmt: &Statement) -> Result<(), SessionError> {
        self.run(stmt, true).map(|_| ())
    }
}

// ============================================================================
// Services
// ============================================================================

struct FakeServices {
    state: Arc<Mutex<FakeState>>,
}

fn service_error(message: String) -> ServiceError {
    ServiceError::Run(RunError::Failed {
        program: "systemctl".to_string(),
        status: "exit status: 1".to_string(),
        stderr: message,
    })
}

impl FakeServices {
    fn change(&self, op: &str, unit: &Unit, f: impl FnOnce(&mut UnitState)) -> Result<(), ServiceError> {
        let mut state = self.state.lock().unwrap();
        state.call(format!("{op}:{}", unit.name)).map_err(service_error)?;
        f(state.units.entry(unit.name.clone()).or_default());
        Ok(())
    }
}

impl ServiceManager for FakeServices {
    fn install(&self, unit: &Unit) -> Result<(), ServiceError> {
        self.change("install", unit, |u| u.installed = true)
    }

    fn start(&self, unit: &Unit) -> Result<(), ServiceError> {
        self.change("start", unit, |u| u.running = true)
    }

    fn stop(&self, unit: &Unit) -> Result<(), ServiceError> {
        self.change("stop", unit, |u| u.running = false)
    }

    fn is_running(&self, unit: &Unit) -> Result<bool, ServiceError> {
        let state = self.state.lock().unwrap();
        Ok(state.units.get(&unit.name).is_some_and(|u| u.running))
    }

    fn uninstall(&self, unit: &Unit) -> Result<(), ServiceError> {
        if !self.is_installed(unit)? {
            return Err(ServiceError::NotInstalled(unit.name.clone()));
        }
        self.change("uninstall", unit, |u| *u = UnitState::default())
    }

    fn is_installed(&self, unit: &Unit) -> Result<bool, ServiceError> {
        let state = self.state.lock().unwrap();
        Ok(state.units.get(&unit.name).is_some_and(|u| u.installed))
    }
}

// ============================================================================
// Instance control
// ============================================================================

struct FakeControl {
    state: Arc<Mutex<FakeState>>,
}

fn control_error(message: String) -> ControlError {
    ControlError::Run(RunError::Failed {
        program: "pg_ctl".to_string(),
        status: "exit status: 1".to_string(),
        stderr: message,
    })
}

impl FakeControl {
    fn change(
        &self,
        op: &str,
        instance: &InstanceRef,
        f: impl FnOnce(&mut FakeInstance),
    ) -> Result<(), ControlError> {
        let qualname = instance.qualname();
        let mut state = self.state.lock().unwrap();
        state.call(format!("{op}:{qualname}")).map_err(control_error)?;
        let found = state
            .instances
            .get_mut(&qualname)
            .ok_or_else(|| ControlError::Missing(instance.label()))?;
        f(found);
        Ok(())
    }
}

impl InstanceControl for FakeControl {
    fn list(&self) -> Result<Vec<(String, String)>, ControlError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .instances
            .keys()
            .filter_map(|q| q.split_once('-'))
            .map(|(v, n)| (v.to_string(), n.to_string()))
            .collect())
    }

    fn exists(&self, instance: &InstanceRef) -> bool {
        let state = self.state.lock().unwrap();
        state.instances.contains_key(&instance.qualname())
    }

    fn read_config(&self, instance: &InstanceRef) -> Result<BTreeMap<String, String>, ControlError> {
        let state = self.state.lock().unwrap();
        state
            .instances
            .get(&instance.qualname())
            .map(|i| i.config.clone())
            .ok_or_else(|| ControlError::Missing(instance.label()))
    }

    fn standby(&self, instance: &InstanceRef) -> Result<Option<StandbyActual>, ControlError> {
        let state = self.state.lock().unwrap();
        let found = state
            .instances
            .get(&instance.qualname())
            .ok_or_else(|| ControlError::Missing(instance.label()))?;
        Ok(found.standby.then(|| StandbyActual {
            conninfo: strip_password(
                found
                    .config
                    .get("primary_conninfo")
                    .map(String::as_str)
                    .unwrap_or_default(),
            ),
            slot: found.config.get("primary_slot_name").cloned(),
        }))
    }

    fn init(&self, instance: &InstanceRef, opts: &InitOptions) -> Result<(), ControlError> {
        let qualname = instance.qualname();
        let mut state = self.state.lock().unwrap();
        state.call(format!("init:{qualname}")).map_err(control_error)?;

        let mut created = FakeInstance::default();
        created.config.insert(
            "unix_socket_directories".to_string(),
            instance.socket_dir.display().to_string(),
        );
        let mut surole = new_role(&opts.surole);
        surole.superuser = true;
        surole.login = true;
        surole.has_password = opts.surole_password.is_some();
        created.roles.insert(opts.surole.clone(), surole);
        created.databases.insert(
            "postgres".to_string(),
            FakeDatabase {
                owner: opts.surole.clone(),
                ..FakeDatabase::default()
            },
        );
        if let Some(standby) = &opts.standby {
            created.standby = true;
            created.config.insert(
                "primary_conninfo".to_string(),
                with_password(&standby.conninfo, standby.password.as_ref()),
            );
            if let Some(slot) = &standby.slot {
                created
                    .config
                    .insert("primary_slot_name".to_string(), slot.clone());
            }
        }
        state.instances.insert(qualname, created);
        Ok(())
    }

    fn write_config(
        &self,
        instance: &InstanceRef,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), ControlError> {
        self.change(&format!("write_config:{key}"), instance, |i| match value {
            Some(v) => {
                i.config.insert(key.to_string(), v.to_string());
            }
            None => {
                i.config.remove(key);
            }
        })
    }

    fn reload(&self, instance: &InstanceRef) -> Result<(), ControlError> {
        self.change("reload", instance, |_| {})
    }

    fn promote(&self, instance: &InstanceRef) -> Result<(), ControlError> {
        self.change("promote", instance, |i| i.standby = false)
    }

    fn remove(&self, instance: &InstanceRef) -> Result<(), ControlError> {
        let qualname = instance.qualname();
        let mut state = self.state.lock().unwrap();
        state.call(format!("remove:{qualname}")).map_err(control_error)?;
        state
            .instances
            .remove(&qualname)
            .map(|_| ())
            .ok_or_else(|| ControlError::Missing(instance.label()))
    }
}
