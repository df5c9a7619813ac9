//! Diff computation - desired documents against inspected ones
//!
//! Pure functions. Unset manifest fields never produce a change; only an
//! explicit value or an explicit `null` does.

use converge::{Change, ChangeKind, ChangeSet, Field, FieldChange, ImpactLevel, compare};
use std::collections::{BTreeMap, BTreeSet};

use super::resource::{Action, DatabaseSpec, InstanceSpec, PgActual, PgResource, SatelliteSpec, ServiceOp};
use crate::catalog::{Query, Statement};
use crate::model::{
    DatabaseActual, InstanceActual, Presence, Privilege, RoleActual, RoleManifest, RunState,
    SatelliteActual, SlotManifest, StandbyStatus,
};

type Changes = ChangeSet<Action>;

/// Diff any resource against its inspected document
pub fn diff(resource: &PgResource, actual: Option<&PgActual>) -> Changes {
    match resource {
        PgResource::Instance(spec) => instance(
            spec,
            actual.and_then(|a| match a {
                PgActual::Instance(i) => Some(i),
                _ => None,
            }),
        ),
        PgResource::Role(role) => self::role(
            role,
            actual.and_then(|a| match a {
                PgActual::Role(r) => Some(r),
                _ => None,
            }),
        ),
        PgResource::Membership(role) => membership(
            role,
            actual.and_then(|a| match a {
                PgActual::Membership(m) => Some(m),
                _ => None,
            }),
        ),
        PgResource::Database(spec) => database(
            spec,
            actual.and_then(|a| match a {
                PgActual::Database(d) => Some(d),
                _ => None,
            }),
        ),
        PgResource::Slot(slot) => self::slot(slot, actual.is_some()),
        PgResource::Satellite(spec) => satellite(
            spec,
            actual.and_then(|a| match a {
                PgActual::Satellite(s) => Some(s),
                _ => None,
            }),
        ),
    }
}

fn service(op: ServiceOp, unit: &crate::service::Unit) -> Action {
    Action::Service {
        op,
        unit: unit.clone(),
    }
}

fn show<T: std::fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "none".to_string(), |v| v.to_string())
}

// ============================================================================
// Instance
// ============================================================================

/// Diff an instance: existence, runtime state, configuration and standby.
pub fn instance(spec: &InstanceSpec, actual: Option<&InstanceActual>) -> Changes {
    let desired = &spec.manifest;
    let unit = &spec.unit;
    let mut changes = Changes::new();

    let Some(actual) = actual else {
        if desired.state == RunState::Absent {
            return changes;
        }
        changes.push(Change::new(
            ChangeKind::Create,
            format!("create instance {}", desired.label()),
            Action::InitInstance,
        ));
        if let Some(port) = desired.port {
            changes.push(write_conf("port", Some(port.to_string()), None, ImpactLevel::None));
        }
        for (key, value) in &desired.settings {
            if let Some(value) = value {
                changes.push(write_conf(key, Some(value.0.clone()), None, ImpactLevel::None));
            }
        }
        changes.push(Change::new(
            ChangeKind::Create,
            "install service",
            service(ServiceOp::Install, unit),
        ));
        if desired.state == RunState::Started {
            changes.push(Change::new(
                ChangeKind::Alter,
                "start",
                service(ServiceOp::Start, unit),
            ));
            if desired
                .standby
                .as_ref()
                .is_some_and(|s| s.status == StandbyStatus::Promoted)
            {
                changes.push(Change::new(ChangeKind::Alter, "promote", Action::Promote));
            }
        }
        return changes;
    };

    if desired.state == RunState::Absent {
        if actual.is_running() {
            changes.push(Change::new(ChangeKind::Alter, "stop", service(ServiceOp::Stop, unit)));
        }
        if actual.unit_installed {
            changes.push(Change::new(
                ChangeKind::Drop,
                "uninstall service",
                service(ServiceOp::Uninstall, unit),
            ));
        }
        changes.push(Change::new(
            ChangeKind::Drop,
            format!("drop instance {}", desired.label()),
            Action::RemoveData,
        ));
        return changes;
    }

    if !actual.unit_installed {
        changes.push(Change::new(
            ChangeKind::Create,
            "install service",
            service(ServiceOp::Install, unit),
        ));
    }

    let running = actual.is_running();
    if desired.state == RunState::Stopped && running {
        changes.push(Change::new(ChangeKind::Alter, "stop", service(ServiceOp::Stop, unit)));
    }

    // Changes to a server that is not left running take effect at start.
    let stays_running = running && desired.state == RunState::Started;
    let impact_of = |key: &str| {
        if !stays_running {
            ImpactLevel::None
        } else if key == "port" || actual.contexts.get(key).is_some_and(|c| c == "postmaster") {
            ImpactLevel::Restart
        } else {
            ImpactLevel::Reload
        }
    };

    if let Some(port) = desired.port
        && actual.port != Some(port)
    {
        changes.push(write_conf(
            "port",
            Some(port.to_string()),
            actual.port.map(|p| p.to_string()),
            impact_of("port"),
        ));
    }

    for (key, value) in &desired.settings {
        let current = actual.config.get(key);
        match value {
            Some(value) if current != Some(&value.0) => changes.push(write_conf(
                key,
                Some(value.0.clone()),
                current.cloned(),
                impact_of(key),
            )),
            None if current.is_some() => {
                changes.push(write_conf(key, None, current.cloned(), impact_of(key)));
            }
            _ => {}
        }
    }

    if let Some(standby) = &desired.standby {
        match &actual.standby {
            Some(_) if standby.status == StandbyStatus::Promoted => {
                changes.push(Change::new(ChangeKind::Alter, "promote", Action::Promote));
            }
            Some(current) => {
                if current.conninfo != standby.primary_conninfo {
                    changes.push(
                        Change::new(
                            ChangeKind::Alter,
                            format!(
                                "set primary_conninfo: {} -> {}",
                                current.conninfo, standby.primary_conninfo
                            ),
                            Action::WriteConninfo {
                                conninfo: standby.primary_conninfo.clone(),
                                password: standby.password.clone(),
                            },
                        )
                        .with_impact(impact_of("primary_conninfo")),
                    );
                }
                if current.slot != standby.slot {
                    changes.push(write_conf(
                        "primary_slot_name",
                        standby.slot.clone(),
                        current.slot.clone(),
                        impact_of("primary_slot_name"),
                    ));
                }
            }
            None if standby.status == StandbyStatus::Demoted => {
                changes.push(Change::new(
                    ChangeKind::Alter,
                    "demote to standby",
                    Action::Reject(format!(
                        "instance {} is a primary and cannot be turned into a standby",
                        desired.label()
                    )),
                ));
            }
            None => {}
        }
    }

    if desired.state == RunState::Started && !running {
        changes.push(Change::new(ChangeKind::Alter, "start", service(ServiceOp::Start, unit)));
    }
    changes
}

fn write_conf(
    key: &str,
    value: Option<String>,
    current: Option<String>,
    impact: ImpactLevel,
) -> Change<Action> {
    let summary = match &value {
        Some(v) => format!("set {}: {} -> {}", key, show(current.as_deref()), v),
        None => format!("reset {}", key),
    };
    Change::new(
        ChangeKind::Alter,
        summary,
        Action::WriteConf {
            key: key.to_string(),
            value,
        },
    )
    .with_impact(impact)
}

// ============================================================================
// Roles
// ============================================================================

const ROLE_FLAGS: [(&str, &str, &str); 6] = [
    ("login", "LOGIN", "NOLOGIN"),
    ("superuser", "SUPERUSER", "NOSUPERUSER"),
    ("inherit", "INHERIT", "NOINHERIT"),
    ("replication", "REPLICATION", "NOREPLICATION"),
    ("createdb", "CREATEDB", "NOCREATEDB"),
    ("createrole", "CREATEROLE", "NOCREATEROLE"),
];

fn role_flags(role: &RoleManifest) -> [&Field<bool>; 6] {
    [
        &role.login,
        &role.superuser,
        &role.inherit,
        &role.replication,
        &role.createdb,
        &role.createrole,
    ]
}

fn actual_flags(role: &RoleActual) -> [bool; 6] {
    [
        role.login,
        role.superuser,
        role.inherit,
        role.replication,
        role.createdb,
        role.createrole,
    ]
}

fn role_statement(query: Query, role: &RoleManifest, options: Vec<String>) -> Statement {
    let mut stmt = Statement::new(query).with_var("name", &role.name);
    if options.iter().any(|o| o.contains(":'valid_until'"))
        && let Some(until) = role.valid_until.value()
    {
        stmt = stmt.with_var("valid_until", until.to_rfc3339());
    }
    if options.iter().any(|o| o.contains(":'password'"))
        && let Some(password) = role.password.value()
    {
        stmt = stmt.with_secret("password", password);
    }
    stmt.with_clause("options", options.join(" "))
}

fn alter_role(role: &RoleManifest, summary: String, option: &str) -> Change<Action> {
    Change::new(
        ChangeKind::Alter,
        summary,
        Action::Sql(role_statement(Query::RoleAlter, role, vec![option.to_string()])),
    )
    .with_impact(ImpactLevel::Reload)
}

/// Diff a role's attributes and password file entry.
pub fn role(desired: &RoleManifest, actual: Option<&RoleActual>) -> Changes {
    let mut changes = Changes::new();

    if !desired.is_present() {
        if let Some(actual) = actual {
            changes.push(Change::new(
                ChangeKind::Drop,
                format!("drop role {}", desired.name),
                Action::Sql(Statement::new(Query::RoleDrop).with_var("name", &desired.name)),
            ));
            if actual.pgpass {
                changes.push(pgpass_change(desired, false));
            }
        }
        return changes;
    }

    let Some(actual) = actual else {
        let mut options = Vec::new();
        for ((_, on, off), field) in ROLE_FLAGS.iter().zip(role_flags(desired)) {
            if let Some(v) = field.value() {
                options.push(if *v { *on } else { *off }.to_string());
            }
        }
        if let Some(limit) = desired.connection_limit.value() {
            options.push(format!("CONNECTION LIMIT {limit}"));
        }
        if desired.valid_until.value().is_some() {
            options.push("VALID UNTIL :'valid_until'".to_string());
        }
        if desired.password.value().is_some() {
            options.push("PASSWORD :'password'".to_string());
        }
        changes.push(Change::new(
            ChangeKind::Create,
            format!("create role {}", desired.name),
            Action::Sql(role_statement(Query::RoleCreate, desired, options)),
        ));
        if desired.pgpass == Field::Value(true) {
            changes.push(pgpass_change(desired, true));
        }
        return changes;
    };

    let current = actual_flags(actual);
    for (((name, on, off), field), current) in
        ROLE_FLAGS.iter().zip(role_flags(desired)).zip(current)
    {
        if let FieldChange::Set(v) = compare(field, Some(&current)) {
            changes.push(alter_role(
                desired,
                format!("set {name}: {current} -> {v}"),
                if v { on } else { off },
            ));
        }
    }

    match compare(&desired.connection_limit, actual.connection_limit.as_ref()) {
        FieldChange::Set(limit) => changes.push(alter_role(
            desired,
            format!(
                "set connection_limit: {} -> {}",
                show(actual.connection_limit),
                limit
            ),
            &format!("CONNECTION LIMIT {limit}"),
        )),
        FieldChange::Clear => changes.push(alter_role(
            desired,
            format!(
                "set connection_limit: {} -> none",
                show(actual.connection_limit)
            ),
            "CONNECTION LIMIT -1",
        )),
        FieldChange::Unchanged => {}
    }

    match compare(&desired.valid_until, actual.valid_until.as_ref()) {
        FieldChange::Set(until) => changes.push(alter_role(
            desired,
            format!("set valid_until: {} -> {}", show(actual.valid_until), until),
            "VALID UNTIL :'valid_until'",
        )),
        FieldChange::Clear => changes.push(alter_role(
            desired,
            format!("set valid_until: {} -> infinity", show(actual.valid_until)),
            "VALID UNTIL 'infinity'",
        )),
        FieldChange::Unchanged => {}
    }

    // The stored password is unobservable; only its presence is compared.
    match &desired.password {
        Field::Value(_) if !actual.has_password => {
            changes.push(alter_role(desired, "set password".to_string(), "PASSWORD :'password'"));
        }
        Field::Clear if actual.has_password => {
            changes.push(alter_role(desired, "remove password".to_string(), "PASSWORD NULL"));
        }
        _ => {}
    }

    match desired.pgpass {
        Field::Value(true) if !actual.pgpass => changes.push(pgpass_change(desired, true)),
        Field::Value(false) | Field::Clear if actual.pgpass => {
            changes.push(pgpass_change(desired, false));
        }
        _ => {}
    }

    changes
}

fn pgpass_change(role: &RoleManifest, present: bool) -> Change<Action> {
    let (kind, summary, password) = if present {
        (
            ChangeKind::Create,
            "add password file entry",
            role.password.value().cloned(),
        )
    } else {
        (ChangeKind::Drop, "remove password file entry", None)
    };
    Change::new(
        kind,
        summary,
        Action::Pgpass {
            role: role.name.clone(),
            password,
        },
    )
}

/// Converge the exact set of roles a role belongs to.
pub fn membership(desired: &RoleManifest, actual: Option<&BTreeSet<String>>) -> Changes {
    let mut changes = Changes::new();
    let empty = BTreeSet::new();
    let current = actual.unwrap_or(&empty);
    let wanted: BTreeSet<String> = match &desired.in_roles {
        Field::Unset => return changes,
        Field::Clear => BTreeSet::new(),
        Field::Value(roles) => roles.iter().cloned().collect(),
    };

    for parent in wanted.difference(current) {
        changes.push(
            Change::new(
                ChangeKind::Alter,
                format!("grant {parent}"),
                Action::Sql(
                    Statement::new(Query::RoleGrant)
                        .with_var("name", &desired.name)
                        .with_var("parent", parent),
                ),
            )
            .with_impact(ImpactLevel::Reload),
        );
    }
    for parent in current.difference(&wanted) {
        changes.push(
            Change::new(
                ChangeKind::Alter,
                format!("revoke {parent}"),
                Action::Sql(
                    Statement::new(Query::RoleRevoke)
                        .with_var("name", &desired.name)
                        .with_var("parent", parent),
                ),
            )
            .with_impact(ImpactLevel::Reload),
        );
    }
    changes
}

// ============================================================================
// Databases
// ============================================================================

/// Privileges PostgreSQL grants on a new database
fn default_grants(owner: &str) -> BTreeMap<String, BTreeSet<Privilege>> {
    BTreeMap::from([
        (
            owner.to_string(),
            BTreeSet::from([Privilege::Connect, Privilege::Create, Privilege::Temporary]),
        ),
        (
            "public".to_string(),
            BTreeSet::from([Privilege::Connect, Privilege::Temporary]),
        ),
    ])
}

fn privilege_list(privileges: &BTreeSet<Privilege>) -> String {
    privileges
        .iter()
        .map(Privilege::as_sql)
        .collect::<Vec<_>>()
        .join(", ")
}

fn db_statement(query: Query, name: &str) -> Statement {
    Statement::new(query).with_var("name", name)
}

fn alter_db(summary: String, stmt: Statement) -> Change<Action> {
    Change::new(ChangeKind::Alter, summary, Action::Sql(stmt)).with_impact(ImpactLevel::Reload)
}

/// Diff a database: existence, owner, settings, extensions and grants.
pub fn database(spec: &DatabaseSpec, actual: Option<&DatabaseActual>) -> Changes {
    let desired = &spec.manifest;
    let name = desired.name.as_str();
    let mut changes = Changes::new();

    if !desired.is_present() {
        if actual.is_some() {
            changes.push(Change::new(
                ChangeKind::Drop,
                format!("drop database {name}"),
                Action::Sql(db_statement(Query::DatabaseDrop, name)),
            ));
        }
        return changes;
    }

    let created: (
        BTreeMap<String, String>,
        BTreeSet<String>,
        BTreeMap<String, BTreeSet<Privilege>>,
    );
    let (owner, settings, extensions, grants) = match actual {
        Some(a) => (
            a.owner.as_str(),
            &a.settings,
            &a.extensions,
            &a.grants,
        ),
        None => {
            let owner = desired
                .owner
                .value()
                .map_or(spec.creator.as_str(), String::as_str);
            let mut stmt = db_statement(Query::DatabaseCreate, name);
            let mut options = String::new();
            if let Some(owner) = desired.owner.value() {
                stmt = stmt.with_var("owner", owner);
                options.push_str("OWNER :\"owner\"");
            }
            changes.push(Change::new(
                ChangeKind::Create,
                format!("create database {name}"),
                Action::Sql(stmt.with_clause("options", options)),
            ));
            created = (BTreeMap::new(), BTreeSet::new(), default_grants(owner));
            (owner, &created.0, &created.1, &created.2)
        }
    };

    if actual.is_some()
        && let Field::Value(new_owner) = &desired.owner
        && new_owner != owner
    {
        changes.push(alter_db(
            format!("set owner: {owner} -> {new_owner}"),
            db_statement(Query::DatabaseAlterOwner, name).with_var("owner", new_owner),
        ));
    }

    match &desired.settings {
        Field::Unset => {}
        Field::Clear => {
            if !settings.is_empty() {
                changes.push(alter_db(
                    "reset all settings".to_string(),
                    db_statement(Query::DatabaseResetAll, name),
                ));
            }
        }
        Field::Value(wanted) => {
            for (key, value) in wanted {
                let current = settings.get(key);
                match value {
                    Some(value) if current != Some(&value.0) => changes.push(alter_db(
                        format!("set {}: {} -> {}", key, show(current), value.0),
                        db_statement(Query::DatabaseSet, name)
                            .with_var("setting", key)
                            .with_var("value", &value.0),
                    )),
                    None if current.is_some() => changes.push(alter_db(
                        format!("reset {key}"),
                        db_statement(Query::DatabaseReset, name).with_var("setting", key),
                    )),
                    _ => {}
                }
            }
        }
    }

    for ext in &desired.extensions {
        let installed = extensions.contains(&ext.name);
        let stmt = |query| {
            Statement::new(query)
                .with_var("extension", &ext.name)
                .on_database(name)
        };
        match (ext.state == Presence::Present, installed) {
            (true, false) => changes.push(alter_db(
                format!("create extension {}", ext.name),
                stmt(Query::ExtensionCreate),
            )),
            (false, true) => changes.push(alter_db(
                format!("drop extension {}", ext.name),
                stmt(Query::ExtensionDrop),
            )),
            _ => {}
        }
    }

    for grant in &desired.grants {
        let empty = BTreeSet::new();
        let current = grants.get(&grant.role).unwrap_or(&empty);
        let missing: BTreeSet<Privilege> = grant.privileges.difference(current).copied().collect();
        let extra: BTreeSet<Privilege> = current.difference(&grant.privileges).copied().collect();
        if !missing.is_empty() {
            changes.push(alter_db(
                format!("grant {} to {}", privilege_list(&missing), grant.role),
                db_statement(Query::DatabaseGrant, name)
                    .with_var("role", &grant.role)
                    .with_clause("privileges", privilege_list(&missing)),
            ));
        }
        if !extra.is_empty() {
            changes.push(alter_db(
                format!("revoke {} from {}", privilege_list(&extra), grant.role),
                db_statement(Query::DatabaseRevoke, name)
                    .with_var("role", &grant.role)
                    .with_clause("privileges", privilege_list(&extra)),
            ));
        }
    }

    changes
}

// ============================================================================
// Replication slots and satellites
// ============================================================================

pub fn slot(desired: &SlotManifest, exists: bool) -> Changes {
    let present = desired.state == Presence::Present;
    let stmt = |query| Statement::new(query).with_var("name", &desired.name);
    match (present, exists) {
        (true, false) => vec![Change::new(
            ChangeKind::Create,
            format!("create replication slot {}", desired.name),
            Action::Sql(stmt(Query::SlotCreate)),
        )]
        .into(),
        (false, true) => vec![Change::new(
            ChangeKind::Drop,
            format!("drop replication slot {}", desired.name),
            Action::Sql(stmt(Query::SlotDrop)),
        )]
        .into(),
        _ => Changes::new(),
    }
}

/// Diff a satellite: configuration file, unit and runtime state.
pub fn satellite(spec: &SatelliteSpec, actual: Option<&SatelliteActual>) -> Changes {
    let desired = &spec.manifest;
    let unit = &spec.unit;
    let mut changes = Changes::new();
    let (config, installed, running) = match actual {
        Some(a) => (a.config.as_deref(), a.installed, a.running),
        None => (None, false, false),
    };

    if desired.state == RunState::Absent {
        if running {
            changes.push(Change::new(ChangeKind::Alter, "stop", service(ServiceOp::Stop, unit)));
        }
        if installed {
            changes.push(Change::new(
                ChangeKind::Drop,
                "uninstall service",
                service(ServiceOp::Uninstall, unit),
            ));
        }
        if config.is_some() {
            changes.push(Change::new(
                ChangeKind::Drop,
                format!("remove {}", spec.configpath.display()),
                Action::RemoveFile {
                    path: spec.configpath.clone(),
                },
            ));
        }
        return changes;
    }

    if config != Some(spec.config.expose()) {
        let impact = if running && desired.state == RunState::Started {
            ImpactLevel::Restart
        } else {
            ImpactLevel::None
        };
        changes.push(
            Change::new(
                if config.is_some() {
                    ChangeKind::Alter
                } else {
                    ChangeKind::Create
                },
                format!("write {}", spec.configpath.display()),
                Action::WriteFile {
                    path: spec.configpath.clone(),
                    content: spec.config.clone(),
                },
            )
            .with_impact(impact),
        );
    }
    if !installed {
        changes.push(Change::new(
            ChangeKind::Create,
            "install service",
            service(ServiceOp::Install, unit),
        ));
    }
    match (desired.state, running) {
        (RunState::Started, false) => {
            changes.push(Change::new(ChangeKind::Alter, "start", service(ServiceOp::Start, unit)));
        }
        (RunState::Stopped, true) => {
            changes.push(Change::new(ChangeKind::Alter, "stop", service(ServiceOp::Stop, unit)));
        }
        _ => {}
    }
    changes
}
