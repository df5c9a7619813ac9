//! Dependency planning - orders the resources of one instance manifest
//!
//! The edge set is small and fixed:
//! - everything inside the instance requires the instance
//! - a database requires the roles it names as owner or grantee
//! - memberships come after every role, requiring their own role
//! - dropped roles come after every database
//! - satellites require the instance, and are torn down before it

use converge::{ExecutionPlan, PlanBuilder, PlanError};
use std::collections::BTreeMap;
use std::fmt::Write as _;

use super::resource::{DatabaseSpec, InstanceSpec, PgResource, SatelliteSpec};
use crate::model::{
    DatabaseManifest, InstanceManifest, InstanceRef, RunState, SatelliteKind, SatelliteManifest,
    Secret,
};
use crate::service::Unit;
use crate::settings::{Settings, render_template};

/// Order the resources of a normalized manifest.
pub fn plan(
    desired: &InstanceManifest,
    settings: &Settings,
    instance: &InstanceRef,
) -> Result<ExecutionPlan<PgResource>, PlanError> {
    let mut b = PlanBuilder::new();
    let spec = InstanceSpec {
        manifest: desired.clone(),
        unit: Unit::postgresql(instance),
    };
    let satellites = satellites(desired, settings, instance);

    if desired.state == RunState::Absent {
        let dbs: Vec<usize> = desired
            .databases
            .iter()
            .map(|db| b.add(PgResource::Database(database(db, settings))))
            .collect();
        let roles: Vec<usize> = desired
            .roles
            .iter()
            .map(|role| b.add(PgResource::Role(role.clone())))
            .collect();
        for &role in &roles {
            for &db in &dbs {
                b.after(role, db);
            }
        }
        let sats: Vec<usize> = satellites
            .into_iter()
            .map(|s| b.add(PgResource::Satellite(s)))
            .collect();
        let inst = b.add(PgResource::Instance(spec));
        for &sat in &sats {
            b.requires(inst, sat);
        }
        for &other in dbs.iter().chain(&roles) {
            b.after(inst, other);
        }
        return b.build();
    }

    let inst = b.add(PgResource::Instance(spec));

    for slot in &desired.replication_slots {
        let idx = b.add(PgResource::Slot(slot.clone()));
        b.requires(idx, inst);
    }

    let mut present: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dropped = Vec::new();
    let mut all_roles = Vec::new();
    for role in &desired.roles {
        let idx = b.add(PgResource::Role(role.clone()));
        b.requires(idx, inst);
        if role.is_present() {
            present.insert(role.name.as_str(), idx);
        } else {
            dropped.push(idx);
        }
        all_roles.push(idx);
    }

    // Membership cycles are allowed: grants are a flat set applied last.
    for role in &desired.roles {
        let Some(&own) = present.get(role.name.as_str()) else {
            continue;
        };
        if role.in_roles.is_unset() {
            continue;
        }
        let idx = b.add(PgResource::Membership(role.clone()));
        b.requires(idx, own);
        for parent in role.in_roles.value().into_iter().flatten() {
            if let Some(&p) = present.get(parent.as_str()) {
                b.requires(idx, p);
            }
        }
        for &r in &all_roles {
            b.after(idx, r);
        }
    }

    for db in &desired.databases {
        let idx = b.add(PgResource::Database(database(db, settings)));
        b.requires(idx, inst);
        if db.is_present() {
            for name in db.referenced_roles() {
                if let Some(&r) = present.get(name) {
                    b.requires(idx, r);
                }
            }
        }
        for &r in &dropped {
            b.after(r, idx);
        }
    }

    for sat in satellites {
        let idx = b.add(PgResource::Satellite(sat));
        b.requires(idx, inst);
    }

    b.build()
}

fn database(manifest: &DatabaseManifest, settings: &Settings) -> DatabaseSpec {
    DatabaseSpec {
        manifest: manifest.clone(),
        creator: settings.postgresql.surole.name.clone(),
    }
}

// ============================================================================
// Satellites
// ============================================================================

/// Satellites of an instance with their rendered configuration.
///
/// A site-enabled satellite the manifest does not mention is torn down
/// along with a dropped instance.
fn satellites(
    desired: &InstanceManifest,
    settings: &Settings,
    instance: &InstanceRef,
) -> Vec<SatelliteSpec> {
    let wanted = |m: &Option<SatelliteManifest>| match m {
        Some(m) => Some(m.clone()),
        None if desired.state == RunState::Absent => Some(SatelliteManifest {
            state: RunState::Absent,
            ..SatelliteManifest::default()
        }),
        None => None,
    };

    let mut specs = Vec::new();
    if let (Some(site), Some(mut manifest)) = (&settings.prometheus, wanted(&desired.prometheus))
    {
        if desired.state == RunState::Absent {
            manifest.state = RunState::Absent;
        }
        let configpath = render_template(&site.configpath, &instance.version, &instance.name);
        let port = manifest.port.unwrap_or(site.default_port);
        let password = manifest
            .password
            .as_ref()
            .or(desired.surole_password.as_ref());
        let config = prometheus_config(&settings.postgresql.surole.name, password, instance, port);
        specs.push(SatelliteSpec {
            kind: SatelliteKind::Prometheus,
            instance: instance.label(),
            unit: Unit::satellite(
                SatelliteKind::Prometheus,
                instance,
                &site.execpath,
                &configpath,
            ),
            manifest,
            configpath,
            config: Secret::new(config),
        });
    }
    if let (Some(site), Some(mut manifest)) = (&settings.pgbackrest, wanted(&desired.pgbackrest))
    {
        if desired.state == RunState::Absent {
            manifest.state = RunState::Absent;
        }
        let configpath = render_template(&site.configpath, &instance.version, &instance.name);
        let config = pgbackrest_config(
            &settings.postgresql.surole.name,
            &site.repository.to_string_lossy(),
            instance,
        );
        specs.push(SatelliteSpec {
            kind: SatelliteKind::Pgbackrest,
            instance: instance.label(),
            unit: Unit::satellite(
                SatelliteKind::Pgbackrest,
                instance,
                &site.execpath,
                &configpath,
            ),
            manifest,
            configpath,
            config: Secret::new(config),
        });
    }
    specs
}

/// postgres_exporter environment file. A socket host only works in the
/// URI query, not in a `key=value` DSN.
fn prometheus_config(
    user: &str,
    password: Option<&Secret>,
    instance: &InstanceRef,
    port: u16,
) -> String {
    let mut userspec = urlencoding::encode(user).into_owned();
    if let Some(password) = password {
        userspec.push(':');
        userspec.push_str(&urlencoding::encode(password.expose()));
    }
    let uri = format!(
        "postgresql://{}@:{}/postgres?host={}&sslmode=disable",
        userspec,
        instance.port,
        urlencoding::encode(&instance.socket_dir.to_string_lossy())
    );

    let mut config = String::new();
    let _ = writeln!(config, "DATA_SOURCE_NAME={uri}");
    let _ = writeln!(config, "PG_EXPORTER_WEB_LISTEN_ADDRESS=:{port}");
    config.push_str("PG_EXPORTER_AUTO_DISCOVER_DATABASES=true\n");
    config
}

/// pgBackRest configuration with one stanza named after the instance
fn pgbackrest_config(user: &str, repository: &str, instance: &InstanceRef) -> String {
    let stanza = instance.qualname();
    let mut config = String::new();
    let _ = writeln!(config, "[global]");
    let _ = writeln!(config, "repo1-path={repository}");
    let _ = writeln!(config, "repo1-retention-full=2");
    let _ = writeln!(config, "repo1-retention-diff=3");
    let _ = writeln!(config);
    let _ = writeln!(config, "[global:archive-push]");
    let _ = writeln!(config, "compress-level=3");
    let _ = writeln!(config);
    let _ = writeln!(config, "[{stanza}]");
    let _ = writeln!(config, "pg1-path={}", instance.datadir.display());
    let _ = writeln!(config, "pg1-port={}", instance.port);
    let _ = writeln!(config, "pg1-socket-path={}", instance.socket_dir.display());
    let _ = writeln!(config, "pg1-user={user}");
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Presence, RoleManifest};
    use crate::settings::{PgBackRestSettings, PrometheusSettings};
    use converge::Field;

    fn keys(plan: &ExecutionPlan<PgResource>) -> Vec<String> {
        plan.resources()
            .map(|r| format!("{}:{}", r.kind(), r.name()))
            .collect()
    }

    fn setup(m: InstanceManifest) -> (InstanceManifest, Settings, InstanceRef) {
        let settings = Settings::default();
        let instance = InstanceRef::new(&settings, "16", &m.name, 5432);
        let m = InstanceManifest {
            version: Some("16".into()),
            ..m
        };
        (m, settings, instance)
    }

    #[test]
    fn test_database_after_owner_role() {
        let mut m = InstanceManifest::named("main");
        m.databases.push(DatabaseManifest {
            owner: Field::Value("bob".into()),
            ..DatabaseManifest::named("app")
        });
        m.roles.push(RoleManifest {
            in_roles: Field::Value(vec!["alice".into()]),
            ..RoleManifest::named("bob")
        });
        m.roles.push(RoleManifest::named("alice"));
        let (m, settings, instance) = setup(m);

        let plan = plan(&m, &settings, &instance).unwrap();
        assert_eq!(
            keys(&plan),
            vec![
                "instance:16/main",
                "role:bob",
                "role:alice",
                "membership:bob",
                "database:app"
            ]
        );
        // database:app requires the instance and bob
        assert_eq!(plan.steps()[4].depends_on, vec![0, 1]);
        // membership:bob requires bob and alice
        assert_eq!(plan.steps()[3].depends_on, vec![1, 2]);
    }

    #[test]
    fn test_dropped_role_after_databases() {
        let mut m = InstanceManifest::named("main");
        m.roles.push(RoleManifest {
            state: Presence::Absent,
            ..RoleManifest::named("old")
        });
        m.databases.push(DatabaseManifest {
            state: Presence::Absent,
            ..DatabaseManifest::named("legacy")
        });
        let (m, settings, instance) = setup(m);
        let plan = plan(&m, &settings, &instance).unwrap();
        assert_eq!(
            keys(&plan),
            vec!["instance:16/main", "database:legacy", "role:old"]
        );
    }

    #[test]
    fn test_absent_instance_drops_nested_first() {
        let mut m = InstanceManifest::named("main");
        m.state = RunState::Absent;
        m.databases.push(DatabaseManifest {
            state: Presence::Absent,
            ..DatabaseManifest::named("db1")
        });
        m.databases.push(DatabaseManifest {
            state: Presence::Absent,
            ..DatabaseManifest::named("db2")
        });
        m.roles.push(RoleManifest {
            state: Presence::Absent,
            ..RoleManifest::named("alice")
        });
        let (m, mut settings, instance) = setup(m);
        settings.prometheus = Some(PrometheusSettings::default());

        let plan = plan(&m, &settings, &instance).unwrap();
        assert_eq!(
            keys(&plan),
            vec![
                "database:db1",
                "database:db2",
                "role:alice",
                "prometheus:16/main",
                "instance:16/main"
            ]
        );
        let PgResource::Satellite(sat) = &plan.steps()[3].resource else {
            panic!("expected satellite");
        };
        assert_eq!(sat.manifest.state, RunState::Absent);
        assert_eq!(plan.steps()[4].depends_on, vec![3]);
    }

    #[test]
    fn test_satellites_require_instance() {
        let mut m = InstanceManifest::named("main");
        m.pgbackrest = Some(SatelliteManifest::default());
        m.replication_slots.push(crate::model::SlotManifest {
            name: "s1".into(),
            state: Presence::Present,
        });
        let (m, mut settings, instance) = setup(m);
        settings.pgbackrest = Some(PgBackRestSettings::default());

        let plan = plan(&m, &settings, &instance).unwrap();
        assert_eq!(
            keys(&plan),
            vec![
                "instance:16/main",
                "replication_slot:s1",
                "pgbackrest:16/main"
            ]
        );
        assert_eq!(plan.steps()[2].depends_on, vec![0]);
    }

    #[test]
    fn test_prometheus_config() {
        let settings = Settings::default();
        let instance = InstanceRef::new(&settings, "16", "main", 5433);
        let config = prometheus_config("postgres", Some(&Secret::new("p@ss")), &instance, 9187);
        assert_eq!(
            config,
            "DATA_SOURCE_NAME=postgresql://postgres:p%40ss@:5433/postgres?host=%2Frun%2Fpostgresql&sslmode=disable\n\
             PG_EXPORTER_WEB_LISTEN_ADDRESS=:9187\n\
             PG_EXPORTER_AUTO_DISCOVER_DATABASES=true\n"
        );
    }

    #[test]
    fn test_pgbackrest_config_has_stanza() {
        let settings = Settings::default();
        let instance = InstanceRef::new(&settings, "16", "main", 5432);
        let config = pgbackrest_config("postgres", "/backups", &instance);
        assert!(config.contains("[16-main]\npg1-path=/var/lib/pgconverge/16/main/data\n"));
        assert!(config.contains("pg1-port=5432\n"));
        assert!(config.starts_with("[global]\nrepo1-path=/backups\n"));
    }
}
