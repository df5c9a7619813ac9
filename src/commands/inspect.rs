//! `inspect`: show the live state of an instance or of one object in it

use anyhow::{Context as AnyhowContext, Result};
use colored::Colorize;

use crate::Context;
use crate::cli::{InspectArgs, InspectObject};
use crate::engine::{self, Inventory, Object, SystemHost};
use crate::model::{DatabaseActual, Privilege, RoleActual};
use crate::render::Format;
use crate::ui;

pub fn run(ctx: &Context, args: InspectArgs) -> Result<()> {
    let object = match args.object {
        None => Object::Instance,
        Some(InspectObject::Role { name }) => Object::Role(name),
        Some(InspectObject::Database { name }) => Object::Database(name),
    };
    let inventory = engine::inspect(
        &SystemHost,
        &ctx.settings,
        &args.instance,
        args.pg_version.as_deref(),
        &object,
    )
    .with_context(|| format!("Could not inspect {}", args.instance))?;

    match args.format {
        Format::Json => println!(
            "{}",
            serde_json::to_string_pretty(&inventory).context("Failed to serialize inventory")?
        ),
        Format::Text => show(&inventory, &object),
    }
    Ok(())
}

fn yes_no(value: bool) -> String {
    if value {
        "yes".green().to_string()
    } else {
        "no".dimmed().to_string()
    }
}

fn show(inventory: &Inventory, object: &Object) {
    let instance = &inventory.instance;
    let actual = &inventory.actual;
    if *object == Object::Instance {
        ui::header(&format!("Instance {}", instance.label()));
        let state = if actual.is_running() {
            "started".green()
        } else {
            "stopped".yellow()
        };
        ui::kv("State", &state.to_string());
        ui::kv(
            "Port",
            &actual
                .port
                .map_or_else(|| format!("{} (default)", instance.port), |p| p.to_string()),
        );
        ui::kv("Data directory", &instance.datadir.display().to_string());
        ui::kv("Service installed", &yes_no(actual.unit_installed));
        match &actual.standby {
            Some(standby) => {
                ui::kv("Standby of", &standby.conninfo);
                if let Some(slot) = &standby.slot {
                    ui::kv("Slot", slot);
                }
            }
            None => ui::kv("Role", "primary"),
        }
        if !actual.is_running() {
            println!();
            ui::dim("Roles and databases are only visible while the instance runs.");
        }
    }

    if !inventory.roles.is_empty() {
        ui::section("Roles");
        for role in &inventory.roles {
            show_role(role, *object != Object::Instance);
        }
    }
    if !inventory.databases.is_empty() {
        ui::section("Databases");
        for db in &inventory.databases {
            show_database(db, *object != Object::Instance);
        }
    }
}

fn show_role(role: &RoleActual, detailed: bool) {
    let mut flags = Vec::new();
    for (set, name) in [
        (role.login, "login"),
        (role.superuser, "superuser"),
        (role.replication, "replication"),
        (role.createdb, "createdb"),
        (role.createrole, "createrole"),
    ] {
        if set {
            flags.push(name);
        }
    }
    println!("  {} {}", role.name.bold(), flags.join(", ").dimmed());
    if !detailed {
        return;
    }
    ui::kv("inherit", &yes_no(role.inherit));
    ui::kv(
        "connection limit",
        &role
            .connection_limit
            .map_or_else(|| "none".to_string(), |l| l.to_string()),
    );
    ui::kv(
        "valid until",
        &role
            .valid_until
            .map_or_else(|| "infinity".to_string(), |v| v.to_rfc3339()),
    );
    ui::kv("password", &yes_no(role.has_password));
    ui::kv("password file entry", &yes_no(role.pgpass));
    if !role.in_roles.is_empty() {
        let parents: Vec<&str> = role.in_roles.iter().map(String::as_str).collect();
        ui::kv("member of", &parents.join(", "));
    }
}

fn show_database(db: &DatabaseActual, detailed: bool) {
    println!("  {} {}", db.name.bold(), format!("owner {}", db.owner).dimmed());
    if !detailed {
        return;
    }
    for (key, value) in &db.settings {
        ui::kv(key, value);
    }
    if !db.extensions.is_empty() {
        let extensions: Vec<&str> = db.extensions.iter().map(String::as_str).collect();
        ui::kv("extensions", &extensions.join(", "));
    }
    for (role, privileges) in &db.grants {
        let privileges: Vec<&str> = privileges.iter().map(Privilege::as_sql).collect();
        ui::kv(&format!("grant {role}"), &privileges.join(", "));
    }
}
