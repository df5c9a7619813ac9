//! Query catalog and database sessions
//!
//! Statements are named blocks of `queries.sql`, bound with psql variables.
//! Values (passwords included) travel as `\set` lines on psql's standard
//! input, never on its command line.

use converge::Error;
use regex::Regex;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Command;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

use crate::control;
use crate::model::{InstanceRef, Secret};
use crate::runner::{RunError, run_with_timeout};

const QUERIES: &str = include_str!("queries.sql");

/// Margin granted to psql on top of the statement timeout
const PROCESS_MARGIN: Duration = Duration::from_secs(10);

// ============================================================================
// Catalog
// ============================================================================

/// Stable names of the statements in the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Query {
    RoleInspect,
    RoleList,
    RoleCreate,
    RoleAlter,
    RoleDrop,
    RoleGrant,
    RoleRevoke,
    DatabaseInspect,
    DatabaseList,
    DatabaseExtensions,
    DatabaseGrants,
    DatabaseCreate,
    DatabaseAlterOwner,
    DatabaseSet,
    DatabaseReset,
    DatabaseResetAll,
    DatabaseDrop,
    DatabaseGrant,
    DatabaseRevoke,
    ExtensionCreate,
    ExtensionDrop,
    InstanceSettings,
    SlotInspect,
    SlotCreate,
    SlotDrop,
}

impl Query {
    pub const ALL: [Query; 25] = [
        Self::RoleInspect,
        Self::RoleList,
        Self::RoleCreate,
        Self::RoleAlter,
        Self::RoleDrop,
        Self::RoleGrant,
        Self::RoleRevoke,
        Self::DatabaseInspect,
        Self::DatabaseList,
        Self::DatabaseExtensions,
        Self::DatabaseGrants,
        Self::DatabaseCreate,
        Self::DatabaseAlterOwner,
        Self::DatabaseSet,
        Self::DatabaseReset,
        Self::DatabaseResetAll,
        Self::DatabaseDrop,
        Self::DatabaseGrant,
        Self::DatabaseRevoke,
        Self::ExtensionCreate,
        Self::ExtensionDrop,
        Self::InstanceSettings,
        Self::SlotInspect,
        Self::SlotCreate,
        Self::SlotDrop,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::RoleInspect => "role_inspect",
            Self::RoleList => "role_list",
            Self::RoleCreate => "role_create",
            Self::RoleAlter => "role_alter",
            Self::RoleDrop => "role_drop",
            Self::RoleGrant => "role_grant",
            Self::RoleRevoke => "role_revoke",
            Self::DatabaseInspect => "database_inspect",
            Self::DatabaseList => "database_list",
            Self::DatabaseExtensions => "database_extensions",
            Self::DatabaseGrants => "database_grants",
            Self::DatabaseCreate => "database_create",
            Self::DatabaseAlterOwner => "database_alter_owner",
            Self::DatabaseSet => "database_set",
            Self::DatabaseReset => "database_reset",
            Self::DatabaseResetAll => "database_reset_all",
            Self::DatabaseDrop => "database_drop",
            Self::DatabaseGrant => "database_grant",
            Self::DatabaseRevoke => "database_revoke",
            Self::ExtensionCreate => "extension_create",
            Self::ExtensionDrop => "extension_drop",
            Self::InstanceSettings => "instance_settings",
            Self::SlotInspect => "replication_slot_inspect",
            Self::SlotCreate => "replication_slot_create",
            Self::SlotDrop => "replication_slot_drop",
        }
    }

    /// SQL text of this statement
    pub fn sql(&self) -> &'static str {
        catalog()
            .get(self.name())
            .map(String::as_str)
            .unwrap_or_default()
    }
}

fn catalog() -> &'static HashMap<&'static str, String> {
    static CATALOG: OnceLock<HashMap<&'static str, String>> = OnceLock::new();
    CATALOG.get_or_init(|| parse_catalog(QUERIES))
}

/// Split `-- name:` blocks into a map of name to SQL text.
fn parse_catalog(text: &'static str) -> HashMap<&'static str, String> {
    let mut map = HashMap::new();
    let mut current: Option<(&'static str, Vec<&'static str>)> = None;

    for line in text.lines() {
        if let Some(name) = line.strip_prefix("-- name:") {
            if let Some((name, body)) = current.take() {
                map.insert(name, body.join("\n").trim().to_string());
            }
            current = Some((name.trim(), Vec::new()));
        } else if let Some((_, body)) = &mut current {
            body.push(line);
        }
    }
    if let Some((name, body)) = current {
        map.insert(name, body.join("\n").trim().to_string());
    }
    map
}

// ============================================================================
// Statements
// ============================================================================

#[derive(Clone, PartialEq, Eq)]
enum Value {
    Plain(String),
    Secret(Secret),
}

/// A catalog query with its bound parameters
#[derive(Clone, PartialEq, Eq)]
pub struct Statement {
    query: Query,
    database: Option<String>,
    vars: Vec<(&'static str, Value)>,
    clauses: Vec<(&'static str, String)>,
}

impl Statement {
    pub fn new(query: Query) -> Self {
        Self {
            query,
            database: None,
            vars: Vec::new(),
            clauses: Vec::new(),
        }
    }

    /// Bind a variable
    pub fn with_var(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.vars.push((name, Value::Plain(value.into())));
        self
    }

    /// Bind a variable holding a password
    pub fn with_secret(mut self, name: &'static str, value: &Secret) -> Self {
        self.vars.push((name, Value::Secret(value.clone())));
        self
    }

    /// Fill a `{placeholder}` with generated SQL.
    ///
    /// Clauses are built from keywords, integers and variable references
    /// only; values always go through [`Statement::with_var`].
    pub fn with_clause(mut self, placeholder: &'static str, sql: impl Into<String>) -> Self {
        self.clauses.push((placeholder, sql.into()));
        self
    }

    /// Run in a specific database instead of the maintenance one
    pub fn on_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn query(&self) -> Query {
        self.query
    }

    pub fn database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Plain variable value
    pub fn var(&self, name: &str) -> Option<&str> {
        self.vars.iter().find_map(|(n, v)| match v {
            Value::Plain(s) if *n == name => Some(s.as_str()),
            _ => None,
        })
    }

    /// Password variable value
    pub fn secret(&self, name: &str) -> Option<&Secret> {
        self.vars.iter().find_map(|(n, v)| match v {
            Value::Secret(s) if *n == name => Some(s),
            _ => None,
        })
    }

    pub fn clause(&self, placeholder: &str) -> Option<&str> {
        self.clauses
            .iter()
            .find(|(p, _)| *p == placeholder)
            .map(|(_, sql)| sql.as_str())
    }

    /// SQL text with clauses substituted
    pub fn sql(&self) -> String {
        let mut sql = self.query.sql().to_string();
        for (placeholder, clause) in &self.clauses {
            sql = sql.replace(&format!("{{{placeholder}}}"), clause);
        }
        sql
    }

    /// psql script: variable assignments followed by the statement.
    fn script(&self, fetch: bool) -> String {
        let mut script = String::new();
        for (name, value) in &self.vars {
            let value = match value {
                Value::Plain(s) => s.as_str(),
                Value::Secret(s) => s.expose(),
            };
            script.push_str(&format!("\\set {} '{}'\n", name, psql_quote(value)));
        }
        if fetch {
            script.push_str(&format!(
                "SELECT coalesce(json_agg(q), '[]'::json) FROM (\n{}\n) AS q;\n",
                self.sql()
            ));
        } else {
            script.push_str(&self.sql());
            script.push_str(";\n");
        }
        script
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.query.name())?;
        for (i, (name, value)) in self.vars.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match value {
                Value::Plain(s) => write!(f, "{name}={s}")?,
                Value::Secret(s) => write!(f, "{name}={s}")?,
            }
        }
        f.write_str(")")
    }
}

impl fmt::Debug for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Escape a value for a single-quoted psql meta-command argument
fn psql_quote(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\'', "''")
        .replace('\n', "\\n")
}

// ============================================================================
// Sessions
// ============================================================================

#[derive(Debug, Error)]
pub enum SessionError {
    /// The targeted object does not exist (undefined object or database)
    #[error("{0}")]
    Missing(String),

    #[error("{message}")]
    Sql { sqlstate: String, message: String },

    #[error("statement timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected result from {query}: {source}")]
    Decode {
        query: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Run(RunError),
}

impl SessionError {
    /// Convert, naming the object a missing-object error is about.
    pub fn into_error(self, kind: &str, name: &str) -> Error {
        match self {
            Self::Missing(_) => Error::not_found(kind, name),
            other => other.into(),
        }
    }
}

impl From<SessionError> for Error {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Timeout(d) => Error::Timeout(d),
            other => Error::execution(other),
        }
    }
}

impl From<RunError> for SessionError {
    fn from(err: RunError) -> Self {
        if let Some(timeout) = err.timeout() {
            return Self::Timeout(timeout);
        }
        if let RunError::Failed { stderr, .. } = &err
            && let Some(classified) = classify(stderr)
        {
            return classified;
        }
        Self::Run(err)
    }
}

/// Map psql's verbose error output to a session error.
fn classify(stderr: &str) -> Option<SessionError> {
    static SQLSTATE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = SQLSTATE
        .get_or_init(|| Regex::new(r"ERROR:\s+([0-9A-Z]{5}):\s*(.*)").ok())
        .as_ref()?;
    let caps = re.captures(stderr)?;
    let sqlstate = caps.get(1)?.as_str().to_string();
    let message = caps
        .get(2)
        .map(|m| m.as_str().trim().to_string())
        .unwrap_or_default();
    Some(match sqlstate.as_str() {
        // undefined_object, invalid_catalog_name
        "42704" | "3D000" => SessionError::Missing(message),
        // query_canceled, raised by statement_timeout
        "57014" => SessionError::Timeout(Duration::ZERO),
        _ => SessionError::Sql { sqlstate, message },
    })
}

/// A connection to one instance, exclusively owned by one run
pub trait Session: Send {
    /// Run a query and return its rows as JSON objects
    fn fetch(&mut self, stmt: &Statement) -> Result<Vec<serde_json::Value>, SessionError>;

    /// Run a statement for its effect
    fn execute(&mut self, stmt: &Statement) -> Result<(), SessionError>;
}

/// Run a query and decode its rows.
pub fn fetch_rows<T: DeserializeOwned>(
    session: &mut dyn Session,
    stmt: &Statement,
) -> Result<Vec<T>, SessionError> {
    session
        .fetch(stmt)?
        .into_iter()
        .map(|row| {
            serde_json::from_value(row).map_err(|source| SessionError::Decode {
                query: stmt.query().name(),
                source,
            })
        })
        .collect()
}

/// Session driving the `psql` client over the instance's local socket
pub struct PsqlSession {
    instance: InstanceRef,
    user: String,
    passfile: PathBuf,
    statement_timeout: Duration,
}

impl PsqlSession {
    pub fn new(
        instance: InstanceRef,
        user: impl Into<String>,
        passfile: PathBuf,
        statement_timeout: Duration,
    ) -> Self {
        Self {
            instance,
            user: user.into(),
            passfile,
            statement_timeout,
        }
    }

    fn command(&self, database: &str) -> Command {
        // A pending port change only applies after restart.
        let port = control::running_port(&self.instance.datadir).unwrap_or(self.instance.port);

        let mut cmd = Command::new(self.instance.bindir.join("psql"));
        cmd.args(["-X", "-q", "-A", "-t"])
            .args(["-v", "ON_ERROR_STOP=1", "-v", "VERBOSITY=verbose"])
            .arg("-h")
            .arg(&self.instance.socket_dir)
            .args(["-p", &port.to_string()])
            .args(["-U", &self.user])
            .args(["-d", database])
            .env(
                "PGOPTIONS",
                format!("-c statement_timeout={}", self.statement_timeout.as_millis()),
            )
            .env("PGPASSFILE", &self.passfile);
        cmd
    }

    fn run(&self, stmt: &Statement, fetch: bool) -> Result<String, SessionError> {
        let database = stmt.database().unwrap_or("postgres");
        log::debug!("{}: {} on {}", self.instance.label(), stmt, database);
        let mut cmd = self.command(database);
        let out = run_with_timeout(
            &mut cmd,
            Some(&stmt.script(fetch)),
            self.statement_timeout + PROCESS_MARGIN,
        )
        .map_err(SessionError::from)
        .map_err(|e| match e {
            SessionError::Timeout(_) => SessionError::Timeout(self.statement_timeout),
            other => other,
        })?;
        Ok(out.stdout)
    }
}

impl Session for PsqlSession {
    fn fetch(&mut self, stmt: &Statement) -> Result<Vec<serde_json::Value>, SessionError> {
        let stdout = self.run(stmt, true)?;
        let trimmed = stdout.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(trimmed).map_err(|source| SessionError::Decode {
            query: stmt.query().name(),
            source,
        })
    }

    fn execute(&mut self, stmt: &Statement) -> Result<(), SessionError> {
        self.run(stmt, false).map(|_| ())
    }
}
