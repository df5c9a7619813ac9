//! Password file (`.pgpass`) entries
//!
//! Only entries of the form `*:<port>:*:<role>:<password>` are managed;
//! every other line is preserved as written.

use std::fs;
use std::io;
use std::path::Path;

use crate::control;
use crate::model::Secret;

/// One managed entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub port: u16,
    pub role: String,
    pub password: Secret,
}

impl Entry {
    fn render(&self) -> String {
        format!(
            "*:{}:*:{}:{}",
            self.port,
            escape(&self.role),
            escape(self.password.expose())
        )
    }
}

fn escape(field: &str) -> String {
    field.replace('\\', "\\\\").replace(':', "\\:")
}

/// Split a line on unescaped colons, unescaping fields.
fn split_fields(line: &str) -> Vec<String> {
    let mut fields = vec![String::new()];
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        let c = match c {
            '\\' => match chars.next() {
                Some(escaped) => escaped,
                None => break,
            },
            ':' => {
                fields.push(String::new());
                continue;
            }
            c => c,
        };
        if let Some(field) = fields.last_mut() {
            field.push(c);
        }
    }
    fields
}

/// Parse a managed entry; `None` for comments and foreign lines.
fn parse_line(line: &str) -> Option<Entry> {
    if line.trim_start().starts_with('#') {
        return None;
    }
    let fields = split_fields(line);
    match fields.as_slice() {
        [host, port, db, role, password] if host == "*" && db == "*" => Some(Entry {
            port: port.parse().ok()?,
            role: role.clone(),
            password: Secret::new(password.clone()),
        }),
        _ => None,
    }
}

fn matches(line: &str, port: u16, role: &str) -> bool {
    parse_line(line).is_some_and(|e| e.port == port && e.role == role)
}

/// Entry for a role on a port
pub fn find(content: &str, port: u16, role: &str) -> Option<Entry> {
    content
        .lines()
        .filter_map(parse_line)
        .find(|e| e.port == port && e.role == role)
}

/// Add or replace the entry of `entry.role` on `entry.port`.
pub fn upsert(content: &str, entry: &Entry) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut written = false;
    for line in content.lines() {
        if matches(line, entry.port, &entry.role) {
            if !written {
                lines.push(entry.render());
                written = true;
            }
        } else {
            lines.push(line.to_string());
        }
    }
    if !written {
        lines.push(entry.render());
    }
    join(lines)
}

/// Remove the entry of a role on a port.
pub fn remove(content: &str, port: u16, role: &str) -> String {
    join(
        content
            .lines()
            .filter(|line| !matches(line, port, role))
            .map(String::from)
            .collect(),
    )
}

fn join(lines: Vec<String>) -> String {
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Read the password file, empty if it does not exist.
pub fn read(path: &Path) -> io::Result<String> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e),
    }
}

/// Write the password file with owner-only permissions (libpq ignores
/// the file otherwise).
pub fn write(path: &Path, content: &str) -> io::Result<()> {
    control::write_private(path, content)
}
