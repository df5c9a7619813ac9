//! `postgresql.conf` reading and in-place updates

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

pub const CONF_FILE: &str = "postgresql.conf";
pub const AUTO_CONF_FILE: &str = "postgresql.auto.conf";

/// Parse configuration text into its effective values (last one wins).
pub fn parse(content: &str) -> BTreeMap<String, String> {
    let mut values = BTreeMap::new();
    for line in content.lines() {
        if let Some((key, value)) = parse_line(line) {
            values.insert(key, value);
        }
    }
    values
}

/// Effective configuration of a data directory, `postgresql.auto.conf`
/// overriding `postgresql.conf`.
pub fn read(datadir: &Path) -> io::Result<BTreeMap<String, String>> {
    let mut values = parse(&fs::read_to_string(datadir.join(CONF_FILE))?);
    match fs::read_to_string(datadir.join(AUTO_CONF_FILE)) {
        Ok(auto) => values.extend(parse(&auto)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    Ok(values)
}

/// Set (`Some`) or remove (`None`) one parameter of a data directory.
///
/// The value goes to `postgresql.conf`. An entry for the key in
/// `postgresql.auto.conf` would shadow it, so it is removed there.
pub fn write(datadir: &Path, key: &str, value: Option<&str>) -> io::Result<()> {
    update(&datadir.join(CONF_FILE), key, value)?;
    let auto = datadir.join(AUTO_CONF_FILE);
    match fs::read_to_string(&auto) {
        Ok(content) if parse(&content).contains_key(key) => {
            log::debug!("Removing {key} from {}", auto.display());
            fs::write(&auto, set(&content, key, None))
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Set (`Some`) or remove (`None`) one parameter in a configuration file.
///
/// Active lines for the key are replaced by a single line at the position
/// of the first one; other lines, comments included, are kept as written.
pub fn update(path: &Path, key: &str, value: Option<&str>) -> io::Result<()> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };
    fs::write(path, set(&content, key, value))
}

/// Pure form of [`update`]
pub fn set(content: &str, key: &str, value: Option<&str>) -> String {
    let mut out = Vec::new();
    let mut written = false;
    for line in content.lines() {
        let matches = parse_line(line).is_some_and(|(k, _)| k == key);
        if !matches {
            out.push(line.to_string());
            continue;
        }
        if let Some(value) = value
            && !written
        {
            out.push(format_line(key, value));
            written = true;
        }
    }
    if let Some(value) = value
        && !written
    {
        out.push(format_line(key, value));
    }

    let mut result = out.join("\n");
    if !result.is_empty() {
        result.push('\n');
    }
    result
}

fn format_line(key: &str, value: &str) -> String {
    format!("{} = '{}'", key, value.replace('\'', "''"))
}

/// Parse `key = value  # comment`, `key value` and quoted values.
fn parse_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let key_end = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let key = line[..key_end].to_lowercase();
    if key.is_empty() {
        return None;
    }

    let rest = line[key_end..].trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest).trim_start();

    let value = if let Some(quoted) = rest.strip_prefix('\'') {
        let mut value = String::new();
        let mut chars = quoted.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '\'' if chars.peek() == Some(&'\'') => {
                    chars.next();
                    value.push('\'');
                }
                '\'' => break,
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        value.push(escaped);
                    }
                }
                c => value.push(c),
            }
        }
        value
    } else {
        rest.split('#').next().unwrap_or_default().trim().to_string()
    };
    Some((key, value))
}
