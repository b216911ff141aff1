//! Line-oriented rewriting of SPA keys inside configuration files.
//!
//! Both the client's TOML file and the SPA helper's `.fwknoprc` file are edited
//! in place: only the lines holding the requested keys inside the requested
//! section change, every other byte is preserved.

use std::path::Path;

use thiserror::Error;

/// Section holding the SPA keys in the client's own TOML configuration.
pub const TOML_SPA_SECTION: &str = "spa";
/// TOML key names for the SPA keys.
pub const TOML_ENCRYPTION_KEY: &str = "encryption_key";
pub const TOML_HMAC_KEY: &str = "hmac_key";
/// `.fwknoprc` key names for the SPA keys.
pub const FWKNOP_ENCRYPTION_KEY: &str = "KEY_BASE64";
pub const FWKNOP_HMAC_KEY: &str = "HMAC_KEY_BASE64";

/// Assignment syntax of a key file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `key = "value"`
    Toml,
    /// `KEY value`
    Fwknop,
}

/// Why a key file could not be rewritten.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyFileError {
    #[error("key `{key}` not found in section [{section}]")]
    MissingKey { key: String, section: String },

    #[error("value for `{key}` contains characters that cannot be stored")]
    InvalidValue { key: String },
}

/// Replace the value of each `(key, value)` pair inside `section`.
///
/// Every key must occur at least once in the section.
pub fn replace_keys(
    content: &str,
    dialect: Dialect,
    section: &str,
    replacements: &[(&str, &str)],
) -> Result<String, KeyFileError> {
    for (key, value) in replacements {
        if !is_storable(value) {
            return Err(KeyFileError::InvalidValue {
                key: (*key).to_string(),
            });
        }
    }

    let mut hits = vec![0usize; replacements.len()];
    let mut current: Option<String> = None;
    let mut out = String::with_capacity(content.len());

    for line in content.split_inclusive('\n') {
        if let Some(name) = section_header(line) {
            current = Some(name.to_string());
            out.push_str(line);
            continue;
        }
        if current.as_deref() != Some(section) {
            out.push_str(line);
            continue;
        }
        let Some(assignment) = parse_assignment(line, dialect) else {
            out.push_str(line);
            continue;
        };
        match replacements
            .iter()
            .position(|(key, _)| *key == assignment.key)
        {
            Some(idx) => {
                hits[idx] += 1;
                let value = replacements[idx].1;
                out.push_str(assignment.indent);
                out.push_str(assignment.key);
                out.push_str(assignment.separator);
                match dialect {
                    Dialect::Toml => {
                        out.push('"');
                        out.push_str(value);
                        out.push('"');
                    }
                    Dialect::Fwknop => out.push_str(value),
                }
                out.push_str(line_ending(line));
            }
            None => out.push_str(line),
        }
    }

    if let Some(idx) = hits.iter().position(|&n| n == 0) {
        return Err(KeyFileError::MissingKey {
            key: replacements[idx].0.to_string(),
            section: section.to_string(),
        });
    }
    Ok(out)
}

/// [`replace_keys`] for the contents of the file at `path`, attributing any
/// failure to that file.
pub fn replace_keys_in(
    path: &Path,
    content: &str,
    dialect: Dialect,
    section: &str,
    replacements: &[(&str, &str)],
) -> crate::Result<String> {
    replace_keys(content, dialect, section, replacements).map_err(|source| {
        crate::Error::KeyFile {
            path: path.to_path_buf(),
            source,
        }
    })
}

/// Read the first value of `key` inside `section`, unquoted.
#[cfg(test)]
fn read_key(content: &str, dialect: Dialect, section: &str, key: &str) -> Option<String> {
    let mut current: Option<&str> = None;
    for line in content.split_inclusive('\n') {
        if let Some(name) = section_header(line) {
            current = Some(name);
            continue;
        }
        if current != Some(section) {
            continue;
        }
        if let Some(assignment) = parse_assignment(line, dialect)
            && assignment.key == key
        {
            let raw = assignment.value.trim();
            return Some(match dialect {
                Dialect::Toml => raw.trim_matches('"').to_string(),
                Dialect::Fwknop => raw.to_string(),
            });
        }
    }
    None
}

struct Assignment<'a> {
    indent: &'a str,
    key: &'a str,
    separator: &'a str,
    value: &'a str,
}

fn section_header(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.starts_with("[[") {
        return None;
    }
    trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .map(str::trim)
}

fn parse_assignment(line: &str, dialect: Dialect) -> Option<Assignment<'_>> {
    let body = line.trim_end_matches(['\r', '\n']);
    let rest = body.trim_start();
    if rest.is_empty() || rest.starts_with('#') || rest.starts_with(';') {
        return None;
    }
    let indent = &body[..body.len() - rest.len()];

    let key_len = match dialect {
        Dialect::Toml => rest.find(|c: char| c == '=' || c.is_whitespace())?,
        Dialect::Fwknop => rest.find(char::is_whitespace)?,
    };
    let key = &rest[..key_len];
    let after_key = &rest[key_len..];

    let sep_len = match dialect {
        Dialect::Toml => {
            let eq = after_key.find('=')?;
            if !after_key[..eq].trim().is_empty() {
                return None;
            }
            let after_eq = &after_key[eq + 1..];
            eq + 1 + (after_eq.len() - after_eq.trim_start().len())
        }
        Dialect::Fwknop => after_key.len() - after_key.trim_start().len(),
    };

    Some(Assignment {
        indent,
        key,
        separator: &after_key[..sep_len],
        value: &after_key[sep_len..],
    })
}

fn line_ending(line: &str) -> &str {
    if line.ends_with("\r\n") {
        "\r\n"
    } else if line.ends_with('\n') {
        "\n"
    } else {
        ""
    }
}

fn is_storable(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_graphic() && !matches!(c, '"' | '\\' | '#' | '\''))
}
