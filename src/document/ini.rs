//! Reads and writes the INI dialect used by configuration documents.
//!
//! * `[section]` headers. Every key belongs to a section.
//! * `key = value` or `key: value`. Keys keep their case. Surrounding white space is trimmed.
//! * Lines starting with `#` or `;` are comments and are not preserved.
//! * An indented line continues the previous value; the parsed value joins its lines with `\n`.
//!
//! [serialize] writes `key = value`, indents continuation lines with a tab, and ends each section
//! with a blank line. Values that [check_entry] accepts survive a write and re-read unchanged.

use super::Sections;
use crate::error::{Error, Result};
use indexmap::map::Entry;
use indexmap::IndexMap;

/// Parses INI text. `source_name` appears in error messages.
pub fn parse(text: &str, source_name: &str) -> Result<Sections> {
    let mut sections = Sections::new();
    let mut section: Option<String> = None;
    let mut key: Option<String> = None;

    let error = |line: usize, message: String| Error::Parse {
        source_name: source_name.to_string(),
        line,
        message,
    };

    for (index, raw) in text.lines().enumerate() {
        let number = index + 1;
        let line = raw.trim();

        if line.is_empty() {
            key = None;
            continue;
        }

        if raw.starts_with(char::is_whitespace) {
            if let (Some(s), Some(k)) = (&section, &key) {
                if let Some(value) = sections.get_mut(s).and_then(|entries| entries.get_mut(k)) {
                    value.push('\n');
                    value.push_str(line);
                    continue;
                }
            }
        }

        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[') {
            let name = name
                .strip_suffix(']')
                .ok_or_else(|| error(number, format!("unterminated section header: {line:?}")))?
                .trim();
            if name.is_empty() {
                return Err(error(number, "empty section name".to_string()));
            }
            match sections.entry(name.to_string()) {
                Entry::Occupied(_) => {
                    return Err(error(number, format!("duplicate section [{name}]")))
                }
                Entry::Vacant(v) => {
                    v.insert(IndexMap::new());
                }
            }
            section = Some(name.to_string());
            key = None;
            continue;
        }

        let Some(current) = &section else {
            return Err(error(number, format!("key outside of any section: {line:?}")));
        };

        let split_at = line
            .find(['=', ':'])
            .ok_or_else(|| error(number, format!("expected `key = value`: {line:?}")))?;
        let (k, v) = (line[..split_at].trim(), line[split_at + 1..].trim());
        if k.is_empty() {
            return Err(error(number, format!("empty key: {line:?}")));
        }

        let entries = sections.entry(current.clone()).or_default();
        if entries.contains_key(k) {
            return Err(error(number, format!("duplicate key `{k}` in [{current}]")));
        }
        entries.insert(k.to_string(), v.to_string());
        key = Some(k.to_string());
    }

    Ok(sections)
}

/// Writes `sections` as INI text.
pub fn serialize(sections: &Sections) -> String {
    let mut text = String::new();
    for (name, entries) in sections {
        text.push('[');
        text.push_str(name);
        text.push_str("]\n");
        for (key, value) in entries {
            text.push_str(key);
            text.push_str(" = ");
            text.push_str(&value.replace('\n', "\n\t"));
            text.push('\n');
        }
        text.push('\n');
    }
    text
}

/// Checks that `section`, `key`, and `value` can be written and read back unchanged.
pub fn check_entry(section: &str, key: &str, value: &str) -> Result<()> {
    let invalid = |what: &str| Err(Error::InvalidInput(format!("{what} in [{section}] {key:?}")));

    if section.is_empty() || section.trim() != section || section.contains([']', '\n', '\r']) {
        return invalid("unusable section name");
    }
    if key.is_empty()
        || key.trim() != key
        || key.contains(['=', ':', '\n', '\r'])
        || key.starts_with(['#', ';', '['])
    {
        return invalid("unusable key");
    }
    for (i, line) in value.split('\n').enumerate() {
        if line.trim() != line || line.contains('\r') {
            return invalid("value line with surrounding white space");
        }
        if i > 0 && line.is_empty() {
            return invalid("value with an empty continuation line");
        }
    }
    Ok(())
}
