//! Parsers for `apt` output and APT source lines.
//!
//! `apt` warns that its CLI output is not a stable interface. These parsers are deliberately
//! forgiving: a line they don't understand is logged and skipped, and the rest of the listing
//! survives.

use super::{
    FieldValue, PackageDetails, PackageRecord, RepositoryEntry, RepositoryKind, SearchResult,
};
use crate::error::{Error, Result};
use crate::logger::Log;
use indexmap::IndexMap;
use regex::Regex;
use std::borrow::Cow;
use std::collections::{BTreeSet, HashSet};
use std::sync::OnceLock;

/// Matches one line of an APT sources file. Any URL scheme is accepted.
fn source_line() -> &'static Regex {
    static COMPUTED: OnceLock<Regex> = OnceLock::new();
    COMPUTED.get_or_init(|| {
        Regex::new(concat!(
            r"^(?P<kind>deb|deb-src)\s+",
            r"(?:\[(?P<options>[^\]]*)\]\s+)?",
            r"(?P<url>\S+)\s+",
            r"(?P<distribution>\S+)",
            r"(?:\s+(?P<components>\S.*))?$",
        ))
        .expect("source line regex is valid")
    })
}

/// Like [source_line], but only accepts `http` and `https` URLs. Used to validate user input.
fn new_source_line() -> &'static Regex {
    static COMPUTED: OnceLock<Regex> = OnceLock::new();
    COMPUTED.get_or_init(|| {
        Regex::new(concat!(
            r"^(?P<kind>deb|deb-src)\s+",
            r"(?:\[(?P<options>[^\]]*)\]\s+)?",
            r"(?P<url>https?://\S+)\s+",
            r"(?P<distribution>\S+)",
            r"(?:\s+(?P<components>\S.*))?$",
        ))
        .expect("new source line regex is valid")
    })
}

/// Splits the part of an `apt list` line after the `/` into words, keeping `[...]` groups whole.
fn list_tokens() -> &'static Regex {
    static COMPUTED: OnceLock<Regex> = OnceLock::new();
    COMPUTED.get_or_init(|| Regex::new(r"\[[^\]]*\]|\S+").expect("list token regex is valid"))
}

/// Matches the first line of each `apt search` result.
fn search_header() -> &'static Regex {
    static COMPUTED: OnceLock<Regex> = OnceLock::new();
    COMPUTED.get_or_init(|| {
        Regex::new(concat!(
            r"^(?P<name>[^/\s]+)/(?P<repository>\S+)\s+",
            r"(?P<version>\S+)\s+(?P<architecture>\S+)",
            r"(?:\s+\[(?P<tags>[^\]]*)\])?$",
        ))
        .expect("search header regex is valid")
    })
}

/// Matches ANSI color sequences, which `apt` emits when it thinks it's talking to a terminal.
fn ansi_escape() -> &'static Regex {
    static COMPUTED: OnceLock<Regex> = OnceLock::new();
    COMPUTED.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*m").expect("ANSI escape regex is valid"))
}

/// Removes ANSI color sequences from `text`.
pub fn strip_ansi(text: &str) -> Cow<'_, str> {
    ansi_escape().replace_all(text, "")
}

/// Parses a bracketed tag group such as `[installed,automatic]` into a set of tags.
pub fn parse_tags(group: &str) -> BTreeSet<String> {
    group
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses a single `apt list` line of the form `name/repo version arch [tags]`.
///
/// # Returns
///
/// `Ok(None)` for lines that aren't package lines at all, such as the `Listing...` banner;
/// `Err` with a reason for package lines that are malformed.
pub fn parse_list_line(line: &str) -> std::result::Result<Option<PackageRecord>, String> {
    let line = line.trim();
    let Some((name, rest)) = line.split_once('/') else {
        return Ok(None);
    };
    if name.is_empty() {
        return Err(format!("missing package name: {line:?}"));
    }

    let tokens: Vec<&str> = list_tokens().find_iter(rest).map(|m| m.as_str()).collect();
    let (repository, version, architecture, tags) = match tokens.as_slice() {
        [repository, version, architecture] => (repository, version, architecture, None),
        [repository, version, architecture, tags] if tags.starts_with('[') => {
            (repository, version, architecture, Some(tags))
        }
        _ => {
            return Err(format!(
                "expected `name/repo version arch [tags]`, got {} fields: {line:?}",
                tokens.len(),
            ))
        }
    };

    Ok(Some(PackageRecord {
        name: name.to_string(),
        repository: repository.to_string(),
        version: version.to_string(),
        architecture: architecture.to_string(),
        tags: tags.map(|t| parse_tags(t)).unwrap_or_default(),
    }))
}

/// Parses the output of `apt list`.
///
/// Malformed lines are logged and skipped. Package names are unique in the result: if `apt`
/// lists a name twice (e.g. once per architecture), the first record wins.
pub fn parse_list(text: &str, log: &Log) -> Vec<PackageRecord> {
    let text = strip_ansi(text);
    let mut seen = HashSet::new();
    let mut records = Vec::new();

    for line in text.lines() {
        match parse_list_line(line) {
            Ok(Some(record)) => {
                if seen.insert(record.name.clone()) {
                    records.push(record);
                } else {
                    log.notice(format!(
                        "ignoring duplicate listing for `{}` ({})",
                        record.name, record.architecture,
                    ));
                }
            }
            Ok(None) => {}
            Err(reason) => log.warning(format!("skipping unparseable package line: {reason}")),
        }
    }
    records
}

/// Parses the inside of an option clause, e.g. `arch=amd64 signed-by=/usr/share/keyrings/x.gpg`.
///
/// An option without `=` maps to an empty value.
pub fn parse_options(clause: &str) -> IndexMap<String, String> {
    clause
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split_whitespace()
        .map(|option| match option.split_once('=') {
            Some((key, value)) => (key.to_string(), value.to_string()),
            None => (option.to_string(), String::new()),
        })
        .collect()
}

fn entry_from(captures: &regex::Captures<'_>) -> Option<RepositoryEntry> {
    Some(RepositoryEntry {
        kind: captures.name("kind")?.as_str().parse().ok()?,
        options: captures
            .name("options")
            .map(|o| parse_options(o.as_str()))
            .unwrap_or_default(),
        url: captures.name("url")?.as_str().to_string(),
        distribution: captures.name("distribution")?.as_str().to_string(),
        components: captures
            .name("components")
            .map(|c| c.as_str().split_whitespace().map(str::to_string).collect())
            .unwrap_or_default(),
    })
}

/// Parses one APT source line. Returns `None` if it doesn't match the grammar.
pub fn parse_source_line(line: &str) -> Option<RepositoryEntry> {
    let captures = source_line().captures(line.trim())?;
    entry_from(&captures)
}

/// Parses source lines, e.g. the output of `grep` over the sources files. Lines that don't match
/// the grammar are dropped.
pub fn parse_repositories(text: &str) -> Vec<RepositoryEntry> {
    text.lines().filter_map(parse_source_line).collect()
}

/// Validates a source line supplied by the user for
/// [PackageManager::add_repository](super::PackageManager::add_repository).
///
/// Only `http` and `https` URLs are accepted.
pub fn validate_source_line(line: &str) -> Result<RepositoryEntry> {
    new_source_line()
        .captures(line.trim())
        .and_then(|c| entry_from(&c))
        .ok_or_else(|| Error::InvalidInput(format!("not a valid APT source line: {line:?}")))
}

/// Parses the output of `apt search`.
///
/// Each result starts with a `name/repo version arch [tags]` header, followed by indented
/// description lines, which are joined with spaces. Everything else, such as the `Sorting...`
/// banner, is ignored.
pub fn parse_search(text: &str) -> Vec<SearchResult> {
    let text = strip_ansi(text);
    let mut results: Vec<SearchResult> = Vec::new();
    let mut open = false;

    for line in text.lines() {
        if line.trim().is_empty() {
            open = false;
            continue;
        }

        if line.starts_with(char::is_whitespace) {
            if let (true, Some(result)) = (open, results.last_mut()) {
                if !result.description.is_empty() {
                    result.description.push(' ');
                }
                result.description.push_str(line.trim());
            }
            continue;
        }

        open = false;
        if let Some(c) = search_header().captures(line.trim_end()) {
            results.push(SearchResult {
                name: c["name"].to_string(),
                repository: c["repository"].to_string(),
                version: c["version"].to_string(),
                architecture: c["architecture"].to_string(),
                tags: c
                    .name("tags")
                    .map(|t| parse_tags(t.as_str()))
                    .unwrap_or_default(),
                description: String::new(),
            });
            open = true;
        }
    }
    results
}

/// Parses the output of `apt show`.
///
/// Fields are `Key: value` lines. A line starting with white space continues the previous field
/// and is appended to it after a `\n`. The `Depends` field is split on commas. Parsing stops at
/// the first blank line after a field, which ends the first record; `apt` prints notes about
/// additional records after it.
pub fn parse_show(text: &str, log: &Log) -> PackageDetails {
    let mut fields: IndexMap<String, FieldValue> = IndexMap::new();
    let mut current: Option<String> = None;

    for line in text.lines() {
        if line.trim().is_empty() {
            if fields.is_empty() {
                continue;
            }
            break;
        }

        if line.starts_with(char::is_whitespace) {
            match current.as_ref().and_then(|key| fields.get_mut(key)) {
                Some(value) => value.continue_with(line.trim()),
                None => log.warning(format!("skipping continuation without a field: {line:?}")),
            }
            continue;
        }

        match line.split_once(':') {
            Some((key, value)) => {
                let key = key.trim().to_string();
                let value = value.trim();
                let value = if key == "Depends" {
                    FieldValue::List(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|d| !d.is_empty())
                            .map(str::to_string)
                            .collect(),
                    )
                } else {
                    FieldValue::Text(value.to_string())
                };
                fields.insert(key.clone(), value);
                current = Some(key);
            }
            None => log.warning(format!("skipping unparseable field line: {line:?}")),
        }
    }

    PackageDetails { fields }
}

impl std::str::FromStr for RepositoryKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "deb" => Ok(RepositoryKind::Deb),
            "deb-src" => Ok(RepositoryKind::DebSrc),
            other => Err(Error::InvalidInput(format!(
                "unknown repository kind: {other:?}"
            ))),
        }
    }
}
