//! Guards values on their way into remote shell commands.
//!
//! There are two tools here, and they are not interchangeable:
//!
//! * [escape_string] is the injection guard for identifiers (package names, unit names). It never
//!   rewrites anything; it either returns the value untouched or refuses it. It must run before a
//!   value is interpolated into a command.
//!
//! * [quote] shell-quotes values that legitimately contain special characters, such as file paths,
//!   file contents, and repository lines.

use crate::error::{Error, Result};
use std::borrow::Cow;

/// Characters that may never appear in an identifier passed to [escape_string].
///
/// Whitespace and control characters are rejected separately.
pub const FORBIDDEN: &[char] = &[
    '/', '"', '\'', '`', '\\', '(', ')', ',', ';', '&', '>', '<', '|', '=', '[', ']', '#', '!', '?',
    ':', '{', '}', '%', '~', '*', '$',
];

/// Fails with [Error::Injection] if `value` is unsafe to interpolate into a shell command.
///
/// A value is unsafe if it is empty, starts with `-` (it would be read as an option), or contains
/// a [FORBIDDEN] character, whitespace, or a control character. Safe values are returned
/// unchanged.
///
/// ```
/// use pardus::sanitize::escape_string;
///
/// assert_eq!("libstdc++6", escape_string("libstdc++6").unwrap());
/// assert!(escape_string("nginx; rm -rf /").is_err());
/// ```
pub fn escape_string(value: &str) -> Result<&str> {
    let unsafe_char = |c: char| FORBIDDEN.contains(&c) || c.is_whitespace() || c.is_control();

    if value.is_empty() || value.starts_with('-') || value.chars().any(unsafe_char) {
        return Err(Error::Injection(value.to_string()));
    }
    Ok(value)
}

/// Runs [escape_string] over every name, failing on the first unsafe one.
pub fn escape_all<'a, I>(names: I) -> Result<Vec<&'a str>>
where
    I: IntoIterator<Item = &'a str>,
{
    names.into_iter().map(escape_string).collect()
}

/// Quotes `value` for safe use as a single word in a POSIX shell.
///
/// Fails with [Error::Injection] only if `value` contains a nul byte, which no shell word can
/// carry.
pub fn quote(value: &str) -> Result<Cow<'_, str>> {
    shlex::try_quote(value).map_err(|_| Error::Injection(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_identifiers() {
        for name in [
            "nginx",
            "libstdc++6",
            "python3.11",
            "linux-image-6.1.0-13-amd64",
            "ssh.service",
            "getty@tty1.service",
            "g++",
        ] {
            assert_eq!(name, escape_string(name).unwrap());
        }
    }

    #[test]
    fn rejects_every_forbidden_character() {
        for c in FORBIDDEN {
            let value = format!("pkg{c}name");
            assert!(
                matches!(escape_string(&value), Err(Error::Injection(v)) if v == value),
                "accepted {value:?}",
            );
        }
    }

    #[test]
    fn rejects_whitespace_and_control_characters() {
        for value in ["a b", "a\tb", "a\nb", "a\rb", "a\u{0}b", "a\u{1b}[0mb", " a", "a "] {
            assert!(escape_string(value).is_err(), "accepted {value:?}");
        }
    }

    #[test]
    fn rejects_empty_and_option_like_values() {
        assert!(escape_string("").is_err());
        assert!(escape_string("-y").is_err());
        assert!(escape_string("--purge").is_err());
        assert!(escape_string("a-").is_ok());
    }

    #[test]
    fn escape_all_stops_on_first_bad_name() {
        assert_eq!(vec!["a", "b"], escape_all(["a", "b"]).unwrap());
        assert!(escape_all(["a", "b|c", "d"]).is_err());
    }

    #[test]
    fn quoted_values_split_back_into_one_word() {
        for value in [
            "/etc/hosts",
            "a b",
            "it's",
            "deb [arch=amd64] https://example.com/ jammy main",
            "$(reboot)",
            "line one\nline two\n",
        ] {
            let quoted = quote(value).unwrap();
            assert_eq!(Some(vec![value.to_string()]), shlex::split(&quoted));
        }
        assert!(quote("a\0b").is_err());
    }
}
