//! Package naming
//!
//! A package is addressed as `domain/group/name:tag`, the same shape a
//! container image reference has. Names are only ever produced by the
//! validating parser; once parsed they are immutable.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::{DEFAULT_DOMAIN, DEFAULT_GROUP, DEFAULT_TAG};

/// Maximum length accepted for a tag.
const MAX_TAG_LEN: usize = 128;

/// Errors from parsing a package name
#[derive(Debug, Error)]
pub enum NameError {
    #[error("package name is empty")]
    Empty,

    #[error("package name '{name}' has too many path segments, expected domain/group/name")]
    TooManySegments { name: String },

    #[error("package name '{name}' has more than one tag separator")]
    TooManyTags { name: String },

    #[error("invalid {part} '{value}' in package name: only letters, digits, '.', '_' and '-' are allowed")]
    InvalidSegment { part: &'static str, value: String },

    #[error("tag '{0}' is longer than {MAX_TAG_LEN} characters")]
    TagTooLong(String),
}

/// A fully qualified, validated package name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageName {
    /// Registry domain, e.g. `registry.example.com:8081`
    domain: String,
    /// Repository group
    group: String,
    /// Package name
    name: String,
    /// Tag, defaults to `latest`
    tag: String,
}

impl PackageName {
    /// Parse a `domain/group/name:tag` string, applying defaults for the
    /// missing parts.
    ///
    /// `name` alone resolves to `fabriq.library/library/name:latest`.
    pub fn parse(value: &str) -> Result<Self, NameError> {
        if value.trim().is_empty() {
            return Err(NameError::Empty);
        }
        // split off the tag first; the domain may legally contain ':'
        // for a port, so only the last path segment is searched
        let (path, tag) = match value.rsplit_once('/') {
            Some((head, last)) => match last.split_once(':') {
                Some((n, t)) => {
                    if t.contains(':') {
                        return Err(NameError::TooManyTags {
                            name: value.to_string(),
                        });
                    }
                    (format!("{}/{}", head, n), t.to_string())
                }
                None => (value.to_string(), DEFAULT_TAG.to_string()),
            },
            None => match value.split_once(':') {
                Some((n, t)) => {
                    if t.contains(':') {
                        return Err(NameError::TooManyTags {
                            name: value.to_string(),
                        });
                    }
                    (n.to_string(), t.to_string())
                }
                None => (value.to_string(), DEFAULT_TAG.to_string()),
            },
        };

        let segments: Vec<&str> = path.split('/').collect();
        let (domain, group, name) = match segments.as_slice() {
            [name] => (DEFAULT_DOMAIN.to_string(), DEFAULT_GROUP.to_string(), name.to_string()),
            [group, name] => (DEFAULT_DOMAIN.to_string(), group.to_string(), name.to_string()),
            [domain, group, name] => (domain.to_string(), group.to_string(), name.to_string()),
            _ => {
                return Err(NameError::TooManySegments {
                    name: value.to_string(),
                })
            }
        };

        validate_segment("domain", &domain, true)?;
        validate_segment("group", &group, false)?;
        validate_segment("name", &name, false)?;
        validate_segment("tag", &tag, false)?;
        if tag.len() > MAX_TAG_LEN {
            return Err(NameError::TagTooLong(tag));
        }

        Ok(Self {
            domain,
            group,
            name,
            tag,
        })
    }

    /// Registry domain part.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Repository group part.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Package name part.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tag part.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The repository a package belongs to: `group/name`, no tag.
    pub fn repository(&self) -> String {
        format!("{}/{}", self.group, self.name)
    }

    /// Fully qualified name without the tag: `domain/group/name`.
    pub fn fully_qualified(&self) -> String {
        format!("{}/{}/{}", self.domain, self.group, self.name)
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}:{}", self.domain, self.group, self.name, self.tag)
    }
}

/// Check a name segment against the restricted character set.
fn validate_segment(part: &'static str, value: &str, allow_port: bool) -> Result<(), NameError> {
    let ok = !value.is_empty()
        && value.chars().all(|c| {
            c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' || (allow_port && c == ':')
        });
    if ok {
        Ok(())
    } else {
        Err(NameError::InvalidSegment {
            part,
            value: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_name() {
        let n = PackageName::parse("registry.example.com/tools/builder:1.2.0").unwrap();
        assert_eq!(n.domain(), "registry.example.com");
        assert_eq!(n.group(), "tools");
        assert_eq!(n.name(), "builder");
        assert_eq!(n.tag(), "1.2.0");
        assert_eq!(n.repository(), "tools/builder");
    }

    #[test]
    fn test_defaults_applied() {
        let n = PackageName::parse("builder").unwrap();
        assert_eq!(n.domain(), DEFAULT_DOMAIN);
        assert_eq!(n.group(), DEFAULT_GROUP);
        assert_eq!(n.tag(), DEFAULT_TAG);

        let n = PackageName::parse("tools/builder").unwrap();
        assert_eq!(n.domain(), DEFAULT_DOMAIN);
        assert_eq!(n.group(), "tools");
    }

    #[test]
    fn test_domain_with_port() {
        let n = PackageName::parse("localhost:8081/tools/builder:latest").unwrap();
        assert_eq!(n.domain(), "localhost:8081");
        assert_eq!(n.tag(), "latest");
    }

    #[test]
    fn test_rejects_bad_characters() {
        assert!(PackageName::parse("tools/bui lder").is_err());
        assert!(PackageName::parse("tools/builder:a:b:c").is_err());
        assert!(PackageName::parse("").is_err());
        assert!(PackageName::parse("a/b/c/d").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        let n = PackageName::parse("registry.example.com/tools/builder:1.2.0").unwrap();
        let again = PackageName::parse(&n.to_string()).unwrap();
        assert_eq!(n, again);
    }

    #[test]
    fn test_tag_length_limit() {
        let long = format!("builder:{}", "x".repeat(200));
        assert!(matches!(PackageName::parse(&long), Err(NameError::TagTooLong(_))));
    }
}
