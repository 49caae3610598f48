//! Scan target validation: a single hostname or IPv4 address, nothing else.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

static HOSTNAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9.-]*[A-Za-z0-9])?$").unwrap());
static IPV4_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}$").unwrap());

const FORBIDDEN: &[char] = &[
    ' ', '\t', '\n', '\r', ';', '|', '&', '$', '`', '<', '>', '(', ')', '[', ']', '{', '}', '\'',
    '"', '\\',
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TargetError {
    #[error("target is empty")]
    Empty,
    #[error("target contains forbidden character {0:?}")]
    ForbiddenCharacter(char),
    #[error("target {0:?} has an IPv4 octet above 255")]
    InvalidIpv4(String),
    #[error("target {0:?} is not a hostname or IPv4 address")]
    Invalid(String),
}

/// Validate and normalize (trim) a scan target.
pub fn validate_target(raw: &str) -> Result<String, TargetError> {
    let target = raw.trim();
    if target.is_empty() {
        return Err(TargetError::Empty);
    }
    if let Some(ch) = target.chars().find(|ch| FORBIDDEN.contains(ch)) {
        return Err(TargetError::ForbiddenCharacter(ch));
    }
    if IPV4_RE.is_match(target) {
        let valid = target
            .split('.')
            .all(|octet| octet.parse::<u16>().is_ok_and(|value| value <= 255));
        return if valid {
            Ok(target.to_string())
        } else {
            Err(TargetError::InvalidIpv4(target.to_string()))
        };
    }
    if HOSTNAME_RE.is_match(target) {
        return Ok(target.to_string());
    }
    Err(TargetError::Invalid(target.to_string()))
}
