//! Port-range grammar for scan arguments.
//!
//! Accepted: comma-separated tokens, each a bare port (`1..=65535`) or a
//! `low-high` pair with `1 <= low <= high <= 65535`. Only ASCII digits, `-`
//! and `,` may appear, which keeps the value inert when handed to the scanner.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

static RANGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(-[0-9]+)?(,[0-9]+(-[0-9]+)?)*$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortRangeError {
    #[error("port range is empty")]
    Empty,
    #[error("port range {0:?} contains characters outside digits, '-' and ','")]
    Syntax(String),
    #[error("port {0} is outside 1-65535")]
    OutOfRange(String),
    #[error("port span {low}-{high} has low > high")]
    Inverted { low: u16, high: u16 },
}

/// A validated, normalized port specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub struct PortRange {
    spans: Vec<(u16, u16)>,
}

impl PortRange {
    pub fn parse(raw: &str) -> Result<Self, PortRangeError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PortRangeError::Empty);
        }
        if !RANGE_RE.is_match(raw) {
            return Err(PortRangeError::Syntax(raw.to_string()));
        }
        let spans = raw
            .split(',')
            .map(|token| match token.split_once('-') {
                Some((low, high)) => {
                    let low = parse_port(low)?;
                    let high = parse_port(high)?;
                    if low > high {
                        return Err(PortRangeError::Inverted { low, high });
                    }
                    Ok((low, high))
                }
                None => {
                    let port = parse_port(token)?;
                    Ok((port, port))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { spans })
    }

    /// The exhaustive `1-65535` range.
    pub fn full() -> Self {
        Self {
            spans: vec![(1, u16::MAX)],
        }
    }

    pub fn is_full(&self) -> bool {
        self.spans.iter().any(|&(low, high)| low == 1 && high == u16::MAX)
    }

    pub fn spans(&self) -> &[(u16, u16)] {
        &self.spans
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, &(low, high)) in self.spans.iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            if low == high {
                write!(f, "{low}")?;
            } else {
                write!(f, "{low}-{high}")?;
            }
        }
        Ok(())
    }
}

impl From<PortRange> for String {
    fn from(range: PortRange) -> Self {
        range.to_string()
    }
}

fn parse_port(token: &str) -> Result<u16, PortRangeError> {
    match token.parse::<u32>() {
        Ok(value) if (1..=u32::from(u16::MAX)).contains(&value) => Ok(value as u16),
        _ => Err(PortRangeError::OutOfRange(token.to_string())),
    }
}
