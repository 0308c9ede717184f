//! Recover an `(x, y)` pair from model text when structured decoding failed.
//!
//! Patterns are tried in order and the first one that matches decides the
//! outcome. Only ASCII digits count, with an optional leading minus. A match
//! whose numbers do not fit an `i32` yields the fallback rather than trying
//! later patterns.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::state::Coordinates;

struct CoordinatePattern {
    name: &'static str,
    regex: Regex,
}

static PATTERNS: Lazy<Vec<CoordinatePattern>> = Lazy::new(|| {
    [
        ("comma_pair", r"(?i)(-?[0-9]+)\s*,\s*(-?[0-9]+)"),
        ("labelled", r"(?is)x\s*[=:]\s*(-?[0-9]+).*?y\s*[=:]\s*(-?[0-9]+)"),
        ("parenthesized", r"(?i)\(\s*(-?[0-9]+)\s*,\s*(-?[0-9]+)\s*\)"),
        ("space_pair", r"(?i)(-?[0-9]+)\s+(-?[0-9]+)"),
    ]
    .into_iter()
    .map(|(name, src)| CoordinatePattern {
        name,
        regex: Regex::new(src).expect("static coordinate pattern"),
    })
    .collect()
});

/// Outcome of running the pattern table over a piece of text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extraction {
    Matched { pattern: &'static str, coordinates: Coordinates },
    /// A pattern matched but its numbers were not valid coordinates.
    Unparseable { pattern: &'static str },
    NoMatch,
}

pub fn scan(text: &str) -> Extraction {
    for pattern in PATTERNS.iter() {
        let Some(caps) = pattern.regex.captures(text) else {
            continue;
        };
        let x = caps.get(1).and_then(|m| m.as_str().parse::<i32>().ok());
        let y = caps.get(2).and_then(|m| m.as_str().parse::<i32>().ok());
        return match (x, y) {
            (Some(x), Some(y)) => Extraction::Matched {
                pattern: pattern.name,
                coordinates: Coordinates::new(x, y),
            },
            _ => Extraction::Unparseable { pattern: pattern.name },
        };
    }
    Extraction::NoMatch
}

/// Coordinates found in `text`, if any pattern produced a usable pair.
pub fn try_extract(text: &str) -> Option<Coordinates> {
    match scan(text) {
        Extraction::Matched { coordinates, .. } => Some(coordinates),
        Extraction::Unparseable { .. } | Extraction::NoMatch => None,
    }
}

/// Never fails: falls back to [`Coordinates::FALLBACK`].
pub fn extract(text: &str) -> Coordinates {
    try_extract(text).unwrap_or(Coordinates::FALLBACK)
}
