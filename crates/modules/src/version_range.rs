use std::fmt;
use std::str::FromStr;

use semver::{Version, VersionReq};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version range {range:?}: {reason}")]
pub struct VersionRangeError {
    pub range: String,
    pub reason: String,
}

/// A set of versions written in the npm range dialect the disable list uses.
///
/// Supported: comparator sets separated by whitespace (`>=1.2.0 <2.0.0`),
/// alternatives joined by `||`, hyphen ranges (`1.0.0 - 1.4.0`), wildcards
/// (`*`, `1.x`, `1.2.*`), tilde and caret. A bare version (`1.2.0`) means
/// exactly that version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    raw: String,
    alternatives: Vec<VersionReq>,
}

impl VersionRange {
    pub fn parse(raw: &str) -> Result<Self, VersionRangeError> {
        let alternatives = raw
            .split("||")
            .map(|alternative| parse_comparator_set(raw, alternative.trim()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: raw.to_string(),
            alternatives,
        })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl FromStr for VersionRange {
    type Err = VersionRangeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn parse_comparator_set(raw: &str, set: &str) -> Result<VersionReq, VersionRangeError> {
    let invalid = |reason: String| VersionRangeError {
        range: raw.to_string(),
        reason,
    };

    if matches!(set, "" | "*" | "x" | "X") {
        return Ok(VersionReq::STAR);
    }

    let comparators = match set.split_once(" - ") {
        Some((low, high)) => {
            let (low, high) = (low.trim(), high.trim());
            if low.is_empty() || high.is_empty() {
                return Err(invalid(format!("incomplete hyphen range {set:?}")));
            }
            vec![
                format!(">={}", strip_v(low)),
                format!("<={}", strip_v(high)),
            ]
        }
        None => comparator_tokens(set)?
            .into_iter()
            .map(|token| exact_if_bare(&token))
            .collect(),
    };

    VersionReq::parse(&comparators.join(", ")).map_err(|error| invalid(error.to_string()))
}

/// Split a comparator set on whitespace, rejoining operators written apart
/// from their version (`>= 1.2.0`).
fn comparator_tokens(set: &str) -> Result<Vec<String>, VersionRangeError> {
    let mut tokens = Vec::new();
    let mut pending_operator: Option<&str> = None;

    for token in set.split_whitespace() {
        let token = token.trim_end_matches(',');
        if token.is_empty() {
            continue;
        }
        if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '~' | '^')) {
            pending_operator = Some(token);
            continue;
        }
        let operator = pending_operator.take().unwrap_or_default();
        tokens.push(format!("{operator}{token}"));
    }

    if let Some(operator) = pending_operator {
        return Err(VersionRangeError {
            range: set.to_string(),
            reason: format!("operator {operator:?} has no version"),
        });
    }

    Ok(tokens)
}

fn exact_if_bare(token: &str) -> String {
    let operator_len = token
        .find(|c: char| !matches!(c, '<' | '>' | '=' | '~' | '^'))
        .unwrap_or(token.len());
    let (operator, version) = token.split_at(operator_len);
    let version = strip_v(version);

    let core = version.split(['-', '+']).next().unwrap_or_default();
    let is_wildcard = core.contains(['*', 'x', 'X']);

    if operator.is_empty() && !is_wildcard {
        format!("={version}")
    } else {
        format!("{operator}{version}")
    }
}

fn strip_v(version: &str) -> &str {
    match version.strip_prefix(['v', 'V']) {
        Some(rest) if rest.starts_with(|c: char| c.is_ascii_digit()) => rest,
        _ => version,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(version: &str) -> Version {
        Version::parse(version).unwrap()
    }

    fn range(raw: &str) -> VersionRange {
        VersionRange::parse(raw).unwrap()
    }

    #[test]
    fn upper_bound_comparator() {
        let r = range("<=1.2.0");
        assert!(r.matches(&v("1.1.0")));
        assert!(r.matches(&v("1.2.0")));
        assert!(!r.matches(&v("1.2.1")));
    }

    #[test]
    fn bare_version_is_exact() {
        let r = range("1.2.0");
        assert!(r.matches(&v("1.2.0")));
        assert!(!r.matches(&v("1.2.1")));
        assert!(!r.matches(&v("1.3.0")));
    }

    #[test]
    fn whitespace_separated_comparators_intersect() {
        let r = range(">=1.0.0 <2.0.0");
        assert!(r.matches(&v("1.0.0")));
        assert!(r.matches(&v("1.9.9")));
        assert!(!r.matches(&v("2.0.0")));
        assert!(!r.matches(&v("0.9.0")));
    }

    #[test]
    fn detached_operator_is_joined() {
        let r = range(">= 1.4.0 < 1.5.0");
        assert!(r.matches(&v("1.4.3")));
        assert!(!r.matches(&v("1.5.0")));
    }

    #[test]
    fn alternatives_union() {
        let r = range("1.0.0 || ^2.1.0");
        assert!(r.matches(&v("1.0.0")));
        assert!(r.matches(&v("2.4.0")));
        assert!(!r.matches(&v("1.1.0")));
        assert!(!r.matches(&v("3.0.0")));
    }

    #[test]
    fn hyphen_range_is_inclusive() {
        let r = range("1.0.0 - 1.4.0");
        assert!(r.matches(&v("1.0.0")));
        assert!(r.matches(&v("1.4.0")));
        assert!(!r.matches(&v("1.4.1")));
    }

    #[test]
    fn wildcards() {
        assert!(range("*").matches(&v("9.9.9")));
        assert!(range("").matches(&v("0.0.1")));
        assert!(range("1.2.x").matches(&v("1.2.7")));
        assert!(!range("1.2.x").matches(&v("1.3.0")));
        assert!(range("2.*").matches(&v("2.8.0")));
    }

    #[test]
    fn tilde_and_caret() {
        assert!(range("~1.2.0").matches(&v("1.2.9")));
        assert!(!range("~1.2.0").matches(&v("1.3.0")));
        assert!(range("^1.2.0").matches(&v("1.9.0")));
    }

    #[test]
    fn leading_v_is_accepted() {
        assert!(range("v1.2.3").matches(&v("1.2.3")));
        assert!(range("<=v2.0.0").matches(&v("1.0.0")));
    }

    #[test]
    fn comma_separated_comparators_are_accepted() {
        let r = range(">=1.0.0, <1.1.0");
        assert!(r.matches(&v("1.0.5")));
        assert!(!r.matches(&v("1.1.0")));
    }

    #[test]
    fn invalid_ranges_are_errors() {
        for raw in ["banana", ">=", "1.0.0 - ", "1.0.0 || nope"] {
            let error = VersionRange::parse(raw).unwrap_err();
            assert_eq!(error.range, raw, "error should name the raw range");
        }
    }

    #[test]
    fn display_keeps_original_text() {
        assert_eq!(range(">= 1.0.0").to_string(), ">= 1.0.0");
        assert_eq!(">= 1.0.0".parse::<VersionRange>().unwrap().as_str(), ">= 1.0.0");
    }
}
