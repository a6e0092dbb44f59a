//! Tolerant semantic-version parsing for clause operators.
//!
//! Wire data routinely carries truncated versions ("2", "2.0"); those are
//! treated as "2.0.0". Build metadata is parsed and ignored for precedence,
//! prerelease identifiers compare per semver precedence rules.

use std::cmp::Ordering;

use once_cell::sync::Lazy;
use regex::Regex;

static VERSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<major>0|[1-9]\d*)(\.(?P<minor>0|[1-9]\d*))?(\.(?P<patch>0|[1-9]\d*))?(-(?P<prerelease>[0-9A-Za-z\-.]+))?(\+(?P<build>[0-9A-Za-z\-.]+))?$",
    )
    .expect("version regex is valid")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SemVer {
    major: u64,
    minor: u64,
    patch: u64,
    prerelease: Vec<String>,
}

impl SemVer {
    pub(crate) fn parse(s: &str) -> Option<SemVer> {
        let caps = VERSION_RE.captures(s)?;
        let part = |name: &str| {
            caps.name(name)
                .map(|m| m.as_str().parse::<u64>())
                .transpose()
                .ok()
                .flatten()
        };
        Some(SemVer {
            major: part("major")?,
            minor: part("minor").unwrap_or(0),
            patch: part("patch").unwrap_or(0),
            prerelease: caps
                .name("prerelease")
                .map(|m| m.as_str().split('.').map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }
}

impl PartialOrd for SemVer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SemVer {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| compare_prerelease(&self.prerelease, &other.prerelease))
    }
}

fn compare_prerelease(a: &[String], b: &[String]) -> Ordering {
    // A release version outranks any prerelease of the same triple.
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {}
    }
    for (ai, bi) in a.iter().zip(b.iter()) {
        let ord = match (ai.parse::<u64>(), bi.parse::<u64>()) {
            (Ok(an), Ok(bn)) => an.cmp(&bn),
            // Numeric identifiers rank below alphanumeric ones.
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => ai.cmp(bi),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}
