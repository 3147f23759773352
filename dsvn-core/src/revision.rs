//! Revision specifiers
//!
//! A `Revision` is what a user types (`HEAD`, `r42`, `{2024-01-31}`); it is
//! turned into a concrete revision number by the client's revision resolver.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SvnError;

/// Symbolic or concrete revision reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Revision {
    Number(u64),
    Head,
    Base,
    Working,
    Committed,
    Previous,
    Date(DateTime<Utc>),
    #[default]
    Undefined,
}

impl Revision {
    /// Everything except `Undefined` can be resolved.
    pub fn is_valid(&self) -> bool {
        !matches!(self, Revision::Undefined)
    }

    /// Keywords answered from working-copy metadata rather than the repository.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            Revision::Base | Revision::Working | Revision::Committed | Revision::Previous
        )
    }

    pub fn number(&self) -> Option<u64> {
        match self {
            Revision::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Parse the command-line forms: `123`, `r123`, `-r123`, keywords in any
    /// case, and `{date}`.
    pub fn parse(s: &str) -> Option<Revision> {
        let s = s.trim();
        if s.is_empty() {
            return None;
        }
        if let Some(inner) = s.strip_prefix('{').and_then(|r| r.strip_suffix('}')) {
            return parse_date(inner).map(Revision::Date);
        }
        let digits = s.strip_prefix("-r").or_else(|| s.strip_prefix('r')).unwrap_or(s);
        if let Ok(n) = digits.parse::<u64>() {
            return Some(Revision::Number(n));
        }
        match s.to_ascii_uppercase().as_str() {
            "HEAD" => Some(Revision::Head),
            "BASE" => Some(Revision::Base),
            "WORKING" => Some(Revision::Working),
            "COMMITTED" => Some(Revision::Committed),
            "PREV" | "PREVIOUS" => Some(Revision::Previous),
            _ => None,
        }
    }
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    let day = NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
    Some(day.and_hms_opt(0, 0, 0)?.and_utc())
}

impl FromStr for Revision {
    type Err = SvnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Revision::parse(s).ok_or_else(|| SvnError::BadRevision(format!("Syntax error in revision argument '{}'", s)))
    }
}

impl From<u64> for Revision {
    fn from(n: u64) -> Self {
        Revision::Number(n)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Revision::Number(n) => write!(f, "{}", n),
            Revision::Head => f.write_str("HEAD"),
            Revision::Base => f.write_str("BASE"),
            Revision::Working => f.write_str("WORKING"),
            Revision::Committed => f.write_str("COMMITTED"),
            Revision::Previous => f.write_str("PREV"),
            Revision::Date(d) => write!(f, "{{{}}}", d.to_rfc3339()),
            Revision::Undefined => f.write_str("UNDEFINED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_parse_numbers() {
        assert_eq!(Revision::parse("42"), Some(Revision::Number(42)));
        assert_eq!(Revision::parse("r7"), Some(Revision::Number(7)));
        assert_eq!(Revision::parse("-r0"), Some(Revision::Number(0)));
        assert_eq!(Revision::parse("r"), None);
    }

    #[test]
    fn test_parse_keywords() {
        assert_eq!(Revision::parse("head"), Some(Revision::Head));
        assert_eq!(Revision::parse("Prev"), Some(Revision::Previous));
        assert_eq!(Revision::parse("COMMITTED"), Some(Revision::Committed));
        assert!(Revision::Base.is_local());
        assert!(!Revision::Head.is_local());
        assert!(!Revision::Undefined.is_valid());
        assert!("bogus".parse::<Revision>().is_err());
    }

    #[test]
    fn test_parse_dates() {
        match Revision::parse("{2024-03-01}") {
            Some(Revision::Date(d)) => assert_eq!((d.year(), d.month(), d.day()), (2024, 3, 1)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            Revision::parse("{2024-03-01T10:00:00Z}"),
            Some(Revision::Date(_))
        ));
        assert_eq!(Revision::parse("{yesterday}"), None);
    }
}
