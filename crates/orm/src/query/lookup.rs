//! Lookup suffixes
//!
//! A filter path is `field` or `field__lookup`. The lookup set is closed.

use std::fmt;

use crate::value::DatePart;

/// Comparison applied by a filter leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lookup {
    Exact,
    Gt,
    Gte,
    Lt,
    Lte,
    IContains,
    In,
    Range,
    Year,
    Month,
    Day,
}

impl Lookup {
    pub const ALL: [Lookup; 11] = [
        Lookup::Exact,
        Lookup::Gt,
        Lookup::Gte,
        Lookup::Lt,
        Lookup::Lte,
        Lookup::IContains,
        Lookup::In,
        Lookup::Range,
        Lookup::Year,
        Lookup::Month,
        Lookup::Day,
    ];

    pub fn parse(suffix: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.as_str() == suffix)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Lookup::Exact => "exact",
            Lookup::Gt => "gt",
            Lookup::Gte => "gte",
            Lookup::Lt => "lt",
            Lookup::Lte => "lte",
            Lookup::IContains => "icontains",
            Lookup::In => "in",
            Lookup::Range => "range",
            Lookup::Year => "year",
            Lookup::Month => "month",
            Lookup::Day => "day",
        }
    }

    pub fn date_part(self) -> Option<DatePart> {
        match self {
            Lookup::Year => Some(DatePart::Year),
            Lookup::Month => Some(DatePart::Month),
            Lookup::Day => Some(DatePart::Day),
            _ => None,
        }
    }

    /// SQL operator for the plain comparisons
    pub fn operator(self) -> Option<&'static str> {
        match self {
            Lookup::Exact | Lookup::Year | Lookup::Month | Lookup::Day => Some("="),
            Lookup::Gt => Some(">"),
            Lookup::Gte => Some(">="),
            Lookup::Lt => Some("<"),
            Lookup::Lte => Some("<="),
            _ => None,
        }
    }
}

impl fmt::Display for Lookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
