use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Query operators for building filter expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equal,
    /// Case-insensitive equality
    IEqual,
    Different,
    IDifferent,
    Like,
    ILike,
    NotLike,
    NotILike,
    /// Strict bounds `(lower, upper)`, either end may be null
    Between,
    /// Inclusive bounds `[lower, upper]`, either end may be null
    BetweenOrEqual,
    Superior,
    Inferior,
    SuperiorOrEqual,
    InferiorOrEqual,
    In,
    IIn,
    NotIn,
    NotIIn,
    /// Exists a related row (to-one relationship) matching a nested filter
    Has,
    /// Exists a related row (to-many relationship) matching a nested filter
    Any,
}

impl Operator {
    pub fn is_membership(self) -> bool {
        matches!(
            self,
            Operator::In | Operator::IIn | Operator::NotIn | Operator::NotIIn
        )
    }
}

const NAMES: [(Operator, &str); 20] = [
    (Operator::Equal, "EQUAL"),
    (Operator::IEqual, "IEQUAL"),
    (Operator::Different, "DIFFERENT"),
    (Operator::IDifferent, "IDIFFERENT"),
    (Operator::Like, "LIKE"),
    (Operator::ILike, "ILIKE"),
    (Operator::NotLike, "NOT_LIKE"),
    (Operator::NotILike, "NOT_ILIKE"),
    (Operator::Between, "BETWEEN"),
    (Operator::BetweenOrEqual, "BETWEEN_OR_EQUAL"),
    (Operator::Superior, "SUPERIOR"),
    (Operator::Inferior, "INFERIOR"),
    (Operator::SuperiorOrEqual, "SUPERIOR_OR_EQUAL"),
    (Operator::InferiorOrEqual, "INFERIOR_OR_EQUAL"),
    (Operator::In, "IN"),
    (Operator::IIn, "IIN"),
    (Operator::NotIn, "NOT_IN"),
    (Operator::NotIIn, "NOT_IIN"),
    (Operator::Has, "HAS"),
    (Operator::Any, "ANY"),
];

impl Operator {
    /// The operator's textual name, e.g. `"NOT_IIN"`.
    pub fn as_str(self) -> &'static str {
        NAMES
            .iter()
            .find(|(operator, _)| *operator == self)
            .map_or("", |(_, name)| name)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses the textual names (`"EQUAL"`, `"BETWEEN_OR_EQUAL"`, ...).
impl FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NAMES
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(operator, _)| *operator)
            .ok_or_else(|| Error::InvalidFilter(format!("unknown operator `{s}`")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for (operator, name) in NAMES {
            assert_eq!(name.parse::<Operator>().ok(), Some(operator));
            assert_eq!(operator.to_string(), name);
        }
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!("equal".parse::<Operator>().is_err());
        assert!("NOT_BETWEEN".parse::<Operator>().is_err());
    }
}
