//! The Droe type lattice: primitives, collections, and nominal records.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ty {
    /// 32-bit signed integer.
    Int,
    /// 64-bit signed integer with implicit scale 10^2.
    Decimal,
    Text,
    Flag,
    /// ISO date carried as text.
    Date,
    /// File path carried as text.
    File,
    /// `list of T`: ordered.
    List(Box<Ty>),
    /// `group of T`: unordered; equality is multiset equality.
    Group(Box<Ty>),
    /// Nominal record type.
    Record(String),
}

impl Ty {
    /// Parse a type name as written in source. Accepts the legacy aliases
    /// `number` (→ int), `string` (→ text) and `boolean` (→ flag).
    pub fn parse_name(name: &str) -> Option<Ty> {
        match name {
            "int" | "number" => Some(Ty::Int),
            "decimal" => Some(Ty::Decimal),
            "text" | "string" => Some(Ty::Text),
            "flag" | "boolean" => Some(Ty::Flag),
            "date" => Some(Ty::Date),
            "file" => Some(Ty::File),
            _ => None,
        }
    }

    /// Assignment compatibility: equal types only. Aliases are normalized
    /// at parse time, so no widening happens here: mixed int/decimal is a
    /// promotion applied by the checker to operands, never to variables.
    pub fn compatible_with(&self, other: &Ty) -> bool {
        self == other
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Ty::Int | Ty::Decimal)
    }

    pub fn is_collection(&self) -> bool {
        matches!(self, Ty::List(_) | Ty::Group(_))
    }

    /// Element type of a collection, or the 1-character text type when
    /// iterating text.
    pub fn element(&self) -> Option<Ty> {
        match self {
            Ty::List(t) | Ty::Group(t) => Some((**t).clone()),
            Ty::Text => Some(Ty::Text),
            _ => None,
        }
    }
}

impl fmt::Display for Ty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ty::Int => write!(f, "int"),
            Ty::Decimal => write!(f, "decimal"),
            Ty::Text => write!(f, "text"),
            Ty::Flag => write!(f, "flag"),
            Ty::Date => write!(f, "date"),
            Ty::File => write!(f, "file"),
            Ty::List(t) => write!(f, "list of {t}"),
            Ty::Group(t) => write!(f, "group of {t}"),
            Ty::Record(name) => write!(f, "{name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_aliases() {
        assert_eq!(Ty::parse_name("number"), Some(Ty::Int));
        assert_eq!(Ty::parse_name("string"), Some(Ty::Text));
        assert_eq!(Ty::parse_name("boolean"), Some(Ty::Flag));
        assert_eq!(Ty::parse_name("widget"), None);
    }

    #[test]
    fn compatibility_is_exact() {
        assert!(Ty::Int.compatible_with(&Ty::Int));
        assert!(!Ty::Int.compatible_with(&Ty::Decimal));
        assert!(Ty::List(Box::new(Ty::Int)).compatible_with(&Ty::List(Box::new(Ty::Int))));
        assert!(!Ty::List(Box::new(Ty::Int)).compatible_with(&Ty::Group(Box::new(Ty::Int))));
    }

    #[test]
    fn display_names() {
        assert_eq!(Ty::List(Box::new(Ty::Text)).to_string(), "list of text");
        assert_eq!(Ty::Record("User".into()).to_string(), "User");
    }

    #[test]
    fn text_iterates_as_text() {
        assert_eq!(Ty::Text.element(), Some(Ty::Text));
        assert_eq!(Ty::Group(Box::new(Ty::Int)).element(), Some(Ty::Int));
        assert_eq!(Ty::Int.element(), None);
    }
}
