use std::fmt;

use crate::{
    document::record::{raw_field, Cell, Record},
    error::SmallError,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEq,
    LessThan,
    LessThanOrEq,
    StartsWith,
}

/// The abstract predicate tree the planner consumes. Callers build it
/// directly; translating a host-language lambda into this form is out
/// of scope for the engine.
#[derive(Clone, Debug)]
pub enum Expr {
    True,
    False,
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare {
        field: String,
        op: Op,
        value: Cell,
    },
}

impl Expr {
    pub fn compare(field: &str, op: Op, value: Cell) -> Expr {
        Expr::Compare {
            field: field.to_string(),
            op,
            value,
        }
    }

    pub fn eq(field: &str, value: Cell) -> Expr {
        Self::compare(field, Op::Equals, value)
    }

    pub fn ne(field: &str, value: Cell) -> Expr {
        Self::compare(field, Op::NotEquals, value)
    }

    pub fn gt(field: &str, value: Cell) -> Expr {
        Self::compare(field, Op::GreaterThan, value)
    }

    pub fn gte(field: &str, value: Cell) -> Expr {
        Self::compare(field, Op::GreaterThanOrEq, value)
    }

    pub fn lt(field: &str, value: Cell) -> Expr {
        Self::compare(field, Op::LessThan, value)
    }

    pub fn lte(field: &str, value: Cell) -> Expr {
        Self::compare(field, Op::LessThanOrEq, value)
    }

    pub fn starts_with(field: &str, prefix: &str) -> Expr {
        Self::compare(field, Op::StartsWith, Cell::String(prefix.to_string()))
    }

    pub fn and(self, other: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(other))
    }

    pub fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }

    /// Evaluate against a decoded record. A missing field fails every
    /// comparison.
    pub fn matches_record(&self, record: &Record) -> bool {
        match self {
            Expr::True => true,
            Expr::False => false,
            Expr::And(a, b) => a.matches_record(record) && b.matches_record(record),
            Expr::Or(a, b) => a.matches_record(record) || b.matches_record(record),
            Expr::Not(inner) => !inner.matches_record(record),
            Expr::Compare { field, op, value } => match record.get(field) {
                None => false,
                Some(cell) => compare_cells(cell, *op, value),
            },
        }
    }

    /// Evaluate directly against an encoded payload: each comparison
    /// walks the self-describing bytes up to its field and decodes
    /// just that one value.
    pub fn matches_raw(&self, payload: &[u8]) -> Result<bool, SmallError> {
        match self {
            Expr::True => Ok(true),
            Expr::False => Ok(false),
            Expr::And(a, b) => Ok(a.matches_raw(payload)? && b.matches_raw(payload)?),
            Expr::Or(a, b) => Ok(a.matches_raw(payload)? || b.matches_raw(payload)?),
            Expr::Not(inner) => Ok(!inner.matches_raw(payload)?),
            Expr::Compare { field, op, value } => match raw_field(payload, field)? {
                None => Ok(false),
                Some(cell) => Ok(compare_cells(&cell, *op, value)),
            },
        }
    }
}

pub(crate) fn compare_cells(cell: &Cell, op: Op, probe: &Cell) -> bool {
    match op {
        Op::Equals => cell == probe,
        Op::NotEquals => cell != probe,
        Op::GreaterThan => matches!(cell.partial_cmp(probe), Some(std::cmp::Ordering::Greater)),
        Op::GreaterThanOrEq => matches!(
            cell.partial_cmp(probe),
            Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
        ),
        Op::LessThan => matches!(cell.partial_cmp(probe), Some(std::cmp::Ordering::Less)),
        Op::LessThanOrEq => matches!(
            cell.partial_cmp(probe),
            Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
        ),
        Op::StartsWith => match (cell, probe) {
            (Cell::String(value), Cell::String(prefix)) => value.starts_with(prefix.as_str()),
            _ => false,
        },
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Expr::True => write!(f, "true"),
            Expr::False => write!(f, "false"),
            Expr::And(a, b) => write!(f, "({} and {})", a, b),
            Expr::Or(a, b) => write!(f, "({} or {})", a, b),
            Expr::Not(inner) => write!(f, "not {}", inner),
            Expr::Compare { field, op, value } => write!(f, "{} {:?} {}", field, op, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Record {
        Record::new()
            .set("name", Cell::String("ada".to_string()))
            .set("age", Cell::Int64(36))
    }

    #[test]
    fn test_compare_ops_on_record() {
        let record = doc();
        assert!(Expr::eq("age", Cell::Int64(36)).matches_record(&record));
        assert!(Expr::gt("age", Cell::Int64(35)).matches_record(&record));
        assert!(!Expr::lt("age", Cell::Int64(36)).matches_record(&record));
        assert!(Expr::starts_with("name", "ad").matches_record(&record));
        assert!(!Expr::eq("missing", Cell::Int64(1)).matches_record(&record));
    }

    #[test]
    fn test_boolean_composition() {
        let record = doc();
        let expr = Expr::gte("age", Cell::Int64(30))
            .and(Expr::starts_with("name", "a"))
            .or(Expr::False);
        assert!(expr.matches_record(&record));
        assert!(!expr.clone().not().matches_record(&record));
    }

    #[test]
    fn test_raw_matches_encoded_payload() {
        let payload = doc().encode();
        let expr = Expr::eq("age", Cell::Int64(36)).and(Expr::ne("name", Cell::Int64(5)));
        assert!(expr.matches_raw(&payload).unwrap());

        let expr = Expr::eq("age", Cell::Int64(99));
        assert!(!expr.matches_raw(&payload).unwrap());
    }
}
