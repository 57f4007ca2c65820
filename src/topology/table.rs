use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use winnow::combinator::{alt, delimited, separated_pair};
use winnow::prelude::*;
use winnow::token::take_while;

use super::TopologyError;

/// `schema.table` as configured on a source, e.g. `dbo.Customers` or `[dbo].[Order Lines]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedTable {
    pub schema: String,
    pub table: String,
}

impl QualifiedTable {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, TopologyError> {
        let trimmed = raw.trim();
        let (schema, table) = qualified.parse(trimmed).map_err(|e| TopologyError::InvalidTable {
            input: raw.to_string(),
            reason: e.to_string(),
        })?;
        let (schema, table) = (schema.trim(), table.trim());
        if schema.is_empty() || table.is_empty() {
            return Err(TopologyError::InvalidTable {
                input: raw.to_string(),
                reason: "schema and table must not be blank".into(),
            });
        }
        Ok(Self::new(schema, table))
    }

    /// `dbo.Customers` -> `dbo_Customers`; used in connector, logical server and history names.
    pub fn safe_name(&self) -> String {
        format!("{}.{}", self.schema, self.table)
            .replace(['.', ' '], "_")
    }
}

impl Display for QualifiedTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

fn bare<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    take_while(1.., |c: char| {
        c.is_alphanumeric() || matches!(c, '_' | '$' | '#' | '@' | '-' | ' ')
    })
    .parse_next(input)
}

fn bracketed<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    delimited('[', take_while(1.., |c: char| c != ']'), ']').parse_next(input)
}

fn quoted<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    delimited('"', take_while(1.., |c: char| c != '"'), '"').parse_next(input)
}

fn ident<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    alt((bracketed, quoted, bare)).parse_next(input)
}

fn qualified<'i>(input: &mut &'i str) -> ModalResult<(&'i str, &'i str)> {
    separated_pair(ident, '.', ident).parse_next(input)
}
