//! Stable identities for rows and columns, and the synthetic cell id.
//!
//! A cell has no identity of its own. It is addressed by the pair of its
//! row and column, rendered as `"{rowId}_{columnId}"`. Row and column ids
//! are hyphenated UUIDs, which never contain `_`, so splitting on the first
//! separator always recovers both halves.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::TableError;

/// Separator between the row and column halves of a synthetic cell id.
pub const CELL_ID_SEPARATOR: char = '_';

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Allocate a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0.hyphenated())
            }
        }

        impl FromStr for $name {
            type Err = TableError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|_| TableError::InvalidId(s.to_string()))
            }
        }
    };
}

define_id!(
    /// Identity of a row, unique within its table and immutable.
    RowId
);

define_id!(
    /// Identity of a column, unique within its table and immutable.
    ColumnId
);

/// Synthetic address of a cell: the owning row plus the column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellId {
    pub row: RowId,
    pub column: ColumnId,
}

impl CellId {
    pub fn new(row: RowId, column: ColumnId) -> Self {
        Self { row, column }
    }
}

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.row, CELL_ID_SEPARATOR, self.column)
    }
}

impl FromStr for CellId {
    type Err = TableError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_cell_id(s)
            .map(|(row, column)| CellId { row, column })
            .ok_or_else(|| TableError::InvalidCellId(s.to_string()))
    }
}

/// Split a synthetic cell id on the first separator and parse both halves.
pub fn parse_cell_id(s: &str) -> Option<(RowId, ColumnId)> {
    let (row, column) = s.split_once(CELL_ID_SEPARATOR)?;
    let row = row.parse().ok()?;
    let column = column.parse().ok()?;
    Some((row, column))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(RowId::new(), RowId::new());
        assert_ne!(ColumnId::new(), ColumnId::new());
    }

    #[test]
    fn test_id_display_parse() {
        let id = RowId::new();
        let parsed: RowId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!(!id.to_string().contains(CELL_ID_SEPARATOR));
    }

    #[test]
    fn test_invalid_id() {
        let err = "not-a-uuid".parse::<ColumnId>().unwrap_err();
        assert_eq!(err, TableError::InvalidId("not-a-uuid".into()));
    }

    #[test]
    fn test_cell_id_recovers_both_halves() {
        for _ in 0..32 {
            let row = RowId::new();
            let column = ColumnId::new();
            let text = CellId::new(row, column).to_string();
            assert_eq!(parse_cell_id(&text), Some((row, column)));
            assert_eq!(text.parse::<CellId>().unwrap(), CellId { row, column });
        }
    }

    #[test]
    fn test_cell_id_format() {
        let row = RowId::from_uuid(Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap());
        let column =
            ColumnId::from_uuid(Uuid::parse_str("6ba7b810-9dad-11d1-80b4-00c04fd430c8").unwrap());
        assert_eq!(
            CellId::new(row, column).to_string(),
            "550e8400-e29b-41d4-a716-446655440000_6ba7b810-9dad-11d1-80b4-00c04fd430c8"
        );
    }

    #[test]
    fn test_cell_id_rejects_malformed() {
        assert_eq!(parse_cell_id("no-separator"), None);
        assert_eq!(parse_cell_id("_"), None);
        let row = RowId::new();
        assert_eq!(parse_cell_id(&format!("{row}_")), None);
        assert_eq!(parse_cell_id(&format!("{row}_{row}_extra")), None);
        assert!(matches!(
            "garbage".parse::<CellId>(),
            Err(TableError::InvalidCellId(_))
        ));
    }
}
