//! Row ordering by column value.

use std::cmp::Ordering;

use crate::ids::{ColumnId, RowId};
use crate::table::Table;
use crate::value::CellValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Compare strings treating digit runs as numbers, ignoring ASCII case.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().peekable();
    let mut right = b.chars().peekable();
    loop {
        match (left.peek().copied(), right.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) if l.is_ascii_digit() && r.is_ascii_digit() => {
                let l_run = take_digits(&mut left);
                let r_run = take_digits(&mut right);
                let l_trim = l_run.trim_start_matches('0');
                let r_trim = r_run.trim_start_matches('0');
                let ord = l_trim
                    .len()
                    .cmp(&r_trim.len())
                    .then_with(|| l_trim.cmp(r_trim))
                    .then_with(|| l_run.len().cmp(&r_run.len()));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(l), Some(r)) => {
                let ord = l.to_ascii_lowercase().cmp(&r.to_ascii_lowercase());
                if ord != Ordering::Equal {
                    return ord;
                }
                left.next();
                right.next();
            }
        }
    }
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(c) = chars.next_if(char::is_ascii_digit) {
        run.push(c);
    }
    run
}

/// Order two cell values. Values of different kinds order by kind.
pub fn compare_values(a: &CellValue, b: &CellValue) -> Ordering {
    match (a, b) {
        (CellValue::String(x), CellValue::String(y)) => natural_cmp(x, y),
        (CellValue::Number(x), CellValue::Number(y)) => x.total_cmp(y),
        (CellValue::Boolean(x), CellValue::Boolean(y)) => x.cmp(y),
        (CellValue::Date(x), CellValue::Date(y)) => x.millis().cmp(&y.millis()),
        (CellValue::Vote(x), CellValue::Vote(y)) => x.vote_count().cmp(&y.vote_count()),
        _ => a.kind().cmp(&b.kind()),
    }
}

impl Table {
    /// Row ids ordered by their effective value in `column` (cell, else column default).
    ///
    /// The sort is stable. Rows without any value come last in both directions.
    pub fn sorted_row_ids(&self, column: ColumnId, direction: SortDirection) -> Vec<RowId> {
        let mut keyed: Vec<(RowId, Option<&CellValue>)> = self
            .rows()
            .map(|row| (row.id(), row.value(column).map(|lookup| lookup.value)))
            .collect();

        keyed.sort_by(|(_, a), (_, b)| match (a, b) {
            (Some(a), Some(b)) => match direction {
                SortDirection::Ascending => compare_values(a, b),
                SortDirection::Descending => compare_values(b, a),
            },
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });
        keyed.into_iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{DateTime, Vote};

    #[test]
    fn test_natural_cmp() {
        assert_eq!(natural_cmp("item2", "item10"), Ordering::Less);
        assert_eq!(natural_cmp("Item2", "item2"), Ordering::Equal);
        assert_eq!(natural_cmp("a", "ab"), Ordering::Less);
        assert_eq!(natural_cmp("x007", "x7"), Ordering::Greater);
        assert_eq!(natural_cmp("b1", "a9"), Ordering::Greater);
    }

    #[test]
    fn test_compare_values() {
        assert_eq!(compare_values(&false.into(), &true.into()), Ordering::Less);
        assert_eq!(compare_values(&(-1.0).into(), &2.5.into()), Ordering::Less);
        let early = DateTime::from_millis(10).unwrap();
        let late = DateTime::from_millis(20).unwrap();
        assert_eq!(compare_values(&early.into(), &late.into()), Ordering::Less);
        let one: Vote = ["a"].into_iter().collect();
        let two: Vote = ["a", "b"].into_iter().collect();
        assert_eq!(compare_values(&two.into(), &one.into()), Ordering::Greater);
        assert_eq!(compare_values(&"z".into(), &0.0.into()), Ordering::Less);
    }

    #[test]
    fn test_sorted_row_ids_uses_defaults_and_puts_empty_last() {
        let mut table = Table::with_default_schema(4);
        let ids = table.row_ids().to_vec();
        let number = table.column_ids()[1];
        let date = table.column_ids()[3];

        table.row_mut(ids[0]).unwrap().set_value(number, 5.0).unwrap();
        table.row_mut(ids[2]).unwrap().set_value(number, -3.0).unwrap();
        // ids[1] and ids[3] fall back to the default 0 and keep their relative order.
        let ascending = table.sorted_row_ids(number, SortDirection::Ascending);
        assert_eq!(ascending, vec![ids[2], ids[1], ids[3], ids[0]]);
        let descending = table.sorted_row_ids(number, SortDirection::Descending);
        assert_eq!(descending, vec![ids[0], ids[1], ids[3], ids[2]]);

        table
            .row_mut(ids[3])
            .unwrap()
            .set_value(date, DateTime::from_millis(1).unwrap())
            .unwrap();
        for direction in [SortDirection::Ascending, SortDirection::Descending] {
            let sorted = table.sorted_row_ids(date, direction);
            assert_eq!(sorted[0], ids[3]);
            assert_eq!(&sorted[1..], &[ids[0], ids[1], ids[2]]);
        }
    }
}
