// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Write response

use std::collections::HashSet;

/// Outcome of a write.
///
/// `success + failed` always equals the number of points the responding
/// servers accounted for. `tables` is only populated when the client was
/// built with `collect_write_details`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    pub success: u32,
    pub failed: u32,
    /// Tables touched by the write, when detail collection is enabled.
    pub tables: Option<HashSet<String>>,
}

impl Response {
    pub fn new(success: u32, failed: u32) -> Self {
        Self {
            success,
            failed,
            tables: None,
        }
    }

    pub fn with_tables(mut self, tables: impl IntoIterator<Item = String>) -> Self {
        self.tables = Some(tables.into_iter().collect());
        self
    }

    /// Additive merge of two responses. Associative and commutative, so
    /// per-endpoint results can be folded in any order.
    pub fn combine(&mut self, other: Response) {
        self.success += other.success;
        self.failed += other.failed;
        match (&mut self.tables, other.tables) {
            (Some(mine), Some(theirs)) => mine.extend(theirs),
            (None, Some(theirs)) => self.tables = Some(theirs),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(success: u32, failed: u32, tables: &[&str]) -> Response {
        Response::new(success, failed)
            .with_tables(tables.iter().map(|t| t.to_string()))
    }

    #[test]
    fn test_combine_counts_and_tables() {
        let mut acc = resp(3, 0, &["a"]);
        acc.combine(resp(2, 1, &["b", "a"]));

        assert_eq!(acc.success, 5);
        assert_eq!(acc.failed, 1);
        let tables = acc.tables.unwrap();
        assert_eq!(tables.len(), 2);
    }

    #[test]
    fn test_combine_is_commutative() {
        let mut left = resp(3, 1, &["a"]);
        left.combine(resp(4, 2, &["b"]));

        let mut right = resp(4, 2, &["b"]);
        right.combine(resp(3, 1, &["a"]));

        assert_eq!(left, right);
    }

    #[test]
    fn test_combine_is_associative() {
        let (a, b, c) = (resp(1, 0, &["a"]), resp(2, 1, &["b"]), resp(3, 2, &["c"]));

        let mut ab = a.clone();
        ab.combine(b.clone());
        let mut ab_c = ab;
        ab_c.combine(c.clone());

        let mut bc = b;
        bc.combine(c);
        let mut a_bc = a;
        a_bc.combine(bc);

        assert_eq!(ab_c, a_bc);
    }
}
