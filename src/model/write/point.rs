// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! [Point] and its builder

use std::collections::BTreeMap;

use crate::{
    errors::{Error, Result},
    model::value::Value,
};

/// Column names the server claims for itself; points may not use them
/// for tags or fields.
const RESERVED_COLUMN_NAMES: [&str; 2] = ["tsid", "timestamp"];

#[inline]
pub fn is_reserved_column_name(name: &str) -> bool {
    RESERVED_COLUMN_NAMES
        .iter()
        .any(|reserved| name.eq_ignore_ascii_case(reserved))
}

/// One datapoint: a timestamped set of tag and field values belonging to
/// exactly one table.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Point {
    pub table: String,
    pub timestamp: i64,
    pub tags: BTreeMap<String, Value>,
    pub fields: BTreeMap<String, Value>,
}

impl Point {
    /// Byte key identifying the series this point belongs to, derived
    /// from its tag names and values. Points sharing a key are encoded
    /// into one wire series entry, keyed timestamps under shared tags.
    ///
    /// Tags iterate in `BTreeMap` order, so the key is stable for equal
    /// tag sets regardless of insertion order.
    pub fn series_key(&self) -> Vec<u8> {
        let mut key = Vec::new();
        for (name, value) in &self.tags {
            key.extend_from_slice(name.as_bytes());
            key.extend_from_slice(&value.to_bytes());
        }

        key
    }
}

/// Builder validating a [Point] before it can enter a write request:
/// a timestamp and at least one field are required, and no column may
/// use a reserved name.
#[derive(Debug)]
pub struct PointBuilder {
    table: String,
    timestamp: Option<i64>,
    // tags' traversing should have definite order
    tags: BTreeMap<String, Value>,
    fields: BTreeMap<String, Value>,
}

impl PointBuilder {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            timestamp: None,
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Set tag name and value of the point.
    ///
    /// Reserved names like 'timestamp' or 'tsid' are rejected by
    /// [`build`](PointBuilder::build), they are keywords in tsdb.
    pub fn tag(mut self, name: impl Into<String>, value: Value) -> Self {
        self.tags.insert(name.into(), value);
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn build(self) -> Result<Point> {
        let timestamp = self.timestamp.ok_or_else(|| {
            Error::Client(format!(
                "timestamp must be set for point of table:{}",
                self.table
            ))
        })?;

        if self.fields.is_empty() {
            return Err(Error::Client(format!(
                "point of table:{} carries no fields",
                self.table
            )));
        }

        if let Some(name) = self
            .tags
            .keys()
            .chain(self.fields.keys())
            .find(|name| is_reserved_column_name(name))
        {
            return Err(Error::Client(format!(
                "column name:{name} is reserved in tsdb"
            )));
        }

        Ok(Point {
            table: self.table,
            timestamp,
            tags: self.tags,
            fields: self.fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_point() {
        let point = PointBuilder::new("machine_table")
            .timestamp(1000)
            .tag("city", Value::String("Singapore".to_string()))
            .field("cpu", Value::Double(0.23))
            .build()
            .unwrap();

        assert_eq!(point.table, "machine_table");
        assert_eq!(point.timestamp, 1000);
        assert_eq!(point.tags.len(), 1);
        assert_eq!(point.fields.len(), 1);
    }

    #[test]
    fn test_missing_parts_rejected() {
        // No fields.
        let res = PointBuilder::new("t").timestamp(1).build();
        assert!(matches!(res, Err(Error::Client(_))));

        // No timestamp.
        let res = PointBuilder::new("t").field("f", Value::Int32(1)).build();
        assert!(matches!(res, Err(Error::Client(_))));
    }

    #[test]
    fn test_reserved_column_name_rejected() {
        for name in ["TIMESTAMP", "timestamp", "tsid", "TsId"] {
            let res = PointBuilder::new("t")
                .timestamp(1)
                .tag(name, Value::Int64(1))
                .field("f", Value::Int32(1))
                .build();
            assert!(res.is_err(), "{name} must be rejected");
        }
    }

    #[test]
    fn test_series_key_ignores_insertion_order() {
        let a = PointBuilder::new("t")
            .timestamp(1)
            .tag("city", Value::String("Beijing".to_string()))
            .tag("ip", Value::String("10.0.0.1".to_string()))
            .field("f", Value::Int32(1))
            .build()
            .unwrap();
        let b = PointBuilder::new("t")
            .timestamp(2)
            .tag("ip", Value::String("10.0.0.1".to_string()))
            .tag("city", Value::String("Beijing".to_string()))
            .field("f", Value::Int32(2))
            .build()
            .unwrap();

        assert_eq!(a.series_key(), b.series_key());

        let c = PointBuilder::new("t")
            .timestamp(1)
            .tag("city", Value::String("Shanghai".to_string()))
            .field("f", Value::Int32(1))
            .build()
            .unwrap();
        assert_ne!(a.series_key(), c.series_key());
    }
}
