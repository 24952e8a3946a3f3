// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Sql query request

/// Query request
///
/// When `tables` is empty the client extracts the referenced table names
/// from the sql text; a non-empty list is authoritative and skips
/// extraction. Avoids exposed interfaces explicitly depending on the
/// wire proto.
#[derive(Debug, Clone, Default)]
pub struct Request {
    pub tables: Vec<String>,
    pub sql: String,
}

impl Request {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            tables: Vec::new(),
            sql: sql.into(),
        }
    }

    pub fn for_tables(mut self, tables: impl IntoIterator<Item = String>) -> Self {
        self.tables = tables.into_iter().collect();
        self
    }
}
