// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Display for sql query response

use std::fmt::{self, Display};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

use crate::model::{sql_query::response::Response, value::Value};

/// Render a sql query [`Response`] as csv: a header row of column names
/// followed by one line per row.
///
/// Fields containing commas, quotes or line breaks are quoted with
/// embedded quotes doubled. Null cells render empty, binary cells render
/// base64.
pub struct CsvFormatter {
    pub resp: Response,
}

impl Display for CsvFormatter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let first_row = match self.resp.rows.first() {
            Some(row) => row,
            None => return Ok(()),
        };

        for (idx, column) in first_row.columns().iter().enumerate() {
            if idx > 0 {
                f.write_str(",")?;
            }
            write_field(f, column.name())?;
        }
        f.write_str("\n")?;

        for row in &self.resp.rows {
            for (idx, column) in row.columns().iter().enumerate() {
                if idx > 0 {
                    f.write_str(",")?;
                }
                write_value(f, column.value())?;
            }
            f.write_str("\n")?;
        }

        Ok(())
    }
}

fn write_value(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    match value {
        Value::Null => Ok(()),
        Value::String(v) => write_field(f, v),
        Value::Varbinary(v) => f.write_str(&BASE64.encode(v)),
        Value::Boolean(v) => write!(f, "{v}"),
        Value::Timestamp(v) => write!(f, "{v}"),
        Value::Double(v) => write!(f, "{v}"),
        Value::Float(v) => write!(f, "{v}"),
        Value::UInt64(v) => write!(f, "{v}"),
        Value::UInt32(v) => write!(f, "{v}"),
        Value::UInt16(v) => write!(f, "{v}"),
        Value::UInt8(v) => write!(f, "{v}"),
        Value::Int64(v) => write!(f, "{v}"),
        Value::Int32(v) => write!(f, "{v}"),
        Value::Int16(v) => write!(f, "{v}"),
        Value::Int8(v) => write!(f, "{v}"),
    }
}

fn write_field(f: &mut fmt::Formatter<'_>, raw: &str) -> fmt::Result {
    if raw.contains(&[',', '"', '\n', '\r'][..]) {
        write!(f, "\"{}\"", raw.replace('"', "\"\""))
    } else {
        f.write_str(raw)
    }
}
