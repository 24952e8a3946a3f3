// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Error in client

use thiserror::Error;

use crate::model::write::Response as WriteResponse;

#[derive(Debug, Error)]
pub enum Error {
    /// Error from the running server.
    #[error("server error, code:{}, msg:{}", .0.code, .0.msg)]
    Server(ServerError),

    /// Error from the rpc layer.
    /// Note that errors reported by a running server are wrapped in
    /// [`Error::Server`], not here.
    #[error("rpc error, endpoint:{endpoint}, err:{source}")]
    Rpc {
        endpoint: String,
        source: tonic::Status,
    },

    /// Error while connecting to an endpoint.
    #[error("failed to connect, addr:{addr}, err:{source}")]
    Connect {
        addr: String,
        source: tonic::transport::Error,
    },

    /// Error from the client itself, the rpc request has not been sent or
    /// has already finished successfully.
    #[error("client error, msg:{0}")]
    Client(String),

    /// The client is used in a way its state does not allow, e.g. writing
    /// through a client that has been shut down.
    #[error("illegal state, msg:{0}")]
    IllegalState(String),

    /// The local or remote concurrency limiter rejected the request.
    #[error("rejected by flow control, msg:{0}")]
    FlowControl(String),

    /// The resolver could not produce any route for the requested tables.
    #[error("failed to route tables, msg:{0}")]
    RouteTable(String),

    /// A query violated a pre-flight check and was never sent.
    #[error("invalid query, msg:{0}")]
    Query(String),

    /// Failed to decode rows from a query response.
    #[error("failed to build rows, msg:{0}")]
    BuildRows(String),

    /// Failed to decode the arrow payload in a query response.
    #[error("failed to decode arrow payload, err:{0}")]
    DecodeArrowPayload(Box<dyn std::error::Error + Send + Sync>),

    /// Some per-endpoint sub-batches of a routed write failed.
    #[error("partial write failure:{0:?}")]
    RouteBasedWriteError(RouteBasedWriteError),

    /// Error unknown.
    #[error("unknown error, msg:{0}")]
    Unknown(String),
}

impl Error {
    /// The server status code carried by this error, if any.
    pub fn server_code(&self) -> Option<u32> {
        match self {
            Error::Server(e) => Some(e.code),
            Error::RouteBasedWriteError(e) => {
                e.errors.first().and_then(|(_, err)| err.server_code())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("server error, code:{code}, msg:{msg}")]
pub struct ServerError {
    pub code: u32,
    pub msg: String,
    /// The endpoint reporting the error, when known.
    pub endpoint: Option<String>,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Aggregated outcome of a routed write where at least one per-endpoint
/// sub-batch failed.
///
/// `ok` keeps the tables and merged response of the sub-batches that
/// succeeded, so callers still see partial progress. Each entry in
/// `errors` names the tables of one failed sub-batch and the cause, which
/// is the failing subset to resubmit.
#[derive(Debug, Default)]
pub struct RouteBasedWriteError {
    pub ok: (Vec<String>, WriteResponse),
    pub errors: Vec<(Vec<String>, Error)>,
}

impl From<Vec<(Vec<String>, Result<WriteResponse>)>> for RouteBasedWriteError {
    fn from(table_result_pairs: Vec<(Vec<String>, Result<WriteResponse>)>) -> Self {
        let mut partial = RouteBasedWriteError::default();
        for (tables, result) in table_result_pairs {
            match result {
                Ok(resp) => {
                    partial.ok.0.extend(tables);
                    partial.ok.1.combine(resp);
                }
                Err(e) => partial.errors.push((tables, e)),
            }
        }

        partial
    }
}

impl RouteBasedWriteError {
    pub fn all_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Every table named in a failed sub-batch.
    pub fn failed_tables(&self) -> Vec<String> {
        self.errors
            .iter()
            .flat_map(|(tables, _)| tables.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_write_aggregation() {
        let pairs = vec![
            (
                vec!["a".to_string()],
                Ok(WriteResponse::new(3, 0)),
            ),
            (
                vec!["b".to_string()],
                Err(Error::Server(ServerError {
                    code: 500,
                    msg: "boom".to_string(),
                    endpoint: None,
                })),
            ),
            (
                vec!["c".to_string()],
                Ok(WriteResponse::new(2, 1)),
            ),
        ];

        let partial: RouteBasedWriteError = pairs.into();
        assert!(!partial.all_ok());
        assert_eq!(partial.ok.0, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(partial.ok.1.success, 5);
        assert_eq!(partial.ok.1.failed, 1);
        assert_eq!(partial.failed_tables(), vec!["b".to_string()]);
    }
}
