// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Config for the underlying rpc client

use std::time::Duration;

/// Config for the underlying grpc client
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// The max length of the message sent to server.
    ///
    /// -1 means unlimited, and the default value is 20MB.
    pub max_send_msg_len: i32,
    /// The max length of the message received from server.
    ///
    /// -1 means unlimited, and the default value is 1GB.
    pub max_recv_msg_len: i32,
    /// The interval for http2 ping frames.
    ///
    /// Default value is 600s.
    pub keep_alive_interval: Duration,
    /// Timeout for http2 ping frame acknowledgement.
    ///
    /// If the ping is not acknowledged within the timeout, the connection
    /// will be closed, and default value is 3s.
    pub keep_alive_timeout: Duration,
    /// Enables http2_keep_alive or not.
    ///
    /// It is enabled by default.
    pub keep_alive_while_idle: bool,
    /// Timeout for write operation.
    ///
    /// Default value is 5s.
    pub default_write_timeout: Duration,
    /// Timeout for sql_query operation.
    ///
    /// Default value is 60s.
    pub default_sql_query_timeout: Duration,
    /// Timeout for connection.
    ///
    /// Default value is 3s.
    pub connect_timeout: Duration,

    /// Authorization for rpc.
    pub authorization: Option<Authorization>,
}

#[derive(Debug, Clone)]
pub struct Authorization {
    pub username: String,
    pub password: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            // 20MB
            max_send_msg_len: 20 * (1 << 20),
            // 1GB
            max_recv_msg_len: 1 << 30,
            keep_alive_interval: Duration::from_secs(60 * 10),
            keep_alive_timeout: Duration::from_secs(3),
            keep_alive_while_idle: true,
            default_write_timeout: Duration::from_secs(5),
            default_sql_query_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(3),
            authorization: None,
        }
    }
}

/// The algorithm used by the per-endpoint adaptive concurrency limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    /// Round-trip-time based limit adjustment in the style of TCP Vegas.
    Vegas,
    /// Compares a short-window rtt to a long-window rtt, increasing the
    /// limit while the ratio stays near 1 and decreasing on degradation.
    Gradient,
}

/// Options for the per-endpoint adaptive concurrency limiter.
#[derive(Debug, Clone)]
pub struct RpcOptions {
    /// When the limiter has no free slot, block the caller until one is
    /// released instead of failing fast with a flow control error.
    pub block_on_limit: bool,
    /// The concurrency limit the limiter starts from.
    pub initial_limit: usize,
    /// The max concurrency limit the limiter may grow to.
    pub max_limit: usize,
    pub limit_kind: LimitKind,
    /// Log limit adjustments at info level.
    pub log_on_limit_change: bool,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            block_on_limit: true,
            initial_limit: 64,
            max_limit: 1024,
            limit_kind: LimitKind::Gradient,
            log_on_limit_change: false,
        }
    }
}
