// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Client interface

mod builder;
mod inner;
mod raw;
mod route_based;
mod stream_query;
mod stream_writer;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
pub use builder::{Builder, Mode};
pub use stream_query::SqlQueryRowIter;
pub use stream_writer::StreamWriter;

use crate::{
    errors::Error,
    metrics::Metrics,
    model::{
        sql_query::{Request as SqlQueryRequest, Response as SqlQueryResponse},
        write::{Request as WriteRequest, Response as WriteResponse},
    },
    rpc_client::{RpcContext, Tenant},
    Result,
};

#[async_trait]
pub trait DbClient: Send + Sync {
    async fn sql_query(&self, ctx: &RpcContext, req: &SqlQueryRequest) -> Result<SqlQueryResponse>;

    /// Issue a server-streaming query and pull its rows through a
    /// blocking iterator.
    ///
    /// `timeout` bounds the wait for each row. The iterator blocks the
    /// calling thread, consume it outside the async runtime.
    async fn blocking_stream_sql_query(
        &self,
        ctx: &RpcContext,
        req: &SqlQueryRequest,
        timeout: Duration,
    ) -> Result<SqlQueryRowIter>;

    async fn write(&self, ctx: &RpcContext, req: &WriteRequest) -> Result<WriteResponse>;

    /// Open a client-streaming write session with affinity to `table`.
    async fn stream_writer(&self, ctx: &RpcContext, table: &str) -> Result<StreamWriter>;

    /// Metrics of this client, for scraping.
    fn metrics(&self) -> Arc<Metrics>;

    /// Release scheduled tasks and drop cached routes. Idempotent; any
    /// operation after shutdown fails with an illegal state error.
    async fn shutdown(&self);
}

/// Options shared by the client implementations, populated by [`Builder`].
#[derive(Clone, Debug)]
pub(crate) struct ClientOptions {
    pub default_database: Option<String>,
    pub default_tenant: Option<Tenant>,
    pub write_max_retries: usize,
    pub read_max_retries: usize,
    pub max_cached_size: usize,
    /// Scheduled route cache gc period; `None` disables gc.
    pub route_gc_period: Option<Duration>,
    pub collect_write_details: bool,
    pub block_on_limit: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            default_database: None,
            default_tenant: None,
            write_max_retries: 1,
            read_max_retries: 1,
            max_cached_size: 10_000,
            route_gc_period: Some(Duration::from_secs(60)),
            collect_write_details: false,
            block_on_limit: true,
        }
    }
}

/// Fill `database` and `tenant` from the client defaults when the caller
/// did not set them.
pub(crate) fn resolve_ctx(ctx: &RpcContext, opts: &ClientOptions) -> Result<RpcContext> {
    let mut ctx = ctx.clone();
    if ctx.database.is_none() {
        match &opts.default_database {
            Some(database) => ctx.database = Some(database.clone()),
            None => {
                return Err(Error::Client(
                    "database is not set in request context or client options".to_string(),
                ))
            }
        }
    }
    if ctx.tenant.is_none() {
        ctx.tenant = opts.default_tenant.clone();
    }

    Ok(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_ctx_database_fallback() {
        let opts = ClientOptions {
            default_database: Some("public".to_string()),
            ..Default::default()
        };

        let resolved = resolve_ctx(&RpcContext::default(), &opts).unwrap();
        assert_eq!(resolved.database.as_deref(), Some("public"));

        let explicit = resolve_ctx(&RpcContext::new("mine"), &opts).unwrap();
        assert_eq!(explicit.database.as_deref(), Some("mine"));
    }

    #[test]
    fn test_resolve_ctx_requires_database() {
        let res = resolve_ctx(&RpcContext::default(), &ClientOptions::default());
        assert!(matches!(res, Err(Error::Client(_))));
    }
}
