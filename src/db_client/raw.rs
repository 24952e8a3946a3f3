// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Client for proxy mode

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    db_client::{
        inner::InnerClient, resolve_ctx, stream_query::spawn_row_pump, ClientOptions, DbClient,
        SqlQueryRowIter, StreamWriter,
    },
    errors::Error,
    metrics::Metrics,
    model::{
        sql_query::{Request as SqlQueryRequest, Response as SqlQueryResponse},
        write::{Request as WriteRequest, Response as WriteResponse},
    },
    rpc_client::{RpcClientFactory, RpcContext},
    Result,
};

/// Client for tsdb in proxy mode: every request goes to the one
/// configured endpoint, which forwards it inside the cluster. The
/// degenerate form of routing.
pub struct RawImpl<F: RpcClientFactory> {
    inner_client: InnerClient<F>,
    opts: ClientOptions,
    metrics: Arc<Metrics>,
    closed: AtomicBool,
}

impl<F: RpcClientFactory> RawImpl<F> {
    pub(crate) fn new(
        factory: Arc<F>,
        endpoint: String,
        opts: ClientOptions,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            inner_client: InnerClient::new(factory, endpoint, metrics.clone()),
            opts,
            metrics,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::IllegalState("client has been shut down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<F: RpcClientFactory> DbClient for RawImpl<F> {
    async fn sql_query(&self, ctx: &RpcContext, req: &SqlQueryRequest) -> Result<SqlQueryResponse> {
        self.ensure_open()?;
        let ctx = resolve_ctx(ctx, &self.opts)?;
        self.inner_client
            .sql_query_internal(&ctx, req, &req.tables)
            .await
    }

    async fn blocking_stream_sql_query(
        &self,
        ctx: &RpcContext,
        req: &SqlQueryRequest,
        timeout: Duration,
    ) -> Result<SqlQueryRowIter> {
        self.ensure_open()?;
        let ctx = resolve_ctx(ctx, &self.opts)?;
        let stream = self
            .inner_client
            .stream_sql_query_internal(&ctx, req, &req.tables)
            .await?;

        Ok(spawn_row_pump(stream, timeout))
    }

    async fn write(&self, ctx: &RpcContext, req: &WriteRequest) -> Result<WriteResponse> {
        self.ensure_open()?;
        if req.is_empty() {
            return Ok(WriteResponse::new(0, 0));
        }
        let ctx = resolve_ctx(ctx, &self.opts)?;

        let mut resp = self.inner_client.write_internal(&ctx, req).await?;
        if self.opts.collect_write_details {
            resp = resp.with_tables(req.tables());
        }
        Ok(resp)
    }

    async fn stream_writer(&self, ctx: &RpcContext, table: &str) -> Result<StreamWriter> {
        self.ensure_open()?;
        let ctx = resolve_ctx(ctx, &self.opts)?;
        let raw_client = self.inner_client.raw_client().await?;

        Ok(StreamWriter::open(
            raw_client,
            ctx,
            table.to_string(),
            self.opts.block_on_limit,
        ))
    }

    fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
