// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Inner client

use std::sync::Arc;

use futures::stream::BoxStream;
use horaedbproto::storage::{
    RequestContext, SqlQueryRequest as SqlQueryRequestPb, SqlQueryResponse as SqlQueryResponsePb,
    WriteRequest as WriteRequestPb,
};
use tokio::sync::OnceCell;

use crate::{
    metrics::Metrics,
    model::{
        sql_query::{Request as SqlQueryRequest, Response as SqlQueryResponse},
        write::{pb_builder::WriteTableRequestPbsBuilder, Request as WriteRequest, Response as WriteResponse},
    },
    rpc_client::{RpcClient, RpcClientFactory, RpcContext},
    Result,
};

/// Per-endpoint client used by both proxy and route based modes, wrapping
/// a lazily built [`RpcClient`] with request assembly and per-endpoint
/// timers.
pub(crate) struct InnerClient<F: RpcClientFactory> {
    factory: Arc<F>,
    endpoint: String,
    metrics: Arc<Metrics>,
    inner_client: OnceCell<Arc<dyn RpcClient>>,
}

impl<F: RpcClientFactory> InnerClient<F> {
    pub fn new(factory: Arc<F>, endpoint: String, metrics: Arc<Metrics>) -> Self {
        InnerClient {
            factory,
            endpoint,
            metrics,
            inner_client: OnceCell::new(),
        }
    }

    pub async fn raw_client(&self) -> Result<Arc<dyn RpcClient>> {
        let client = self
            .inner_client
            .get_or_try_init(|| self.factory.build(self.endpoint.clone()))
            .await?;
        Ok(client.clone())
    }

    fn sql_query_request_pb(
        ctx: &RpcContext,
        req: &SqlQueryRequest,
        tables: &[String],
    ) -> SqlQueryRequestPb {
        SqlQueryRequestPb {
            context: Some(request_context(ctx)),
            tables: tables.to_vec(),
            sql: req.sql.clone(),
        }
    }

    pub async fn sql_query_internal(
        &self,
        ctx: &RpcContext,
        req: &SqlQueryRequest,
        tables: &[String],
    ) -> Result<SqlQueryResponse> {
        let client = self.raw_client().await?;
        let req_pb = Self::sql_query_request_pb(ctx, req, tables);

        let timer = self
            .metrics
            .sql_query_duration
            .with_label_values(&[self.endpoint.as_str()])
            .start_timer();
        let result = client.sql_query(ctx, req_pb).await;
        timer.observe_duration();

        result.and_then(SqlQueryResponse::try_from)
    }

    pub async fn stream_sql_query_internal(
        &self,
        ctx: &RpcContext,
        req: &SqlQueryRequest,
        tables: &[String],
    ) -> Result<BoxStream<'static, Result<SqlQueryResponsePb>>> {
        let client = self.raw_client().await?;
        let req_pb = Self::sql_query_request_pb(ctx, req, tables);
        client.stream_sql_query(ctx, req_pb).await
    }

    pub async fn write_internal(
        &self,
        ctx: &RpcContext,
        req: &WriteRequest,
    ) -> Result<WriteResponse> {
        let client = self.raw_client().await?;
        self.metrics.write_batch_size.observe(req.num_points() as f64);
        let req_pb = build_write_request_pb(ctx, req);

        let timer = self
            .metrics
            .write_duration
            .with_label_values(&[self.endpoint.as_str()])
            .start_timer();
        let result = client.write(ctx, req_pb).await;
        timer.observe_duration();

        result.map(|resp_pb| WriteResponse::new(resp_pb.success, resp_pb.failed))
    }
}

fn request_context(ctx: &RpcContext) -> RequestContext {
    debug_assert!(ctx.database.is_some());
    RequestContext {
        database: ctx.database.clone().unwrap_or_default(),
    }
}

pub(crate) fn build_write_request_pb(ctx: &RpcContext, req: &WriteRequest) -> WriteRequestPb {
    WriteRequestPb {
        context: Some(request_context(ctx)),
        table_requests: WriteTableRequestPbsBuilder(req.clone()).build(),
    }
}
