// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Rpc layer: the transport contract and its grpc implementation

mod limit;
pub(crate) mod mock_rpc_client;
mod rpc_client_impl;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::stream::BoxStream;
use horaedbproto::storage::{
    RouteRequest as RouteRequestPb, RouteResponse as RouteResponsePb,
    SqlQueryRequest as SqlQueryRequestPb, SqlQueryResponse as SqlQueryResponsePb,
    WriteRequest as WriteRequestPb, WriteResponse as WriteResponsePb,
};
pub use mock_rpc_client::{count_points, ok_write_response, MockRpcClient, MockRpcClientFactory};
pub use rpc_client_impl::RpcClientImplFactory;

use crate::errors::Result;

/// Tenant tuple attached to every outgoing rpc as metadata.
#[derive(Clone, Debug, Default)]
pub struct Tenant {
    pub tenant: String,
    pub sub_tenant: String,
    pub token: String,
}

/// Context for rpc request.
#[derive(Clone, Debug, Default)]
pub struct RpcContext {
    pub database: Option<String>,
    pub tenant: Option<Tenant>,
    /// Overrides the per-operation default timeout when set.
    pub timeout: Option<Duration>,
}

impl RpcContext {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: Some(database.into()),
            ..Default::default()
        }
    }

    pub fn tenant(mut self, tenant: Tenant) -> Self {
        self.tenant = Some(tenant);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The transport consumed by routers and dispatchers: unary calls,
/// a client-streaming write, a server-streaming query and a cheap
/// connectivity probe.
#[async_trait]
pub trait RpcClient: Send + Sync {
    async fn route(&self, ctx: &RpcContext, req: RouteRequestPb) -> Result<RouteResponsePb>;

    async fn write(&self, ctx: &RpcContext, req: WriteRequestPb) -> Result<WriteResponsePb>;

    async fn sql_query(&self, ctx: &RpcContext, req: SqlQueryRequestPb)
        -> Result<SqlQueryResponsePb>;

    /// Send a stream of write requests, resolving to the server's single
    /// final response after the stream is half-closed.
    async fn stream_write(
        &self,
        ctx: &RpcContext,
        requests: BoxStream<'static, WriteRequestPb>,
    ) -> Result<WriteResponsePb>;

    /// Issue a query whose response arrives as a stream of partial
    /// results.
    async fn stream_sql_query(
        &self,
        ctx: &RpcContext,
        req: SqlQueryRequestPb,
    ) -> Result<BoxStream<'static, Result<SqlQueryResponsePb>>>;

    /// Whether the endpoint behind this client currently accepts
    /// connections.
    async fn check_connection(&self) -> bool;
}

/// Builds one [`RpcClient`] per endpoint.
#[async_trait]
pub trait RpcClientFactory: Send + Sync + 'static {
    async fn build(&self, endpoint: String) -> Result<Arc<dyn RpcClient>>;
}
