// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Client for TSDB, a distributed columnar time-series database speaking
//! the HoraeDB storage grpc protocol.
//!
//! In `Direct` mode the client caches table-to-server routes, fans writes
//! out to the owning servers in parallel and transparently retries the
//! failed subset when a cached route goes stale. `Proxy` mode pins all
//! traffic to one endpoint. Besides unary writes and sql queries, the
//! client offers a client-streaming write session and a streaming query
//! row iterator.

mod config;
pub mod db_client;
mod errors;
mod metrics;
pub mod model;
mod router;
mod rpc_client;
mod sql;
mod util;

pub use crate::{
    config::{Authorization, LimitKind, RpcConfig, RpcOptions},
    errors::{Error, Result, RouteBasedWriteError, ServerError},
    metrics::Metrics,
    rpc_client::{
        MockRpcClient, MockRpcClientFactory, RpcClient, RpcClientFactory, RpcContext, Tenant,
    },
};
