// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Rpc client used for testing

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use horaedbproto::common::ResponseHeader;
use horaedbproto::storage::{
    Endpoint as EndpointPb, Route as RoutePb, RouteRequest as RouteRequestPb,
    RouteResponse as RouteResponsePb, SqlQueryRequest as SqlQueryRequestPb,
    SqlQueryResponse as SqlQueryResponsePb, WriteRequest as WriteRequestPb,
    WriteResponse as WriteResponsePb,
};

use crate::{
    model::route::Endpoint,
    rpc_client::{RpcClient, RpcClientFactory, RpcContext},
    util::StatusCode,
    Result,
};

type WriteHandler = dyn Fn(&WriteRequestPb) -> Result<WriteResponsePb> + Send + Sync;
type SqlQueryHandler = dyn Fn(&SqlQueryRequestPb) -> Result<SqlQueryResponsePb> + Send + Sync;

pub fn ok_header() -> ResponseHeader {
    let mut header = ResponseHeader::default();
    header.code = StatusCode::Ok.as_u32();
    header
}

pub fn ok_write_response(success: u32, failed: u32) -> WriteResponsePb {
    let mut resp = WriteResponsePb::default();
    resp.header = Some(ok_header());
    resp.success = success;
    resp.failed = failed;
    resp
}

/// Points carried by a write request pb, one per field group.
pub fn count_points(req: &WriteRequestPb) -> u32 {
    req.table_requests
        .iter()
        .flat_map(|t| t.entries.iter())
        .map(|e| e.field_groups.len() as u32)
        .sum()
}

/// Rpc client used for testing, exported so applications can exercise
/// their own code against this client without a running server.
///
/// Routes are answered from `route_table`; write and query behavior is
/// scriptable through [`set_write_handler`](MockRpcClient::set_write_handler)
/// and [`set_sql_query_handler`](MockRpcClient::set_sql_query_handler),
/// defaulting to "everything succeeds".
pub struct MockRpcClient {
    pub route_table: Arc<DashMap<String, Endpoint>>,
    pub reachable: Arc<AtomicBool>,
    pub route_calls: Arc<AtomicUsize>,
    write_handler: Mutex<Arc<WriteHandler>>,
    sql_query_handler: Mutex<Arc<SqlQueryHandler>>,
}

impl MockRpcClient {
    fn ensure_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(crate::Error::Rpc {
                endpoint: "mock".to_string(),
                source: tonic::Status::unavailable("endpoint down"),
            })
        }
    }

    pub fn with_route_table(route_table: Arc<DashMap<String, Endpoint>>) -> Self {
        Self {
            route_table,
            reachable: Arc::new(AtomicBool::new(true)),
            route_calls: Arc::new(AtomicUsize::new(0)),
            write_handler: Mutex::new(Arc::new(|req| {
                Ok(ok_write_response(count_points(req), 0))
            })),
            sql_query_handler: Mutex::new(Arc::new(|_req| {
                let mut resp = SqlQueryResponsePb::default();
                resp.header = Some(ok_header());
                Ok(resp)
            })),
        }
    }

    pub fn set_write_handler(&self, handler: Arc<WriteHandler>) {
        *self.write_handler.lock().unwrap() = handler;
    }

    pub fn set_sql_query_handler(&self, handler: Arc<SqlQueryHandler>) {
        *self.sql_query_handler.lock().unwrap() = handler;
    }

    fn write_handler(&self) -> Arc<WriteHandler> {
        self.write_handler.lock().unwrap().clone()
    }

    fn sql_query_handler(&self) -> Arc<SqlQueryHandler> {
        self.sql_query_handler.lock().unwrap().clone()
    }
}

#[async_trait]
impl RpcClient for MockRpcClient {
    async fn route(&self, _ctx: &RpcContext, req: RouteRequestPb) -> Result<RouteResponsePb> {
        self.route_calls.fetch_add(1, Ordering::Relaxed);
        self.ensure_reachable()?;

        let routes: Vec<_> = req
            .tables
            .iter()
            .filter_map(|table| {
                let endpoint = self.route_table.get(table.as_str())?.value().clone();
                let mut route_pb = RoutePb::default();
                route_pb.table = table.clone();
                route_pb.endpoint = Some(EndpointPb::from(endpoint));
                Some(route_pb)
            })
            .collect();

        let mut route_resp = RouteResponsePb::default();
        route_resp.header = Some(ok_header());
        route_resp.routes = routes;
        Ok(route_resp)
    }

    async fn write(&self, _ctx: &RpcContext, req: WriteRequestPb) -> Result<WriteResponsePb> {
        self.ensure_reachable()?;
        (self.write_handler())(&req)
    }

    async fn sql_query(
        &self,
        _ctx: &RpcContext,
        req: SqlQueryRequestPb,
    ) -> Result<SqlQueryResponsePb> {
        (self.sql_query_handler())(&req)
    }

    async fn stream_write(
        &self,
        _ctx: &RpcContext,
        mut requests: BoxStream<'static, WriteRequestPb>,
    ) -> Result<WriteResponsePb> {
        let handler = self.write_handler();
        let mut total = ok_write_response(0, 0);
        while let Some(req) = requests.next().await {
            let resp = handler(&req)?;
            total.success += resp.success;
            total.failed += resp.failed;
        }

        Ok(total)
    }

    async fn stream_sql_query(
        &self,
        _ctx: &RpcContext,
        req: SqlQueryRequestPb,
    ) -> Result<BoxStream<'static, Result<SqlQueryResponsePb>>> {
        let resp = (self.sql_query_handler())(&req);
        Ok(stream::iter(vec![resp]).boxed())
    }

    async fn check_connection(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }
}

/// Factory handing out pre-registered mocks per endpoint.
///
/// Building an unregistered endpoint fails, mirroring an unreachable
/// server.
pub struct MockRpcClientFactory {
    pub clients: DashMap<String, Arc<MockRpcClient>>,
}

impl MockRpcClientFactory {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    pub fn register(&self, endpoint: &Endpoint, client: Arc<MockRpcClient>) {
        self.clients.insert(endpoint.to_string(), client);
    }
}

#[async_trait]
impl RpcClientFactory for MockRpcClientFactory {
    async fn build(&self, endpoint: String) -> Result<Arc<dyn RpcClient>> {
        match self.clients.get(&endpoint) {
            Some(client) => Ok(client.value().clone() as Arc<dyn RpcClient>),
            None => Err(crate::Error::Client(format!(
                "no mock client registered for endpoint:{endpoint}"
            ))),
        }
    }
}
