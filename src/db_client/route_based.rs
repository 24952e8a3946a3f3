// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Client for route based mode

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::{sync::OnceCell, task::JoinHandle};
use tracing::debug;

use crate::{
    db_client::{
        inner::InnerClient, resolve_ctx, stream_query::spawn_row_pump, ClientOptions, DbClient,
        SqlQueryRowIter, StreamWriter,
    },
    errors::{Error, RouteBasedWriteError},
    metrics::Metrics,
    model::{
        route::Endpoint,
        sql_query::{Request as SqlQueryRequest, Response as SqlQueryResponse},
        write::{point::Point, Request as WriteRequest, Response as WriteResponse},
    },
    router::{Router, RouterImpl},
    rpc_client::{RpcClientFactory, RpcContext},
    util::{is_flow_control, is_retriable, retry_delay, should_refresh},
    Result,
};

/// Client implementation for tsdb while using route based mode: requests
/// are routed per table and sent directly to the owning server.
pub struct RouteBasedImpl<F: RpcClientFactory> {
    factory: Arc<F>,
    cluster_endpoint: String,
    router: OnceCell<Arc<dyn Router>>,
    standalone_pool: DirectClientPool<F>,
    opts: ClientOptions,
    metrics: Arc<Metrics>,
    gc_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl<F: RpcClientFactory> RouteBasedImpl<F> {
    pub(crate) fn new(
        factory: Arc<F>,
        cluster_endpoint: String,
        opts: ClientOptions,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            factory: factory.clone(),
            cluster_endpoint,
            router: OnceCell::new(),
            standalone_pool: DirectClientPool::new(factory, metrics.clone()),
            opts,
            metrics,
            gc_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    async fn router(&self) -> Result<&Arc<dyn Router>> {
        self.router
            .get_or_try_init(|| async {
                let cluster: Endpoint = self.cluster_endpoint.parse().map_err(|e| {
                    Error::Client(format!(
                        "Failed to parse cluster endpoint:{}, err:{}",
                        self.cluster_endpoint, e
                    ))
                })?;

                let router = Arc::new(RouterImpl::new(
                    cluster,
                    self.factory.clone(),
                    self.metrics.clone(),
                    self.opts.max_cached_size,
                ));

                if let Some(period) = self.opts.route_gc_period {
                    let router_for_gc: Arc<dyn Router> = router.clone();
                    let handle = tokio::spawn(async move {
                        let mut ticker = tokio::time::interval(period);
                        // The first tick fires immediately, skip it.
                        ticker.tick().await;
                        loop {
                            ticker.tick().await;
                            router_for_gc.gc();
                        }
                    });
                    *self.gc_task.lock().unwrap() = Some(handle);
                }

                Ok(router as Arc<dyn Router>)
            })
            .await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::IllegalState("client has been shut down".to_string()));
        }
        Ok(())
    }

    /// Tables of a sql query, either the explicit list or extracted from
    /// the sql text.
    fn query_tables(req: &SqlQueryRequest) -> Result<Vec<String>> {
        let tables = if req.tables.is_empty() {
            crate::sql::table_names(&req.sql)
        } else {
            req.tables.clone()
        };

        if tables.is_empty() {
            return Err(Error::Query(
                "unable to determine the tables of the sql query, set them explicitly"
                    .to_string(),
            ));
        }

        Ok(tables)
    }

    /// All tables of one sql query must live on one server.
    fn single_endpoint(
        routes: &HashMap<String, Endpoint>,
        tables: &[String],
    ) -> Result<Endpoint> {
        let mut endpoint: Option<&Endpoint> = None;
        for table in tables {
            let table_endpoint = routes.get(table).ok_or_else(|| {
                Error::RouteTable(format!("no endpoint resolved for table:{table}"))
            })?;
            match endpoint {
                None => endpoint = Some(table_endpoint),
                Some(chosen) if chosen != table_endpoint => {
                    return Err(Error::Query(
                        "tables of sql query do not belong to the same server".to_string(),
                    ));
                }
                Some(_) => {}
            }
        }

        endpoint.cloned().ok_or_else(|| {
            Error::RouteTable("no endpoint resolved for sql query".to_string())
        })
    }

    fn record_retry(&self, err: &Error) {
        let code = match err.server_code() {
            Some(code) => code.to_string(),
            None => "flow_control".to_string(),
        };
        self.metrics.retries.with_label_values(&[code.as_str()]).inc();
    }

    async fn resolve_query_endpoint(
        &self,
        ctx: &RpcContext,
        tables: &[String],
    ) -> Result<Endpoint> {
        let router = self.router().await?;
        let routes = router.route_for(ctx, tables).await?;
        Self::single_endpoint(&routes, tables)
    }
}

/// Whether the dispatcher may recover from `err` by retrying, and whether
/// the cached routes behind it are stale.
fn classify_failure(err: &Error) -> (bool, bool) {
    match err {
        Error::Server(server_error) => (
            is_retriable(server_error.code),
            should_refresh(server_error.code, &server_error.msg),
        ),
        Error::FlowControl(_) => (true, false),
        _ => (false, false),
    }
}

fn is_flow_control_failure(err: &Error) -> bool {
    match err {
        Error::Server(server_error) => is_flow_control(server_error.code),
        Error::FlowControl(_) => true,
        _ => false,
    }
}

#[async_trait]
impl<F: RpcClientFactory> DbClient for RouteBasedImpl<F> {
    async fn sql_query(&self, ctx: &RpcContext, req: &SqlQueryRequest) -> Result<SqlQueryResponse> {
        self.ensure_open()?;
        let ctx = resolve_ctx(ctx, &self.opts)?;
        let tables = Self::query_tables(req)?;
        let router = self.router().await?;

        let mut attempt: usize = 0;
        loop {
            let endpoint = self.resolve_query_endpoint(&ctx, &tables).await?;
            let client = self.standalone_pool.get_or_create(&endpoint);

            match client.sql_query_internal(&ctx, req, &tables).await {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    let (retry_eligible, stale) = classify_failure(&e);
                    // A transport failure may also mean the table moved.
                    if stale || matches!(e, Error::Rpc { .. } | Error::Connect { .. }) {
                        router.clear_route_cache_by(&tables);
                    }

                    if retry_eligible && attempt < self.opts.read_max_retries {
                        self.record_retry(&e);
                        attempt += 1;
                        if is_flow_control_failure(&e) {
                            tokio::time::sleep(retry_delay(attempt)).await;
                        }
                        continue;
                    }

                    return Err(e);
                }
            }
        }
    }

    async fn blocking_stream_sql_query(
        &self,
        ctx: &RpcContext,
        req: &SqlQueryRequest,
        timeout: Duration,
    ) -> Result<SqlQueryRowIter> {
        self.ensure_open()?;
        let ctx = resolve_ctx(ctx, &self.opts)?;
        let tables = Self::query_tables(req)?;

        let endpoint = self.resolve_query_endpoint(&ctx, &tables).await?;
        let client = self.standalone_pool.get_or_create(&endpoint);
        let stream = client.stream_sql_query_internal(&ctx, req, &tables).await?;

        Ok(spawn_row_pump(stream, timeout))
    }

    async fn write(&self, ctx: &RpcContext, req: &WriteRequest) -> Result<WriteResponse> {
        self.ensure_open()?;
        if req.is_empty() {
            return Ok(WriteResponse::new(0, 0));
        }
        let ctx = resolve_ctx(ctx, &self.opts)?;
        let router = self.router().await?;

        let mut pending: HashMap<String, Vec<Point>> = req.point_groups.clone();
        let mut ok_tables: Vec<String> = Vec::new();
        let mut ok_resp = WriteResponse::default();
        let mut fatal: Vec<(Vec<String>, Error)> = Vec::new();
        let mut attempt: usize = 0;

        loop {
            // Partition the pending points by their resolved endpoints.
            let tables: Vec<String> = pending.keys().cloned().collect();
            let routes = router.route_for(&ctx, &tables).await?;

            let mut by_endpoint: HashMap<Endpoint, WriteRequest> = HashMap::new();
            for (table, points) in pending.drain() {
                match routes.get(&table) {
                    Some(endpoint) => {
                        by_endpoint
                            .entry(endpoint.clone())
                            .or_default()
                            .point_groups
                            .insert(table, points);
                    }
                    None => fatal.push((
                        vec![table.clone()],
                        Error::RouteTable(format!("no endpoint resolved for table:{table}")),
                    )),
                }
            }

            // Fan out to every endpoint in parallel.
            let futures: Vec<_> = by_endpoint
                .into_iter()
                .map(|(endpoint, sub_req)| {
                    let client = self.standalone_pool.get_or_create(&endpoint);
                    let ctx = ctx.clone();
                    async move {
                        let result = client.write_internal(&ctx, &sub_req).await;
                        (endpoint, sub_req, result)
                    }
                })
                .collect();

            let mut retriable: HashMap<String, Vec<Point>> = HashMap::new();
            let mut evicts: Vec<String> = Vec::new();
            let mut saw_flow_control = false;

            for (endpoint, sub_req, result) in join_all(futures).await {
                let sub_tables = sub_req.tables();
                match result {
                    Ok(mut resp) => {
                        if self.opts.collect_write_details {
                            resp = resp.with_tables(sub_tables.iter().cloned());
                        }
                        ok_tables.extend(sub_tables);
                        ok_resp.combine(resp);
                    }
                    Err(e) => {
                        let (retry_eligible, stale) = classify_failure(&e);
                        if stale {
                            evicts.extend(sub_tables.iter().cloned());
                        }

                        if retry_eligible && attempt < self.opts.write_max_retries {
                            self.record_retry(&e);
                            saw_flow_control |= is_flow_control_failure(&e);
                            debug!(%endpoint, err = %e, "write sub-batch will be retried");
                            retriable.extend(sub_req.point_groups);
                        } else {
                            fatal.push((sub_tables, e));
                        }
                    }
                }
            }

            // Invalidate stale routes before the retry re-resolves them.
            if !evicts.is_empty() {
                router.clear_route_cache_by(&evicts);
            }

            if retriable.is_empty() {
                break;
            }
            attempt += 1;
            if saw_flow_control {
                tokio::time::sleep(retry_delay(attempt)).await;
            }
            pending = retriable;
        }

        if fatal.is_empty() {
            Ok(ok_resp)
        } else {
            Err(Error::RouteBasedWriteError(RouteBasedWriteError {
                ok: (ok_tables, ok_resp),
                errors: fatal,
            }))
        }
    }

    async fn stream_writer(&self, ctx: &RpcContext, table: &str) -> Result<StreamWriter> {
        self.ensure_open()?;
        let ctx = resolve_ctx(ctx, &self.opts)?;

        let router = self.router().await?;
        let tables = vec![table.to_string()];
        let routes = router.route_for(&ctx, &tables).await?;
        let endpoint = routes.get(table).cloned().ok_or_else(|| {
            Error::RouteTable(format!("no endpoint resolved for table:{table}"))
        })?;

        let client = self.standalone_pool.get_or_create(&endpoint);
        let raw_client = client.raw_client().await?;

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
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Some(handle) = self.gc_task.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(router) = self.router.get() {
            router.clear_route_cache();
        }
    }
}

/// DirectClientPool is the pool actually holding connections to data
/// nodes.
struct DirectClientPool<F: RpcClientFactory> {
    pool: DashMap<Endpoint, Arc<InnerClient<F>>>,
    factory: Arc<F>,
    metrics: Arc<Metrics>,
}

impl<F: RpcClientFactory> DirectClientPool<F> {
    fn new(factory: Arc<F>, metrics: Arc<Metrics>) -> Self {
        Self {
            pool: DashMap::new(),
            factory,
            metrics,
        }
    }

    fn get_or_create(&self, endpoint: &Endpoint) -> Arc<InnerClient<F>> {
        if let Some(c) = self.pool.get(endpoint) {
            // If exist in cache, return.
            c.value().clone()
        } else {
            // If not exist, build --> insert --> return.
            self.pool
                .entry(endpoint.clone())
                .or_insert(Arc::new(InnerClient::new(
                    self.factory.clone(),
                    endpoint.to_string(),
                    self.metrics.clone(),
                )))
                .clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{
        errors::ServerError,
        model::value::Value,
        model::write::point::PointBuilder,
        rpc_client::mock_rpc_client::{
            count_points, ok_write_response, MockRpcClient, MockRpcClientFactory,
        },
        util::StatusCode,
    };

    fn endpoint(i: u32) -> Endpoint {
        Endpoint::new(format!("192.168.0.{i}"), 8831)
    }

    fn cluster_endpoint() -> Endpoint {
        Endpoint::new("192.168.0.100".to_string(), 8831)
    }

    struct TestCluster {
        client: Arc<RouteBasedImpl<MockRpcClientFactory>>,
        cluster_client: Arc<MockRpcClient>,
        factory: Arc<MockRpcClientFactory>,
    }

    fn make_cluster(opts: ClientOptions) -> TestCluster {
        let factory = Arc::new(MockRpcClientFactory::new());
        let cluster_client = Arc::new(MockRpcClient::with_route_table(Arc::new(DashMap::new())));
        factory.register(&cluster_endpoint(), cluster_client.clone());

        let metrics = Arc::new(Metrics::new().unwrap());
        let client = Arc::new(RouteBasedImpl::new(
            factory.clone(),
            cluster_endpoint().to_string(),
            opts,
            metrics,
        ));

        TestCluster {
            client,
            cluster_client,
            factory,
        }
    }

    fn default_opts() -> ClientOptions {
        ClientOptions {
            default_database: Some("public".to_string()),
            route_gc_period: None,
            ..Default::default()
        }
    }

    fn register_data_node(cluster: &TestCluster, ep: &Endpoint) -> Arc<MockRpcClient> {
        let client = Arc::new(MockRpcClient::with_route_table(Arc::new(DashMap::new())));
        cluster.factory.register(ep, client.clone());
        client
    }

    fn machine_point(ts: i64, city: &str, cpu: f64) -> Point {
        PointBuilder::new("machine_table".to_string())
            .timestamp(ts)
            .tag("city".to_string(), Value::String(city.to_string()))
            .field("cpu".to_string(), Value::Double(cpu))
            .build()
            .unwrap()
    }

    fn machine_write_request() -> WriteRequest {
        let mut req = WriteRequest::default();
        req.add_points(vec![
            machine_point(1000, "Singapore", 0.23),
            machine_point(1001, "Singapore", 0.25),
            machine_point(1001, "Shanghai", 0.21),
        ]);
        req
    }

    #[tokio::test]
    async fn test_happy_path_write() {
        let cluster = make_cluster(default_opts());
        register_data_node(&cluster, &endpoint(1));
        cluster
            .cluster_client
            .route_table
            .insert("machine_table".to_string(), endpoint(1));

        let ctx = RpcContext::default();
        let resp = cluster
            .client
            .write(&ctx, &machine_write_request())
            .await
            .unwrap();

        assert_eq!(resp.success, 3);
        assert_eq!(resp.failed, 0);
    }

    #[tokio::test]
    async fn test_empty_write_short_circuits() {
        let cluster = make_cluster(default_opts());
        let resp = cluster
            .client
            .write(&RpcContext::default(), &WriteRequest::default())
            .await
            .unwrap();
        assert_eq!(resp.success, 0);
        assert_eq!(resp.failed, 0);
        assert_eq!(
            cluster
                .cluster_client
                .route_calls
                .load(Ordering::Relaxed),
            0
        );
    }

    #[tokio::test]
    async fn test_multi_endpoint_write_merges_details() {
        let opts = ClientOptions {
            collect_write_details: true,
            ..default_opts()
        };
        let cluster = make_cluster(opts);
        register_data_node(&cluster, &endpoint(1));
        register_data_node(&cluster, &endpoint(2));
        cluster
            .cluster_client
            .route_table
            .insert("machine_table".to_string(), endpoint(1));
        cluster
            .cluster_client
            .route_table
            .insert("disk_table".to_string(), endpoint(2));

        let mut req = machine_write_request();
        req.add_point(
            PointBuilder::new("disk_table".to_string())
                .timestamp(1000)
                .field("used".to_string(), Value::UInt64(42))
                .build()
                .unwrap(),
        );

        let resp = cluster
            .client
            .write(&RpcContext::default(), &req)
            .await
            .unwrap();

        assert_eq!(resp.success, 4);
        let tables = resp.tables.unwrap();
        assert!(tables.contains("machine_table"));
        assert!(tables.contains("disk_table"));
    }

    #[tokio::test]
    async fn test_stale_route_evicts_and_retries_failed_subset() {
        let cluster = make_cluster(default_opts());
        let data_client = register_data_node(&cluster, &endpoint(1));
        cluster
            .cluster_client
            .route_table
            .insert("machine_table".to_string(), endpoint(1));

        // First write reports a stale route, the second succeeds.
        let write_calls = Arc::new(AtomicUsize::new(0));
        let write_calls_clone = write_calls.clone();
        data_client.set_write_handler(Arc::new(move |req| {
            if write_calls_clone.fetch_add(1, Ordering::Relaxed) == 0 {
                Err(Error::Server(ServerError {
                    code: StatusCode::InvalidRoute.as_u32(),
                    msg: "route stale".to_string(),
                    endpoint: None,
                }))
            } else {
                Ok(ok_write_response(count_points(req), 0))
            }
        }));

        let resp = cluster
            .client
            .write(&RpcContext::default(), &machine_write_request())
            .await
            .unwrap();

        assert_eq!(resp.success, 3);
        assert_eq!(resp.failed, 0);
        assert_eq!(write_calls.load(Ordering::Relaxed), 2);
        // The stale route was dropped, so the retry re-resolved exactly
        // once more.
        assert_eq!(
            cluster.cluster_client.route_calls.load(Ordering::Relaxed),
            2
        );
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let opts = ClientOptions {
            write_max_retries: 1,
            ..default_opts()
        };
        let cluster = make_cluster(opts);
        let data_client = register_data_node(&cluster, &endpoint(1));
        cluster
            .cluster_client
            .route_table
            .insert("machine_table".to_string(), endpoint(1));

        let write_calls = Arc::new(AtomicUsize::new(0));
        let write_calls_clone = write_calls.clone();
        data_client.set_write_handler(Arc::new(move |_req| {
            write_calls_clone.fetch_add(1, Ordering::Relaxed);
            Err(Error::Server(ServerError {
                code: StatusCode::InvalidRoute.as_u32(),
                msg: "route stale".to_string(),
                endpoint: None,
            }))
        }));

        let res = cluster
            .client
            .write(&RpcContext::default(), &machine_write_request())
            .await;

        // Initial attempt plus exactly one retry.
        assert_eq!(write_calls.load(Ordering::Relaxed), 2);
        match res {
            Err(Error::RouteBasedWriteError(partial)) => {
                assert!(!partial.all_ok());
                assert_eq!(partial.failed_tables(), vec!["machine_table".to_string()]);
            }
            other => panic!("expected partial write error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_successful_subset() {
        let opts = ClientOptions {
            write_max_retries: 0,
            ..default_opts()
        };
        let cluster = make_cluster(opts);
        register_data_node(&cluster, &endpoint(1));
        let failing_client = register_data_node(&cluster, &endpoint(2));
        cluster
            .cluster_client
            .route_table
            .insert("machine_table".to_string(), endpoint(1));
        cluster
            .cluster_client
            .route_table
            .insert("disk_table".to_string(), endpoint(2));

        failing_client.set_write_handler(Arc::new(|_req| {
            Err(Error::Server(ServerError {
                code: StatusCode::InternalError.as_u32(),
                msg: "disk full".to_string(),
                endpoint: None,
            }))
        }));

        let mut req = machine_write_request();
        req.add_point(
            PointBuilder::new("disk_table".to_string())
                .timestamp(1000)
                .field("used".to_string(), Value::UInt64(42))
                .build()
                .unwrap(),
        );

        let res = cluster.client.write(&RpcContext::default(), &req).await;
        match res {
            Err(Error::RouteBasedWriteError(partial)) => {
                assert_eq!(partial.ok.0, vec!["machine_table".to_string()]);
                assert_eq!(partial.ok.1.success, 3);
                assert_eq!(partial.failed_tables(), vec!["disk_table".to_string()]);
            }
            other => panic!("expected partial write error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cross_endpoint_sql_query_rejected_before_rpc() {
        let cluster = make_cluster(default_opts());
        let client1 = register_data_node(&cluster, &endpoint(1));
        let client2 = register_data_node(&cluster, &endpoint(2));
        cluster
            .cluster_client
            .route_table
            .insert("t1".to_string(), endpoint(1));
        cluster
            .cluster_client
            .route_table
            .insert("t2".to_string(), endpoint(2));

        let sql_calls = Arc::new(AtomicUsize::new(0));
        for client in [&client1, &client2] {
            let sql_calls = sql_calls.clone();
            client.set_sql_query_handler(Arc::new(move |_req| {
                sql_calls.fetch_add(1, Ordering::Relaxed);
                Err(Error::Unknown("must not be reached".to_string()))
            }));
        }

        let req = SqlQueryRequest::new("select * from t1 join t2 on t1.id = t2.id");
        let res = cluster.client.sql_query(&RpcContext::default(), &req).await;

        assert!(matches!(res, Err(Error::Query(_))));
        assert_eq!(sql_calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_sql_query_extracts_tables_from_sql() {
        let cluster = make_cluster(default_opts());
        let data_client = register_data_node(&cluster, &endpoint(1));
        cluster
            .cluster_client
            .route_table
            .insert("machine_table".to_string(), endpoint(1));

        let seen_tables = Arc::new(Mutex::new(Vec::new()));
        let seen_tables_clone = seen_tables.clone();
        data_client.set_sql_query_handler(Arc::new(move |req| {
            *seen_tables_clone.lock().unwrap() = req.tables.clone();
            let mut resp = horaedbproto::storage::SqlQueryResponse::default();
            resp.output = Some(
                horaedbproto::storage::sql_query_response::Output::AffectedRows(0),
            );
            Ok(resp)
        }));

        let req = SqlQueryRequest::new("select * from machine_table where city = 'Beijing'");
        cluster
            .client
            .sql_query(&RpcContext::default(), &req)
            .await
            .unwrap();

        assert_eq!(
            *seen_tables.lock().unwrap(),
            vec!["machine_table".to_string()]
        );
    }

    #[tokio::test]
    async fn test_operations_fail_after_shutdown() {
        let cluster = make_cluster(default_opts());
        cluster.client.shutdown().await;
        // Idempotent.
        cluster.client.shutdown().await;

        let res = cluster
            .client
            .write(&RpcContext::default(), &machine_write_request())
            .await;
        assert!(matches!(res, Err(Error::IllegalState(_))));
    }

}
