// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! [Router] in client
//!
//! Maps table names to the endpoints owning them through a bounded
//! concurrent cache. Misses are resolved with one batched route rpc
//! against the cluster endpoint; tables the cluster cannot resolve fall
//! back to the cluster endpoint itself. A scheduled [`Router::gc`] keeps
//! the cache under its size bound by evicting the least recently hit
//! routes.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};

use async_trait::async_trait;
use dashmap::DashMap;
use horaedbproto::storage::{RequestContext, RouteRequest as RouteRequestPb};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::{
    errors::{Error, Result},
    metrics::Metrics,
    model::route::{Endpoint, Route},
    rpc_client::{RpcClient, RpcClientFactory, RpcContext},
};

/// Gc starts evicting once the cache reaches this share of the max size.
const GC_TRIGGER_RATIO: f64 = 0.75;
/// Share of the cache evicted per gc round.
const GC_EVICT_RATIO: f64 = 0.10;
/// Rounds without shrinkage tolerated before a gc run gives up, bounds
/// the run under a concurrent insert flood.
const MAX_STALLED_GC_ROUNDS: usize = 3;

/// Used to route tables to endpoints.
#[async_trait]
pub trait Router: Send + Sync {
    /// Resolve every table to an endpoint, from cache when possible.
    ///
    /// The returned map always covers all requested tables: tables the
    /// refresh cannot resolve are mapped to the cluster endpoint, which
    /// forwards requests internally.
    async fn route_for(
        &self,
        ctx: &RpcContext,
        tables: &[String],
    ) -> Result<HashMap<String, Endpoint>>;

    /// Unconditionally refresh the routes of `tables` from the cluster,
    /// overwriting cache entries. The returned map only covers the tables
    /// the cluster resolved, no fallback synthesis happens here.
    async fn route_refresh_for(
        &self,
        ctx: &RpcContext,
        tables: &[String],
    ) -> Result<HashMap<String, Endpoint>>;

    /// Targeted invalidation, used by dispatchers on a stale route.
    fn clear_route_cache_by(&self, tables: &[String]);

    fn clear_route_cache(&self);

    /// Enforce the cache size bound by evicting least recently hit
    /// routes.
    fn gc(&self);
}

/// Implementation for [`Router`].
///
/// Reads are wait-free on the concurrent map. Concurrent misses on the
/// same table may issue duplicate refresh rpcs; the refresh is idempotent
/// and insertion is last-writer-wins, so no refresh lock is held.
pub struct RouterImpl<F: RpcClientFactory> {
    cluster_endpoint: Endpoint,
    factory: Arc<F>,
    cluster_client: OnceCell<Arc<dyn RpcClient>>,
    cache: DashMap<String, Arc<Route>>,
    max_cached_size: usize,
    metrics: Arc<Metrics>,
    started_at: Instant,
    fallback_cursor: AtomicUsize,
}

impl<F: RpcClientFactory> RouterImpl<F> {
    pub fn new(
        cluster_endpoint: Endpoint,
        factory: Arc<F>,
        metrics: Arc<Metrics>,
        max_cached_size: usize,
    ) -> Self {
        Self {
            cluster_endpoint,
            factory,
            cluster_client: OnceCell::new(),
            cache: DashMap::new(),
            max_cached_size,
            metrics,
            started_at: Instant::now(),
            fallback_cursor: AtomicUsize::new(0),
        }
    }

    /// Milliseconds since this router was created, the monotonic tick
    /// stamped into routes on every hit.
    fn now_tick(&self) -> i64 {
        self.started_at.elapsed().as_millis() as i64
    }

    async fn cluster_client(&self) -> Result<&Arc<dyn RpcClient>> {
        self.cluster_client
            .get_or_try_init(|| self.factory.build(self.cluster_endpoint.to_string()))
            .await
    }

    /// Ask any reachable cached endpoint for routes when the cluster
    /// endpoint itself is down, round-robin over the candidates.
    async fn fallback_route(
        &self,
        ctx: &RpcContext,
        req: RouteRequestPb,
    ) -> Result<horaedbproto::storage::RouteResponse> {
        let mut reserve_endpoints: Vec<Endpoint> = {
            let mut distinct: Vec<Endpoint> = Vec::new();
            for entry in self.cache.iter() {
                let endpoint = &entry.value().endpoint;
                if *endpoint != self.cluster_endpoint && !distinct.contains(endpoint) {
                    distinct.push(endpoint.clone());
                }
            }
            distinct
        };

        if reserve_endpoints.is_empty() {
            return Err(Error::RouteTable(
                "cluster endpoint is unreachable and no cached endpoint is available".to_string(),
            ));
        }

        let start = self.fallback_cursor.fetch_add(1, Ordering::Relaxed) % reserve_endpoints.len();
        reserve_endpoints.rotate_left(start);

        for endpoint in &reserve_endpoints {
            let client = match self.factory.build(endpoint.to_string()).await {
                Ok(client) => client,
                Err(e) => {
                    debug!(%endpoint, err = %e, "skip unreachable fallback endpoint");
                    continue;
                }
            };
            if !client.check_connection().await {
                continue;
            }

            match client.route(ctx, req.clone()).await {
                Ok(resp) => {
                    warn!(%endpoint, "routes refreshed through fallback endpoint");
                    return Ok(resp);
                }
                Err(e) => {
                    debug!(%endpoint, err = %e, "fallback endpoint failed to answer route");
                }
            }
        }

        Err(Error::RouteTable(
            "cluster endpoint is unreachable and all fallback endpoints failed".to_string(),
        ))
    }

    fn make_route_request(&self, ctx: &RpcContext, tables: &[String]) -> RouteRequestPb {
        let mut req = RouteRequestPb::default();
        req.context = Some(RequestContext {
            database: ctx.database.clone().unwrap_or_default(),
        });
        req.tables = tables.to_vec();
        req
    }

    #[cfg(test)]
    fn insert_route_at(&self, table: &str, endpoint: Endpoint, tick: i64) {
        self.cache.insert(
            table.to_string(),
            Arc::new(Route::new(table.to_string(), endpoint, tick)),
        );
    }
}

#[async_trait]
impl<F: RpcClientFactory> Router for RouterImpl<F> {
    async fn route_for(
        &self,
        ctx: &RpcContext,
        tables: &[String],
    ) -> Result<HashMap<String, Endpoint>> {
        if tables.is_empty() {
            return Ok(HashMap::new());
        }

        let now = self.now_tick();
        let mut resolved = HashMap::with_capacity(tables.len());
        let mut misses = Vec::new();
        for table in tables {
            match self.cache.get(table) {
                Some(route) => {
                    route.touch(now);
                    resolved.insert(table.clone(), route.endpoint.clone());
                }
                None => {
                    if !misses.contains(table) {
                        misses.push(table.clone());
                    }
                }
            }
        }

        if misses.is_empty() {
            return Ok(resolved);
        }

        match self.route_refresh_for(ctx, &misses).await {
            Ok(refreshed) => resolved.extend(refreshed),
            // The cluster explicitly refused, nothing to mask.
            Err(e @ Error::Server(_)) => {
                return Err(Error::RouteTable(format!(
                    "failed to refresh routes, err:{e}"
                )))
            }
            Err(e) => {
                warn!(err = %e, "route refresh failed, fall back to cluster endpoint");
            }
        }

        // Tables the refresh could not resolve are served by the cluster
        // endpoint. Not cached: the next call retries a real refresh.
        for table in misses {
            resolved
                .entry(table)
                .or_insert_with(|| self.cluster_endpoint.clone());
        }

        Ok(resolved)
    }

    async fn route_refresh_for(
        &self,
        ctx: &RpcContext,
        tables: &[String],
    ) -> Result<HashMap<String, Endpoint>> {
        let req = self.make_route_request(ctx, tables);

        let resp = {
            let cluster_result = match self.cluster_client().await {
                Ok(client) => client.route(ctx, req.clone()).await,
                Err(e) => Err(e),
            };
            match cluster_result {
                Ok(resp) => resp,
                Err(e) if is_unreachable(&e) => self.fallback_route(ctx, req).await?,
                Err(e) => return Err(e),
            }
        };

        let now = self.now_tick();
        let mut refreshed = HashMap::with_capacity(resp.routes.len());
        for route in resp.routes {
            // Endpoint may be none, don't cache it when it is.
            let endpoint = match route.endpoint {
                Some(endpoint_pb) => Endpoint::from(endpoint_pb),
                None => continue,
            };

            self.cache.insert(
                route.table.clone(),
                Arc::new(Route::new(route.table.clone(), endpoint.clone(), now)),
            );
            refreshed.insert(route.table, endpoint);
        }

        self.metrics
            .route_refreshed_size
            .observe(refreshed.len() as f64);
        self.metrics.route_cached_size.observe(self.cache.len() as f64);

        Ok(refreshed)
    }

    fn clear_route_cache_by(&self, tables: &[String]) {
        for table in tables {
            self.cache.remove(table.as_str());
        }
        if !tables.is_empty() {
            debug!(count = tables.len(), "invalidated cached routes");
        }
    }

    fn clear_route_cache(&self) {
        self.cache.clear();
    }

    fn gc(&self) {
        let timer = self.metrics.route_gc_timer.start_timer();
        let trigger = (self.max_cached_size as f64 * GC_TRIGGER_RATIO) as usize;

        let mut rounds: usize = 0;
        let mut stalled_rounds = 0;
        loop {
            let size = self.cache.len();
            if size < trigger.max(1) || stalled_rounds >= MAX_STALLED_GC_ROUNDS {
                break;
            }

            let evict_count = ((size as f64 * GC_EVICT_RATIO) as usize).max(1);
            let mut entries: Vec<(String, i64)> = self
                .cache
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().last_hit()))
                .collect();
            entries.sort_unstable_by_key(|(_, last_hit)| *last_hit);
            for (table, _) in entries.into_iter().take(evict_count) {
                self.cache.remove(&table);
            }

            self.metrics.route_gc_items.observe(evict_count as f64);
            rounds += 1;
            // Concurrent inserts may outpace eviction; give up once
            // eviction stops shrinking the cache.
            if self.cache.len() >= size {
                stalled_rounds += 1;
            } else {
                stalled_rounds = 0;
            }
        }

        self.metrics.route_gc_times.observe(rounds as f64);
        timer.observe_duration();
        if rounds > 0 {
            debug!(
                rounds,
                remaining = self.cache.len(),
                "route cache gc finished"
            );
        }
    }
}

fn is_unreachable(err: &Error) -> bool {
    match err {
        Error::Connect { .. } => true,
        Error::Rpc { source, .. } => matches!(
            source.code(),
            tonic::Code::Unavailable | tonic::Code::DeadlineExceeded
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dashmap::DashMap;

    use super::*;
    use crate::rpc_client::mock_rpc_client::{MockRpcClient, MockRpcClientFactory};

    fn make_router(
        cluster: Endpoint,
        max_cached_size: usize,
    ) -> (
        RouterImpl<MockRpcClientFactory>,
        Arc<MockRpcClient>,
        Arc<MockRpcClientFactory>,
    ) {
        let factory = Arc::new(MockRpcClientFactory::new());
        let cluster_client = Arc::new(MockRpcClient::with_route_table(Arc::new(DashMap::new())));
        factory.register(&cluster, cluster_client.clone());
        let metrics = Arc::new(Metrics::new().unwrap());
        let router = RouterImpl::new(cluster, factory.clone(), metrics, max_cached_size);
        (router, cluster_client, factory)
    }

    #[tokio::test]
    async fn test_basic_flow() {
        let cluster = Endpoint::new("192.168.0.5".to_string(), 15);
        let (router, cluster_client, _factory) = make_router(cluster.clone(), 100);

        let table1 = "table1".to_string();
        let table2 = "table2".to_string();
        let endpoint1 = Endpoint::new("192.168.0.1".to_string(), 11);
        let endpoint2 = Endpoint::new("192.168.0.2".to_string(), 12);
        let endpoint3 = Endpoint::new("192.168.0.3".to_string(), 13);

        cluster_client
            .route_table
            .insert(table1.clone(), endpoint1.clone());
        cluster_client
            .route_table
            .insert(table2.clone(), endpoint2.clone());

        let ctx = RpcContext::new("public");
        let tables = vec![table1.clone(), table2.clone()];

        // Follow these steps to check whether the cache is used or not:
        // route --> change route_table --> route again.
        let routes = router.route_for(&ctx, &tables).await.unwrap();
        assert_eq!(routes[&table1], endpoint1);
        assert_eq!(routes[&table2], endpoint2);

        cluster_client
            .route_table
            .insert(table1.clone(), endpoint3.clone());

        let routes = router.route_for(&ctx, &tables).await.unwrap();
        assert_eq!(routes[&table1], endpoint1, "cached route must win");

        router.clear_route_cache_by(&[table1.clone()]);
        let routes = router.route_for(&ctx, &tables).await.unwrap();
        assert_eq!(routes[&table1], endpoint3);
        assert_eq!(routes[&table2], endpoint2);
    }

    #[tokio::test]
    async fn test_unresolved_tables_fall_back_to_cluster() {
        let cluster = Endpoint::new("192.168.0.5".to_string(), 15);
        let (router, cluster_client, _factory) = make_router(cluster.clone(), 100);

        let ctx = RpcContext::new("public");
        let tables = vec!["unknown1".to_string(), "unknown2".to_string()];
        let routes = router.route_for(&ctx, &tables).await.unwrap();

        assert_eq!(routes["unknown1"], cluster);
        assert_eq!(routes["unknown2"], cluster);
        // Synthesized routes are not cached, so each call refreshes.
        assert_eq!(cluster_client.route_calls.load(std::sync::atomic::Ordering::Relaxed), 1);
        router.route_for(&ctx, &tables).await.unwrap();
        assert_eq!(cluster_client.route_calls.load(std::sync::atomic::Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_cached_hits_skip_refresh() {
        let cluster = Endpoint::new("192.168.0.5".to_string(), 15);
        let (router, cluster_client, _factory) = make_router(cluster.clone(), 100);

        let table = "table1".to_string();
        cluster_client
            .route_table
            .insert(table.clone(), Endpoint::new("192.168.0.1".to_string(), 11));

        let ctx = RpcContext::new("public");
        router.route_for(&ctx, &[table.clone()]).await.unwrap();
        router.route_for(&ctx, &[table.clone()]).await.unwrap();
        router.route_for(&ctx, &[table]).await.unwrap();

        assert_eq!(
            cluster_client
                .route_calls
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn test_gc_under_pressure_keeps_recent_routes() {
        let cluster = Endpoint::new("192.168.0.5".to_string(), 15);
        let (router, _cluster_client, _factory) = make_router(cluster.clone(), 100);

        let endpoint = Endpoint::new("192.168.0.1".to_string(), 11);
        // 200 routes with ascending last-hit ticks.
        for i in 0..200 {
            router.insert_route_at(&format!("table_{i:03}"), endpoint.clone(), i as i64);
        }

        router.gc();

        let remaining = router.cache.len();
        assert!(remaining < 75, "cache still holds {remaining} routes");
        // The survivors are the most recently hit ones.
        assert!(router.cache.contains_key("table_199"));
        assert!(!router.cache.contains_key("table_000"));
    }

    #[tokio::test]
    async fn test_gc_noop_below_trigger() {
        let cluster = Endpoint::new("192.168.0.5".to_string(), 15);
        let (router, _cluster_client, _factory) = make_router(cluster.clone(), 100);

        let endpoint = Endpoint::new("192.168.0.1".to_string(), 11);
        for i in 0..50 {
            router.insert_route_at(&format!("table_{i}"), endpoint.clone(), i as i64);
        }

        router.gc();
        assert_eq!(router.cache.len(), 50);
    }

    #[tokio::test]
    async fn test_fallback_endpoint_routing() {
        let cluster = Endpoint::new("192.168.0.5".to_string(), 15);
        let (router, cluster_client, factory) = make_router(cluster.clone(), 100);

        // A data endpoint that can also answer route requests.
        let data_endpoint = Endpoint::new("192.168.0.1".to_string(), 11);
        let data_client = Arc::new(MockRpcClient::with_route_table(Arc::new(DashMap::new())));
        let moved_endpoint = Endpoint::new("192.168.0.9".to_string(), 19);
        data_client
            .route_table
            .insert("table1".to_string(), moved_endpoint.clone());
        factory.register(&data_endpoint, data_client.clone());

        // Seed the cache so the fallback has a candidate, then take the
        // cluster endpoint down.
        router.insert_route_at("seed_table", data_endpoint.clone(), 0);
        cluster_client
            .reachable
            .store(false, std::sync::atomic::Ordering::Relaxed);

        let ctx = RpcContext::new("public");
        let refreshed = router
            .route_refresh_for(&ctx, &["table1".to_string()])
            .await
            .unwrap();

        assert_eq!(refreshed["table1"], moved_endpoint);
        assert!(
            data_client
                .route_calls
                .load(std::sync::atomic::Ordering::Relaxed)
                >= 1
        );
    }

    #[tokio::test]
    async fn test_refresh_fails_when_no_fallback_exists() {
        let cluster = Endpoint::new("192.168.0.5".to_string(), 15);
        let (router, cluster_client, _factory) = make_router(cluster.clone(), 100);
        cluster_client
            .reachable
            .store(false, std::sync::atomic::Ordering::Relaxed);

        let ctx = RpcContext::new("public");
        let res = router.route_refresh_for(&ctx, &["table1".to_string()]).await;
        assert!(matches!(res, Err(Error::RouteTable(_))));

        // route_for masks the failure by synthesizing the cluster route.
        let routes = router.route_for(&ctx, &["table1".to_string()]).await.unwrap();
        assert_eq!(routes["table1"], cluster);
    }
}
