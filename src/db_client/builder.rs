// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Client builder

use std::{sync::Arc, time::Duration};

use crate::{
    db_client::{raw::RawImpl, route_based::RouteBasedImpl, ClientOptions, DbClient},
    metrics::Metrics,
    rpc_client::{RpcClientImplFactory, Tenant},
    Result, RpcConfig, RpcOptions,
};

/// Access mode to tsdb server(s).
#[derive(Debug, Clone)]
pub enum Mode {
    /// When accessing the cluster by `Direct` mode, requests are sent
    /// directly to the right instance determined by routing information.
    Direct,
    /// When accessing by `Proxy` mode, requests are just sent to the
    /// configured instance, which takes the responsibility for forwarding
    /// them.
    Proxy,
}

/// The builder for building [`DbClient`].
#[derive(Debug, Clone)]
pub struct Builder {
    mode: Mode,
    endpoint: String,
    rpc_config: RpcConfig,
    rpc_opts: RpcOptions,
    client_opts: ClientOptions,
}

#[allow(clippy::return_self_not_must_use)]
impl Builder {
    pub fn new(endpoint: String, mode: Mode) -> Self {
        Self {
            mode,
            endpoint,
            rpc_config: RpcConfig::default(),
            rpc_opts: RpcOptions::default(),
            client_opts: ClientOptions::default(),
        }
    }

    /// Database used when a request context does not name one.
    #[inline]
    pub fn default_database(mut self, default_database: impl Into<String>) -> Self {
        self.client_opts.default_database = Some(default_database.into());
        self
    }

    /// Tenant tuple attached to every request without an explicit one.
    #[inline]
    pub fn tenant(mut self, tenant: Tenant) -> Self {
        self.client_opts.default_tenant = Some(tenant);
        self
    }

    #[inline]
    pub fn rpc_config(mut self, rpc_config: RpcConfig) -> Self {
        self.rpc_config = rpc_config;
        self
    }

    #[inline]
    pub fn rpc_options(mut self, rpc_opts: RpcOptions) -> Self {
        self.client_opts.block_on_limit = rpc_opts.block_on_limit;
        self.rpc_opts = rpc_opts;
        self
    }

    /// Max automatic retries of a write on retriable server codes.
    #[inline]
    pub fn write_max_retries(mut self, retries: usize) -> Self {
        self.client_opts.write_max_retries = retries;
        self
    }

    /// Max automatic retries of a query on retriable server codes.
    #[inline]
    pub fn read_max_retries(mut self, retries: usize) -> Self {
        self.client_opts.read_max_retries = retries;
        self
    }

    /// Soft upper bound of the route cache, enforced by the scheduled gc.
    #[inline]
    pub fn max_cached_size(mut self, max_cached_size: usize) -> Self {
        self.client_opts.max_cached_size = max_cached_size;
        self
    }

    /// Period of the scheduled route cache gc, `None` disables it.
    #[inline]
    pub fn route_gc_period(mut self, period: Option<Duration>) -> Self {
        self.client_opts.route_gc_period = period;
        self
    }

    /// Populate the affected-table set in write responses.
    #[inline]
    pub fn collect_write_details(mut self, collect: bool) -> Self {
        self.client_opts.collect_write_details = collect;
        self
    }

    pub fn build(self) -> Result<Arc<dyn DbClient>> {
        let metrics = Arc::new(Metrics::new()?);
        let factory = Arc::new(RpcClientImplFactory::new(self.rpc_config, self.rpc_opts));

        let client: Arc<dyn DbClient> = match self.mode {
            Mode::Direct => Arc::new(RouteBasedImpl::new(
                factory,
                self.endpoint,
                self.client_opts,
                metrics,
            )),
            Mode::Proxy => Arc::new(RawImpl::new(
                factory,
                self.endpoint,
                self.client_opts,
                metrics,
            )),
        };

        Ok(client)
    }
}
