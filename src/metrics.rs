// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Client metrics
//!
//! Instrument names are a public contract for operators; renaming one is a
//! breaking change.

use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
};

use crate::errors::{Error, Result};

/// Metrics of one client instance, registered into a registry owned by the
/// client.
#[derive(Clone, Debug)]
pub struct Metrics {
    registry: Registry,

    // --- Route cache
    pub route_refreshed_size: Histogram,
    pub route_cached_size: Histogram,
    pub route_gc_times: Histogram,
    pub route_gc_items: Histogram,
    pub route_gc_timer: Histogram,

    // --- Dispatch
    pub write_duration: HistogramVec,
    pub sql_query_duration: HistogramVec,
    pub write_batch_size: Histogram,
    pub retries: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let route_refreshed_size = Histogram::with_opts(
            HistogramOpts::new(
                "route_for_tables_refreshed_size",
                "Tables refreshed from the cluster per route_for call",
            )
            .buckets(exponential_buckets(1.0, 2.0, 12).map_err(convert_err)?),
        )
        .map_err(convert_err)?;

        let route_cached_size = Histogram::with_opts(
            HistogramOpts::new(
                "route_for_tables_cached_size",
                "Route cache size observed after each refresh",
            )
            .buckets(exponential_buckets(1.0, 2.0, 16).map_err(convert_err)?),
        )
        .map_err(convert_err)?;

        let route_gc_times = Histogram::with_opts(
            HistogramOpts::new(
                "route_for_tables_gc_times",
                "Eviction rounds executed per gc run",
            )
            .buckets(vec![0.0, 1.0, 2.0, 3.0]),
        )
        .map_err(convert_err)?;

        let route_gc_items = Histogram::with_opts(
            HistogramOpts::new(
                "route_for_tables_gc_items",
                "Routes evicted per gc round",
            )
            .buckets(exponential_buckets(1.0, 2.0, 12).map_err(convert_err)?),
        )
        .map_err(convert_err)?;

        let route_gc_timer = Histogram::with_opts(HistogramOpts::new(
            "route_for_tables_gc_timer",
            "Duration of one gc run in seconds",
        ))
        .map_err(convert_err)?;

        let write_duration = HistogramVec::new(
            HistogramOpts::new("write_duration_seconds", "Write rpc duration per endpoint"),
            &["endpoint"],
        )
        .map_err(convert_err)?;

        let sql_query_duration = HistogramVec::new(
            HistogramOpts::new(
                "sql_query_duration_seconds",
                "Sql query rpc duration per endpoint",
            ),
            &["endpoint"],
        )
        .map_err(convert_err)?;

        let write_batch_size = Histogram::with_opts(
            HistogramOpts::new("write_batch_size", "Points per write sub-batch")
                .buckets(exponential_buckets(1.0, 4.0, 10).map_err(convert_err)?),
        )
        .map_err(convert_err)?;

        let retries = IntCounterVec::new(
            Opts::new("request_retries_total", "Retries per server status code"),
            &["code"],
        )
        .map_err(convert_err)?;

        for collector in [
            Box::new(route_refreshed_size.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(route_cached_size.clone()),
            Box::new(route_gc_times.clone()),
            Box::new(route_gc_items.clone()),
            Box::new(route_gc_timer.clone()),
            Box::new(write_duration.clone()),
            Box::new(sql_query_duration.clone()),
            Box::new(write_batch_size.clone()),
            Box::new(retries.clone()),
        ] {
            registry.register(collector).map_err(convert_err)?;
        }

        Ok(Self {
            registry,
            route_refreshed_size,
            route_cached_size,
            route_gc_times,
            route_gc_items,
            route_gc_timer,
            write_duration,
            sql_query_duration,
            write_batch_size,
            retries,
        })
    }

    /// The registry holding all instruments of this client, for scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

fn convert_err(e: prometheus::Error) -> Error {
    Error::Client(format!("failed to build metrics, err:{e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_names_registered() {
        let metrics = Metrics::new().unwrap();
        metrics.route_refreshed_size.observe(3.0);
        metrics.route_gc_items.observe(10.0);
        metrics.retries.with_label_values(&["302"]).inc();

        let encoded = prometheus::TextEncoder::new()
            .encode_to_string(&metrics.registry().gather())
            .unwrap();
        for name in [
            "route_for_tables_refreshed_size",
            "route_for_tables_cached_size",
            "route_for_tables_gc_times",
            "route_for_tables_gc_items",
            "route_for_tables_gc_timer",
        ] {
            assert!(encoded.contains(name), "missing {name}");
        }
    }
}
