// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! [Endpoint] and the cached [Route] pointing at it

use std::{
    fmt::Display,
    str::FromStr,
    sync::atomic::{AtomicI64, Ordering},
};

use horaedbproto::storage::Endpoint as EndpointPb;

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct Endpoint {
    pub addr: String,
    pub port: u32,
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}:{}", self.addr, self.port))
    }
}

impl Endpoint {
    pub fn new(addr: String, port: u32) -> Self {
        Self { addr, port }
    }
}

impl FromStr for Endpoint {
    type Err = Box<dyn std::error::Error + Send + Sync>;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (addr, raw_port) = match s.rsplit_once(':') {
            Some(v) => v,
            None => {
                let err_msg = "Can't find ':' in the source string".to_string();
                return Err(Self::Err::from(err_msg));
            }
        };

        if addr.is_empty() {
            let err_msg = "Empty addr in the source string".to_string();
            return Err(Self::Err::from(err_msg));
        }

        let port = raw_port.parse().map_err(|e| {
            let err_msg = format!("Fail to parse port:{raw_port}, err:{e}");
            Self::Err::from(err_msg)
        })?;
        if port > u16::MAX as u32 {
            let err_msg = "Too large port (<=65536)".to_string();
            return Err(Self::Err::from(err_msg));
        }

        Ok(Endpoint {
            addr: addr.to_string(),
            port,
        })
    }
}

impl From<EndpointPb> for Endpoint {
    fn from(endpoint_pb: EndpointPb) -> Self {
        Self {
            addr: endpoint_pb.ip,
            port: endpoint_pb.port,
        }
    }
}

impl From<Endpoint> for EndpointPb {
    fn from(endpoint: Endpoint) -> Self {
        Self {
            ip: endpoint.addr,
            port: endpoint.port,
        }
    }
}

/// One cached table -> endpoint mapping with the millisecond tick of its
/// last cache hit, which drives least-recently-hit eviction.
#[derive(Debug)]
pub struct Route {
    pub table: String,
    pub endpoint: Endpoint,
    last_hit: AtomicI64,
}

impl Route {
    pub fn new(table: String, endpoint: Endpoint, now: i64) -> Self {
        Self {
            table,
            endpoint,
            last_hit: AtomicI64::new(now),
        }
    }

    pub fn last_hit(&self) -> i64 {
        self.last_hit.load(Ordering::Acquire)
    }

    /// Push `last_hit` forward to `now` with a single compare-and-set
    /// attempt. On contention the update is dropped, eviction only needs
    /// approximate recency ordering.
    pub fn touch(&self, now: i64) {
        let seen = self.last_hit.load(Ordering::Relaxed);
        if now > seen {
            let _ = self
                .last_hit
                .compare_exchange(seen, now, Ordering::Release, Ordering::Relaxed);
        }
    }
}
