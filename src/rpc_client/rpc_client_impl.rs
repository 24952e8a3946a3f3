// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Grpc implementation of [`RpcClient`]

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::stream::{BoxStream, StreamExt};
use horaedbproto::common::ResponseHeader;
use horaedbproto::storage::{
    storage_service_client::StorageServiceClient,
    RouteRequest as RouteRequestPb, RouteResponse as RouteResponsePb,
    SqlQueryRequest as SqlQueryRequestPb, SqlQueryResponse as SqlQueryResponsePb,
    WriteRequest as WriteRequestPb, WriteResponse as WriteResponsePb,
};
use tonic::{
    metadata::{AsciiMetadataValue, MetadataMap},
    transport::{Channel, Endpoint as TonicEndpoint},
    IntoStreamingRequest, Request,
};

use crate::{
    config::{RpcConfig, RpcOptions},
    errors::{Error, Result, ServerError},
    rpc_client::{limit::Limiter, RpcClient, RpcClientFactory, RpcContext},
    util::is_ok,
};

const RPC_HEADER_TENANT_KEY: &str = "x-tsdb-access-tenant";
const RPC_HEADER_SUB_TENANT_KEY: &str = "x-tsdb-access-sub-tenant";
const RPC_HEADER_TOKEN_KEY: &str = "x-tsdb-access-token";
const RPC_HEADER_AUTHORIZATION_KEY: &str = "authorization";

/// The implementation for [`RpcClient`] based on the grpc protocol, one
/// instance per endpoint, sharing one http2 channel and one adaptive
/// concurrency limiter.
pub struct RpcClientImpl {
    channel: Channel,
    endpoint: String,
    rpc_config: RpcConfig,
    limiter: Limiter,
}

impl RpcClientImpl {
    fn new(channel: Channel, endpoint: String, rpc_config: RpcConfig, rpc_opts: &RpcOptions) -> Self {
        let limiter = Limiter::new(rpc_opts, endpoint.clone());
        Self {
            channel,
            endpoint,
            rpc_config,
            limiter,
        }
    }

    fn make_request<T>(&self, ctx: &RpcContext, msg: T, default_timeout: Duration) -> Result<Request<T>> {
        let mut request = Request::new(msg);
        request.set_timeout(ctx.timeout.unwrap_or(default_timeout));
        self.fill_metadata(ctx, request.metadata_mut())?;

        Ok(request)
    }

    fn fill_metadata(&self, ctx: &RpcContext, metadata: &mut MetadataMap) -> Result<()> {
        if let Some(tenant) = &ctx.tenant {
            metadata.insert(RPC_HEADER_TENANT_KEY, parse_metadata_value(&tenant.tenant)?);
            if !tenant.sub_tenant.is_empty() {
                metadata.insert(
                    RPC_HEADER_SUB_TENANT_KEY,
                    parse_metadata_value(&tenant.sub_tenant)?,
                );
            }
            if !tenant.token.is_empty() {
                metadata.insert(RPC_HEADER_TOKEN_KEY, parse_metadata_value(&tenant.token)?);
            }
        }

        if let Some(auth) = &self.rpc_config.authorization {
            let encoded = BASE64.encode(format!("{}:{}", auth.username, auth.password));
            metadata.insert(
                RPC_HEADER_AUTHORIZATION_KEY,
                parse_metadata_value(&format!("Basic {encoded}"))?,
            );
        }

        Ok(())
    }

    fn check_header(&self, header: Option<ResponseHeader>) -> Result<()> {
        if let Some(header) = header {
            if !is_ok(header.code) {
                return Err(Error::Server(ServerError {
                    code: header.code,
                    msg: header.error,
                    endpoint: Some(self.endpoint.clone()),
                }));
            }
        }

        Ok(())
    }

    fn rpc_err(&self, status: tonic::Status) -> Error {
        Error::Rpc {
            endpoint: self.endpoint.clone(),
            source: status,
        }
    }
}

#[async_trait]
impl RpcClient for RpcClientImpl {
    async fn route(&self, ctx: &RpcContext, req: RouteRequestPb) -> Result<RouteResponsePb> {
        let permit = self.limiter.acquire().await?;
        let request = self.make_request(ctx, req, self.rpc_config.default_write_timeout)?;

        let mut client = StorageServiceClient::new(self.channel.clone());
        let result = client.route(request).await;
        match result {
            Ok(resp) => {
                permit.success();
                let resp = resp.into_inner();
                self.check_header(resp.header.clone())?;
                Ok(resp)
            }
            Err(status) => {
                permit.failure();
                Err(self.rpc_err(status))
            }
        }
    }

    async fn write(&self, ctx: &RpcContext, req: WriteRequestPb) -> Result<WriteResponsePb> {
        let permit = self.limiter.acquire().await?;
        let request = self.make_request(ctx, req, self.rpc_config.default_write_timeout)?;

        let mut client = StorageServiceClient::new(self.channel.clone());
        match client.write(request).await {
            Ok(resp) => {
                permit.success();
                let resp = resp.into_inner();
                self.check_header(resp.header.clone())?;
                Ok(resp)
            }
            Err(status) => {
                permit.failure();
                Err(self.rpc_err(status))
            }
        }
    }

    async fn sql_query(
        &self,
        ctx: &RpcContext,
        req: SqlQueryRequestPb,
    ) -> Result<SqlQueryResponsePb> {
        let permit = self.limiter.acquire().await?;
        let request = self.make_request(ctx, req, self.rpc_config.default_sql_query_timeout)?;

        let mut client = StorageServiceClient::new(self.channel.clone());
        match client.sql_query(request).await {
            Ok(resp) => {
                permit.success();
                let resp = resp.into_inner();
                self.check_header(resp.header.clone())?;
                Ok(resp)
            }
            Err(status) => {
                permit.failure();
                Err(self.rpc_err(status))
            }
        }
    }

    fn stream_write<'life0, 'life1, 'async_trait>(
        &'life0 self,
        ctx: &'life1 RpcContext,
        requests: BoxStream<'static, WriteRequestPb>,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<WriteResponsePb>> + Send + 'async_trait>,
    >
    where
        Self: Sync + 'async_trait,
        'life0: 'async_trait,
        'life1: 'async_trait,
    {
        let ctx = ctx.clone();
        Box::pin(do_stream_write(self, ctx, requests))
    }

    async fn stream_sql_query(
        &self,
        ctx: &RpcContext,
        req: SqlQueryRequestPb,
    ) -> Result<BoxStream<'static, Result<SqlQueryResponsePb>>> {
        let permit = self.limiter.acquire().await?;
        let request = self.make_request(ctx, req, self.rpc_config.default_sql_query_timeout)?;

        let mut client = StorageServiceClient::new(self.channel.clone());
        match client.stream_sql_query(request).await {
            Ok(resp) => {
                permit.success();
                let endpoint = self.endpoint.clone();
                let stream = resp
                    .into_inner()
                    .map(move |message| match message {
                        Ok(resp_pb) => {
                            if let Some(header) = &resp_pb.header {
                                if !is_ok(header.code) {
                                    return Err(Error::Server(ServerError {
                                        code: header.code,
                                        msg: header.error.clone(),
                                        endpoint: Some(endpoint.clone()),
                                    }));
                                }
                            }
                            Ok(resp_pb)
                        }
                        Err(status) => Err(Error::Rpc {
                            endpoint: endpoint.clone(),
                            source: status,
                        }),
                    })
                    .boxed();
                Ok(stream)
            }
            Err(status) => {
                permit.failure();
                Err(self.rpc_err(status))
            }
        }
    }

    async fn check_connection(&self) -> bool {
        let connect = tokio::net::TcpStream::connect(&self.endpoint);
        matches!(
            tokio::time::timeout(self.rpc_config.connect_timeout, connect).await,
            Ok(Ok(_))
        )
    }
}

fn do_stream_write<'a>(
    this: &'a RpcClientImpl,
    ctx: RpcContext,
    requests: BoxStream<'static, WriteRequestPb>,
) -> impl std::future::Future<Output = Result<WriteResponsePb>> + Send + 'a {
    async move {
        let ctx = &ctx;
        let permit = this.limiter.acquire().await?;

        let mut request = requests.into_streaming_request();
        if let Some(timeout) = ctx.timeout {
            request.set_timeout(timeout);
        }
        this.fill_metadata(ctx, request.metadata_mut())?;

        let mut client = StorageServiceClient::new(this.channel.clone());
        match client.stream_write(request).await {
            Ok(resp) => {
                permit.success();
                let resp = resp.into_inner();
                this.check_header(resp.header.clone())?;
                Ok(resp)
            }
            Err(status) => {
                permit.failure();
                Err(this.rpc_err(status))
            }
        }
    }
}

fn parse_metadata_value(value: &str) -> Result<AsciiMetadataValue> {
    value
        .parse()
        .map_err(|e| Error::Client(format!("invalid rpc metadata value:{value}, err:{e}")))
}

/// Builder for [`RpcClientImpl`]s, one per endpoint.
pub struct RpcClientImplFactory {
    rpc_config: RpcConfig,
    rpc_opts: RpcOptions,
}

impl RpcClientImplFactory {
    pub fn new(rpc_config: RpcConfig, rpc_opts: RpcOptions) -> Self {
        Self {
            rpc_config,
            rpc_opts,
        }
    }

    #[inline]
    fn make_endpoint_url(endpoint: &str) -> String {
        format!("http://{endpoint}")
    }
}

#[async_trait]
impl RpcClientFactory for RpcClientImplFactory {
    /// Establish a channel to `endpoint` and wrap it into an
    /// [`RpcClient`].
    ///
    /// Building is not cached here, callers hold on to the built client
    /// per endpoint.
    async fn build(&self, endpoint: String) -> Result<Arc<dyn RpcClient>> {
        let url = Self::make_endpoint_url(&endpoint);
        let channel = TonicEndpoint::from_shared(url)
            .map_err(|e| Error::Connect {
                addr: endpoint.clone(),
                source: e,
            })?
            .connect_timeout(self.rpc_config.connect_timeout)
            .http2_keep_alive_interval(self.rpc_config.keep_alive_interval)
            .keep_alive_timeout(self.rpc_config.keep_alive_timeout)
            .keep_alive_while_idle(self.rpc_config.keep_alive_while_idle)
            .connect()
            .await
            .map_err(|e| Error::Connect {
                addr: endpoint.clone(),
                source: e,
            })?;

        Ok(Arc::new(RpcClientImpl::new(
            channel,
            endpoint,
            self.rpc_config.clone(),
            &self.rpc_opts,
        )))
    }
}
