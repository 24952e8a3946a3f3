// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Client-streaming write session

use std::sync::Arc;

use futures::{
    channel::mpsc::{channel, Sender},
    stream::StreamExt,
    SinkExt,
};
use horaedbproto::storage::{WriteRequest as WriteRequestPb, WriteResponse as WriteResponsePb};
use tokio::task::JoinHandle;

use crate::{
    db_client::inner::build_write_request_pb,
    errors::{Error, Result},
    model::write::{point::Point, Request as WriteRequest, Response as WriteResponse},
    rpc_client::{RpcClient, RpcContext},
};

/// Write requests buffered on the wire-side channel before backpressure
/// kicks in.
const CHANNEL_CAPACITY: usize = 64;

/// A client-streaming write session bound to one table's endpoint.
///
/// Points are buffered locally by [`write`](StreamWriter::write) and put
/// on the wire by [`flush`](StreamWriter::flush). The session half-closes
/// through [`completed`](StreamWriter::completed), which consumes the
/// writer and resolves to the server's aggregated response. Points for
/// other tables are accepted and sent to the session endpoint, the server
/// rejects them if it does not own those tables.
///
/// The server observes flushes in call order. A transport or server error
/// aborts the session; later flushes fail and `completed` surfaces the
/// cause.
pub struct StreamWriter {
    table: String,
    ctx: RpcContext,
    sender: Sender<WriteRequestPb>,
    buffer: WriteRequest,
    block_on_full: bool,
    response: JoinHandle<Result<WriteResponsePb>>,
}

impl StreamWriter {
    pub(crate) fn open(
        client: Arc<dyn RpcClient>,
        ctx: RpcContext,
        table: String,
        block_on_full: bool,
    ) -> Self {
        let (sender, receiver) = channel(CHANNEL_CAPACITY);
        let rpc_ctx = ctx.clone();
        let response =
            tokio::spawn(async move { client.stream_write(&rpc_ctx, receiver.boxed()).await });

        Self {
            table,
            ctx,
            sender,
            buffer: WriteRequest::default(),
            block_on_full,
            response,
        }
    }

    /// The table this session has affinity to.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Buffer `points` locally without flushing.
    pub fn write(&mut self, points: Vec<Point>) -> Result<()> {
        if self.sender.is_closed() {
            return Err(Error::IllegalState(
                "stream write session is closed".to_string(),
            ));
        }

        self.buffer.add_points(points);
        Ok(())
    }

    /// Buffer `points` and flush everything buffered so far.
    pub async fn write_and_flush(&mut self, points: Vec<Point>) -> Result<()> {
        self.write(points)?;
        self.flush().await
    }

    /// Put the buffered points on the wire.
    ///
    /// When the wire-side channel is full this either waits for capacity
    /// or fails fast with a flow control error, depending on
    /// `block_on_limit`.
    pub async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let req = std::mem::take(&mut self.buffer);
        let req_pb = build_write_request_pb(&self.ctx, &req);

        if self.block_on_full {
            self.sender
                .send(req_pb)
                .await
                .map_err(|_| session_aborted())
        } else {
            self.sender.try_send(req_pb).map_err(|e| {
                if e.is_full() {
                    Error::FlowControl("stream write buffer is full".to_string())
                } else {
                    session_aborted()
                }
            })
        }
    }

    /// Flush, half-close the stream and wait for the server's final
    /// response covering every accepted flush.
    pub async fn completed(mut self) -> Result<WriteResponse> {
        let flush_result = self.flush().await;
        self.sender.close_channel();

        match self.response.await {
            Ok(Ok(resp_pb)) => {
                // A final response does not cover a flush that never made
                // it onto the wire.
                flush_result?;
                Ok(WriteResponse::new(resp_pb.success, resp_pb.failed))
            }
            Ok(Err(e)) => Err(e),
            Err(join_err) => Err(Error::Unknown(format!(
                "stream write task failed, err:{join_err}"
            ))),
        }
    }
}

fn session_aborted() -> Error {
    Error::IllegalState("stream write session already aborted".to_string())
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use dashmap::DashMap;

    use super::*;
    use crate::{
        errors::ServerError,
        model::{value::Value, write::point::PointBuilder},
        rpc_client::mock_rpc_client::MockRpcClient,
        util::StatusCode,
    };

    fn sample_point(i: i64) -> Point {
        PointBuilder::new("machine_table".to_string())
            .timestamp(i)
            .tag("city".to_string(), Value::String("Beijing".to_string()))
            .field("cpu".to_string(), Value::Double(0.5))
            .build()
            .unwrap()
    }

    fn mock_client() -> Arc<MockRpcClient> {
        Arc::new(MockRpcClient::with_route_table(Arc::new(DashMap::new())))
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_thousand_flushes_complete_with_total() {
        let client = mock_client();
        let ctx = RpcContext::new("public");
        let mut writer = StreamWriter::open(client, ctx, "machine_table".to_string(), true);

        for i in 0..1000 {
            writer.write_and_flush(vec![sample_point(i)]).await.unwrap();
        }

        let resp = writer.completed().await.unwrap();
        assert_eq!(resp.success, 1000);
        assert_eq!(resp.failed, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_buffered_writes_flush_once() {
        let client = mock_client();
        let ctx = RpcContext::new("public");
        let mut writer = StreamWriter::open(client, ctx, "machine_table".to_string(), true);

        writer.write(vec![sample_point(1), sample_point(2)]).unwrap();
        writer.write(vec![sample_point(3)]).unwrap();
        // Nothing flushed yet; completed flushes the remainder.
        let resp = writer.completed().await.unwrap();
        assert_eq!(resp.success, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_empty_session_completes_with_zero() {
        let client = mock_client();
        let ctx = RpcContext::new("public");
        let writer = StreamWriter::open(client, ctx, "machine_table".to_string(), true);

        let resp = writer.completed().await.unwrap();
        assert_eq!(resp.success, 0);
        assert_eq!(resp.failed, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_server_abort_surfaces_on_completed() {
        let client = mock_client();
        client.set_write_handler(Arc::new(|_req| {
            Err(Error::Server(ServerError {
                code: StatusCode::InternalError.as_u32(),
                msg: "disk full".to_string(),
                endpoint: None,
            }))
        }));

        let ctx = RpcContext::new("public");
        let mut writer = StreamWriter::open(client, ctx, "machine_table".to_string(), true);
        writer.write_and_flush(vec![sample_point(1)]).await.unwrap();

        // Give the aborted session a moment to propagate, then further
        // writes are rejected.
        for _ in 0..50 {
            if writer.sender.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(matches!(
            writer.write(vec![sample_point(2)]),
            Err(Error::IllegalState(_))
        ));

        let res = writer.completed().await;
        assert!(matches!(res, Err(Error::Server(_))));
    }
}
