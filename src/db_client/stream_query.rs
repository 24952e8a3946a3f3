// Copyright 2024 TSDB Project Authors. Licensed under Apache-2.0.

//! Blocking row iterator over a server-streaming query

use std::{
    sync::mpsc::{sync_channel, Receiver, RecvTimeoutError},
    time::Duration,
};

use futures::stream::{BoxStream, StreamExt};
use horaedbproto::storage::SqlQueryResponse as SqlQueryResponsePb;

use crate::{
    errors::{Error, Result},
    model::sql_query::{row::Row, Response as SqlQueryResponse},
};

/// Rows buffered between the rpc callbacks and the consumer. The pump
/// task stalls once the consumer falls this far behind.
const ROW_QUEUE_CAPACITY: usize = 1024;

/// Pull iterator over the rows of a streaming query.
///
/// Each `next` call blocks up to the configured timeout waiting for the
/// next row. A transport or server error ends the stream and surfaces as
/// the final item; hitting the timeout does the same.
pub struct SqlQueryRowIter {
    rx: Receiver<Result<Row>>,
    timeout: Duration,
    done: bool,
}

impl Iterator for SqlQueryRowIter {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.rx.recv_timeout(self.timeout) {
            Ok(Ok(row)) => Some(Ok(row)),
            Ok(Err(e)) => {
                self.done = true;
                Some(Err(e))
            }
            Err(RecvTimeoutError::Timeout) => {
                self.done = true;
                Some(Err(Error::Client(format!(
                    "timed out after {:?} waiting for next row",
                    self.timeout
                ))))
            }
            // Sender dropped: the stream completed.
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// Spawn the pump decoding streamed responses into rows.
pub(crate) fn spawn_row_pump(
    mut stream: BoxStream<'static, Result<SqlQueryResponsePb>>,
    timeout: Duration,
) -> SqlQueryRowIter {
    let (tx, rx) = sync_channel(ROW_QUEUE_CAPACITY);

    tokio::spawn(async move {
        while let Some(message) = stream.next().await {
            let decoded = message.and_then(SqlQueryResponse::try_from);
            match decoded {
                Ok(resp) => {
                    for row in resp.rows {
                        if tx.send(Ok(row)).is_err() {
                            // Consumer dropped the iterator.
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            }
        }
    });

    SqlQueryRowIter {
        rx,
        timeout,
        done: false,
    }
}
