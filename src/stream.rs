// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Stream adapters: the inbound byte source handed to applications for
//! `STDIN`/`DATA`, and the outbound record writer backing `STDOUT`/
//! `STDERR`.
//!
//! Inbound chunks are queued on an unbounded channel rather than a
//! bounded one. A bounded channel would give the application real
//! backpressure, but the single connection reader is the only producer
//! for every session on the connection; if that reader ever blocked
//! trying to push into a full channel for a session whose application
//! task has not started yet (still in `ReceivingParams`), every other
//! session on the same connection would stall behind it. Unbounded
//! avoids that head-of-line block at the cost of an unenforced memory
//! ceiling, which is acceptable for CGI-sized request bodies.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{self, AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use crate::conn::ConnWriter;
use crate::error::SessionError;
use crate::protocol::RecordType;

/// One item on an inbound stream's channel: either a chunk of record
/// content, or the explicit end-of-stream marker sent when the
/// zero-length closing record arrives. A marker, not reliance on the
/// sender being dropped, is what lets [`InboundStream::poll_read`]
/// report EOF: `stdin_tx`/`data_tx` live inside the session's
/// `SessionHandle` for as long as the session is in the connection's
/// table, which outlives the application task reading the stream to
/// completion (the table entry is only removed once that task returns).
enum InboundItem {
    Chunk(Bytes),
    End,
}

/// The producer half of an inbound stream, held by the connection loop.
#[derive(Clone)]
pub(crate) struct InboundSender {
    tx: mpsc::UnboundedSender<InboundItem>,
}

impl InboundSender {
    /// Forwards one record's content to the stream.
    pub(crate) fn push(&self, chunk: Bytes) {
        // Only fails if the application dropped its read half already,
        // which happens once the session is finalizing; there is
        // nothing further to deliver to in that case.
        let _ = self.tx.send(InboundItem::Chunk(chunk));
    }

    /// Marks the stream ended, for the zero-length closing record. The
    /// reader observes this as EOF once it has drained any chunks
    /// already queued ahead of it.
    pub(crate) fn close(&self) {
        let _ = self.tx.send(InboundItem::End);
    }
}

/// The consumer half: an [`AsyncRead`] the application reads as an
/// ordinary byte stream, ending at EOF when the zero-length record
/// arrived and [`InboundSender::close`] queued the end marker.
pub struct InboundStream {
    rx: mpsc::UnboundedReceiver<InboundItem>,
    current: Bytes,
    ended: bool,
}

/// Builds a connected sender/stream pair for one session's STDIN or DATA
/// substream.
pub(crate) fn inbound_pair() -> (InboundSender, InboundStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        InboundSender { tx },
        InboundStream {
            rx,
            current: Bytes::new(),
            ended: false,
        },
    )
}

impl AsyncRead for InboundStream {
    fn poll_read(
        mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.current.is_empty() {
                let n = buf.remaining().min(self.current.len());
                buf.put_slice(&self.current[..n]);
                self.current.advance(n);
                return Poll::Ready(Ok(()));
            }
            if self.ended {
                return Poll::Ready(Ok(()));
            }
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(InboundItem::Chunk(chunk))) => {
                    self.current = chunk;
                    continue;
                }
                Poll::Ready(Some(InboundItem::End)) | Poll::Ready(None) => {
                    self.ended = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// An outbound record stream (`STDOUT` or `STDERR`): buffers application
/// writes and flushes them as FastCGI stream records, respecting the
/// session's buffer-size setting and the closed/open discipline from
/// §4.5 of the runtime specification.
pub(crate) struct RecordWriter<W> {
    conn: std::sync::Arc<ConnWriter<W>>,
    request_id: u16,
    record_type: RecordType,
    buffer: Vec<u8>,
    buffer_size: usize,
    closed: bool,
    wrote_any: bool,
    /// STDERR suppresses its end-of-stream record when nothing was ever
    /// written (§9 open question); STDOUT always sends one.
    suppress_empty_close: bool,
}

impl<W: tokio::io::AsyncWrite + Unpin> RecordWriter<W> {
    pub(crate) fn new(
        conn: std::sync::Arc<ConnWriter<W>>, request_id: u16, record_type: RecordType,
        buffer_size: usize, suppress_empty_close: bool,
    ) -> Self {
        Self {
            conn,
            request_id,
            record_type,
            buffer: Vec::new(),
            buffer_size,
            closed: false,
            wrote_any: false,
            suppress_empty_close,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    /// Changes the chunking threshold; has no effect on bytes already
    /// buffered, only on when the next flush is triggered.
    pub(crate) fn set_buffer_size(&mut self, size: usize) {
        self.buffer_size = size.max(1);
    }

    pub(crate) async fn write(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::StreamClosed);
        }
        if data.is_empty() {
            return Ok(());
        }
        self.wrote_any = true;
        self.buffer.extend_from_slice(data);
        if self.buffer.len() >= self.buffer_size {
            self.flush_buffered().await?;
        }
        Ok(())
    }

    pub(crate) async fn flush(&mut self) -> Result<(), SessionError> {
        self.flush_buffered().await
    }

    async fn flush_buffered(&mut self) -> Result<(), SessionError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let payload = std::mem::take(&mut self.buffer);
        self.conn
            .write_stream(self.record_type, self.request_id, &payload)
            .await?;
        Ok(())
    }

    /// Flushes any buffered bytes and, unless this is an empty STDERR,
    /// emits the zero-length end-of-stream record. Idempotent.
    pub(crate) async fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        self.flush_buffered().await?;
        if self.wrote_any || !self.suppress_empty_close {
            self.conn
                .write_record(self.record_type, self.request_id, &[])
                .await?;
        }
        self.closed = true;
        Ok(())
    }
}
