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

//! The per-connection worker: reads records off one transport stream,
//! routes them to sessions, and owns the outbound record serializer
//! every session on this connection shares.

use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{self, AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::app::Outcome;
use crate::engine::EngineShared;
use crate::pool::ParamBufferPool;
use crate::protocol::{
    BadRecordFlags, BeginRequest, Header, ProtocolStatus, RecordType, decode_pair, encode_pair,
};
use crate::request::{Request, RequestInfo};
use crate::session::{AdmitError, SessionHandle, SessionState, SessionTable};
use crate::stream::inbound_pair;

/// The boxed transport write half every [`ConnWriter`] and [`crate::request::Request`]
/// in the public API is built around, so `Request` itself stays a
/// concrete, non-generic type usable from the object-safe [`crate::app::Application`]
/// trait regardless of which `Transport::Conn` accepted the connection.
pub(crate) type DynWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// The shared outbound half of a connection: every session writes
/// records through the same mutex so header, content, and padding for
/// one record are never interleaved with another session's bytes.
pub(crate) struct ConnWriter<W> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> ConnWriter<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub(crate) async fn write_record(
        &self, r#type: RecordType, request_id: u16, content: &[u8],
    ) -> io::Result<()> {
        let mut w = self.writer.lock().await;
        Header::write_record(&mut *w, r#type, request_id, content).await?;
        w.flush().await
    }

    pub(crate) async fn write_stream(
        &self, r#type: RecordType, request_id: u16, payload: &[u8],
    ) -> io::Result<()> {
        let mut w = self.writer.lock().await;
        Header::write_stream(&mut *w, r#type, request_id, payload).await?;
        w.flush().await
    }

    async fn write_end_request(
        &self, request_id: u16, app_status: i32, protocol_status: ProtocolStatus,
    ) -> io::Result<()> {
        let mut w = self.writer.lock().await;
        crate::protocol::write_end_request(&mut *w, request_id, app_status, protocol_status).await?;
        w.flush().await
    }

    async fn write_unknown_type(&self, request_id: u16, unknown_type: u8) -> io::Result<()> {
        let mut w = self.writer.lock().await;
        crate::protocol::write_unknown_type(&mut *w, request_id, unknown_type).await?;
        w.flush().await
    }

    async fn write_get_values_result(&self, pairs: &[(&str, &str)]) -> io::Result<()> {
        let mut content = Vec::new();
        for (name, value) in pairs {
            encode_pair(name.as_bytes(), value.as_bytes(), &mut content);
        }
        self.write_record(RecordType::GetValuesResult, 0, &content)
            .await
    }

    /// Half-closes the write side of the duplex: used to proactively
    /// close a non-keep-alive connection once its last session ends, and
    /// to close the duplex after a clean peer-initiated EOF once every
    /// in-flight session has finished.
    async fn shutdown(&self) -> io::Result<()> {
        let mut w = self.writer.lock().await;
        w.shutdown().await
    }
}

/// Which stream a content chunk belongs to; `PARAMS` is handled
/// differently from `STDIN`/`DATA` since it feeds a [`crate::params::ParamReader`]
/// rather than a byte channel.
enum StreamKind {
    Params,
    Stdin,
    Data,
}

/// One accepted transport connection. Held behind an `Arc` so spawned
/// session tasks can report completion back without a side channel.
pub(crate) struct Connection<S> {
    id: u64,
    shared: Arc<EngineShared>,
    writer: Arc<ConnWriter<DynWriter>>,
    sessions: Mutex<SessionTable>,
    pool: ParamBufferPool,
    /// Notified every time a session is removed from `sessions`, so the
    /// read loop can wait for in-flight sessions to drain after a clean
    /// peer EOF without polling the table on a timer.
    session_done: Notify,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub(crate) fn new(shared: Arc<EngineShared>, id: u64, stream: S) -> (Arc<Self>, ReadHalf<S>) {
        let (read_half, write_half) = io::split(stream);
        let conn = Arc::new(Self {
            id,
            sessions: Mutex::new(SessionTable::new(
                shared.max_sessions_per_connection,
                shared.global_session_count.clone(),
                shared.max_sessions,
            )),
            writer: Arc::new(ConnWriter::new(Box::new(write_half) as DynWriter)),
            pool: ParamBufferPool::new(),
            shared,
            session_done: Notify::new(),
        });
        (conn, read_half)
    }

    /// Drives the connection until the peer closes it or a transport
    /// error occurs.
    ///
    /// A fatal I/O error aborts every session still outstanding
    /// immediately, since the transport can no longer carry their
    /// output. A clean peer EOF is gentler: sessions whose application
    /// task is already dispatched are left to run to completion and emit
    /// their own `END_REQUEST`; any session still waiting on `PARAMS`
    /// that will now never arrive is evicted instead, since no task was
    /// ever dispatched for it to finish on its own. Only once every
    /// remaining session has finished does this method close the write
    /// half and return (§4.3 Termination).
    pub(crate) async fn serve(self: Arc<Self>, mut reader: ReadHalf<S>) {
        loop {
            match Header::read_from(&mut reader).await {
                Ok(Some(header)) => {
                    if let Err(error) = self.handle_record(header, &mut reader).await {
                        tracing::warn!(conn = self.id, %error, "connection closed after I/O error");
                        self.abort_all().await;
                        return;
                    }
                }
                Ok(None) => {
                    tracing::debug!(conn = self.id, "peer closed connection");
                    break;
                }
                Err(error) => {
                    tracing::warn!(conn = self.id, %error, "error reading record header");
                    self.abort_all().await;
                    return;
                }
            }
        }

        self.evict_undispatched_sessions().await;
        self.wait_for_sessions_to_drain().await;
        if let Err(error) = self.writer.shutdown().await {
            tracing::debug!(conn = self.id, %error, "error shutting down connection after clean EOF");
        }
    }

    /// Waits until every session has been removed from the table,
    /// i.e. every in-flight application task has finished and emitted
    /// its `END_REQUEST`.
    async fn wait_for_sessions_to_drain(self: &Arc<Self>) {
        loop {
            let done = self.session_done.notified();
            if self.sessions.lock().await.len() == 0 {
                return;
            }
            done.await;
        }
    }

    /// Removes every session still stuck in `Opening`/`ReceivingParams`
    /// when the connection ends. Those never had an application task
    /// dispatched, so nothing will ever call `finish_session` for them;
    /// left in the table, they would make `wait_for_sessions_to_drain`
    /// wait forever for an `END_REQUEST` that can never come.
    async fn evict_undispatched_sessions(self: &Arc<Self>) {
        let stuck: Vec<u16> = {
            let mut sessions = self.sessions.lock().await;
            let ids: Vec<u16> = sessions
                .ids()
                .filter(|&id| {
                    matches!(
                        sessions.get(id).map(|handle| handle.state),
                        Some(SessionState::Opening) | Some(SessionState::ReceivingParams)
                    )
                })
                .collect();
            for &id in &ids {
                sessions.remove(id);
            }
            ids
        };
        for id in stuck {
            tracing::warn!(conn = self.id, request_id = id, "connection ended before PARAMS closed, abandoning session");
            if let Err(error) = self
                .writer
                .write_end_request(id, -1, ProtocolStatus::RequestComplete)
                .await
            {
                tracing::debug!(conn = self.id, request_id = id, %error, "could not write END_REQUEST for abandoned session");
            }
        }
    }

    async fn handle_record(
        self: &Arc<Self>, header: Header, reader: &mut ReadHalf<S>,
    ) -> io::Result<()> {
        let flags = header.validate();
        if !flags.is_empty() {
            let _content = header.read_content(reader).await?;
            tracing::warn!(conn = self.id, request_id = header.request_id, ?flags, "rejected malformed record");
            if flags.contains(BadRecordFlags::UNKNOWN_TYPE) {
                if let RecordType::Other(byte) = header.r#type {
                    self.writer.write_unknown_type(header.request_id, byte).await?;
                }
            }
            return Ok(());
        }

        match header.r#type {
            RecordType::BeginRequest => self.on_begin_request(header, reader).await,
            RecordType::AbortRequest => {
                header.read_content(reader).await?;
                self.on_abort_request(header.request_id).await;
                Ok(())
            }
            RecordType::Params => self.on_stream_chunk(header, reader, StreamKind::Params).await,
            RecordType::Stdin => self.on_stream_chunk(header, reader, StreamKind::Stdin).await,
            RecordType::Data => self.on_stream_chunk(header, reader, StreamKind::Data).await,
            RecordType::GetValues => self.on_get_values(header, reader).await,
            // EndRequest/Stdout/Stderr/UnknownType are application->peer
            // only; a well-behaved peer never sends them. Consume and
            // ignore rather than tearing down the connection over it.
            _ => {
                header.read_content(reader).await?;
                Ok(())
            }
        }
    }

    async fn on_begin_request(
        self: &Arc<Self>, header: Header, reader: &mut ReadHalf<S>,
    ) -> io::Result<()> {
        let content = header.read_content(reader).await?;
        let id = header.request_id;

        let begin = match BeginRequest::decode(&content) {
            Ok(begin) => begin,
            Err(error) => {
                tracing::warn!(conn = self.id, request_id = id, %error, "malformed BEGIN_REQUEST");
                return Ok(());
            }
        };

        let mut sessions = self.sessions.lock().await;

        if sessions.contains(id) {
            drop(sessions);
            tracing::warn!(conn = self.id, request_id = id, "BEGIN_REQUEST for a live session id");
            return self
                .writer
                .write_end_request(id, -1, ProtocolStatus::CantMpxConn)
                .await;
        }

        let app = begin.role.and_then(|role| self.shared.roles.get(role));
        let Some(app) = app else {
            drop(sessions);
            return self
                .writer
                .write_end_request(id, 0, ProtocolStatus::UnknownRole)
                .await;
        };
        let role = begin.role.expect("role resolved to a registered application");

        if let Err(admit_error) = sessions.try_reserve() {
            drop(sessions);
            let status = match admit_error {
                AdmitError::NoMultiplexing => ProtocolStatus::CantMpxConn,
                AdmitError::Overloaded => ProtocolStatus::Overloaded,
            };
            return self.writer.write_end_request(id, -1, status).await;
        }

        let (stdin_tx, stdin_rx) = inbound_pair();
        let data_pair = matches!(role, crate::protocol::Role::Filter).then(inbound_pair);
        let data_tx = data_pair.as_ref().map(|(tx, _)| tx.clone());
        let data_rx = data_pair.map(|(_, rx)| rx);

        let _ = app;
        let handle = SessionHandle {
            role,
            keep_alive: begin.keep_alive,
            state: SessionState::Opening,
            params: Some(crate::params::ParamReader::new(self.pool.acquire())),
            stdin_tx,
            data_tx,
            stdin_rx: Some(stdin_rx),
            data_rx,
            cancel: CancellationToken::new(),
        };
        sessions.insert(id, handle);
        drop(sessions);

        tracing::debug!(conn = self.id, request_id = id, ?role, "session opened");

        // PARAMS may already be fully buffered by the time we learn the
        // stream closed (see on_stream_chunk), at which point the
        // session transitions straight to Running from there. Nothing
        // further to do here: the application task is dispatched by
        // on_stream_chunk once PARAMS finishes.
        Ok(())
    }

    async fn on_abort_request(self: &Arc<Self>, id: u16) {
        let mut sessions = self.sessions.lock().await;
        if let Some(handle) = sessions.get_mut(id) {
            tracing::debug!(conn = self.id, request_id = id, "session aborted by peer");
            handle.cancel.cancel();
        }
    }

    async fn on_stream_chunk(
        self: &Arc<Self>, header: Header, reader: &mut ReadHalf<S>, kind: StreamKind,
    ) -> io::Result<()> {
        let content = header.read_content(reader).await?;
        let id = header.request_id;
        let closing = content.is_empty();

        let mut sessions = self.sessions.lock().await;
        let Some(handle) = sessions.get_mut(id) else {
            // Unknown session: the record was already consumed above,
            // nothing further to do.
            return Ok(());
        };

        match kind {
            StreamKind::Stdin => {
                if closing {
                    handle.close_stdin();
                } else {
                    handle.deliver_stdin(Bytes::from(content));
                }
                return Ok(());
            }
            StreamKind::Data => {
                if closing {
                    handle.close_data();
                } else {
                    handle.deliver_data(Bytes::from(content));
                }
                return Ok(());
            }
            StreamKind::Params => {}
        }

        handle.state = SessionState::ReceivingParams;
        let Some(reader_acc) = handle.params.as_mut() else {
            return Ok(());
        };
        if !closing {
            if let Err(error) = reader_acc.append(&content) {
                tracing::warn!(conn = self.id, request_id = id, %error, "malformed PARAMS stream");
                let handle = sessions.remove(id).expect("just looked up");
                drop(sessions);
                self.pool.release(handle.params.map(|p| p.into_buf()).unwrap_or_default());
                return self
                    .writer
                    .write_end_request(id, -1, ProtocolStatus::RequestComplete)
                    .await;
            }
            return Ok(());
        }

        // Zero-length PARAMS record: finish accumulation and dispatch.
        let reader_acc = handle.params.take().expect("checked above");
        let (params, buf) = match reader_acc.finish() {
            Ok(parts) => parts,
            Err(error) => {
                tracing::warn!(conn = self.id, request_id = id, %error, "PARAMS stream left undecoded bytes");
                sessions.remove(id);
                drop(sessions);
                return self
                    .writer
                    .write_end_request(id, -1, ProtocolStatus::RequestComplete)
                    .await;
            }
        };
        self.pool.release(buf);

        let role = handle.role;
        let keep_alive = handle.keep_alive;
        let cancel = handle.cancel.clone();
        let stdin_rx = handle
            .stdin_rx
            .take()
            .expect("stdin reader is only taken once, at dispatch");
        let data_rx = handle.data_rx.take();
        handle.state = SessionState::Running;
        drop(sessions);

        let app = match self.shared.roles.get(role) {
            Some(app) => app,
            None => {
                // Role was registered when BEGIN_REQUEST was admitted;
                // it cannot have disappeared since the table is
                // immutable for the engine's lifetime.
                unreachable!("role table is immutable after engine construction")
            }
        };

        let info = RequestInfo {
            request_id: id,
            role,
            keep_alive,
        };
        let conn = self.clone();
        let writer = self.writer.clone();
        let buffer_size = self.shared.buffer_size;

        self.shared.executor.spawn(Box::pin(async move {
            let mut request = Request::new(info, params, stdin_rx, data_rx, writer, buffer_size, cancel);
            let outcome = tokio::select! {
                outcome = app.serve(&mut request) => outcome,
                _ = request.cancelled() => Outcome::Aborted,
            };
            conn.finish_session(id, request, outcome).await;
        }));

        Ok(())
    }

    async fn finish_session(
        self: Arc<Self>, id: u16, mut request: Request, outcome: Outcome,
    ) {
        let (app_status, status) = match outcome {
            Outcome::Completed(code) => (code, ProtocolStatus::RequestComplete),
            Outcome::Overloaded => (-1, ProtocolStatus::Overloaded),
            Outcome::Aborted => (-1, ProtocolStatus::RequestComplete),
            Outcome::Failed(message) => {
                if !request.headers_sent() {
                    let _ = request.set_status(501);
                    let _ = request
                        .write_stdout(format!("Internal server error: {message}").as_bytes())
                        .await;
                }
                let _ = request.write_stderr(message.as_bytes()).await;
                (-2, ProtocolStatus::RequestComplete)
            }
        };

        if let Err(error) = request.finalize().await {
            tracing::warn!(conn = self.id, request_id = id, %error, "error closing response streams");
        }

        if let Err(error) = self.writer.write_end_request(id, app_status, status).await {
            tracing::warn!(conn = self.id, request_id = id, %error, "error writing END_REQUEST");
        }

        let mut sessions = self.sessions.lock().await;
        sessions.remove(id);
        let sessions_remaining = sessions.len();
        drop(sessions);
        self.session_done.notify_waiters();

        let keep_alive = request.diagnostics().keep_alive;
        if !keep_alive && sessions_remaining == 0 {
            tracing::debug!(conn = self.id, request_id = id, "closing connection, keep-alive not set");
            if let Err(error) = self.writer.shutdown().await {
                tracing::warn!(conn = self.id, request_id = id, %error, "error shutting down connection after non-keep-alive session");
            }
        }
    }

    async fn on_get_values(
        self: &Arc<Self>, header: Header, reader: &mut ReadHalf<S>,
    ) -> io::Result<()> {
        let content = header.read_content(reader).await?;
        let mut names = Vec::new();
        let mut offset = 0;
        while offset < content.len() {
            match decode_pair(&content[offset..]) {
                Ok(Some((name, _value, consumed))) => {
                    names.push(name);
                    offset += consumed;
                }
                _ => break,
            }
        }

        let mut pairs = Vec::new();
        for name in &names {
            let value = match name.as_slice() {
                b"FCGI_MAX_CONNS" => self.shared.max_connections.map(|n| n.to_string()),
                b"FCGI_MAX_REQS" => self.shared.max_sessions.map(|n| n.to_string()),
                b"FCGI_MPXS_CONNS" => Some(
                    if self.shared.max_sessions_per_connection == Some(1) {
                        "0"
                    } else {
                        "1"
                    }
                    .to_string(),
                ),
                _ => None,
            };
            if let Some(value) = value {
                if let Ok(name) = std::str::from_utf8(name) {
                    pairs.push((name.to_string(), value));
                }
            }
        }
        if pairs.len() < names.len() {
            tracing::warn!(conn = self.id, "GET_VALUES_RESULT omitted unrecognized variable names");
        }

        let borrowed: Vec<(&str, &str)> = pairs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        self.writer.write_get_values_result(&borrowed).await
    }

    async fn abort_all(self: &Arc<Self>) {
        let sessions = self.sessions.lock().await;
        for id in sessions.ids() {
            if let Some(handle) = sessions.get(id) {
                handle.cancel.cancel();
            }
        }
    }
}
