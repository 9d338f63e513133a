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

//! The engine facade: the `Transport` collaborator contract, a builder
//! that wires up registered role applications and capacity limits, and
//! the accept loop that turns transport connections into running
//! [`crate::conn::Connection`]s.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures_core::Stream;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};

use crate::app::{Application, RoleTable};
use crate::conn::Connection;
use crate::error::EngineError;
use crate::executor::{SessionExecutor, SpawnExecutor, WorkerPoolExecutor};
use crate::ids;
use crate::protocol::Role;

/// The transport collaborator: a stream of accepted connections. The
/// core never opens a listening socket itself (§6); it only consumes
/// whatever `Transport` hands it.
///
/// Each item is a freshly accepted duplex connection paired with a
/// description string used for tracing (peer address, socket path, …).
/// Peer authorization and connection-count enforcement (`MAX_CONN`) are
/// the responsibility of whoever builds the `Transport`, not of this
/// trait or of [`Engine`].
pub trait Transport: Stream<Item = std::io::Result<(Self::Conn, String)>> + Unpin + Send {
    /// The duplex connection type yielded by this transport.
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;
}

/// A `Transport` over a [`tokio::net::TcpListener`]. Performs no peer
/// filtering; every accepted connection is handed to the engine.
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    pub fn new(listener: TcpListener) -> Self {
        Self { listener }
    }
}

impl Stream for TcpTransport {
    type Item = std::io::Result<(TcpStream, String)>;

    fn poll_next(
        self: Pin<&mut Self>, cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        match self.listener.poll_accept(cx) {
            std::task::Poll::Ready(Ok((stream, addr))) => {
                std::task::Poll::Ready(Some(Ok((stream, addr.to_string()))))
            }
            std::task::Poll::Ready(Err(error)) => std::task::Poll::Ready(Some(Err(error))),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl Transport for TcpTransport {
    type Conn = TcpStream;
}

/// A `Transport` over a [`tokio::net::UnixListener`]. Performs no peer
/// filtering; every accepted connection is handed to the engine.
pub struct UnixTransport {
    listener: UnixListener,
}

impl UnixTransport {
    pub fn new(listener: UnixListener) -> Self {
        Self { listener }
    }
}

impl Stream for UnixTransport {
    type Item = std::io::Result<(UnixStream, String)>;

    fn poll_next(
        self: Pin<&mut Self>, cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        match self.listener.poll_accept(cx) {
            std::task::Poll::Ready(Ok((stream, addr))) => {
                let label = addr
                    .as_pathname()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "unix:unnamed".to_string());
                std::task::Poll::Ready(Some(Ok((stream, label))))
            }
            std::task::Poll::Ready(Err(error)) => std::task::Poll::Ready(Some(Err(error))),
            std::task::Poll::Pending => std::task::Poll::Pending,
        }
    }
}

impl Transport for UnixTransport {
    type Conn = UnixStream;
}

/// Configuration and role registrations shared, read-only, by every
/// connection and session the engine spawns.
pub(crate) struct EngineShared {
    pub(crate) roles: RoleTable,
    pub(crate) max_connections: Option<usize>,
    pub(crate) max_sessions: Option<usize>,
    pub(crate) max_sessions_per_connection: Option<usize>,
    pub(crate) global_session_count: Arc<AtomicUsize>,
    pub(crate) buffer_size: usize,
    pub(crate) executor: Arc<dyn SessionExecutor>,
}

/// Default `STDOUT`/`STDERR` chunking threshold: 8 KiB.
const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// How session application tasks are dispatched (§5): one task per
/// session, or a fixed pool of workers draining a shared queue.
enum ExecutorKind {
    PerSession,
    WorkerPool(usize),
}

/// Builds an [`Engine`] by registering role applications and capacity
/// limits. Mirrors the shape of a plain config struct rather than an
/// external file format or env-loader (§10.3): the embedding binary is
/// free to source these values from wherever it likes before calling
/// into this builder.
pub struct EngineBuilder {
    roles: RoleTable,
    max_connections: Option<usize>,
    max_sessions: Option<usize>,
    max_sessions_per_connection: Option<usize>,
    buffer_size: usize,
    executor: ExecutorKind,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            roles: RoleTable::default(),
            max_connections: None,
            max_sessions: None,
            max_sessions_per_connection: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            executor: ExecutorKind::PerSession,
        }
    }

    /// Registers the `RESPONDER` role implementation.
    pub fn responder(mut self, app: impl Application) -> Self {
        self.roles.set(Role::Responder, Arc::new(app));
        self
    }

    /// Registers the `AUTHORIZER` role implementation.
    pub fn authorizer(mut self, app: impl Application) -> Self {
        self.roles.set(Role::Authorizer, Arc::new(app));
        self
    }

    /// Registers the `FILTER` role implementation.
    pub fn filter(mut self, app: impl Application) -> Self {
        self.roles.set(Role::Filter, Arc::new(app));
        self
    }

    /// `MAX_CONN`: advertised via `FCGI_MAX_CONNS`. Not enforced here —
    /// the transport acceptor is responsible for capping concurrent
    /// connections (§4.4).
    pub fn max_connections(mut self, n: usize) -> Self {
        self.max_connections = Some(n);
        self
    }

    /// `MAX_SESS`: global cap on concurrent sessions across every
    /// connection, advertised via `FCGI_MAX_REQS`.
    pub fn max_sessions(mut self, n: usize) -> Self {
        self.max_sessions = Some(n);
        self
    }

    /// `MAX_SESS_PER_CONN`: per-connection session cap. `1` makes the
    /// connection advertise no multiplexing (`FCGI_MPXS_CONNS=0`).
    pub fn max_sessions_per_connection(mut self, n: usize) -> Self {
        self.max_sessions_per_connection = Some(n);
        self
    }

    /// Sets the initial `STDOUT`/`STDERR` buffer size directly, in bytes.
    pub fn buffer_size_bytes(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Sets the initial buffer size from a `BUFFER_SIZE`-style string: a
    /// plain byte count or a number with a `k`/`m`/`g` suffix
    /// (case-insensitive), e.g. `"64k"`, `"4M"`.
    pub fn buffer_size(mut self, input: &str) -> Result<Self, EngineError> {
        self.buffer_size = parse_buffer_size(input)?;
        Ok(self)
    }

    /// Runs every session on a fixed pool of `workers` long-lived tasks
    /// instead of spawning one task per session.
    pub fn worker_pool(mut self, workers: usize) -> Self {
        self.executor = ExecutorKind::WorkerPool(workers);
        self
    }

    /// Finishes construction. Fails only if no role was registered at
    /// all — an engine with nothing to dispatch to can never be a valid
    /// configuration.
    pub fn build(self) -> Result<Engine, EngineError> {
        if self.roles.is_empty() {
            return Err(EngineError::NoRolesConfigured);
        }
        let executor: Arc<dyn SessionExecutor> = match self.executor {
            ExecutorKind::PerSession => Arc::new(SpawnExecutor),
            ExecutorKind::WorkerPool(workers) => Arc::new(WorkerPoolExecutor::new(workers)),
        };
        let shared = Arc::new(EngineShared {
            roles: self.roles,
            max_connections: self.max_connections,
            max_sessions: self.max_sessions,
            max_sessions_per_connection: self.max_sessions_per_connection,
            global_session_count: Arc::new(AtomicUsize::new(0)),
            buffer_size: self.buffer_size,
            executor,
        });
        Ok(Engine {
            shared,
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Parses a `BUFFER_SIZE`-style string: digits optionally followed by a
/// `k`/`m`/`g` suffix (case-insensitive, powers of 1024).
fn parse_buffer_size(input: &str) -> Result<usize, EngineError> {
    let trimmed = input.trim();
    let bad = |reason: &str| EngineError::InvalidBufferSize {
        input: input.to_string(),
        reason: reason.to_string(),
    };
    if trimmed.is_empty() {
        return Err(bad("empty string"));
    }
    let (digits, multiplier) = match trimmed.as_bytes()[trimmed.len() - 1] {
        b'k' | b'K' => (&trimmed[..trimmed.len() - 1], 1024),
        b'm' | b'M' => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        b'g' | b'G' => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed, 1),
    };
    let base: usize = digits.parse().map_err(|_| bad("not a number"))?;
    base.checked_mul(multiplier).ok_or_else(|| bad("overflows usize"))
}

/// A handle that requests the engine stop accepting new connections.
/// Existing connections and sessions are unaffected; they run to
/// completion on their own.
#[derive(Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

/// The running engine: accepts connections from a [`Transport`] and
/// spawns one worker per connection. Exposes only the two observable
/// surfaces the runtime specification calls for (§7): "process another
/// unit of work" (here, [`Engine::serve`]'s internal loop, which stops
/// once the transport ends or [`StopHandle::stop`] was called) and
/// "fatal engine configuration failure" ([`EngineBuilder::build`],
/// startup only).
pub struct Engine {
    shared: Arc<EngineShared>,
    stopped: Arc<AtomicBool>,
}

impl Engine {
    /// Returns a handle that can ask a running [`Engine::serve`] call to
    /// stop accepting new connections.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stopped: self.stopped.clone(),
        }
    }

    /// Accepts connections from `transport` until it ends or a stop is
    /// requested, spawning one worker task per connection. Each
    /// connection's errors are confined to that connection (§7); this
    /// method itself only returns once the engine has decided to stop.
    pub async fn serve<T: Transport>(&self, mut transport: T) -> Result<(), EngineError> {
        loop {
            if self.stopped.load(Ordering::Acquire) {
                tracing::debug!("engine stop requested, no longer accepting connections");
                return Ok(());
            }
            match transport.next().await {
                Some(Ok((stream, description))) => {
                    let id = ids::next_conn_id();
                    tracing::debug!(conn = id, peer = %description, "accepted connection");
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        let (connection, reader) = Connection::new(shared, id, stream);
                        connection.serve(reader).await;
                    });
                }
                Some(Err(error)) => {
                    tracing::warn!(%error, "transport accept error");
                }
                None => {
                    tracing::debug!("transport exhausted, engine stopping");
                    return Ok(());
                }
            }
        }
    }
}
