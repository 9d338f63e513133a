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

//! Per-session bookkeeping: the request-id-keyed table a connection keeps
//! for its live sessions, and the lifecycle state each entry moves
//! through.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::params::ParamReader;
use crate::protocol::Role;
use crate::stream::{InboundSender, InboundStream};

/// Where a session sits in its lifecycle. Tracked mainly so the
/// connection loop can log meaningful transitions and so `ABORT_REQUEST`
/// can tell a session that never dispatched an application task apart
/// from one that already finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    /// `BEGIN_REQUEST` accepted, no `PARAMS` seen yet.
    Opening,
    /// At least one `PARAMS` record has arrived; the stream is still
    /// open.
    ReceivingParams,
    /// `PARAMS` closed, parameters frozen, application task dispatched.
    Running,
    /// The application task returned (or was aborted); `END_REQUEST` is
    /// in flight or already sent.
    Finalizing,
}

/// Everything the connection loop needs to route records for one live
/// request, plus the cancellation handle the dispatched application task
/// watches.
pub(crate) struct SessionHandle {
    pub(crate) role: Role,
    pub(crate) keep_alive: bool,
    pub(crate) state: SessionState,
    /// Present while accumulating `PARAMS`; taken and consumed once the
    /// stream closes.
    pub(crate) params: Option<ParamReader>,
    pub(crate) stdin_tx: InboundSender,
    /// Only populated for the `Filter` role.
    pub(crate) data_tx: Option<InboundSender>,
    /// The reader halves of `stdin_tx`/`data_tx`, held here from
    /// `BEGIN_REQUEST` until `PARAMS` closes and the application task is
    /// dispatched, at which point the connection loop takes them to build
    /// the [`crate::request::Request`].
    pub(crate) stdin_rx: Option<InboundStream>,
    pub(crate) data_rx: Option<InboundStream>,
    pub(crate) cancel: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn deliver_stdin(&self, chunk: Bytes) {
        self.stdin_tx.push(chunk);
    }

    /// Marks STDIN ended, for the zero-length closing record.
    pub(crate) fn close_stdin(&self) {
        self.stdin_tx.close();
    }

    pub(crate) fn deliver_data(&self, chunk: Bytes) {
        if let Some(tx) = &self.data_tx {
            tx.push(chunk);
        }
    }

    /// Marks DATA ended, for the zero-length closing record. A no-op for
    /// non-`Filter` sessions, which never have a `data_tx`.
    pub(crate) fn close_data(&self) {
        if let Some(tx) = &self.data_tx {
            tx.close();
        }
    }
}

/// The live sessions on one connection, plus the bookkeeping needed to
/// enforce the per-connection and process-wide session caps.
pub(crate) struct SessionTable {
    sessions: HashMap<u16, SessionHandle>,
    max_per_conn: Option<usize>,
    global_count: Arc<AtomicUsize>,
    global_max: Option<usize>,
}

/// Why a `BEGIN_REQUEST` could not be admitted; carries enough
/// information for the connection loop to pick the right `END_REQUEST`
/// protocol status. Collision and role resolution are checked by the
/// caller before reaching capacity admission (see
/// [`SessionTable::try_reserve`]), matching the order the runtime
/// specification lays out: id collision, then unimplemented role, then
/// capacity.
pub(crate) enum AdmitError {
    /// The connection (or the engine as a whole) declared it cannot
    /// multiplex and a session is already active.
    NoMultiplexing,
    /// A capacity limit (per-connection or global) was reached.
    Overloaded,
}

impl SessionTable {
    pub(crate) fn new(
        max_per_conn: Option<usize>, global_count: Arc<AtomicUsize>, global_max: Option<usize>,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            max_per_conn,
            global_count,
            global_max,
        }
    }

    pub(crate) fn get_mut(&mut self, id: u16) -> Option<&mut SessionHandle> {
        self.sessions.get_mut(&id)
    }

    pub(crate) fn get(&self, id: u16) -> Option<&SessionHandle> {
        self.sessions.get(&id)
    }

    pub(crate) fn contains(&self, id: u16) -> bool {
        self.sessions.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Reserves a capacity slot for a new session, once the caller has
    /// already confirmed the request id does not collide with a live
    /// session and the declared role resolved to a registered handler.
    pub(crate) fn try_reserve(&mut self) -> Result<(), AdmitError> {
        if self.max_per_conn == Some(1) && !self.sessions.is_empty() {
            return Err(AdmitError::NoMultiplexing);
        }
        if let Some(cap) = self.max_per_conn {
            if self.sessions.len() >= cap {
                return Err(AdmitError::Overloaded);
            }
        }
        if let Some(cap) = self.global_max {
            // Optimistic increment-then-check: harmless overshoot by at
            // most (connection count) under contention, corrected by the
            // caller calling `release` when this admission is rejected.
            let prev = self.global_count.fetch_add(1, Ordering::AcqRel);
            if prev >= cap {
                self.global_count.fetch_sub(1, Ordering::AcqRel);
                return Err(AdmitError::Overloaded);
            }
        }
        Ok(())
    }

    pub(crate) fn insert(&mut self, id: u16, handle: SessionHandle) {
        self.sessions.insert(id, handle);
    }

    /// Removes a session, releasing its slot in the global counter if one
    /// was ever reserved for it (i.e. the table was built with a global
    /// cap in the first place).
    pub(crate) fn remove(&mut self, id: u16) -> Option<SessionHandle> {
        let removed = self.sessions.remove(&id);
        if removed.is_some() && self.global_max.is_some() {
            self.global_count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.sessions.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::inbound_pair;

    fn handle() -> SessionHandle {
        let (stdin_tx, stdin_rx) = inbound_pair();
        SessionHandle {
            role: Role::Responder,
            keep_alive: false,
            state: SessionState::Opening,
            params: None,
            stdin_tx,
            data_tx: None,
            stdin_rx: Some(stdin_rx),
            data_rx: None,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn detects_duplicate_request_id() {
        let mut table = SessionTable::new(None, Arc::new(AtomicUsize::new(0)), None);
        table.insert(1, handle());
        assert!(table.contains(1));
    }

    #[test]
    fn no_multiplexing_rejects_second_concurrent_session() {
        let mut table = SessionTable::new(Some(1), Arc::new(AtomicUsize::new(0)), None);
        table.try_reserve().unwrap();
        table.insert(1, handle());
        assert!(matches!(
            table.try_reserve(),
            Err(AdmitError::NoMultiplexing)
        ));
    }

    #[test]
    fn per_connection_cap_overloads_past_the_limit() {
        let mut table = SessionTable::new(Some(2), Arc::new(AtomicUsize::new(0)), None);
        table.try_reserve().unwrap();
        table.insert(1, handle());
        table.try_reserve().unwrap();
        table.insert(2, handle());
        assert!(matches!(table.try_reserve(), Err(AdmitError::Overloaded)));
    }

    #[test]
    fn global_cap_is_released_on_removal() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut table = SessionTable::new(None, counter.clone(), Some(1));
        table.try_reserve().unwrap();
        table.insert(1, handle());
        assert!(matches!(table.try_reserve(), Err(AdmitError::Overloaded)));
        table.remove(1);
        assert_eq!(counter.load(Ordering::Acquire), 0);
        table.try_reserve().unwrap();
    }
}
