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

//! The application collaborator: the trait user code implements to serve
//! a FastCGI role, and the outcome it reports back to the session
//! handler.

use std::sync::Arc;

use futures_util::future::BoxFuture;

pub use crate::protocol::Role;
use crate::request::Request;

/// What an application task reports back to the session handler, in
/// place of exception-driven flow control (`OverloadException`,
/// `RecordIOException` in the source this crate descends from).
#[derive(Debug, Clone)]
pub enum Outcome {
    /// The application ran to completion; carries the process exit code
    /// that will be placed in `appStatus` (default 0 if the application
    /// never calls [`Request::exit`]).
    Completed(i32),
    /// The application declined the request because it is overloaded.
    /// Maps to `END_REQUEST(appStatus = -1, OVERLOADED)`.
    Overloaded,
    /// The application task was canceled by `ABORT_REQUEST` or a
    /// connection-level fault before it completed. Distinct from
    /// [`Outcome::Failed`]: no diagnostic is implied, the session simply
    /// never got to finish. Maps to
    /// `END_REQUEST(appStatus = -1, REQUEST_COMPLETE)`.
    Aborted,
    /// The application failed unexpectedly; `diagnostic` is written to
    /// STDERR and, if no bytes were written yet, folded into a
    /// best-effort 501 response. Maps to
    /// `END_REQUEST(appStatus = -2, REQUEST_COMPLETE)`.
    Failed(String),
}

/// One FastCGI role implementation. Object-safe so an [`crate::engine::Engine`]
/// can hold any combination of responder, authorizer, and filter behind a
/// `Arc<dyn Application>` without a generic parameter per role.
///
/// Implementors box their future explicitly (there is no `async fn` in
/// this trait) — the same tradeoff this crate's client-side ancestor
/// avoids by not using `async-trait`, kept here rather than pulling in a
/// new proc-macro dependency for a single trait.
pub trait Application: Send + Sync + 'static {
    fn serve<'a>(&'a self, request: &'a mut Request) -> BoxFuture<'a, Outcome>;
}

impl<F> Application for F
where
    F: for<'a> Fn(&'a mut Request) -> BoxFuture<'a, Outcome> + Send + Sync + 'static,
{
    fn serve<'a>(&'a self, request: &'a mut Request) -> BoxFuture<'a, Outcome> {
        (self)(request)
    }
}

/// Which [`Application`] (if any) is registered for each role. Built once
/// by [`crate::engine::EngineBuilder`] and shared read-only by every
/// connection.
#[derive(Clone, Default)]
pub(crate) struct RoleTable {
    responder: Option<Arc<dyn Application>>,
    authorizer: Option<Arc<dyn Application>>,
    filter: Option<Arc<dyn Application>>,
}

impl RoleTable {
    pub(crate) fn set(&mut self, role: Role, app: Arc<dyn Application>) {
        match role {
            Role::Responder => self.responder = Some(app),
            Role::Authorizer => self.authorizer = Some(app),
            Role::Filter => self.filter = Some(app),
        }
    }

    pub(crate) fn get(&self, role: Role) -> Option<Arc<dyn Application>> {
        match role {
            Role::Responder => self.responder.clone(),
            Role::Authorizer => self.authorizer.clone(),
            Role::Filter => self.filter.clone(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.responder.is_none() && self.authorizer.is_none() && self.filter.is_none()
    }
}
