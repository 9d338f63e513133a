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

//! The two session dispatch strategies an [`crate::engine::Engine`] can
//! run with: a task per session, or a fixed pool of workers draining a
//! shared queue.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};

/// Dispatches a finished, boxed session future for execution. Object-safe
/// so the engine can hold either strategy behind one `Arc<dyn SessionExecutor>`.
pub(crate) trait SessionExecutor: Send + Sync + 'static {
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

/// Spawns one `tokio` task per session. Unbounded concurrency, lowest
/// latency, the default.
pub(crate) struct SpawnExecutor;

impl SessionExecutor for SpawnExecutor {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }
}

/// Runs every session on a fixed-size pool of long-lived worker tasks
/// pulling from a shared queue, bounding total session concurrency
/// regardless of how many connections are open.
pub(crate) struct WorkerPoolExecutor {
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
}

impl WorkerPoolExecutor {
    pub(crate) fn new(workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();
        let rx = Arc::new(Mutex::new(rx));
        for worker in 0..workers.max(1) {
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let task = { rx.lock().await.recv().await };
                    match task {
                        Some(task) => task.await,
                        None => {
                            tracing::debug!(worker, "session worker pool channel closed");
                            break;
                        }
                    }
                }
            });
        }
        Self { tx }
    }
}

impl SessionExecutor for WorkerPoolExecutor {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        // The channel only closes when every worker task has been
        // dropped, which cannot happen while this executor is alive.
        let _ = self.tx.send(task);
    }
}
