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

//! The per-connection pool of reusable PARAMS accumulation buffers.

use std::sync::Mutex;

/// Caps how many idle buffers a connection keeps around; beyond this the
/// pool just drops the buffer and lets the allocator reclaim it.
const MAX_POOLED_BUFFERS: usize = 32;

/// A lock-protected free list of byte buffers, lent to one
/// [`crate::params::ParamReader`] at a time and returned when that
/// session's PARAMS stream closes.
#[derive(Debug, Default)]
pub(crate) struct ParamBufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl ParamBufferPool {
    pub(crate) fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Acquires a buffer for a newly created session, reusing one from
    /// the free list if available.
    pub(crate) fn acquire(&self) -> Vec<u8> {
        self.free
            .lock()
            .expect("param buffer pool mutex poisoned")
            .pop()
            .unwrap_or_default()
    }

    /// Returns a buffer to the pool once its session's PARAMS stream has
    /// closed.
    pub(crate) fn release(&self, buf: Vec<u8>) {
        let mut free = self.free.lock().expect("param buffer pool mutex poisoned");
        if free.len() < MAX_POOLED_BUFFERS {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffer_is_reused() {
        let pool = ParamBufferPool::new();
        let mut buf = pool.acquire();
        buf.extend_from_slice(b"scratch");
        let ptr = buf.as_ptr();
        pool.release(buf);

        let reused = pool.acquire();
        assert_eq!(reused.as_ptr(), ptr);
    }

    #[test]
    fn pool_caps_retained_buffers() {
        let pool = ParamBufferPool::new();
        for _ in 0..MAX_POOLED_BUFFERS + 8 {
            pool.release(Vec::new());
        }
        assert!(pool.free.lock().unwrap().len() <= MAX_POOLED_BUFFERS);
    }
}
