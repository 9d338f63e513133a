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

//! Error types for FastCGI server operations.
//!
//! Three enums, one per concern, following the shape of this crate's
//! ancestor client: a single `thiserror`-derived enum per concern rather
//! than a grab bag of `Box<dyn Error>`, with `tokio::io::Error` wrapped
//! transparently wherever a variant is a pure I/O passthrough.

/// Errors confined to a single record; the connection loop logs these and
/// either drops the record or answers with `UNKNOWN_TYPE`, never tearing
/// down the connection.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Wrapper of `tokio::io::Error`.
    #[error(transparent)]
    Io(#[from] tokio::io::Error),

    /// A record's content length did not match what the record type
    /// requires (e.g. `BEGIN_REQUEST` with a length other than 8).
    #[error("bad content length for record type `{record_type}`")]
    BadLength {
        /// The record type whose length was wrong.
        record_type: String,
    },

    /// A name or value length prefix decoded to more than `i32::MAX`
    /// bytes.
    #[error("name or value length exceeds 2^31-1 bytes")]
    LengthOverflow,

    /// The PARAMS stream closed with undigested bytes still buffered.
    #[error("PARAMS stream closed with {remaining} undecoded bytes remaining")]
    TrailingParamBytes {
        /// Number of buffered bytes that were never completed into a pair.
        remaining: usize,
    },

    /// Parameter bytes were not valid UTF-8.
    #[error("parameter bytes are not valid UTF-8")]
    InvalidUtf8,
}

/// Errors confined to a single session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Wrapper of `tokio::io::Error`.
    #[error(transparent)]
    Io(#[from] tokio::io::Error),

    /// The application tried to mutate the status line or header map
    /// after the first byte of the response body had already been sent.
    #[error("response headers were already sent")]
    HeadersAlreadySent,

    /// The application tried to change the output buffer size after the
    /// first write.
    #[error("buffer size can only be set before the first write")]
    BufferSizeAlreadyFixed,

    /// A write was attempted on a stream (STDOUT/STDERR) that already
    /// emitted its end-of-stream record.
    #[error("stream is already closed")]
    StreamClosed,

    /// The session was canceled (ABORT_REQUEST or a connection-level
    /// fault) before the application finished.
    #[error("session was aborted")]
    Aborted,
}

/// Errors fatal to engine startup (invalid configuration, a transport
/// that could not be bound). Never raised once the engine is serving.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Wrapper of `tokio::io::Error`.
    #[error(transparent)]
    Io(#[from] tokio::io::Error),

    /// A `buffer_size` string did not parse as `<number>[k|m|g]`.
    #[error("invalid buffer size `{input}`: {reason}")]
    InvalidBufferSize {
        /// The string that failed to parse.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// No role handler was registered at all.
    #[error("engine was built with no responder, authorizer, or filter registered")]
    NoRolesConfigured,
}
