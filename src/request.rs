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

//! [`Request`], the context object handed to an [`crate::app::Application`]
//! for the lifetime of one session.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::conn::{ConnWriter, DynWriter};
use crate::error::SessionError;
use crate::params::ParamMap;
use crate::protocol::Role;
use crate::stream::{InboundStream, RecordWriter};

/// Read-only facts about the session an application may want for
/// logging, independent of the parameter map.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo {
    pub request_id: u16,
    pub role: Role,
    pub keep_alive: bool,
}

/// The per-session context passed to [`crate::app::Application::serve`].
///
/// Holds the frozen parameter map, the `STDIN`/`DATA` byte sources, and
/// the `STDOUT`/`STDERR` byte sinks. The status line and header map may
/// only be changed before the first byte of the response body is
/// written; after that [`Request::set_status`], [`Request::set_header`],
/// [`Request::add_header`], and [`Request::set_buffer_size`] all return
/// [`SessionError::HeadersAlreadySent`] / [`SessionError::BufferSizeAlreadyFixed`].
pub struct Request {
    info: RequestInfo,
    params: ParamMap,
    stdin: InboundStream,
    data: Option<InboundStream>,
    stdout: RecordWriter<DynWriter>,
    stderr: RecordWriter<DynWriter>,
    status: u16,
    headers: Vec<(String, String)>,
    headers_sent: bool,
    exit_code: i32,
    cancel: CancellationToken,
}

impl Request {
    pub(crate) fn new(
        info: RequestInfo, params: ParamMap, stdin: InboundStream, data: Option<InboundStream>,
        conn: Arc<ConnWriter<DynWriter>>, buffer_size: usize, cancel: CancellationToken,
    ) -> Self {
        Self {
            info,
            params,
            stdin,
            data,
            stdout: RecordWriter::new(
                conn.clone(),
                info.request_id,
                crate::protocol::RecordType::Stdout,
                buffer_size,
                false,
            ),
            stderr: RecordWriter::new(
                conn,
                info.request_id,
                crate::protocol::RecordType::Stderr,
                buffer_size,
                true,
            ),
            status: 200,
            headers: Vec::new(),
            headers_sent: false,
            exit_code: 0,
            cancel,
        }
    }

    /// Facts about this session (request id, role, keep-alive) useful for
    /// tracing and diagnostics.
    pub fn diagnostics(&self) -> RequestInfo {
        self.info
    }

    /// Whether the response prefix has already been materialized. Used by
    /// the connection loop to decide whether a best-effort 501 response
    /// can still be folded in after an uncaught application failure.
    pub(crate) fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// The frozen CGI parameter map decoded from `PARAMS`.
    pub fn parameters(&self) -> &ParamMap {
        &self.params
    }

    /// The `STDIN` byte stream. Readable as an ordinary [`tokio::io::AsyncRead`];
    /// reaches EOF once the peer sends the closing zero-length record.
    pub fn stdin(&mut self) -> &mut (impl tokio::io::AsyncRead + Unpin) {
        &mut self.stdin
    }

    /// The `DATA` byte stream, present only for the `Filter` role. `None`
    /// for `Responder` and `Authorizer` sessions, since the peer never
    /// opens a `DATA` stream for them.
    pub fn data(&mut self) -> Option<&mut (impl tokio::io::AsyncRead + Unpin)> {
        self.data.as_mut()
    }

    /// True once the peer has sent `ABORT_REQUEST` for this session. The
    /// application is expected to poll this (or select against
    /// [`Request::cancelled`]) during long-running work and wind down
    /// cooperatively.
    pub fn aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// A future that resolves once the session is aborted, for use in
    /// `tokio::select!` alongside the application's own work.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Sets the CGI response status before any body bytes are written.
    pub fn set_status(&mut self, code: u16) -> Result<(), SessionError> {
        if self.headers_sent {
            return Err(SessionError::HeadersAlreadySent);
        }
        self.status = code;
        Ok(())
    }

    /// Replaces all previously set values for `name` with a single
    /// `value`.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<(), SessionError> {
        if self.headers_sent {
            return Err(SessionError::HeadersAlreadySent);
        }
        let name = name.into();
        self.headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
        Ok(())
    }

    /// Appends another value for `name`, leaving any value already set
    /// intact (e.g. repeated `Set-Cookie` headers). Duplicate handling
    /// beyond "both lines are emitted" is left to the caller.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> Result<(), SessionError> {
        if self.headers_sent {
            return Err(SessionError::HeadersAlreadySent);
        }
        self.headers.push((name.into(), value.into()));
        Ok(())
    }

    /// Sets the `STDOUT`/`STDERR` chunking size. Only effective before
    /// the first write to either stream.
    pub fn set_buffer_size(&mut self, size: usize) -> Result<(), SessionError> {
        if self.headers_sent {
            return Err(SessionError::BufferSizeAlreadyFixed);
        }
        self.stdout.set_buffer_size(size);
        self.stderr.set_buffer_size(size);
        Ok(())
    }

    /// Records the process exit code to report in `END_REQUEST`. Most
    /// applications instead return `Outcome::Completed(code)` directly;
    /// this exists for handlers that want to set the code as they go and
    /// return `Outcome::Completed(request.exit_code())` at the end.
    pub fn exit(&mut self, code: i32) {
        self.exit_code = code;
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// Writes body bytes to `STDOUT`, emitting the buffered status-line
    /// and header block first if this is the first write.
    pub async fn write_stdout(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.ensure_headers_flushed().await?;
        self.stdout.write(data).await
    }

    /// Writes to `STDERR`, independent of whether `STDOUT` headers have
    /// been sent yet.
    pub async fn write_stderr(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.stderr.write(data).await
    }

    async fn ensure_headers_flushed(&mut self) -> Result<(), SessionError> {
        if self.headers_sent {
            return Ok(());
        }
        let mut preamble =
            format!("Status: {} {}\r\n", self.status, reason_phrase(self.status)).into_bytes();
        for (name, value) in &self.headers {
            preamble.extend_from_slice(name.as_bytes());
            preamble.extend_from_slice(b": ");
            preamble.extend_from_slice(value.as_bytes());
            preamble.extend_from_slice(b"\r\n");
        }
        preamble.extend_from_slice(b"\r\n");
        self.headers_sent = true;
        self.stdout.write(&preamble).await
    }

    /// Flushes and closes `STDOUT`/`STDERR`. If no body bytes were ever
    /// written, emits the header preamble first so the response is never
    /// bodiless and headerless at the same time.
    pub(crate) async fn finalize(&mut self) -> Result<(), SessionError> {
        if !self.headers_sent {
            self.ensure_headers_flushed().await?;
        }
        self.stdout.close().await?;
        self.stderr.close().await?;
        Ok(())
    }
}

/// The standard reason phrase for a status code, for the `Status:` CGI
/// response line. Unrecognized codes fall back to `"Unknown"` rather
/// than failing the request over a cosmetic detail.
fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn conn() -> Arc<ConnWriter<DynWriter>> {
        let (a, _b) = duplex(4096);
        Arc::new(ConnWriter::new(Box::new(a)))
    }

    fn info() -> RequestInfo {
        RequestInfo {
            request_id: 1,
            role: Role::Responder,
            keep_alive: false,
        }
    }

    fn request() -> Request {
        let (_tx, stdin) = crate::stream::inbound_pair();
        Request::new(info(), ParamMap::default(), stdin, None, conn(), 8192, CancellationToken::new())
    }

    #[test]
    fn reason_phrase_covers_common_codes() {
        assert_eq!(reason_phrase(200), "OK");
        assert_eq!(reason_phrase(404), "Not Found");
        assert_eq!(reason_phrase(999), "Unknown");
    }

    #[tokio::test]
    async fn header_mutation_fails_after_headers_sent() {
        let mut req = request();
        req.set_status(404).unwrap();
        req.set_header("Content-Type", "text/plain").unwrap();
        req.write_stdout(b"not found").await.unwrap();

        assert!(matches!(
            req.set_status(200),
            Err(SessionError::HeadersAlreadySent)
        ));
        assert!(matches!(
            req.set_header("X-Foo", "bar"),
            Err(SessionError::HeadersAlreadySent)
        ));
        assert!(matches!(
            req.set_buffer_size(1),
            Err(SessionError::BufferSizeAlreadyFixed)
        ));
    }

    #[tokio::test]
    async fn last_writer_wins_before_first_write() {
        let mut req = request();
        req.set_status(500).unwrap();
        req.set_status(200).unwrap();
        assert_eq!(req.status, 200);
    }

    #[tokio::test]
    async fn exit_code_defaults_to_zero_and_is_settable() {
        let mut req = request();
        assert_eq!(req.exit_code(), 0);
        req.exit(7);
        assert_eq!(req.exit_code(), 7);
    }
}

