//! Shared scaffolding for the end-to-end scenario tests: a minimal
//! hand-rolled FastCGI peer encoder/decoder (independent of the crate's
//! own, private, record codec — these tests exercise the public
//! `Engine`/`Transport` surface with literal wire bytes, the same way a
//! real nginx/Apache peer would) and a `Transport` that serves exactly
//! one `tokio::io::duplex` connection.

use std::pin::Pin;
use std::task::{Context, Poll};

use fastcgi_server::Transport;
use futures_core::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};

pub const BEGIN_REQUEST: u8 = 1;
pub const ABORT_REQUEST: u8 = 2;
pub const END_REQUEST: u8 = 3;
pub const PARAMS: u8 = 4;
pub const STDIN: u8 = 5;
pub const STDOUT: u8 = 6;
pub const STDERR: u8 = 7;
#[allow(dead_code)]
pub const DATA: u8 = 8;
pub const GET_VALUES: u8 = 9;
pub const GET_VALUES_RESULT: u8 = 10;

pub const ROLE_RESPONDER: u16 = 1;
#[allow(dead_code)]
pub const ROLE_AUTHORIZER: u16 = 2;
#[allow(dead_code)]
pub const ROLE_FILTER: u16 = 3;

pub const PROTO_REQUEST_COMPLETE: u8 = 0;
pub const PROTO_CANT_MPX_CONN: u8 = 1;
pub const PROTO_OVERLOADED: u8 = 2;
pub const PROTO_UNKNOWN_ROLE: u8 = 3;

/// Appends one record (header + content + padding to an 8-byte
/// boundary) to `out`.
pub fn write_record(out: &mut Vec<u8>, r#type: u8, id: u16, content: &[u8]) {
    assert!(content.len() <= 0xffff);
    let padding = (8 - ((content.len() + 8) % 8)) % 8;
    out.push(1); // version
    out.push(r#type);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&(content.len() as u16).to_be_bytes());
    out.push(padding as u8);
    out.push(0); // reserved
    out.extend_from_slice(content);
    out.extend(std::iter::repeat(0u8).take(padding));
}

pub fn begin_request(out: &mut Vec<u8>, id: u16, role: u16, keep_alive: bool) {
    let mut content = [0u8; 8];
    content[0..2].copy_from_slice(&role.to_be_bytes());
    content[2] = if keep_alive { 1 } else { 0 };
    write_record(out, BEGIN_REQUEST, id, &content);
}

pub fn abort_request(out: &mut Vec<u8>, id: u16) {
    write_record(out, ABORT_REQUEST, id, &[]);
}

/// Appends one name/value pair in FastCGI's variable-length form
/// (values used by these tests always fit the 1-byte length form).
pub fn encode_pair(out: &mut Vec<u8>, name: &[u8], value: &[u8]) {
    assert!(name.len() < 128 && value.len() < 128);
    out.push(name.len() as u8);
    out.push(value.len() as u8);
    out.extend_from_slice(name);
    out.extend_from_slice(value);
}

pub fn params_record(out: &mut Vec<u8>, id: u16, pairs: &[(&[u8], &[u8])]) {
    let mut content = Vec::new();
    for (name, value) in pairs {
        encode_pair(&mut content, name, value);
    }
    write_record(out, PARAMS, id, &content);
}

pub fn get_values_record(out: &mut Vec<u8>, names: &[&[u8]]) {
    let mut content = Vec::new();
    for name in names {
        encode_pair(&mut content, name, b"");
    }
    write_record(out, GET_VALUES, 0, &content);
}

/// One fully decoded record read back from a peer-facing stream.
#[derive(Debug)]
pub struct Record {
    pub r#type: u8,
    pub id: u16,
    pub content: Vec<u8>,
}

pub async fn read_record<R: AsyncRead + Unpin>(reader: &mut R) -> Option<Record> {
    let mut header = [0u8; 8];
    let mut read = 0;
    while read < 8 {
        let n = reader.read(&mut header[read..]).await.unwrap();
        if n == 0 {
            if read == 0 {
                return None;
            }
            panic!("truncated header");
        }
        read += n;
    }
    let id = u16::from_be_bytes([header[2], header[3]]);
    let len = u16::from_be_bytes([header[4], header[5]]) as usize;
    let padding = header[6] as usize;
    let mut content = vec![0u8; len];
    reader.read_exact(&mut content).await.unwrap();
    if padding > 0 {
        let mut pad = vec![0u8; padding];
        reader.read_exact(&mut pad).await.unwrap();
    }
    Some(Record {
        r#type: header[1],
        id,
        content,
    })
}

/// Reads records from `reader` until `END_REQUEST` for `id` is seen,
/// returning the concatenated `STDOUT` bytes, the concatenated `STDERR`
/// bytes, and the decoded `(appStatus, protocolStatus)`.
pub async fn read_until_end_request<R: AsyncRead + Unpin>(
    reader: &mut R, id: u16,
) -> (Vec<u8>, Vec<u8>, i32, u8) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    loop {
        let record = read_record(reader).await.expect("peer closed before END_REQUEST");
        if record.id != id {
            continue;
        }
        match record.r#type {
            STDOUT => stdout.extend_from_slice(&record.content),
            STDERR => stderr.extend_from_slice(&record.content),
            END_REQUEST => {
                let app_status = i32::from_be_bytes([
                    record.content[0],
                    record.content[1],
                    record.content[2],
                    record.content[3],
                ]);
                let proto_status = record.content[4];
                return (stdout, stderr, app_status, proto_status);
            }
            _ => {}
        }
    }
}

/// A `Transport` that yields exactly one pre-built duplex connection,
/// then ends — the hermetic stand-in for a listening socket these
/// tests use instead of a live FastCGI peer.
pub struct OnceTransport {
    conn: Option<DuplexStream>,
}

impl OnceTransport {
    pub fn new(conn: DuplexStream) -> Self {
        Self { conn: Some(conn) }
    }
}

impl Stream for OnceTransport {
    type Item = std::io::Result<(DuplexStream, String)>;

    fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.conn.take() {
            Some(conn) => Poll::Ready(Some(Ok((conn, "test".to_string())))),
            None => Poll::Ready(None),
        }
    }
}

impl Transport for OnceTransport {
    type Conn = DuplexStream;
}

/// Flushes `writer` after writing `bytes`, as a real socket write
/// eventually would.
pub async fn send<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) {
    writer.write_all(bytes).await.unwrap();
    writer.flush().await.unwrap();
}
