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

//! Wire-level FastCGI protocol structures and the record codec.
//!
//! This module owns everything that is purely a function of the bytes on
//! the wire: record headers, the begin/end-request bodies, the role and
//! protocol-status enumerations, and the variable-length name/value pair
//! encoding shared by `PARAMS` and `GET_VALUES`/`GET_VALUES_RESULT`. It does
//! not know about sessions, connections, or applications.

use std::fmt::{self, Display};

use bitflags::bitflags;
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// FastCGI protocol version 1, the only version this implementation speaks.
pub(crate) const VERSION_1: u8 = 1;

/// Largest content length a single record may carry.
pub(crate) const MAX_LENGTH: usize = 0xffff;

/// Length of the fixed FastCGI record header, in bytes.
pub(crate) const HEADER_LEN: usize = 8;

/// Largest content chunk the writer emits for a single record when
/// splitting a long stream write, chosen so that `HEADER_LEN + content` is
/// already a multiple of 8 and no padding bytes are wasted.
pub(crate) const OPTIMAL_PAYLOAD: usize = ((HEADER_LEN + MAX_LENGTH) & !7) - HEADER_LEN;

/// FastCGI record type tags, values are wire-fixed by the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    BeginRequest,
    AbortRequest,
    EndRequest,
    Params,
    Stdin,
    Stdout,
    Stderr,
    Data,
    GetValues,
    GetValuesResult,
    UnknownType,
    /// A type tag not in the table above; carries the raw byte so the
    /// connection loop can echo it back inside an `UNKNOWN_TYPE` record.
    Other(u8),
}

impl RecordType {
    fn from_u8(u: u8) -> Self {
        match u {
            1 => RecordType::BeginRequest,
            2 => RecordType::AbortRequest,
            3 => RecordType::EndRequest,
            4 => RecordType::Params,
            5 => RecordType::Stdin,
            6 => RecordType::Stdout,
            7 => RecordType::Stderr,
            8 => RecordType::Data,
            9 => RecordType::GetValues,
            10 => RecordType::GetValuesResult,
            11 => RecordType::UnknownType,
            other => RecordType::Other(other),
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            RecordType::BeginRequest => 1,
            RecordType::AbortRequest => 2,
            RecordType::EndRequest => 3,
            RecordType::Params => 4,
            RecordType::Stdin => 5,
            RecordType::Stdout => 6,
            RecordType::Stderr => 7,
            RecordType::Data => 8,
            RecordType::GetValues => 9,
            RecordType::GetValuesResult => 10,
            RecordType::UnknownType => 11,
            RecordType::Other(b) => b,
        }
    }

    /// Whether this type carries a byte stream that can span several
    /// records and is terminated by a zero-length record (PARAMS, STDIN,
    /// STDOUT, STDERR, DATA).
    pub(crate) fn is_stream(self) -> bool {
        matches!(
            self,
            RecordType::Params
                | RecordType::Stdin
                | RecordType::Stdout
                | RecordType::Stderr
                | RecordType::Data
        )
    }
}

impl Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.to_u8(), f)
    }
}

bitflags! {
    /// Flags describing why an inbound record was rejected. Several may
    /// apply to the same record; the connection loop logs the combination
    /// and drops the record rather than tearing down the connection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BadRecordFlags: u8 {
        const UNKNOWN_TYPE = 0b0001;
        const BAD_VERSION  = 0b0010;
        const BAD_LENGTH   = 0b0100;
        const BAD_REQ_ID   = 0b1000;
    }
}

/// A decoded record header plus the raw content and padding lengths still
/// to be read off the wire.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub(crate) version: u8,
    pub(crate) r#type: RecordType,
    pub(crate) request_id: u16,
    pub(crate) content_length: u16,
    pub(crate) padding_length: u8,
}

impl Header {
    fn new(r#type: RecordType, request_id: u16, content_length: u16) -> Self {
        Self {
            version: VERSION_1,
            r#type,
            request_id,
            content_length,
            padding_length: Self::padding_for(content_length),
        }
    }

    /// Smallest padding that brings `content_length` up to a multiple of 8.
    fn padding_for(content_length: u16) -> u8 {
        ((!content_length).wrapping_add(1)) as u8 & 7
    }

    /// Validates header fields per the FastCGI spec, returning the set of
    /// violations (empty if the header is well-formed).
    pub(crate) fn validate(&self) -> BadRecordFlags {
        let mut flags = BadRecordFlags::empty();
        if self.version < VERSION_1 {
            flags |= BadRecordFlags::BAD_VERSION;
        }
        if matches!(self.r#type, RecordType::Other(_)) {
            flags |= BadRecordFlags::UNKNOWN_TYPE;
        }
        let management_typed = matches!(self.r#type, RecordType::GetValues);
        if management_typed && self.request_id != 0 {
            flags |= BadRecordFlags::BAD_REQ_ID;
        }
        match self.r#type {
            RecordType::BeginRequest if self.content_length != 8 => {
                flags |= BadRecordFlags::BAD_LENGTH;
            }
            RecordType::AbortRequest if self.content_length != 0 => {
                flags |= BadRecordFlags::BAD_LENGTH;
            }
            _ => {}
        }
        flags
    }

    /// Reads the next 8-byte header from `reader`. Returns `Ok(None)` on a
    /// clean EOF at a header boundary (the normal way a connection ends).
    pub(crate) async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut R,
    ) -> io::Result<Option<Self>> {
        let mut buf = [0u8; HEADER_LEN];
        let mut read = 0;
        while read < HEADER_LEN {
            let n = reader.read(&mut buf[read..]).await?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "FastCGI record header truncated",
                ));
            }
            read += n;
        }
        Ok(Some(Self {
            version: buf[0],
            r#type: RecordType::from_u8(buf[1]),
            request_id: u16::from_be_bytes([buf[2], buf[3]]),
            content_length: u16::from_be_bytes([buf[4], buf[5]]),
            padding_length: buf[6],
        }))
    }

    /// Reads the content bytes followed by the padding bytes described by
    /// this header, returning exactly `content_length` bytes.
    pub(crate) async fn read_content<R: AsyncRead + Unpin>(
        &self, reader: &mut R,
    ) -> io::Result<Vec<u8>> {
        let mut content = vec![0u8; self.content_length as usize];
        reader.read_exact(&mut content).await?;
        if self.padding_length > 0 {
            let mut padding = vec![0u8; self.padding_length as usize];
            reader.read_exact(&mut padding).await?;
        }
        Ok(content)
    }

    /// Writes a single record (header, content, padding) atomically from
    /// the caller's point of view; the caller is expected to be holding
    /// the connection's outbound mutex already.
    async fn write_to<W: AsyncWrite + Unpin>(self, writer: &mut W, content: &[u8]) -> io::Result<()> {
        debug_assert_eq!(content.len(), self.content_length as usize);
        let mut buf = [0u8; HEADER_LEN];
        buf[0] = self.version;
        buf[1] = self.r#type.to_u8();
        buf[2..4].copy_from_slice(&self.request_id.to_be_bytes());
        buf[4..6].copy_from_slice(&self.content_length.to_be_bytes());
        buf[6] = self.padding_length;
        buf[7] = 0;
        writer.write_all(&buf).await?;
        writer.write_all(content).await?;
        if self.padding_length > 0 {
            const ZEROES: [u8; 255] = [0u8; 255];
            writer
                .write_all(&ZEROES[..self.padding_length as usize])
                .await?;
        }
        Ok(())
    }

    /// Writes one record with up to 65535 bytes of content.
    pub(crate) async fn write_record<W: AsyncWrite + Unpin>(
        writer: &mut W, r#type: RecordType, request_id: u16, content: &[u8],
    ) -> io::Result<()> {
        debug_assert!(content.len() <= MAX_LENGTH);
        let header = Self::new(r#type, request_id, content.len() as u16);
        header.write_to(writer, content).await
    }

    /// Writes `payload` as a sequence of records, chunked so no record
    /// exceeds 65535 bytes of content. Does not write the closing
    /// zero-length record; callers that are ending the stream call
    /// [`Header::write_record`] with an empty slice afterwards.
    pub(crate) async fn write_stream<W: AsyncWrite + Unpin>(
        writer: &mut W, r#type: RecordType, request_id: u16, mut payload: &[u8],
    ) -> io::Result<()> {
        while !payload.is_empty() {
            let chunk_len = if payload.len() >= MAX_LENGTH {
                OPTIMAL_PAYLOAD
            } else {
                payload.len()
            };
            let (chunk, rest) = payload.split_at(chunk_len);
            Self::write_record(writer, r#type, request_id, chunk).await?;
            payload = rest;
        }
        Ok(())
    }
}

/// FastCGI application roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Role {
    Responder = 1,
    Authorizer = 2,
    Filter = 3,
}

impl Role {
    fn from_u16(u: u16) -> Option<Self> {
        match u {
            1 => Some(Role::Responder),
            2 => Some(Role::Authorizer),
            3 => Some(Role::Filter),
            _ => None,
        }
    }
}

/// Bit 0 of the `BEGIN_REQUEST` flags byte.
const FLAG_KEEP_CONN: u8 = 1;

/// Decoded `BEGIN_REQUEST` content.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BeginRequest {
    pub(crate) role: Option<Role>,
    pub(crate) keep_alive: bool,
}

impl BeginRequest {
    /// Decodes the 8-byte `BEGIN_REQUEST` content. `role` is `None` when
    /// the peer named a role this table of constants does not know about;
    /// the connection loop turns that into `UNKNOWN_ROLE`.
    pub(crate) fn decode(content: &[u8]) -> Result<Self, ProtocolError> {
        if content.len() != 8 {
            return Err(ProtocolError::BadLength {
                record_type: RecordType::BeginRequest.to_string(),
            });
        }
        let role = Role::from_u16(u16::from_be_bytes([content[0], content[1]]));
        let flags = content[2];
        Ok(Self {
            role,
            keep_alive: flags & FLAG_KEEP_CONN != 0,
        })
    }
}

/// FastCGI protocol status codes carried in `END_REQUEST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolStatus {
    RequestComplete = 0,
    CantMpxConn = 1,
    Overloaded = 2,
    UnknownRole = 3,
}

/// Encodes and writes an `END_REQUEST` record.
pub(crate) async fn write_end_request<W: AsyncWrite + Unpin>(
    writer: &mut W, request_id: u16, app_status: i32, protocol_status: ProtocolStatus,
) -> io::Result<()> {
    let mut content = [0u8; 8];
    content[0..4].copy_from_slice(&(app_status as u32).to_be_bytes());
    content[4] = protocol_status as u8;
    Header::write_record(writer, RecordType::EndRequest, request_id, &content).await
}

/// Encodes and writes an `UNKNOWN_TYPE` record echoing the offending type.
pub(crate) async fn write_unknown_type<W: AsyncWrite + Unpin>(
    writer: &mut W, request_id: u16, unknown_type: u8,
) -> io::Result<()> {
    let mut content = [0u8; 8];
    content[0] = unknown_type;
    Header::write_record(writer, RecordType::UnknownType, request_id, &content).await
}

/// Encodes a variable-length name or value length prefix: 1 byte for
/// lengths under 128, otherwise 4 big-endian bytes with the high bit set.
pub(crate) fn encode_length(len: usize, out: &mut Vec<u8>) {
    if len < 128 {
        out.push(len as u8);
    } else {
        let encoded = (len as u32) | 0x8000_0000;
        out.extend_from_slice(&encoded.to_be_bytes());
    }
}

/// Decodes a variable-length name/value length prefix starting at
/// `buf[0]`. Returns `(length, bytes_consumed)`, or `None` if `buf` does
/// not yet contain a complete prefix.
pub(crate) fn decode_length(buf: &[u8]) -> Option<(usize, usize)> {
    let first = *buf.first()?;
    if first & 0x80 == 0 {
        Some((first as usize, 1))
    } else {
        if buf.len() < 4 {
            return None;
        }
        let raw = u32::from_be_bytes([buf[0] & 0x7f, buf[1], buf[2], buf[3]]);
        Some((raw as usize, 4))
    }
}

/// Appends one name/value pair to `out` in FastCGI wire form.
pub(crate) fn encode_pair(name: &[u8], value: &[u8], out: &mut Vec<u8>) {
    encode_length(name.len(), out);
    encode_length(value.len(), out);
    out.extend_from_slice(name);
    out.extend_from_slice(value);
}

/// Attempts to decode one complete name/value pair from the front of
/// `buf`. Returns `(name, value, bytes_consumed)`, or `None` if `buf` does
/// not yet hold a complete pair.
pub(crate) fn decode_pair(buf: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>, usize)>, ProtocolError> {
    const MAX_NAME_OR_VALUE: usize = i32::MAX as usize;

    let Some((name_len, name_prefix)) = decode_length(buf) else {
        return Ok(None);
    };
    let after_name_len = &buf[name_prefix..];
    let Some((value_len, value_prefix)) = decode_length(after_name_len) else {
        return Ok(None);
    };
    if name_len > MAX_NAME_OR_VALUE || value_len > MAX_NAME_OR_VALUE {
        return Err(ProtocolError::LengthOverflow);
    }
    let header_len = name_prefix + value_prefix;
    let total = header_len + name_len + value_len;
    if buf.len() < total {
        return Ok(None);
    }
    let name = buf[header_len..header_len + name_len].to_vec();
    let value = buf[header_len + name_len..total].to_vec();
    Ok(Some((name, value, total)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn padding_aligns_to_eight_bytes() {
        for len in 0u16..=300 {
            let pad = Header::padding_for(len);
            assert_eq!((HEADER_LEN + len as usize + pad as usize) % 8, 0);
            assert!((pad as usize) < 8);
        }
    }

    #[test]
    fn optimal_payload_is_8192_times_8_minus_header() {
        assert_eq!(OPTIMAL_PAYLOAD, 65528);
        assert_eq!((HEADER_LEN + OPTIMAL_PAYLOAD) % 8, 0);
    }

    #[tokio::test]
    async fn header_round_trips_through_a_stream() {
        let (mut a, mut b) = duplex(4096);
        Header::write_record(&mut a, RecordType::Stdin, 42, b"hello")
            .await
            .unwrap();
        a.flush().await.unwrap();

        let header = Header::read_from(&mut b).await.unwrap().unwrap();
        assert_eq!(header.request_id, 42);
        assert!(matches!(header.r#type, RecordType::Stdin));
        assert_eq!(header.content_length, 5);
        let content = header.read_content(&mut b).await.unwrap();
        assert_eq!(content, b"hello");
    }

    #[tokio::test]
    async fn clean_eof_at_header_boundary_is_none() {
        let (a, mut b) = duplex(4);
        drop(a);
        assert!(Header::read_from(&mut b).await.unwrap().is_none());
    }

    #[test]
    fn length_boundary_at_127_stays_one_byte() {
        let mut out = Vec::new();
        encode_length(127, &mut out);
        assert_eq!(out, vec![127]);
        let mut out = Vec::new();
        encode_length(128, &mut out);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0] & 0x80, 0x80);
    }

    #[test]
    fn pair_round_trips_across_arbitrary_splits() {
        let mut encoded = Vec::new();
        encode_pair(b"SCRIPT_NAME", b"/index.php", &mut encoded);
        encode_pair(b"QUERY_STRING", b"", &mut encoded);

        for split in 0..=encoded.len() {
            let (first, second) = encoded.split_at(split);
            let mut acc = first.to_vec();
            acc.extend_from_slice(second);
            let mut offset = 0;
            let mut pairs = Vec::new();
            while offset < acc.len() {
                let (name, value, consumed) = decode_pair(&acc[offset..]).unwrap().unwrap();
                pairs.push((name, value));
                offset += consumed;
            }
            assert_eq!(
                pairs,
                vec![
                    (b"SCRIPT_NAME".to_vec(), b"/index.php".to_vec()),
                    (b"QUERY_STRING".to_vec(), b"".to_vec()),
                ]
            );
        }
    }

    #[test]
    fn decode_pair_reports_incomplete_data() {
        let mut encoded = Vec::new();
        encode_pair(b"NAME", b"value", &mut encoded);
        assert!(decode_pair(&encoded[..2]).unwrap().is_none());
    }
}
