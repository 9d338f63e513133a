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

//! The PARAMS stream accumulator and the parameter map handed to
//! applications.

use std::collections::HashMap;
use std::ops::Deref;

use crate::{error::ProtocolError, protocol};

/// The CGI-style environment variables decoded from a session's PARAMS
/// stream. Immutable once the application task starts (§4.5, invariant
/// 4 in the testable properties): the map is built once by
/// [`ParamReader::finish`] and handed to the session unchanged.
#[derive(Debug, Clone, Default)]
pub struct ParamMap(HashMap<String, String>);

impl ParamMap {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Deref for ParamMap {
    type Target = HashMap<String, String>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Stateful accumulator that reassembles the `{name -> value}` map from a
/// sequence of `PARAMS` record content chunks, which may split a pair
/// anywhere, including across record boundaries.
///
/// The internal buffer is handed in by the caller (normally borrowed from
/// the connection's [`crate::pool::ParamBufferPool`]) and handed back by
/// [`ParamReader::finish`] so it can be reused by the next session. Growth
/// beyond the borrowed buffer's capacity is left to `Vec`'s own amortized
/// doubling rather than a hand-rolled growth formula.
pub(crate) struct ParamReader {
    buf: Vec<u8>,
    pairs: Vec<(String, String)>,
}

impl ParamReader {
    pub(crate) fn new(mut buf: Vec<u8>) -> Self {
        buf.clear();
        Self {
            buf,
            pairs: Vec::new(),
        }
    }

    /// Appends one PARAMS record's content and decodes as many complete
    /// pairs as are now available, leaving any partial pair buffered.
    pub(crate) fn append(&mut self, chunk: &[u8]) -> Result<(), ProtocolError> {
        self.buf.extend_from_slice(chunk);

        let mut consumed = 0;
        while let Some((name, value, used)) = protocol::decode_pair(&self.buf[consumed..])? {
            let name = String::from_utf8(name).map_err(|_| ProtocolError::InvalidUtf8)?;
            let value = String::from_utf8(value).map_err(|_| ProtocolError::InvalidUtf8)?;
            self.pairs.push((name, value));
            consumed += used;
        }
        self.buf.drain(..consumed);
        Ok(())
    }

    /// Surrenders the internal buffer without requiring the stream to have
    /// closed cleanly, used when a malformed PARAMS stream is being torn
    /// down early and the buffer should still be returned to its pool.
    pub(crate) fn into_buf(mut self) -> Vec<u8> {
        self.buf.clear();
        self.buf
    }

    /// Called when the zero-length PARAMS record closes the stream.
    /// Succeeds only if every byte appended so far decoded into a
    /// complete pair; returns the finished map and the buffer for reuse.
    pub(crate) fn finish(mut self) -> Result<(ParamMap, Vec<u8>), ProtocolError> {
        if !self.buf.is_empty() {
            return Err(ProtocolError::TrailingParamBytes {
                remaining: self.buf.len(),
            });
        }
        self.buf.clear();
        Ok((ParamMap(self.pairs.drain(..).collect()), self.buf))
    }
}
