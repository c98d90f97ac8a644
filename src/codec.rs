/*
 * Copyright 2024 Google LLC
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! Streaming frame decoding.
//!
//! The proxy core treats the RPC wire format as opaque: a
//! [`StreamingDecoder`] parses whole logical units out of the read buffer
//! and reports them through the [`DecodeCallbacks`] sink. Decoders are
//! registered per leading magic byte in a [`ProtocolRegistry`].

pub mod frame;

use std::collections::HashMap;

/// Flow-control result of a decode callback.
///
/// `StopIteration` instructs the calling decoder to pause emitting further
/// callbacks; resumption is owned by the sink.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FilterStatus {
    Continue,
    StopIteration,
}

/// Decoded RPC frame headers. Keys are case-sensitive as transmitted.
pub type Headers = HashMap<String, String>;

/// The sink a [`StreamingDecoder`] reports into as bytes arrive.
pub trait DecodeCallbacks {
    /// Invoked when a complete frame header block has been parsed.
    fn on_decode_header(&mut self, headers: Headers) -> FilterStatus;

    /// Invoked for each body chunk.
    fn on_decode_data(&mut self, data: &[u8]) -> FilterStatus;

    /// Invoked for optional trailing metadata.
    fn on_decode_trailer(&mut self, trailers: Headers) -> FilterStatus;
}

/// A protocol specific frame parser.
///
/// `decode` parses at most one whole logical unit from the front of `buf`
/// and returns the number of bytes it consumed. Incomplete input is not an
/// error: the decoder consumes nothing and returns zero so the caller can
/// retry once more bytes have arrived.
pub trait StreamingDecoder: Send + Sync {
    fn decode(
        &self,
        buf: &[u8],
        sink: &mut dyn DecodeCallbacks,
    ) -> Result<usize, DecodeError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("no decoder registered for protocol magic {0:#04x}")]
    UnknownProtocol(u8),
    #[error("frame declares malformed {0} block")]
    MalformedBlock(&'static str),
    #[error("frame length {0} exceeds the connection buffer limit {1}")]
    FrameTooLarge(usize, usize),
}

/// Registry of the protocols a listener is configured to decode, keyed by
/// the frame's leading magic byte.
pub struct ProtocolRegistry {
    decoders: HashMap<u8, Box<dyn StreamingDecoder>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// The registry with the stock binary RPC frame decoder installed.
    pub fn default_protocols() -> Self {
        let mut registry = Self::new();
        registry.register(frame::MAGIC, Box::new(frame::FrameDecoder::default()));
        registry
    }

    pub fn register(&mut self, magic: u8, decoder: Box<dyn StreamingDecoder>) {
        self.decoders.insert(magic, decoder);
    }

    /// Decodes as many whole frames as `buf` holds, reporting each into
    /// `sink`. Stops early when the sink returns
    /// [`FilterStatus::StopIteration`]. Returns the bytes consumed.
    pub fn decode(
        &self,
        buf: &[u8],
        sink: &mut dyn DecodeCallbacks,
    ) -> Result<usize, DecodeError> {
        let mut consumed = 0;

        while consumed < buf.len() {
            let magic = buf[consumed];
            let decoder = self
                .decoders
                .get(&magic)
                .ok_or(DecodeError::UnknownProtocol(magic))?;

            let mut sentinel = StopSentinel::new(sink);
            let n = decoder.decode(&buf[consumed..], &mut sentinel)?;
            if n == 0 {
                break;
            }

            consumed += n;
            if sentinel.stopped {
                break;
            }
        }

        Ok(consumed)
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::default_protocols()
    }
}

/// Wraps a sink to remember whether any callback asked to pause, so the
/// registry can stop the frame loop without inspecting decoder internals.
struct StopSentinel<'a> {
    inner: &'a mut dyn DecodeCallbacks,
    stopped: bool,
}

impl<'a> StopSentinel<'a> {
    fn new(inner: &'a mut dyn DecodeCallbacks) -> Self {
        Self {
            inner,
            stopped: false,
        }
    }
}

impl DecodeCallbacks for StopSentinel<'_> {
    fn on_decode_header(&mut self, headers: Headers) -> FilterStatus {
        let status = self.inner.on_decode_header(headers);
        self.stopped |= status == FilterStatus::StopIteration;
        status
    }

    fn on_decode_data(&mut self, data: &[u8]) -> FilterStatus {
        let status = self.inner.on_decode_data(data);
        self.stopped |= status == FilterStatus::StopIteration;
        status
    }

    fn on_decode_trailer(&mut self, trailers: Headers) -> FilterStatus {
        let status = self.inner.on_decode_trailer(trailers);
        self.stopped |= status == FilterStatus::StopIteration;
        status
    }
}
