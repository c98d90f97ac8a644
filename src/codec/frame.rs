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

//! The stock binary RPC frame codec.
//!
//! Wire layout, all integers big-endian:
//!
//! ```text
//! +--------+--------+--------------+--------------+------------+---------------+---------------+
//! | magic  | flags  | header count | header bytes | body bytes | trailer count | trailer bytes |
//! |  u8    |  u8    |     u16      |     u32      |    u32     |      u16      |      u32      |
//! +--------+--------+--------------+--------------+------------+---------------+---------------+
//! | header k/v block | body | trailer k/v block |
//! ```
//!
//! Key/value pairs are encoded as `u16` length-prefixed UTF-8 strings. The
//! trailer block is only present when [`FLAG_TRAILER`] is set.

use bytes::Bytes;

use crate::codec::{DecodeCallbacks, DecodeError, FilterStatus, Headers, StreamingDecoder};

pub const MAGIC: u8 = 0xb5;

/// Set when the frame carries a trailer block after the body.
pub const FLAG_TRAILER: u8 = 0x01;

const PRELUDE_BYTES: usize = 18;

/// Decoder for the frame layout above. One instance is shared by every
/// connection; all state lives in the caller's buffer.
#[derive(Clone, Copy, Debug)]
pub struct FrameDecoder {
    max_frame_bytes: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self {
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

impl StreamingDecoder for FrameDecoder {
    fn decode(
        &self,
        buf: &[u8],
        sink: &mut dyn DecodeCallbacks,
    ) -> Result<usize, DecodeError> {
        if buf.len() < PRELUDE_BYTES {
            return Ok(0);
        }

        if buf[0] != MAGIC {
            return Err(DecodeError::UnknownProtocol(buf[0]));
        }

        let flags = buf[1];
        let header_count = read_u16(&buf[2..4]) as usize;
        let header_bytes = read_u32(&buf[4..8]) as usize;
        let body_bytes = read_u32(&buf[8..12]) as usize;
        let trailer_count = read_u16(&buf[12..14]) as usize;
        let trailer_bytes = read_u32(&buf[14..18]) as usize;

        if flags & FLAG_TRAILER == 0 && (trailer_count != 0 || trailer_bytes != 0) {
            return Err(DecodeError::MalformedBlock("trailer"));
        }

        let total = PRELUDE_BYTES + header_bytes + body_bytes + trailer_bytes;
        if total > self.max_frame_bytes {
            return Err(DecodeError::FrameTooLarge(total, self.max_frame_bytes));
        }

        if buf.len() < total {
            return Ok(0);
        }

        let header_block = &buf[PRELUDE_BYTES..PRELUDE_BYTES + header_bytes];
        let headers = parse_kv_block(header_block, header_count, "header")?;
        if sink.on_decode_header(headers) == FilterStatus::StopIteration {
            return Ok(total);
        }

        let body_start = PRELUDE_BYTES + header_bytes;
        if body_bytes > 0
            && sink.on_decode_data(&buf[body_start..body_start + body_bytes])
                == FilterStatus::StopIteration
        {
            return Ok(total);
        }

        if flags & FLAG_TRAILER != 0 {
            let trailer_start = body_start + body_bytes;
            let trailer_block = &buf[trailer_start..trailer_start + trailer_bytes];
            let trailers = parse_kv_block(trailer_block, trailer_count, "trailer")?;
            sink.on_decode_trailer(trailers);
        }

        Ok(total)
    }
}

fn read_u16(buf: &[u8]) -> u16 {
    u16::from_be_bytes([buf[0], buf[1]])
}

fn read_u32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Parses `count` length-prefixed key/value pairs out of `block`. The
/// block must be exactly consumed.
fn parse_kv_block(
    block: &[u8],
    count: usize,
    kind: &'static str,
) -> Result<Headers, DecodeError> {
    let mut headers = Headers::with_capacity(count);
    let mut cursor = 0;

    for _ in 0..count {
        let key = read_string(block, &mut cursor).ok_or(DecodeError::MalformedBlock(kind))?;
        let value = read_string(block, &mut cursor).ok_or(DecodeError::MalformedBlock(kind))?;
        headers.insert(key, value);
    }

    if cursor != block.len() {
        return Err(DecodeError::MalformedBlock(kind));
    }

    Ok(headers)
}

fn read_string(block: &[u8], cursor: &mut usize) -> Option<String> {
    if block.len() < *cursor + 2 {
        return None;
    }
    let len = read_u16(&block[*cursor..*cursor + 2]) as usize;
    *cursor += 2;

    if block.len() < *cursor + len {
        return None;
    }
    let raw = &block[*cursor..*cursor + len];
    *cursor += len;

    String::from_utf8(raw.to_vec()).ok()
}

/// Encodes one frame. Headers are written in sorted key order so output
/// is deterministic for a given input.
pub fn encode_frame(headers: &Headers, body: &[u8], trailers: Option<&Headers>) -> Bytes {
    let header_block = encode_kv_block(headers);
    let trailer_block = trailers.map(encode_kv_block);

    let mut out = Vec::with_capacity(
        PRELUDE_BYTES
            + header_block.len()
            + body.len()
            + trailer_block.as_ref().map_or(0, Vec::len),
    );

    out.push(MAGIC);
    out.push(if trailers.is_some() { FLAG_TRAILER } else { 0 });
    out.extend_from_slice(&(headers.len() as u16).to_be_bytes());
    out.extend_from_slice(&(header_block.len() as u32).to_be_bytes());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&(trailers.map_or(0, Headers::len) as u16).to_be_bytes());
    out.extend_from_slice(&(trailer_block.as_ref().map_or(0, Vec::len) as u32).to_be_bytes());
    out.extend_from_slice(&header_block);
    out.extend_from_slice(body);
    if let Some(block) = &trailer_block {
        out.extend_from_slice(block);
    }

    Bytes::from(out)
}

fn encode_kv_block(headers: &Headers) -> Vec<u8> {
    let mut keys: Vec<_> = headers.keys().collect();
    keys.sort();

    let mut block = Vec::new();
    for key in keys {
        for part in [key.as_str(), headers[key].as_str()] {
            block.extend_from_slice(&(part.len() as u16).to_be_bytes());
            block.extend_from_slice(part.as_bytes());
        }
    }
    block
}
