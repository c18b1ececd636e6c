//! The RTMP chunk stream: de-multiplexes/multiplexes variable-size messages
//! across interleaved chunk streams with compressed headers.
//!
//! Implements `tokio_util::codec::{Decoder, Encoder}` over a
//! `Framed<TcpStream, _>`, carrying real per-direction state (header
//! caches, partial-message buffers) since RTMP framing is itself stateful
//! across chunks rather than one message per read.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use failure::{bail, Error};
use pretty_hex::PrettyHex;
use tokio_util::codec::{Decoder, Encoder};

use crate::constants::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

pub const PROTOCOL_CONTROL_CSID: u32 = 2;
const EXT_TIMESTAMP_SENTINEL: u32 = 0x00FF_FFFF;
const IDLE_BUFFER_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct InboundMessage {
    pub csid: u32,
    pub type_id: u8,
    pub stream_id: u32,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("csid", &self.csid)
            .field("type_id", &self.type_id)
            .field("stream_id", &self.stream_id)
            .field("timestamp", &self.timestamp)
            .field("payload", &self.payload.hex_dump())
            .finish()
    }
}

#[derive(Clone)]
pub struct OutboundMessage {
    pub csid: u32,
    pub stream_id: u32,
    pub type_id: u8,
    pub timestamp: u32,
    pub payload: Bytes,
}

impl std::fmt::Debug for OutboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundMessage")
            .field("csid", &self.csid)
            .field("stream_id", &self.stream_id)
            .field("type_id", &self.type_id)
            .field("timestamp", &self.timestamp)
            .field("payload", &self.payload.hex_dump())
            .finish()
    }
}

impl OutboundMessage {
    pub fn control(csid: u32, type_id: u8, payload: Bytes) -> Self {
        OutboundMessage {
            csid,
            stream_id: 0,
            type_id,
            timestamp: 0,
            payload,
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct InCachedHeader {
    timestamp: u32,
    delta: u32,
    message_length: u32,
    message_type_id: u8,
    message_stream_id: u32,
    has_ext_timestamp: bool,
}

struct PartialMessage {
    buf: BytesMut,
    expected_len: u32,
    last_active: Instant,
}

#[derive(Clone, Copy, Debug, Default)]
struct OutHeaderRecord {
    last_time: u32,
    last_type: u8,
    last_size: u32,
    last_ext: bool,
}

enum Control {
    Full,
    Message,
    Time,
    Continue,
}

impl Control {
    fn fmt(&self) -> u8 {
        match self {
            Control::Full => 0,
            Control::Message => 1,
            Control::Time => 2,
            Control::Continue => 3,
        }
    }
}

pub struct ChunkCodec {
    in_chunk_size: usize,
    out_chunk_size: usize,
    in_headers: HashMap<u32, InCachedHeader>,
    in_buffers: HashMap<u32, PartialMessage>,
    out_headers: HashMap<u32, OutHeaderRecord>,
    next_out_csid: u32,
    window_ack_size: u32,
    bytes_in: u64,
    bytes_in_at_last_ack: u64,
}

impl Default for ChunkCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkCodec {
    pub fn new() -> Self {
        ChunkCodec {
            in_chunk_size: crate::constants::DEFAULT_CHUNK_SIZE,
            out_chunk_size: 4096,
            in_headers: HashMap::new(),
            in_buffers: HashMap::new(),
            out_headers: HashMap::new(),
            next_out_csid: 3,
            window_ack_size: 5_000_000,
            bytes_in: 0,
            bytes_in_at_last_ack: 0,
        }
    }

    /// Hands out the next free outbound chunk stream id; CSID 2 is reserved
    /// for protocol control and never returned here.
    pub fn allocate_csid(&mut self) -> u32 {
        let csid = self.next_out_csid;
        self.next_out_csid += 1;
        csid
    }

    pub fn set_out_chunk_size(&mut self, n: usize) {
        self.out_chunk_size = n;
    }

    pub fn out_chunk_size(&self) -> usize {
        self.out_chunk_size
    }

    pub fn set_window_ack_size(&mut self, n: u32) {
        self.window_ack_size = n.max(1);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Returns the current byte count to acknowledge once `window_ack_size`
    /// bytes have arrived since the last ack, resetting the threshold.
    pub fn take_pending_ack(&mut self) -> Option<u32> {
        if self.bytes_in.saturating_sub(self.bytes_in_at_last_ack) >= u64::from(self.window_ack_size)
        {
            self.bytes_in_at_last_ack = self.bytes_in;
            Some(self.bytes_in as u32)
        } else {
            None
        }
    }

    /// Drops partial-message buffers that haven't been touched in 120 s, so
    /// a peer that opens many chunk streams and never completes messages
    /// can't grow memory without bound.
    pub fn purge_idle_buffers(&mut self) {
        let now = Instant::now();
        self.in_buffers
            .retain(|_, b| now.duration_since(b.last_active) < IDLE_BUFFER_TIMEOUT);
    }

    fn basic_header_len(first: u8) -> usize {
        match first & 0x3F {
            0 => 2,
            1 => 3,
            _ => 1,
        }
    }

    fn message_header_len(fmt: u8) -> usize {
        match fmt {
            0 => 11,
            1 => 7,
            2 => 3,
            _ => 0,
        }
    }

    /// Attempts to decode exactly one chunk from the front of `src`.
    /// Returns `Ok(None)` without consuming anything if not enough bytes
    /// are buffered yet.
    fn try_decode_chunk(&mut self, src: &mut BytesMut) -> Result<Option<Option<InboundMessage>>, Error> {
        if src.is_empty() {
            return Ok(None);
        }
        let first = src[0];
        let fmt = first >> 6;
        let cs = first & 0x3F;
        let basic_len = Self::basic_header_len(first);
        if src.len() < basic_len {
            return Ok(None);
        }
        let csid: u32 = match cs {
            0 => 64 + u32::from(src[1]),
            1 => 64 + u32::from(src[1]) + u32::from(src[2]) * 256,
            _ => u32::from(cs),
        };

        let msg_header_len = Self::message_header_len(fmt);
        if src.len() < basic_len + msg_header_len {
            return Ok(None);
        }

        // Determine whether an extended timestamp field follows, and the
        // tentative (pre-extension) header values, without consuming yet.
        let header_slice = &src[basic_len..basic_len + msg_header_len];
        let cached = self.in_headers.get(&csid).copied().unwrap_or_default();

        let (ts_field, needs_ext_probe) = match fmt {
            0 | 1 | 2 => {
                let ts = u24_be(&header_slice[0..3]);
                (ts, ts == EXT_TIMESTAMP_SENTINEL)
            }
            _ => (0, cached.has_ext_timestamp),
        };

        let ext_len = if needs_ext_probe { 4 } else { 0 };
        let total_header_len = basic_len + msg_header_len + ext_len;
        if src.len() < total_header_len {
            return Ok(None);
        }

        // We have the full header (and know the extension is present or
        // not); figure out how much payload this chunk can carry before
        // checking we have all of that buffered too.
        let (message_length, message_type_id, message_stream_id) = match fmt {
            0 => (
                u24_be(&header_slice[3..6]),
                header_slice[6],
                u32::from_le_bytes([
                    header_slice[7],
                    header_slice[8],
                    header_slice[9],
                    header_slice[10],
                ]),
            ),
            1 => (
                u24_be(&header_slice[3..6]),
                header_slice[6],
                cached.message_stream_id,
            ),
            2 => (
                cached.message_length,
                cached.message_type_id,
                cached.message_stream_id,
            ),
            _ => (
                cached.message_length,
                cached.message_type_id,
                cached.message_stream_id,
            ),
        };

        let already_buffered = if fmt == 3 {
            self.in_buffers.get(&csid).map(|p| p.buf.len()).unwrap_or(0)
        } else {
            0
        };
        let remaining = (message_length as usize).saturating_sub(already_buffered);
        let payload_take = remaining.min(self.in_chunk_size);
        let total_needed = total_header_len + payload_take;
        if src.len() < total_needed {
            return Ok(None);
        }

        // Everything needed for this chunk is buffered; consume it.
        let mut buf = src.split_to(total_needed);
        buf.advance(basic_len);
        let header_slice = buf.split_to(msg_header_len + ext_len);

        let absolute_timestamp = if ext_len > 0 {
            let ext = u32::from_be_bytes([
                header_slice[msg_header_len],
                header_slice[msg_header_len + 1],
                header_slice[msg_header_len + 2],
                header_slice[msg_header_len + 3],
            ]);
            match fmt {
                0 => ext,
                1 | 2 => cached.timestamp.wrapping_add(ext),
                _ => cached.timestamp.wrapping_add(cached.delta),
            }
        } else {
            match fmt {
                0 => ts_field,
                1 | 2 => cached.timestamp.wrapping_add(ts_field),
                _ => cached.timestamp.wrapping_add(cached.delta),
            }
        };
        let delta = match fmt {
            0 => 0,
            1 | 2 => absolute_timestamp.wrapping_sub(cached.timestamp),
            _ => cached.delta,
        };

        self.in_headers.insert(
            csid,
            InCachedHeader {
                timestamp: absolute_timestamp,
                delta,
                message_length,
                message_type_id,
                message_stream_id,
                has_ext_timestamp: ext_len > 0,
            },
        );

        let payload = buf; // remaining bytes after split are exactly the payload
        let entry = self.in_buffers.entry(csid).or_insert_with(|| PartialMessage {
            buf: BytesMut::with_capacity(message_length as usize),
            expected_len: message_length,
            last_active: Instant::now(),
        });
        if fmt != 3 {
            entry.buf.clear();
            entry.expected_len = message_length;
        }
        entry.buf.extend_from_slice(&payload);
        entry.last_active = Instant::now();

        if entry.buf.len() as u32 >= entry.expected_len {
            let complete = self.in_buffers.remove(&csid).unwrap();
            let mut message = InboundMessage {
                csid,
                type_id: message_type_id,
                stream_id: message_stream_id,
                timestamp: absolute_timestamp,
                payload: complete.buf.freeze(),
            };
            self.apply_framing_side_effects(&mut message)?;
            return Ok(Some(Some(message)));
        }

        Ok(Some(None))
    }

    /// Set Chunk Size and Abort are framing-level concerns: they must take
    /// effect immediately so subsequent chunks on this connection parse
    /// correctly, rather than waiting for the message dispatcher.
    fn apply_framing_side_effects(&mut self, message: &mut InboundMessage) -> Result<(), Error> {
        match message.type_id {
            1 if message.payload.len() >= 4 => {
                let n = u32::from_be_bytes([
                    message.payload[0],
                    message.payload[1],
                    message.payload[2],
                    message.payload[3],
                ]) as usize;
                if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&n) {
                    bail!("peer requested out-of-range chunk size {}", n);
                }
                self.in_chunk_size = n;
            }
            2 if message.payload.len() >= 4 => {
                let target_csid = u32::from_be_bytes([
                    message.payload[0],
                    message.payload[1],
                    message.payload[2],
                    message.payload[3],
                ]);
                self.in_buffers.remove(&target_csid);
            }
            _ => {}
        }
        Ok(())
    }
}

fn u24_be(b: &[u8]) -> u32 {
    (u32::from(b[0]) << 16) | (u32::from(b[1]) << 8) | u32::from(b[2])
}

fn put_u24_be(buf: &mut BytesMut, v: u32) {
    let v = v.min(0x00FF_FFFF);
    buf.put_u8((v >> 16) as u8);
    buf.put_u8((v >> 8) as u8);
    buf.put_u8(v as u8);
}

fn put_basic_header(buf: &mut BytesMut, fmt: u8, csid: u32) {
    if csid < 64 {
        buf.put_u8((fmt << 6) | (csid as u8));
    } else if csid < 320 {
        buf.put_u8(fmt << 6);
        buf.put_u8((csid - 64) as u8);
    } else {
        buf.put_u8((fmt << 6) | 1);
        let rel = csid - 64;
        buf.put_u8(rel as u8);
        buf.put_u8((rel >> 8) as u8);
    }
}

impl Decoder for ChunkCodec {
    type Item = InboundMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.try_decode_chunk(src)? {
                None => return Ok(None),
                Some(None) => continue,
                Some(Some(msg)) => {
                    self.bytes_in += msg.payload.len() as u64;
                    return Ok(Some(msg));
                }
            }
        }
    }
}

impl Encoder<OutboundMessage> for ChunkCodec {
    type Error = Error;

    fn encode(&mut self, item: OutboundMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let is_control = item.type_id < 8;
        let csid = if is_control {
            PROTOCOL_CONTROL_CSID
        } else {
            item.csid
        };

        let uses_ext = item.timestamp >= EXT_TIMESTAMP_SENTINEL;
        let size = item.payload.len() as u32;

        let control = if is_control {
            // Protocol control messages always get a fresh record, never
            // diffed against a prior one on this stream id.
            self.out_headers.remove(&item.stream_id);
            Control::Full
        } else {
            match self.out_headers.get(&item.stream_id) {
                None => Control::Full,
                Some(rec) => {
                    if rec.last_time == 0 || item.timestamp <= rec.last_time {
                        Control::Full
                    } else if rec.last_type != item.type_id || rec.last_size != size {
                        Control::Message
                    } else {
                        Control::Time
                    }
                }
            }
        };

        let delta = match self.out_headers.get(&item.stream_id) {
            Some(rec) => item.timestamp.wrapping_sub(rec.last_time),
            None => item.timestamp,
        };

        self.out_headers.insert(
            item.stream_id,
            OutHeaderRecord {
                last_time: item.timestamp,
                last_type: item.type_id,
                last_size: size,
                last_ext: uses_ext,
            },
        );

        let fmt = control.fmt();
        put_basic_header(dst, fmt, csid);

        let time_field = if matches!(control, Control::Full) {
            item.timestamp
        } else {
            delta
        };
        match control {
            Control::Full => {
                put_u24_be(dst, time_field.min(EXT_TIMESTAMP_SENTINEL));
                put_u24_be(dst, size);
                dst.put_u8(item.type_id);
                dst.put_u32_le(item.stream_id);
            }
            Control::Message => {
                put_u24_be(dst, time_field.min(EXT_TIMESTAMP_SENTINEL));
                put_u24_be(dst, size);
                dst.put_u8(item.type_id);
            }
            Control::Time => {
                put_u24_be(dst, time_field.min(EXT_TIMESTAMP_SENTINEL));
            }
            Control::Continue => {}
        }
        if uses_ext {
            dst.put_u32(item.timestamp);
        }

        let mut remaining = &item.payload[..];
        let mut first = true;
        while !remaining.is_empty() || first {
            let take = remaining.len().min(self.out_chunk_size);
            if !first {
                put_basic_header(dst, 3, csid);
                if uses_ext {
                    dst.put_u32(item.timestamp);
                }
            }
            dst.extend_from_slice(&remaining[..take]);
            remaining = &remaining[take..];
            first = false;
            if remaining.is_empty() {
                break;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_decode_round_trip(payloads: &[(u32, u8, u32, &[u8])]) {
        let mut codec = ChunkCodec::new();
        codec.set_out_chunk_size(128);
        let mut buf = BytesMut::new();
        for &(csid, type_id, stream_id, payload) in payloads {
            codec
                .encode(
                    OutboundMessage {
                        csid,
                        stream_id,
                        type_id,
                        timestamp: 0,
                        payload: Bytes::copy_from_slice(payload),
                    },
                    &mut buf,
                )
                .unwrap();
        }

        let mut decoder = ChunkCodec::new();
        let mut got = Vec::new();
        while let Some(msg) = decoder.decode(&mut buf).unwrap() {
            got.push(msg);
        }
        assert_eq!(got.len(), payloads.len());
        for (msg, &(_, type_id, stream_id, payload)) in got.iter().zip(payloads) {
            assert_eq!(msg.type_id, type_id);
            assert_eq!(msg.stream_id, stream_id);
            assert_eq!(&msg.payload[..], payload);
        }
    }

    #[test]
    fn round_trips_single_small_message() {
        encode_decode_round_trip(&[(5, 9, 1, b"hello world")]);
    }

    #[test]
    fn splits_and_reassembles_across_chunk_boundary() {
        let payload = vec![0xABu8; 5000];
        let mut codec = ChunkCodec::new();
        codec.set_out_chunk_size(4096);
        let mut buf = BytesMut::new();
        codec
            .encode(
                OutboundMessage {
                    csid: 5,
                    stream_id: 1,
                    type_id: 9,
                    timestamp: 0,
                    payload: Bytes::copy_from_slice(&payload),
                },
                &mut buf,
            )
            .unwrap();

        let mut decoder = ChunkCodec::new();
        decoder.in_chunk_size = 4096;
        let msg = decoder.decode(&mut buf).unwrap().expect("complete message");
        assert_eq!(msg.payload.len(), 5000);
        assert_eq!(&msg.payload[..], &payload[..]);
    }

    #[test]
    fn basic_header_two_and_three_byte_forms() {
        let mut buf = BytesMut::new();
        put_basic_header(&mut buf, 0, 64);
        assert_eq!(buf.len(), 2);
        assert_eq!(buf[1], 0);

        let mut buf = BytesMut::new();
        put_basic_header(&mut buf, 0, 65599);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn header_compression_reuses_time_chunks() {
        encode_decode_round_trip(&[
            (5, 9, 1, b"aaaa"),
            (5, 9, 1, b"bbbb"),
            (5, 9, 1, b"cccc"),
        ]);
    }
}
