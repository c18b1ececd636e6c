//! Message-type routing and per-type payload helpers: classifying a
//! decoded chunk-stream message by its RTMP type id, and picking apart
//! audio/video/metadata payloads far enough to find sequence headers and
//! Enhanced-RTMP FourCC framing. The actual handler bodies (updating
//! session state, talking to the registry) live in `session.rs`; this
//! module only knows how to read the bytes.

use bytes::Bytes;
use failure::Error;

use crate::amf0::{self, Amf0Value};
use crate::codec::{aac::AacConfig, av1::Av1Config, avc::AvcConfig, hevc::HevcConfig};

pub const TYPE_SET_CHUNK_SIZE: u8 = 1;
pub const TYPE_ABORT: u8 = 2;
pub const TYPE_ACKNOWLEDGEMENT: u8 = 3;
pub const TYPE_USER_CONTROL: u8 = 4;
pub const TYPE_WINDOW_ACK_SIZE: u8 = 5;
pub const TYPE_SET_PEER_BANDWIDTH: u8 = 6;
pub const TYPE_AUDIO: u8 = 8;
pub const TYPE_VIDEO: u8 = 9;
pub const TYPE_AMF3_DATA: u8 = 15;
pub const TYPE_AMF3_COMMAND: u8 = 17;
pub const TYPE_AMF0_DATA: u8 = 18;
pub const TYPE_AMF0_COMMAND: u8 = 20;
pub const TYPE_AGGREGATE: u8 = 22;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageKind {
    SetChunkSize,
    Abort,
    Acknowledgement,
    UserControl,
    WindowAckSize,
    SetPeerBandwidth,
    Audio,
    Video,
    Amf3Data,
    Amf3Command,
    Amf0Data,
    Amf0Command,
    Aggregate,
    Unknown(u8),
}

pub fn classify(type_id: u8) -> MessageKind {
    match type_id {
        TYPE_SET_CHUNK_SIZE => MessageKind::SetChunkSize,
        TYPE_ABORT => MessageKind::Abort,
        TYPE_ACKNOWLEDGEMENT => MessageKind::Acknowledgement,
        TYPE_USER_CONTROL => MessageKind::UserControl,
        TYPE_WINDOW_ACK_SIZE => MessageKind::WindowAckSize,
        TYPE_SET_PEER_BANDWIDTH => MessageKind::SetPeerBandwidth,
        TYPE_AUDIO => MessageKind::Audio,
        TYPE_VIDEO => MessageKind::Video,
        TYPE_AMF3_DATA => MessageKind::Amf3Data,
        TYPE_AMF3_COMMAND => MessageKind::Amf3Command,
        TYPE_AMF0_DATA => MessageKind::Amf0Data,
        TYPE_AMF0_COMMAND => MessageKind::Amf0Command,
        TYPE_AGGREGATE => MessageKind::Aggregate,
        other => MessageKind::Unknown(other),
    }
}

/// A type id > 22 is not part of the RTMP message catalog this server
/// understands and is treated as a framing error, not silently ignored.
pub fn is_known_type_range(type_id: u8) -> bool {
    type_id <= TYPE_AGGREGATE
}

// --- Audio -----------------------------------------------------------------

pub fn is_aac_sequence_header(payload: &[u8]) -> bool {
    payload.len() >= 2 && (payload[0] >> 4) == 10 && payload[1] == 0
}

/// Strips the 2-byte FLV `AudioTagHeader` (SoundFormat/Rate/Size/Type byte
/// plus AACPacketType byte) and parses the remaining `AudioSpecificConfig`.
pub fn parse_aac_sequence_header(payload: &[u8]) -> AacConfig {
    if payload.len() < 2 {
        return AacConfig::default();
    }
    crate::codec::aac::parse(&payload[2..])
}

// --- Video -------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VideoPacketSubtype {
    SequenceStart,
    CodedFrames,
    SequenceEnd,
    CodedFramesX,
    Metadata,
    Mpeg2TsSequenceStart,
    Unknown(u8),
}

impl VideoPacketSubtype {
    fn from_nibble(n: u8) -> Self {
        match n {
            0 => VideoPacketSubtype::SequenceStart,
            1 => VideoPacketSubtype::CodedFrames,
            2 => VideoPacketSubtype::SequenceEnd,
            3 => VideoPacketSubtype::CodedFramesX,
            4 => VideoPacketSubtype::Metadata,
            5 => VideoPacketSubtype::Mpeg2TsSequenceStart,
            other => VideoPacketSubtype::Unknown(other),
        }
    }
}

pub fn is_enhanced_video(payload: &[u8]) -> bool {
    !payload.is_empty() && (payload[0] >> 4) & 0x08 != 0
}

/// Legacy FLV video codec ids this server cares about.
pub const CODEC_ID_AVC: u8 = 7;
pub const CODEC_ID_HEVC: u8 = 12;
pub const CODEC_ID_AV1: u8 = 13;

/// Converts an Enhanced-RTMP (FourCC) video payload into the legacy
/// `{byte0=(frame_type<<4)|codec_id, byte1=packet_type, bytes2..4=cts, ...}`
/// shape the rest of the pipeline understands, so HEVC/AV1 sequence-header
/// extraction can share code with the AVC path. Returns `None` for subtypes
/// with no legacy equivalent (Metadata, MPEG-2 TS sequence start) — those
/// are forwarded to subscribers unchanged rather than normalized.
pub fn normalize_enhanced_video(payload: &[u8]) -> Option<Bytes> {
    if payload.len() < 5 {
        return None;
    }
    let frame_type = (payload[0] >> 4) & 0x07;
    let subtype = VideoPacketSubtype::from_nibble(payload[0] & 0x0F);
    let fourcc = &payload[1..5];
    let codec_id = match fourcc {
        b"hvc1" => CODEC_ID_HEVC,
        b"av01" => CODEC_ID_AV1,
        _ => return None,
    };

    let (packet_type, cts, data_offset) = match subtype {
        VideoPacketSubtype::SequenceStart => (0u8, 0i32, 5),
        VideoPacketSubtype::CodedFramesX => (1u8, 0i32, 5),
        VideoPacketSubtype::CodedFrames => {
            if payload.len() < 8 {
                return None;
            }
            let cts = i32::from_be_bytes([0, payload[5], payload[6], payload[7]]);
            let cts = (cts << 8) >> 8; // sign-extend the 24-bit value
            (1u8, cts, 8)
        }
        VideoPacketSubtype::SequenceEnd => (2u8, 0i32, 5),
        VideoPacketSubtype::Metadata | VideoPacketSubtype::Mpeg2TsSequenceStart => return None,
        VideoPacketSubtype::Unknown(_) => return None,
    };

    let mut out = Vec::with_capacity(5 + (payload.len() - data_offset));
    out.push((frame_type << 4) | codec_id);
    out.push(packet_type);
    let cts_bytes = cts.to_be_bytes();
    out.extend_from_slice(&cts_bytes[1..4]);
    out.extend_from_slice(&payload[data_offset..]);
    Some(Bytes::from(out))
}

#[derive(Clone, Debug, Default)]
pub struct VideoSequenceConfig {
    pub avc: Option<AvcConfig>,
    pub hevc: Option<HevcConfig>,
    pub av1: Option<Av1Config>,
}

/// Extracts codec config from the first keyframe sequence-header video
/// packet, legacy or Enhanced-RTMP alike. `payload` is the raw message
/// payload as it arrived on the wire (before any normalization).
pub fn parse_video_sequence_header(payload: &[u8]) -> Option<VideoSequenceConfig> {
    let (legacy, is_sequence_start): (std::borrow::Cow<[u8]>, bool) = if is_enhanced_video(payload)
    {
        let normalized = normalize_enhanced_video(payload)?;
        let is_seq = normalized.len() >= 2 && normalized[1] == 0;
        (std::borrow::Cow::Owned(normalized.to_vec()), is_seq)
    } else {
        if payload.len() < 2 {
            return None;
        }
        (std::borrow::Cow::Borrowed(payload), payload[1] == 0)
    };

    if !is_sequence_start || legacy.len() < 5 {
        return None;
    }
    let frame_type = legacy[0] >> 4;
    if frame_type != 1 {
        return None; // not a keyframe
    }
    let codec_id = legacy[0] & 0x0F;
    let body = &legacy[5..];
    let mut out = VideoSequenceConfig::default();
    match codec_id {
        // avc::parse expects the full FLV VideoTagHeader + configurationVersion
        // byte still attached (it skips all 6 bytes itself); HEVC/AV1 expect
        // the tag header already stripped.
        CODEC_ID_AVC => out.avc = Some(crate::codec::avc::parse(&legacy)),
        CODEC_ID_HEVC => out.hevc = Some(crate::codec::hevc::parse(body)),
        CODEC_ID_AV1 => out.av1 = Some(crate::codec::av1::parse(body)),
        _ => return None,
    }
    Some(out)
}

// --- Protocol control payloads -----------------------------------------------

/// 4-byte big-endian chunk size, for type 1 (Set Chunk Size).
pub fn encode_set_chunk_size(size: u32) -> Bytes {
    Bytes::copy_from_slice(&size.to_be_bytes())
}

/// 4-byte big-endian window size, for type 5 (Window Ack Size).
pub fn encode_window_ack_size(size: u32) -> Bytes {
    Bytes::copy_from_slice(&size.to_be_bytes())
}

/// 4-byte big-endian window size plus a 1-byte limit type, for type 6 (Set
/// Peer Bandwidth). Limit type 2 ("dynamic") is what the connect
/// response always sends.
pub fn encode_set_peer_bandwidth(size: u32, limit_type: u8) -> Bytes {
    let mut out = Vec::with_capacity(5);
    out.extend_from_slice(&size.to_be_bytes());
    out.push(limit_type);
    Bytes::from(out)
}

/// 4-byte big-endian csid, for type 3 (Acknowledgement).
pub fn encode_acknowledgement(sequence_number: u32) -> Bytes {
    Bytes::copy_from_slice(&sequence_number.to_be_bytes())
}

// --- Metadata / AMF0 ---------------------------------------------------------

/// Type 15/17 (AMF3 data/command) carry a leading 0x00 marker byte ahead of
/// an otherwise-ordinary AMF0 encoding; strip it before decoding.
pub fn strip_amf3_marker(payload: &[u8]) -> &[u8] {
    if payload.first() == Some(&0) {
        &payload[1..]
    } else {
        payload
    }
}

/// Decodes an AMF0 Data message (type 18) and, if it's a metadata payload
/// (`@setDataFrame onMetaData {...}` or bare `onMetaData {...}`), returns
/// the values with any `@setDataFrame` wrapper stripped.
pub fn parse_metadata(payload: &[u8]) -> Result<Option<Vec<Amf0Value>>, Error> {
    let values = amf0::decode_all(payload)?;
    let mut iter = values.into_iter();
    match iter.next() {
        Some(Amf0Value::Utf8String(ref s)) if s == "@setDataFrame" => {
            let rest: Vec<Amf0Value> = iter.collect();
            match rest.first() {
                Some(Amf0Value::Utf8String(ref s2)) if s2 == "onMetaData" => Ok(Some(rest)),
                _ => Ok(None),
            }
        }
        Some(v @ Amf0Value::Utf8String(_)) => {
            if matches!(&v, Amf0Value::Utf8String(s) if s == "onMetaData") {
                let mut rest = vec![v];
                rest.extend(iter);
                Ok(Some(rest))
            } else {
                Ok(None)
            }
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_types() {
        assert_eq!(classify(8), MessageKind::Audio);
        assert_eq!(classify(20), MessageKind::Amf0Command);
        assert!(matches!(classify(99), MessageKind::Unknown(99)));
    }

    #[test]
    fn rejects_type_ids_past_aggregate() {
        assert!(is_known_type_range(22));
        assert!(!is_known_type_range(23));
    }

    #[test]
    fn detects_aac_sequence_header_marker() {
        assert!(is_aac_sequence_header(&[0xAF, 0x00, 0x12, 0x10]));
        assert!(!is_aac_sequence_header(&[0xAF, 0x01, 0x12, 0x10]));
    }

    #[test]
    fn normalizes_enhanced_hevc_sequence_start() {
        let mut payload = vec![0x80 | (1 << 4) | 0]; // ExHeader, keyframe, SequenceStart
        payload.extend_from_slice(b"hvc1");
        payload.extend_from_slice(&[0xAA, 0xBB]);
        let normalized = normalize_enhanced_video(&payload).unwrap();
        assert_eq!(normalized[0] >> 4, 1);
        assert_eq!(normalized[0] & 0x0F, CODEC_ID_HEVC);
        assert_eq!(normalized[1], 0);
        assert_eq!(&normalized[5..], &[0xAA, 0xBB]);
    }

    #[test]
    fn encodes_protocol_control_payloads() {
        assert_eq!(&encode_set_chunk_size(4096)[..], &[0, 0, 0x10, 0]);
        assert_eq!(&encode_window_ack_size(5_000_000)[..], &5_000_000u32.to_be_bytes());
        assert_eq!(encode_set_peer_bandwidth(5_000_000, 2).len(), 5);
    }

    #[test]
    fn metadata_strips_set_data_frame_wrapper() {
        let values = vec![
            Amf0Value::Utf8String("@setDataFrame".to_string()),
            Amf0Value::Utf8String("onMetaData".to_string()),
            Amf0Value::Number(1.0),
        ];
        let encoded = amf0::encode_all(&values).unwrap();
        let parsed = parse_metadata(&encoded).unwrap().unwrap();
        assert_eq!(parsed[0], Amf0Value::Utf8String("onMetaData".to_string()));
        assert_eq!(parsed.len(), 2);
    }
}
