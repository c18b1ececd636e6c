//! Lookup tables shared by the codec-config parsers and the AMF0 status
//! messages.

pub const AAC_SAMPLE_RATE: [u32; 16] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350, 0, 0,
    0,
];

pub const AAC_CHANNELS: [u8; 8] = [0, 1, 2, 3, 4, 5, 6, 8];

pub const AUDIO_CODEC_NAME: [&str; 17] = [
    "",
    "ADPCM",
    "MP3",
    "LinearLE",
    "Nellymoser16",
    "Nellymoser8",
    "Nellymoser",
    "G711A",
    "G711U",
    "",
    "AAC",
    "Speex",
    "",
    "OPUS",
    "MP3-8K",
    "DeviceSpecific",
    "Uncompressed",
];

pub const VIDEO_CODEC_NAME: [&str; 13] = [
    "",
    "Jpeg",
    "Sorenson-H263",
    "ScreenVideo",
    "On2-VP6",
    "On2-VP6-Alpha",
    "ScreenVideo2",
    "H264",
    "",
    "",
    "",
    "",
    "H265",
];

/// AAC object type → human profile name, per `get_aac_profile_name`.
pub fn aac_profile_name(object_type: u32, sbr: i32, ps: i32) -> &'static str {
    match object_type {
        1 => "Main",
        2 => {
            if ps > 0 {
                "HEv2"
            } else if sbr > 0 {
                "HE"
            } else {
                "LC"
            }
        }
        3 => "SSR",
        4 => "LTP",
        5 => "SBR",
        _ => "",
    }
}

/// FLV `SoundFormat` → codec name, for the audio descriptor's `name` field.
pub fn audio_codec_name(codec_id: u8) -> &'static str {
    AUDIO_CODEC_NAME.get(codec_id as usize).copied().unwrap_or("")
}

/// FLV `CodecID` → codec name, for the video descriptor's `name` field.
/// Codec id 13 has no legacy FLV entry; it's this crate's own Enhanced-RTMP
/// AV1 convention (see `message::CODEC_ID_AV1`).
pub fn video_codec_name(codec_id: u8) -> &'static str {
    match codec_id {
        13 => "AV1",
        _ => VIDEO_CODEC_NAME.get(codec_id as usize).copied().unwrap_or(""),
    }
}

/// `GenuineFMSConst`: the 36-byte server-side handshake key string.
pub const GENUINE_FMS_CONST: &[u8] = b"Genuine Adobe Flash Media Server 001";

/// `GenuineFPConst`: the 30-byte client-side handshake key string.
pub const GENUINE_FP_CONST: &[u8] = b"Genuine Adobe Flash Player 001";

/// `RandomCrud`: appended to `GENUINE_FMS_CONST` when keying S2's first HMAC
/// pass (`GenuineFMSConstCrud` in the original).
pub const RANDOM_CRUD: [u8; 32] = [
    0xf0, 0xee, 0xc2, 0x4a, 0x80, 0x68, 0xbe, 0xe8, 0x2e, 0x00, 0xd0, 0xd1, 0x02, 0x9e, 0x7e, 0x57,
    0x6e, 0xec, 0x5d, 0x2d, 0x29, 0x80, 0x6f, 0xab, 0x93, 0xb8, 0xe6, 0x36, 0xcf, 0xeb, 0x31, 0xae,
];

pub const SHA256_DIGEST_LEN: usize = 32;

pub const RTMP_HANDSHAKE_SIZE: usize = 1536;

pub const DEFAULT_CHUNK_SIZE: usize = 128;
pub const MIN_CHUNK_SIZE: usize = 128;
pub const MAX_CHUNK_SIZE: usize = 10_485_760;

pub const DEFAULT_PORT: u16 = 1935;
