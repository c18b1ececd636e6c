//! AAC `AudioSpecificConfig` parsing out of an RTMP AAC sequence header
//! (the FLV `AACAUDIODATA` payload with `AACPacketType == 0`).

use crate::bitreader::BitReader;
use crate::constants::{aac_profile_name, AAC_CHANNELS, AAC_SAMPLE_RATE};

#[derive(Clone, Debug, Default)]
pub struct AacConfig {
    pub object_type: u32,
    pub sample_rate: u32,
    pub chan_config: u32,
    pub channels: u8,
    /// -1 when not an SBR extension.
    pub sbr: i32,
    /// -1 when not parametric stereo.
    pub ps: i32,
    /// Set when the buffer ran out mid-parse; fields above are best-effort.
    pub truncated: bool,
}

impl AacConfig {
    pub fn profile_name(&self) -> &'static str {
        aac_profile_name(self.object_type, self.sbr, self.ps)
    }
}

fn read_object_type(r: &mut BitReader) -> u32 {
    let object_type = r.read(5);
    if object_type == 31 {
        r.read(6) + 32
    } else {
        object_type
    }
}

fn read_sample_rate(r: &mut BitReader) -> u32 {
    let idx = r.read(4);
    if idx == 0x0f {
        r.read(24)
    } else {
        AAC_SAMPLE_RATE[idx as usize]
    }
}

/// Parses an AAC sequence header. The caller strips the 2-byte FLV
/// `AudioTagHeader` (`SoundFormat`/`AACPacketType`) before calling this;
/// `header` is the raw `AudioSpecificConfig` starting at the object type.
pub fn parse(header: &[u8]) -> AacConfig {
    let mut r = BitReader::new(header);

    let mut cfg = AacConfig {
        object_type: read_object_type(&mut r),
        sbr: -1,
        ps: -1,
        ..AacConfig::default()
    };
    cfg.sample_rate = read_sample_rate(&mut r);
    cfg.chan_config = r.read(4);
    if (cfg.chan_config as usize) < AAC_CHANNELS.len() {
        cfg.channels = AAC_CHANNELS[cfg.chan_config as usize];
    }

    if cfg.object_type == 5 || cfg.object_type == 29 {
        if cfg.object_type == 29 {
            cfg.ps = 1;
        }
        cfg.sbr = 1;
        cfg.sample_rate = read_sample_rate(&mut r);
        cfg.object_type = read_object_type(&mut r);
    }

    cfg.truncated = r.is_error();
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_stereo_44100() {
        // object_type=2 (LC), sampling_index=0x4 (44100), chan_config=2.
        let cfg = parse(&[0x12, 0x10]);
        assert_eq!(cfg.object_type, 2);
        assert_eq!(cfg.sample_rate, 44_100);
        assert_eq!(cfg.channels, 2);
        assert!(!cfg.truncated);
    }

    #[test]
    fn truncated_buffer_does_not_panic() {
        let cfg = parse(&[0x00]);
        assert!(cfg.truncated);
    }
}
