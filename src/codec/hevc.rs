//! H.265/HEVC sequence-header parsing: walks an `HEVCDecoderConfigurationRecord`
//! to find the SPS NAL unit, then parses its conformance window to compute
//! the cropped display width/height.

use crate::bitreader::BitReader;

#[derive(Clone, Debug, Default)]
pub struct HevcConfig {
    pub profile: u32,
    pub level: f64,
    pub width: u32,
    pub height: u32,
    /// Set when the buffer ran out mid-parse; fields above are best-effort.
    pub truncated: bool,
}

/// Strips emulation-prevention bytes (`0x00 0x00 0x03` -> `0x00 0x00`) from a
/// NAL unit's RBSP, per H.265 Annex B / ITU-T H.265 section 7.3.1.1.
fn de_escape_rbsp(nal_payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nal_payload.len());
    let mut i = 0;
    while i < nal_payload.len() {
        if i + 2 < nal_payload.len() && nal_payload[i..i + 3] == [0x00, 0x00, 0x03] {
            out.push(0x00);
            out.push(0x00);
            i += 3;
        } else {
            out.push(nal_payload[i]);
            i += 1;
        }
    }
    out
}

/// Advances past a `profile_tier_level()` block (ITU-T H.265 section 7.3.3)
/// without retaining any field — profile/level are read from the fixed
/// `HEVCDecoderConfigurationRecord` prefix instead, matching how the
/// original treats `hevc_parse_ptl`'s return value as write-only.
fn skip_profile_tier_level(r: &mut BitReader, max_sub_layers_minus1: u32) {
    r.read(2 + 1 + 5); // profile_space, tier_flag, profile_idc
    r.read(32); // profile_compatibility_flags
    r.read(1 + 1 + 1 + 1); // progressive/interlaced/non_packed/frame_only constraint flags
    r.read(32);
    r.read(12); // reserved
    r.read(8); // level_idc

    let mut profile_present = Vec::with_capacity(max_sub_layers_minus1 as usize);
    let mut level_present = Vec::with_capacity(max_sub_layers_minus1 as usize);
    for _ in 0..max_sub_layers_minus1 {
        profile_present.push(r.read_bool());
        level_present.push(r.read_bool());
    }
    if max_sub_layers_minus1 > 0 {
        for _ in max_sub_layers_minus1..8 {
            r.read(2);
        }
    }
    for i in 0..max_sub_layers_minus1 as usize {
        if profile_present[i] {
            r.read(2 + 1 + 5);
            r.read(32);
            r.read(1 + 1 + 1 + 1);
            r.read(32);
            r.read(12);
        }
        if level_present[i] {
            r.read(8);
        }
    }
}

/// Parses an SPS RBSP (NAL header already stripped by the caller) for just
/// the fields needed to compute cropped width/height.
fn parse_sps(rbsp: &[u8]) -> (u32, u32) {
    let mut r = BitReader::new(rbsp);
    r.read(4); // sps_video_parameter_set_id
    let max_sub_layers_minus1 = r.read(3);
    r.read(1); // sps_temporal_id_nesting_flag
    skip_profile_tier_level(&mut r, max_sub_layers_minus1);
    r.read_exp_golomb(); // sps_seq_parameter_set_id
    let chroma_format_idc = r.read_exp_golomb();
    if chroma_format_idc == 3 {
        r.read(1); // separate_colour_plane_flag
    }
    let width = r.read_exp_golomb();
    let height = r.read_exp_golomb();
    let conformance_window_flag = r.read_bool();
    let (mut left, mut right, mut top, mut bottom) = (0u32, 0u32, 0u32, 0u32);
    if conformance_window_flag {
        let horiz_mult = 1 + u32::from(chroma_format_idc < 3);
        let vert_mult = 1 + u32::from(chroma_format_idc < 2);
        left = r.read_exp_golomb() * horiz_mult;
        right = r.read_exp_golomb() * horiz_mult;
        top = r.read_exp_golomb() * vert_mult;
        bottom = r.read_exp_golomb() * vert_mult;
    }
    (width.saturating_sub(left + right), height.saturating_sub(top + bottom))
}

/// Parses an `HEVCDecoderConfigurationRecord`. `header` is the FLV video
/// payload after the 2-byte `VideoTagHeader` has been stripped by the
/// caller (matching `hevc_sequence_header = hevc_sequence_header[5:]` in the
/// original, which additionally skips a 3-byte composition time).
pub fn parse(header: &[u8]) -> HevcConfig {
    let mut cfg = HevcConfig::default();
    if header.len() < 23 {
        cfg.truncated = true;
        return cfg;
    }
    if header[0] != 1 {
        // configurationVersion must be 1.
        cfg.truncated = true;
        return cfg;
    }
    cfg.profile = u32::from(header[1] & 0x1F);
    let general_level_idc = header[12];
    cfg.level = f64::from(general_level_idc) / 30.0;
    let num_of_arrays = header[22];

    let mut rest = &header[23..];
    for _ in 0..num_of_arrays {
        if rest.len() < 3 {
            cfg.truncated = true;
            break;
        }
        let array_nal_type = rest[0] & 0x3F;
        let num_nalus = (u16::from(rest[1]) << 8) | u16::from(rest[2]);
        rest = &rest[3..];
        for _ in 0..num_nalus {
            if rest.len() < 2 {
                cfg.truncated = true;
                return cfg;
            }
            let nal_length = ((u16::from(rest[0]) << 8) | u16::from(rest[1])) as usize;
            rest = &rest[2..];
            if rest.len() < nal_length {
                cfg.truncated = true;
                return cfg;
            }
            let nal_unit = &rest[..nal_length];
            rest = &rest[nal_length..];

            if array_nal_type == 33 && nal_unit.len() > 2 {
                let rbsp = de_escape_rbsp(&nal_unit[2..]);
                let (width, height) = parse_sps(&rbsp);
                cfg.width = width;
                cfg.height = height;
            }
        }
    }

    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    /// conformance crop left=2, right=2 on chroma_format_idc=1 (4:2:0,
    /// horiz_mult=2) reduces reported width by (2+2)*2 = 8.
    #[test]
    fn conformance_crop_reduces_width() {
        let mut w = BitWriter::new();
        w.put(4, 0); // sps_video_parameter_set_id
        w.put(3, 0); // sps_max_sub_layers_minus1 = 0
        w.put(1, 0); // sps_temporal_id_nesting_flag
        // profile_tier_level with max_sub_layers_minus1 = 0: fixed 88-bit block,
        // no sub-layer loop (8 reserved 2-bit entries since 0>0 is false -> none).
        w.put(2, 0); // profile_space
        w.put(1, 0); // tier_flag
        w.put(5, 1); // profile_idc
        w.put(32, 0); // profile_compatibility_flags
        w.put(4, 0); // progressive/interlaced/non_packed/frame_only
        w.put(32, 0);
        w.put(12, 0);
        w.put(8, 90); // general_level_idc (unused by width/height path)
        w.put_ue(0); // sps_seq_parameter_set_id
        w.put_ue(1); // chroma_format_idc = 1 (4:2:0)
        w.put_ue(1920); // pic_width_in_luma_samples
        w.put_ue(1080); // pic_height_in_luma_samples
        w.put(1, 1); // conformance_window_flag
        w.put_ue(2); // conf_win_left_offset
        w.put_ue(2); // conf_win_right_offset
        w.put_ue(0); // conf_win_top_offset
        w.put_ue(0); // conf_win_bottom_offset
        let rbsp = w.finish();

        let (width, height) = parse_sps(&rbsp);
        assert_eq!(width, 1920 - 8);
        assert_eq!(height, 1080);
    }

    #[test]
    fn truncated_buffer_does_not_panic() {
        let cfg = parse(&[0u8; 10]);
        assert!(cfg.truncated);
    }

    struct BitWriter {
        bits: Vec<bool>,
    }

    impl BitWriter {
        fn new() -> Self {
            BitWriter { bits: Vec::new() }
        }

        fn put(&mut self, n: u32, v: u32) {
            for i in (0..n).rev() {
                self.bits.push((v >> i) & 1 != 0);
            }
        }

        fn put_ue(&mut self, v: u32) {
            let v = v + 1;
            let bits = 32 - v.leading_zeros();
            for _ in 0..bits - 1 {
                self.bits.push(false);
            }
            self.put(bits, v);
        }

        fn finish(self) -> Vec<u8> {
            let mut out = Vec::new();
            for chunk in self.bits.chunks(8) {
                let mut byte = 0u8;
                for (i, b) in chunk.iter().enumerate() {
                    if *b {
                        byte |= 1 << (7 - i);
                    }
                }
                out.push(byte);
            }
            out
        }
    }
}
