//! H.264/AVC sequence-header parsing: walks an `AVCDecoderConfigurationRecord`
//! plus its first embedded SPS NAL unit to recover profile/level/width/height.
//!
//! Scaling lists are deliberately left unparsed since they don't affect
//! width/height.

use crate::bitreader::BitReader;

#[derive(Clone, Debug, Default)]
pub struct AvcConfig {
    pub profile: u32,
    pub compat: u32,
    pub level: f64,
    pub nalu_length_size: u32,
    pub width: u32,
    pub height: u32,
    /// Set when the buffer ran out mid-parse; fields above are best-effort.
    pub truncated: bool,
}

const HIGH_PROFILES_WITH_CHROMA_INFO: &[u32] = &[100, 110, 122, 244, 44, 83, 86, 118];

/// Parses an `AVCDecoderConfigurationRecord`. `header` is the raw FLV video
/// payload as it arrived on the wire, unstripped: the 5-byte
/// `VideoTagHeader` (`FrameType|CodecID`, `AVCPacketType`, 3-byte
/// composition time) immediately followed by the
/// `AVCDecoderConfigurationRecord` starting at `configurationVersion`. The
/// 6-byte skip below consumes exactly that prefix before reaching
/// `AVCProfileIndication`.
pub fn parse(header: &[u8]) -> AvcConfig {
    let mut r = BitReader::new(header);
    let mut cfg = AvcConfig::default();

    r.read(48); // FrameType|CodecID, AVCPacketType, 3-byte composition time,
                // configurationVersion byte

    loop {
        cfg.profile = r.read(8);
        cfg.compat = r.read(8);
        let level_idc = r.read(8);
        cfg.nalu_length_size = (r.read(8) & 0x03) + 1;
        let nb_sps = r.read(8) & 0x1F;
        if nb_sps == 0 || r.is_error() {
            break;
        }

        r.read(16); // sequenceParameterSetLength
        if r.read(8) != 0x67 {
            break;
        }

        let profile_idc = r.read(8);
        r.read(8); // constraint_set flags + reserved
        r.read(8); // level_idc (re-read from the SPS itself, ignored here)
        r.read_exp_golomb(); // seq_parameter_set_id

        if HIGH_PROFILES_WITH_CHROMA_INFO.contains(&profile_idc) {
            let chroma_format_idc = r.read_exp_golomb();
            if chroma_format_idc == 3 {
                r.read(1); // separate_colour_plane_flag
            }
            r.read_exp_golomb(); // bit_depth_luma_minus8
            r.read_exp_golomb(); // bit_depth_chroma_minus8
            r.read(1); // qpprime_y_zero_transform_bypass_flag
            if r.read_bool() {
                // seq_scaling_matrix_present_flag
                let count = if chroma_format_idc != 3 { 8 } else { 12 };
                for _ in 0..count {
                    r.read_bool(); // seq_scaling_list_present_flag[i]; lists unparsed.
                }
            }
        }

        r.read_exp_golomb(); // log2_max_frame_num_minus4
        let pic_order_cnt_type = r.read_exp_golomb();
        if pic_order_cnt_type == 0 {
            r.read_exp_golomb(); // log2_max_pic_order_cnt_lsb_minus4
        } else if pic_order_cnt_type == 1 {
            r.read(1); // delta_pic_order_always_zero_flag
            r.read_exp_golomb(); // offset_for_non_ref_pic
            r.read_exp_golomb(); // offset_for_top_to_bottom_field
            let num_ref_frames_in_poc_cycle = r.read_exp_golomb();
            for _ in 0..num_ref_frames_in_poc_cycle {
                r.read_exp_golomb();
            }
        }

        r.read_exp_golomb(); // max_num_ref_frames
        r.read(1); // gaps_in_frame_num_value_allowed_flag
        let width_mbs_minus1 = r.read_exp_golomb();
        let height_map_units_minus1 = r.read_exp_golomb();
        let frame_mbs_only_flag = r.read(1);
        if frame_mbs_only_flag == 0 {
            r.read(1); // mb_adaptive_frame_field_flag
        }
        r.read(1); // direct_8x8_inference_flag

        let (crop_left, crop_right, crop_top, crop_bottom) = if r.read_bool() {
            (
                r.read_exp_golomb(),
                r.read_exp_golomb(),
                r.read_exp_golomb(),
                r.read_exp_golomb(),
            )
        } else {
            (0, 0, 0, 0)
        };

        cfg.level = f64::from(level_idc) / 10.0;
        cfg.width = (width_mbs_minus1 + 1) * 16 - (crop_left + crop_right) * 2;
        cfg.height = (2 - frame_mbs_only_flag) * (height_map_units_minus1 + 1) * 16
            - (crop_top + crop_bottom) * 2;
        break;
    }

    cfg.truncated = r.is_error();
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 1920x1080 baseline profile 66, level 31 (3.1), no high-profile chroma
    /// extension, progressive, no cropping. Builds the full FLV video
    /// payload (`VideoTagHeader` + `AVCDecoderConfigurationRecord`) exactly
    /// as it arrives on the wire and drives it through
    /// `message::parse_video_sequence_header`, the same entry point
    /// `session.rs` uses, rather than hand-aligning a buffer to `parse`'s
    /// own skip count.
    #[test]
    fn baseline_1080p() {
        // VideoTagHeader: FrameType=1 (key frame), CodecID=7 (AVC);
        // AVCPacketType=0 (sequence header); 3-byte composition time.
        let mut buf = vec![(1 << 4) | 7, 0x00, 0x00, 0x00, 0x00];

        // AVCDecoderConfigurationRecord.
        buf.push(0x01); // configurationVersion
        buf.push(66); // AVCProfileIndication
        buf.push(0); // profile_compatibility
        buf.push(31); // AVCLevelIndication
        buf.push(0xFF); // lengthSizeMinusOne nibble -> nalu_length_size=4
        buf.push(0x01); // numOfSequenceParameterSets = 1
        buf.extend_from_slice(&[0x00, 0x00]); // sequenceParameterSetLength (unused)
        buf.push(0x67); // NAL header (SPS)

        // SPS body, hand-built bit by bit.
        let mut w = BitWriter::new();
        w.put(8, 66); // profile_idc
        w.put(8, 0); // constraint flags + reserved
        w.put(8, 31); // level_idc
        w.put_ue(0); // seq_parameter_set_id
        w.put_ue(0); // log2_max_frame_num_minus4
        w.put_ue(0); // pic_order_cnt_type = 0
        w.put_ue(0); // log2_max_pic_order_cnt_lsb_minus4
        w.put_ue(1); // max_num_ref_frames
        w.put(1, 0); // gaps_in_frame_num_value_allowed_flag
        w.put_ue(119); // pic_width_in_mbs_minus1 -> (119+1)*16=1920
        w.put_ue(67); // pic_height_in_map_units_minus1 -> (67+1)*16=1088
        w.put(1, 1); // frame_mbs_only_flag
        w.put(1, 0); // direct_8x8_inference_flag
        w.put(1, 1); // frame_cropping_flag
        w.put_ue(0); // crop_left
        w.put_ue(0); // crop_right
        w.put_ue(0); // crop_top
        w.put_ue(4); // crop_bottom -> 1088 - 2*4 = 1080
        buf.extend(w.finish());

        let parsed = crate::message::parse_video_sequence_header(&buf).expect("sequence header");
        let cfg = parsed.avc.expect("avc config");
        assert_eq!(cfg.profile, 66);
        assert_eq!(cfg.width, 1920);
        assert_eq!(cfg.height, 1080);
        assert!((cfg.level - 3.1).abs() < 1e-9);
        assert!(!cfg.truncated);
    }

    #[test]
    fn truncated_buffer_does_not_panic() {
        let cfg = parse(&[0u8; 4]);
        assert!(cfg.truncated);
    }

    /// Minimal MSB-first bit writer used only to build SPS test fixtures.
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
