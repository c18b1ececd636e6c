//! AV1 sequence-header OBU parsing (`AV1CodecConfigurationRecord`'s embedded
//! `sequence_header_obu()`).
//!
//! Follows the AV1 Bitstream & Decoding Process Specification's
//! `sequence_header_obu` syntax (timing info / decoder model info /
//! operating-points loop, then variable-width frame-size fields)
//! bit-for-bit rather than any fixed byte offsets, since the field widths
//! here depend on several preceding flags.

use crate::bitreader::BitReader;

#[derive(Clone, Debug, Default)]
pub struct Av1Config {
    pub seq_profile: u32,
    pub seq_level_idx: u32,
    pub level: f64,
    pub width: u32,
    pub height: u32,
    /// Set when the buffer ran out mid-parse; fields above are best-effort.
    pub truncated: bool,
}

fn timing_info(r: &mut BitReader) {
    r.read(32); // num_units_in_display_tick
    r.read(32); // time_scale
    if r.read_bool() {
        // equal_picture_interval
        r.read_exp_golomb(); // num_ticks_per_picture_minus_1
    }
}

fn decoder_model_info(r: &mut BitReader) -> u32 {
    let buffer_delay_length_minus_1 = r.read(5);
    r.read(32); // num_units_in_decoding_tick
    r.read(5); // buffer_removal_time_length_minus_1
    r.read(5); // frame_presentation_time_length_minus_1
    buffer_delay_length_minus_1
}

fn operating_parameters_info(r: &mut BitReader, buffer_delay_length_minus_1: u32) {
    let n = buffer_delay_length_minus_1 + 1;
    r.read(n); // decoder_buffer_delay
    r.read(n); // encoder_buffer_delay
    r.read(1); // low_delay_mode_flag
}

/// Parses the `sequence_header_obu()` found inside an
/// `AV1CodecConfigurationRecord`'s `configOBUs`. `header` should start at
/// the OBU payload (the caller has already consumed any OBU header byte(s)
/// and size field, per AV1 Annex A low-overhead bitstream format).
pub fn parse(header: &[u8]) -> Av1Config {
    let mut r = BitReader::new(header);
    let mut cfg = Av1Config::default();

    cfg.seq_profile = r.read(3);
    r.read(1); // still_picture
    let reduced_still_picture_header = r.read_bool();

    let mut seq_level_idx0 = 0u32;
    if reduced_still_picture_header {
        seq_level_idx0 = r.read(5);
    } else {
        let timing_info_present_flag = r.read_bool();
        let mut decoder_model_info_present_flag = false;
        let mut buffer_delay_length_minus_1 = 0;
        if timing_info_present_flag {
            timing_info(&mut r);
            decoder_model_info_present_flag = r.read_bool();
            if decoder_model_info_present_flag {
                buffer_delay_length_minus_1 = decoder_model_info(&mut r);
            }
        }
        let initial_display_delay_present_flag = r.read_bool();
        let operating_points_cnt_minus_1 = r.read(5);
        for i in 0..=operating_points_cnt_minus_1 {
            r.read(12); // operating_point_idc[i]
            let seq_level_idx = r.read(5);
            if i == 0 {
                seq_level_idx0 = seq_level_idx;
            }
            if seq_level_idx > 7 {
                r.read(1); // seq_tier[i]
            }
            if decoder_model_info_present_flag {
                let present = r.read_bool();
                if present {
                    operating_parameters_info(&mut r, buffer_delay_length_minus_1);
                }
            }
            if initial_display_delay_present_flag {
                let present = r.read_bool();
                if present {
                    r.read(4); // initial_display_delay_minus_1[i]
                }
            }
        }
    }
    cfg.seq_level_idx = seq_level_idx0;
    cfg.level = f64::from(seq_level_idx0) / 8.0;

    // operatingPoint 0 is chosen; nothing further to consume for it.
    let frame_width_bits_minus_1 = r.read(4);
    let frame_height_bits_minus_1 = r.read(4);
    cfg.width = r.read(frame_width_bits_minus_1 + 1) + 1;
    cfg.height = r.read(frame_height_bits_minus_1 + 1) + 1;

    cfg.truncated = r.is_error();
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn reduced_still_picture_header_1280x720() {
        let mut w = BitWriter::new();
        w.put(3, 0); // seq_profile
        w.put(1, 1); // still_picture
        w.put(1, 1); // reduced_still_picture_header
        w.put(5, 4); // seq_level_idx[0]
        w.put(4, 10); // frame_width_bits_minus_1 -> n=11
        w.put(4, 9); // frame_height_bits_minus_1 -> n=10
        w.put(11, 1279); // max_frame_width_minus_1
        w.put(10, 719); // max_frame_height_minus_1
        let buf = w.finish();

        let cfg = parse(&buf);
        assert_eq!(cfg.seq_profile, 0);
        assert_eq!(cfg.width, 1280);
        assert_eq!(cfg.height, 720);
        assert!((cfg.level - 0.5).abs() < 1e-9);
        assert!(!cfg.truncated);
    }

    #[test]
    fn truncated_buffer_does_not_panic() {
        let cfg = parse(&[0u8; 1]);
        assert!(cfg.truncated);
    }
}
