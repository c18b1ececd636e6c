//! Sequence-header (codec-config) parsers for the media types this relay
//! extracts descriptors from: AAC, H.264/AVC, H.265/HEVC, and AV1.
//!
//! Every parser here is infallible in the Rust sense — a truncated or
//! malformed buffer sets `truncated` on the returned descriptor rather than
//! returning `Result`, per the "best-effort partial descriptor" requirement:
//! a broken sequence header must not tear down the session, only degrade
//! the descriptor the session reports.

pub mod aac;
pub mod av1;
pub mod avc;
pub mod hevc;
