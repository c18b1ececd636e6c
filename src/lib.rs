//! An RTMP live-streaming ingest/relay server: handshake, chunk-stream
//! codec, command/session state machine and a process-wide publish/play
//! registry, plus the codec sequence-header parsers (AAC/AVC/HEVC/AV1) the
//! session layer uses to log and cache what a publisher is sending.
//!
//! A thin `src/bin` entry point wraps the library crate holding the
//! actual protocol machinery.

pub mod amf0;
pub mod bitreader;
pub mod chunk;
pub mod codec;
pub mod command;
pub mod constants;
pub mod context;
pub mod error;
pub mod handshake;
pub mod message;
pub mod registry;
pub mod session;

pub use registry::Registry;
pub use session::Session;
