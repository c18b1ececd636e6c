//! The RPC/control command layer: the `connect` → `createStream` →
//! `publish`/`play` session state machine, built on top of `amf0.rs` for
//! argument decoding/encoding. This module knows how to parse an incoming
//! AMF0 command and how to build the AMF0 payload for each reply; it does
//! not own a socket or the stream registry — `session.rs` drives both and
//! supplies the stream/chunk ids each reply goes out on.

use std::collections::HashMap;

use failure::{bail, Error};

use crate::amf0::{self, Amf0Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init,
    HandshakeDone,
    Connected,
    Publishing,
    Playing,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishMode {
    Live,
    Record,
    Append,
}

impl PublishMode {
    fn from_str(s: &str) -> PublishMode {
        match s {
            "record" => PublishMode::Record,
            "append" => PublishMode::Append,
            _ => PublishMode::Live,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConnectInfo {
    pub app: String,
    pub tc_url: Option<String>,
    pub swf_url: Option<String>,
    pub flash_ver: Option<String>,
    pub object_encoding: f64,
}

/// A decoded AMF0 Command message: `[name, transaction_id, command_object,
/// ...args]`.
pub struct IncomingCommand<'a> {
    pub name: &'a str,
    pub transaction_id: f64,
    pub command_object: Option<&'a Amf0Value>,
    pub args: &'a [Amf0Value],
}

pub fn parse_command(values: &[Amf0Value]) -> Option<IncomingCommand<'_>> {
    let name = match values.first() {
        Some(Amf0Value::Utf8String(s)) => s.as_str(),
        _ => return None,
    };
    let transaction_id = values.get(1).and_then(amf0::as_f64).unwrap_or(0.0);
    let command_object = values.get(2).filter(|v| !matches!(v, Amf0Value::Null));
    let args = if values.len() > 3 { &values[3..] } else { &[] };
    Some(IncomingCommand {
        name,
        transaction_id,
        command_object,
        args,
    })
}

pub fn parse_connect(cmd: &IncomingCommand) -> Result<ConnectInfo, Error> {
    let object = cmd.command_object.ok_or_else(|| failure::err_msg("connect missing command object"))?;
    let app = amf0::object_get(object, "app")
        .and_then(amf0::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| failure::err_msg("connect missing non-empty app"))?
        .to_string();
    Ok(ConnectInfo {
        app,
        tc_url: amf0::object_get(object, "tcUrl").and_then(amf0::as_str).map(String::from),
        swf_url: amf0::object_get(object, "swfUrl").and_then(amf0::as_str).map(String::from),
        flash_ver: amf0::object_get(object, "flashVer").and_then(amf0::as_str).map(String::from),
        object_encoding: amf0::object_get(object, "objectEncoding")
            .and_then(amf0::as_f64)
            .unwrap_or(0.0),
    })
}

/// `publish` command args: `[streamKey, mode]` (mode defaults to "live").
pub fn parse_publish_args(args: &[Amf0Value]) -> Result<(String, PublishMode), Error> {
    let stream_key = args
        .first()
        .and_then(amf0::as_str)
        .ok_or_else(|| failure::err_msg("publish missing stream key"))?
        .to_string();
    let mode = args
        .get(1)
        .and_then(amf0::as_str)
        .map(PublishMode::from_str)
        .unwrap_or(PublishMode::Live);
    Ok((stream_key, mode))
}

/// `play` command args: `[streamKey, ...]` — start/duration/reset are
/// accepted but not acted on (no seeking, no recorded playback).
pub fn parse_play_args(args: &[Amf0Value]) -> Result<String, Error> {
    args.first()
        .and_then(amf0::as_str)
        .map(String::from)
        .ok_or_else(|| failure::err_msg("play missing stream key"))
}

// --- AMF0 payload builders ---------------------------------------------------

fn status_object(level: &str, code: &str, description: &str) -> Amf0Value {
    let mut map = HashMap::new();
    map.insert("level".to_string(), Amf0Value::Utf8String(level.to_string()));
    map.insert("code".to_string(), Amf0Value::Utf8String(code.to_string()));
    map.insert(
        "description".to_string(),
        Amf0Value::Utf8String(description.to_string()),
    );
    Amf0Value::Object(map)
}

pub fn encode_connect_result(transaction_id: f64, object_encoding: f64) -> Result<Vec<u8>, Error> {
    let mut props = HashMap::new();
    props.insert(
        "fmsVer".to_string(),
        Amf0Value::Utf8String("MasterStream/8,2".to_string()),
    );
    props.insert("capabilities".to_string(), Amf0Value::Number(31.0));
    props.insert("objectEncoding".to_string(), Amf0Value::Number(object_encoding));

    let values = vec![
        Amf0Value::Utf8String("_result".to_string()),
        Amf0Value::Number(transaction_id),
        Amf0Value::Object(props),
        status_object("status", "NetConnection.Connect.Success", "Connection succeeded."),
    ];
    amf0::encode_all(&values)
}

pub fn encode_create_stream_result(transaction_id: f64, stream_id: f64) -> Result<Vec<u8>, Error> {
    let values = vec![
        Amf0Value::Utf8String("_result".to_string()),
        Amf0Value::Number(transaction_id),
        Amf0Value::Null,
        Amf0Value::Number(stream_id),
    ];
    amf0::encode_all(&values)
}

pub fn encode_on_status(level: &str, code: &str, description: &str) -> Result<Vec<u8>, Error> {
    let values = vec![
        Amf0Value::Utf8String("onStatus".to_string()),
        Amf0Value::Number(0.0),
        Amf0Value::Null,
        status_object(level, code, description),
    ];
    amf0::encode_all(&values)
}

pub fn encode_publish_start(app: &str, stream_key: &str) -> Result<Vec<u8>, Error> {
    encode_on_status(
        "status",
        "NetStream.Publish.Start",
        &format!("/{}/{} is now published.", app, stream_key),
    )
}

pub fn encode_publish_bad_name(app: &str, stream_key: &str) -> Result<Vec<u8>, Error> {
    encode_on_status(
        "error",
        "NetStream.Publish.BadName",
        &format!("/{}/{} is already published.", app, stream_key),
    )
}

pub fn encode_publish_unauthorized() -> Result<Vec<u8>, Error> {
    encode_on_status(
        "error",
        "NetStream.publish.Unauthorized",
        "Publish stream key must not be empty.",
    )
}

pub fn encode_play_start(stream_key: &str) -> Result<Vec<u8>, Error> {
    encode_on_status(
        "status",
        "NetStream.Play.Start",
        &format!("Started playing {}.", stream_key),
    )
}

pub fn encode_play_bad_name(app: &str) -> Result<Vec<u8>, Error> {
    encode_on_status(
        "error",
        "NetStream.Play.BadName",
        &format!("No publisher for app {}.", app),
    )
}

pub fn encode_play_unpublish_notify(stream_key: &str) -> Result<Vec<u8>, Error> {
    encode_on_status(
        "status",
        "NetStream.Play.UnpublishNotify",
        &format!("{} has stopped publishing.", stream_key),
    )
}

/// Whether `from` -> `to` is a legal session-state transition in the
/// `INIT -> HANDSHAKE_DONE -> CONNECTED -> (PUBLISHING | PLAYING) -> CLOSED`
/// machine.
pub fn is_valid_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    matches!(
        (from, to),
        (Init, HandshakeDone)
            | (HandshakeDone, Connected)
            | (Connected, Publishing)
            | (Connected, Playing)
            | (_, Closed)
    )
}

pub fn ensure_transition(from: SessionState, to: SessionState) -> Result<(), Error> {
    if is_valid_transition(from, to) {
        Ok(())
    } else {
        bail!("illegal session state transition {:?} -> {:?}", from, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_connect_command_object() {
        let mut object = HashMap::new();
        object.insert("app".to_string(), Amf0Value::Utf8String("live".to_string()));
        object.insert(
            "tcUrl".to_string(),
            Amf0Value::Utf8String("rtmp://example/live".to_string()),
        );
        let values = vec![
            Amf0Value::Utf8String("connect".to_string()),
            Amf0Value::Number(1.0),
            Amf0Value::Object(object),
        ];
        let cmd = parse_command(&values).unwrap();
        assert_eq!(cmd.name, "connect");
        let info = parse_connect(&cmd).unwrap();
        assert_eq!(info.app, "live");
        assert_eq!(info.tc_url.as_deref(), Some("rtmp://example/live"));
    }

    #[test]
    fn rejects_connect_with_empty_app() {
        let mut object = HashMap::new();
        object.insert("app".to_string(), Amf0Value::Utf8String(String::new()));
        let values = vec![
            Amf0Value::Utf8String("connect".to_string()),
            Amf0Value::Number(1.0),
            Amf0Value::Object(object),
        ];
        let cmd = parse_command(&values).unwrap();
        assert!(parse_connect(&cmd).is_err());
    }

    #[test]
    fn parses_publish_args_with_default_mode() {
        let args = vec![Amf0Value::Utf8String("abc".to_string())];
        let (key, mode) = parse_publish_args(&args).unwrap();
        assert_eq!(key, "abc");
        assert_eq!(mode, PublishMode::Live);
    }

    #[test]
    fn state_machine_rejects_skipping_connect() {
        assert!(!is_valid_transition(SessionState::Init, SessionState::Publishing));
        assert!(is_valid_transition(SessionState::Connected, SessionState::Publishing));
        assert!(is_valid_transition(SessionState::Playing, SessionState::Closed));
    }

    #[test]
    fn connect_result_round_trips_through_amf0() {
        let bytes = encode_connect_result(1.0, 0.0).unwrap();
        let values = amf0::decode_all(&bytes).unwrap();
        assert_eq!(values[0], Amf0Value::Utf8String("_result".to_string()));
    }
}
