//! The per-connection session state machine: drives one TCP connection
//! from handshake through `connect`/`createStream` to publish-or-play
//! streaming, and tears itself down on any unrecoverable error. Wires
//! together `handshake`, `chunk::ChunkCodec` (wrapped in a
//! `Framed<TcpStream, _>` driven with `futures::{StreamExt, SinkExt}`),
//! `command`, `message`, and `registry`.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use failure::{Error, ResultExt};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::amf0;
use crate::chunk::{ChunkCodec, InboundMessage, OutboundMessage, PROTOCOL_CONTROL_CSID};
use crate::command::{self, ConnectInfo, SessionState};
use crate::context::Context;
use crate::error::CloseReason;
use crate::message::{self, MessageKind};
use crate::registry::{self, CachedHeaders, Registry, SessionId};

/// Server announces this outbound chunk size to every peer right after
/// `connect`; matches the value `ChunkCodec` already uses for its own
/// outbound framing by default.
const OUT_CHUNK_SIZE: u32 = 4096;
const WINDOW_ACK_SIZE: u32 = 5_000_000;
const PEER_BANDWIDTH: u32 = 5_000_000;
/// "dynamic" limit type, sent as part of the connect response.
const PEER_BANDWIDTH_LIMIT_DYNAMIC: u8 = 2;

#[derive(Clone, Copy, Debug, Default)]
struct AudioDescriptor {
    codec_id: u8,
    sample_rate: u32,
    channels: u8,
    name: &'static str,
}

#[derive(Clone, Copy, Debug, Default)]
struct VideoDescriptor {
    codec_id: u8,
    level: f64,
    width: u32,
    height: u32,
    name: &'static str,
}

/// Per-connection chunk-stream ids allocated once, at `connect`, and reused
/// for the life of the session: one each for the command/audio/video
/// channels.
#[derive(Clone, Copy, Debug, Default)]
struct Csids {
    command: u32,
    audio: u32,
    video: u32,
    data: u32,
}

pub struct Session {
    id: SessionId,
    ctx: Context,
    registry: Arc<Registry>,
    framed: Framed<TcpStream, ChunkCodec>,
    state: SessionState,
    connect_info: Option<ConnectInfo>,
    create_stream_counter: f64,
    csids: Csids,
    /// The message stream id the client used for its `publish`/`play` call;
    /// every subsequent reply on that logical stream echoes it back.
    media_stream_id: u32,
    stream_key: String,
    peer_bandwidth: u32,
    aac_sequence_header: Option<Bytes>,
    video_sequence_header: Option<Bytes>,
    metadata_payload: Option<Bytes>,
    audio: AudioDescriptor,
    video: VideoDescriptor,
    subscriber_rx: Option<mpsc::Receiver<OutboundMessage>>,
}

impl Session {
    /// Runs one accepted connection to completion, cleaning up any
    /// registry entry it holds regardless of how it exits.
    pub async fn run(
        stream: TcpStream,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        registry: Arc<Registry>,
    ) {
        let id = registry::next_session_id();
        let ctx = Context::new(local_addr, peer_addr);
        info!("{} (session {}): accepted", ctx, id);

        let mut session = Session {
            id,
            ctx,
            registry,
            framed: match Self::handshake(stream).await {
                Ok(framed) => framed,
                Err(e) => {
                    warn!("{} (session {}): handshake failed: {}", ctx, id, e);
                    return;
                }
            },
            state: SessionState::HandshakeDone,
            connect_info: None,
            create_stream_counter: 0.0,
            csids: Csids::default(),
            media_stream_id: 0,
            stream_key: String::new(),
            peer_bandwidth: 0,
            aac_sequence_header: None,
            video_sequence_header: None,
            metadata_payload: None,
            audio: AudioDescriptor::default(),
            video: VideoDescriptor::default(),
            subscriber_rx: None,
        };

        if let Err(e) = session.drive().await {
            let noteworthy = e
                .downcast_ref::<failure::Context<CloseReason>>()
                .map_or(true, |c| c.get_context().is_noteworthy());
            if noteworthy {
                warn!("{} (session {}): closing: {}", session.ctx, session.id, e);
            } else {
                debug!("{} (session {}): closing: {}", session.ctx, session.id, e);
            }
        }
        session.cleanup().await;
        info!("{} (session {}): done", session.ctx, session.id);
    }

    async fn handshake(mut stream: TcpStream) -> Result<Framed<TcpStream, ChunkCodec>, Error> {
        crate::handshake::perform(&mut stream).await?;
        Ok(Framed::new(stream, ChunkCodec::new()))
    }

    fn app(&self) -> &str {
        self.connect_info.as_ref().map(|c| c.app.as_str()).unwrap_or("")
    }

    /// The event loop: pulls the next inbound chunk-stream message or, once
    /// playing, the next fanned-out media message for this subscriber, and
    /// acts on whichever is ready first. The two sources are polled by hand
    /// (rather than inside a `tokio::select!` future expression that would
    /// have to capture all of `self`) so `self.framed` and
    /// `self.subscriber_rx` can be borrowed independently.
    async fn drive(&mut self) -> Result<(), Error> {
        enum Event {
            Inbound(InboundMessage),
            Outbound(OutboundMessage),
            Eof,
            SubscriberChannelClosed,
        }

        loop {
            let event = {
                let framed = &mut self.framed;
                match &mut self.subscriber_rx {
                    Some(rx) => tokio::select! {
                        inbound = framed.next() => match inbound {
                            Some(Ok(msg)) => Event::Inbound(msg),
                            Some(Err(e)) => return Err(e.context(CloseReason::Framing).into()),
                            None => Event::Eof,
                        },
                        out = rx.recv() => match out {
                            Some(out) => Event::Outbound(out),
                            None => Event::SubscriberChannelClosed,
                        },
                    },
                    None => match framed.next().await {
                        Some(Ok(msg)) => Event::Inbound(msg),
                        Some(Err(e)) => return Err(e.context(CloseReason::Framing).into()),
                        None => Event::Eof,
                    },
                }
            };

            match event {
                Event::Inbound(msg) => {
                    self.ctx.byte_offset = self.framed.codec().bytes_in();
                    self.handle_message(msg).await?;
                    self.maybe_ack().await?;
                }
                Event::Outbound(out) => {
                    self.framed.send(out).await.context(CloseReason::Transport)?;
                }
                Event::Eof => return Err(failure::err_msg("EOF").context(CloseReason::Transport).into()),
                Event::SubscriberChannelClosed => {
                    return Err(failure::err_msg("dropped as a slow consumer")
                        .context(CloseReason::FanoutOverflow)
                        .into())
                }
            }
        }
    }

    async fn maybe_ack(&mut self) -> Result<(), Error> {
        if let Some(seq) = self.framed.codec_mut().take_pending_ack() {
            self.send_control(message::TYPE_ACKNOWLEDGEMENT, message::encode_acknowledgement(seq))
                .await?;
        }
        self.framed.codec_mut().purge_idle_buffers();
        Ok(())
    }

    async fn send_control(&mut self, type_id: u8, payload: Bytes) -> Result<(), Error> {
        self.framed
            .send(OutboundMessage::control(PROTOCOL_CONTROL_CSID, type_id, payload))
            .await
            .context(CloseReason::Transport)?;
        Ok(())
    }

    async fn send_command(&mut self, payload: Vec<u8>) -> Result<(), Error> {
        self.framed
            .send(OutboundMessage {
                csid: self.csids.command,
                stream_id: self.media_stream_id,
                type_id: message::TYPE_AMF0_COMMAND,
                timestamp: 0,
                payload: Bytes::from(payload),
            })
            .await
            .context(CloseReason::Transport)?;
        Ok(())
    }

    async fn handle_message(&mut self, msg: InboundMessage) -> Result<(), Error> {
        if !message::is_known_type_range(msg.type_id) {
            return Err(failure::format_err!(
                "unknown message type id {} (expected <= 22)",
                msg.type_id
            )
            .context(CloseReason::Framing)
            .into());
        }

        match message::classify(msg.type_id) {
            MessageKind::SetChunkSize | MessageKind::Abort => {
                // Framing-level effects already applied inline by ChunkCodec.
            }
            MessageKind::Acknowledgement => {
                debug!("{}: ack from peer, ignored (stats only)", self.ctx);
            }
            MessageKind::UserControl => {
                debug!("{}: user control message, out of scope", self.ctx);
            }
            MessageKind::WindowAckSize => {
                if msg.payload.len() >= 4 {
                    let n = be_u32(&msg.payload);
                    self.framed.codec_mut().set_window_ack_size(n);
                }
            }
            MessageKind::SetPeerBandwidth => {
                if msg.payload.len() >= 4 {
                    self.peer_bandwidth = be_u32(&msg.payload);
                }
            }
            MessageKind::Audio => self.handle_audio(msg).await?,
            MessageKind::Video => self.handle_video(msg).await?,
            MessageKind::Amf3Data => {
                let payload = message::strip_amf3_marker(&msg.payload);
                self.handle_data(payload).await?;
            }
            MessageKind::Amf3Command => {
                let payload = message::strip_amf3_marker(&msg.payload);
                self.handle_command(msg.stream_id, payload).await?;
            }
            MessageKind::Amf0Data => self.handle_data(&msg.payload).await?,
            MessageKind::Amf0Command => self.handle_command(msg.stream_id, &msg.payload).await?,
            MessageKind::Aggregate => {
                debug!("{}: aggregate message, out of scope", self.ctx);
            }
            MessageKind::Unknown(n) => {
                debug!("{}: ignoring reserved/unused message type {}", self.ctx, n);
            }
        }
        Ok(())
    }

    // --- Media -----------------------------------------------------------

    async fn handle_audio(&mut self, msg: InboundMessage) -> Result<(), Error> {
        if message::is_aac_sequence_header(&msg.payload) {
            let cfg = message::parse_aac_sequence_header(&msg.payload);
            info!(
                "{}: AAC sequence header: {} {}Hz {}ch",
                self.ctx,
                cfg.profile_name(),
                cfg.sample_rate,
                cfg.channels
            );
            self.audio.sample_rate = cfg.sample_rate;
            self.audio.channels = cfg.channels;
            self.audio.codec_id = 10; // FLV AAC
            self.audio.name = crate::constants::audio_codec_name(self.audio.codec_id);
            self.aac_sequence_header = Some(msg.payload.clone());
            if self.state == SessionState::Publishing {
                self.registry
                    .cache_aac_sequence_header(self.app(), self.id, msg.payload.to_vec());
            }
        }
        self.fan_out(self.csids.audio, message::TYPE_AUDIO, msg.timestamp, msg.payload);
        Ok(())
    }

    async fn handle_video(&mut self, msg: InboundMessage) -> Result<(), Error> {
        if let Some(cfg) = message::parse_video_sequence_header(&msg.payload) {
            if let Some(avc) = cfg.avc {
                info!(
                    "{}: AVC sequence header: profile {} level {:.1} {}x{}",
                    self.ctx, avc.profile, avc.level, avc.width, avc.height
                );
                self.video = VideoDescriptor {
                    codec_id: message::CODEC_ID_AVC,
                    level: avc.level,
                    width: avc.width,
                    height: avc.height,
                    name: crate::constants::video_codec_name(message::CODEC_ID_AVC),
                };
            } else if let Some(hevc) = cfg.hevc {
                info!(
                    "{}: HEVC sequence header: profile {} level {:.1} {}x{}",
                    self.ctx, hevc.profile, hevc.level, hevc.width, hevc.height
                );
                self.video = VideoDescriptor {
                    codec_id: message::CODEC_ID_HEVC,
                    level: hevc.level,
                    width: hevc.width,
                    height: hevc.height,
                    name: crate::constants::video_codec_name(message::CODEC_ID_HEVC),
                };
            } else if let Some(av1) = cfg.av1 {
                info!(
                    "{}: AV1 sequence header: profile {} level {:.1} {}x{}",
                    self.ctx, av1.seq_profile, av1.level, av1.width, av1.height
                );
                self.video = VideoDescriptor {
                    codec_id: message::CODEC_ID_AV1,
                    level: av1.level,
                    width: av1.width,
                    height: av1.height,
                    name: crate::constants::video_codec_name(message::CODEC_ID_AV1),
                };
            }
            self.video_sequence_header = Some(msg.payload.clone());
            if self.state == SessionState::Publishing {
                self.registry
                    .cache_avc_sequence_header(self.app(), self.id, msg.payload.to_vec());
            }
        }
        self.fan_out(self.csids.video, message::TYPE_VIDEO, msg.timestamp, msg.payload);
        Ok(())
    }

    async fn handle_data(&mut self, payload: &[u8]) -> Result<(), Error> {
        match message::parse_metadata(payload) {
            Ok(Some(_values)) => {
                self.metadata_payload = Some(Bytes::copy_from_slice(payload));
                if self.state == SessionState::Publishing {
                    self.registry
                        .cache_metadata(self.app(), self.id, payload.to_vec());
                }
                self.fan_out(
                    self.csids.data,
                    message::TYPE_AMF0_DATA,
                    0,
                    Bytes::copy_from_slice(payload),
                );
            }
            Ok(None) => debug!("{}: unrecognized AMF0 data message, ignored", self.ctx),
            Err(e) => warn!("{}: malformed AMF0 data message: {}", self.ctx, e),
        }
        Ok(())
    }

    fn fan_out(&self, csid: u32, type_id: u8, timestamp: u32, payload: Bytes) {
        if self.state != SessionState::Publishing {
            return;
        }
        let message = OutboundMessage {
            csid,
            stream_id: 0, // rewritten per-subscriber by the registry
            type_id,
            timestamp,
            payload,
        };
        self.registry.fan_out(self.app(), self.id, &message);
    }

    // --- Commands ----------------------------------------------------------

    async fn handle_command(&mut self, message_stream_id: u32, payload: &[u8]) -> Result<(), Error> {
        let values = match amf0::decode_all(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!("{}: malformed AMF0 command: {}", self.ctx, e);
                return Ok(());
            }
        };
        let cmd = match command::parse_command(&values) {
            Some(c) => c,
            None => {
                debug!("{}: AMF0 command with no name, ignored", self.ctx);
                return Ok(());
            }
        };

        debug!("{}: command {:?}", self.ctx, cmd.name);
        match cmd.name {
            "connect" => self.on_connect(&cmd).await,
            "createStream" => self.on_create_stream(&cmd).await,
            "releaseStream" | "FCPublish" | "FCUnpublish" | "getStreamLength" => Ok(()),
            "publish" => self.on_publish(message_stream_id, &cmd).await,
            "play" => self.on_play(message_stream_id, &cmd).await,
            other => {
                debug!("{}: unhandled command {:?}, ignored", self.ctx, other);
                Ok(())
            }
        }
    }

    async fn on_connect(&mut self, cmd: &command::IncomingCommand<'_>) -> Result<(), Error> {
        let info = command::parse_connect(cmd).context(CloseReason::ProtocolState)?;
        command::ensure_transition(self.state, SessionState::Connected).context(CloseReason::ProtocolState)?;

        self.csids.command = self.framed.codec_mut().allocate_csid();
        self.csids.audio = self.framed.codec_mut().allocate_csid();
        self.csids.video = self.framed.codec_mut().allocate_csid();
        self.csids.data = self.framed.codec_mut().allocate_csid();

        self.send_control(
            message::TYPE_WINDOW_ACK_SIZE,
            message::encode_window_ack_size(WINDOW_ACK_SIZE),
        )
        .await?;
        self.send_control(
            message::TYPE_SET_PEER_BANDWIDTH,
            message::encode_set_peer_bandwidth(PEER_BANDWIDTH, PEER_BANDWIDTH_LIMIT_DYNAMIC),
        )
        .await?;
        self.send_control(
            message::TYPE_SET_CHUNK_SIZE,
            message::encode_set_chunk_size(OUT_CHUNK_SIZE),
        )
        .await?;
        self.framed.codec_mut().set_out_chunk_size(OUT_CHUNK_SIZE as usize);

        let object_encoding = info.object_encoding;
        info!("{}: connect app={:?}", self.ctx, info.app);
        self.connect_info = Some(info);
        self.state = SessionState::Connected;

        let reply = command::encode_connect_result(cmd.transaction_id, object_encoding)?;
        self.send_command(reply).await
    }

    async fn on_create_stream(&mut self, cmd: &command::IncomingCommand<'_>) -> Result<(), Error> {
        self.create_stream_counter += 1.0;
        let reply = command::encode_create_stream_result(cmd.transaction_id, self.create_stream_counter)?;
        self.send_command(reply).await
    }

    async fn on_publish(&mut self, message_stream_id: u32, cmd: &command::IncomingCommand<'_>) -> Result<(), Error> {
        let (stream_key, _mode) = match command::parse_publish_args(cmd.args) {
            Ok(v) => v,
            Err(e) => {
                warn!("{}: malformed publish command: {}", self.ctx, e);
                return Ok(());
            }
        };
        self.media_stream_id = message_stream_id;

        if stream_key.is_empty() {
            let reply = command::encode_publish_unauthorized()?;
            self.send_command(reply).await?;
            return Err(failure::err_msg("publish with empty stream key").context(CloseReason::ProtocolState).into());
        }

        let app = self.app().to_string();
        let stream_path = format!("{}/{}", app, stream_key);
        if self
            .registry
            .try_publish(&app, self.id, stream_path.clone(), message_stream_id)
            .is_err()
        {
            warn!("{}: duplicate publish attempt on app {:?}", self.ctx, app);
            let reply = command::encode_publish_bad_name(&app, &stream_key)?;
            self.send_command(reply).await?;
            return Err(failure::format_err!("app {:?} already published", app)
                .context(CloseReason::ProtocolState)
                .into());
        }

        command::ensure_transition(self.state, SessionState::Publishing).context(CloseReason::ProtocolState)?;
        self.state = SessionState::Publishing;
        self.stream_key = stream_key.clone();
        info!("{}: publishing {:?}", self.ctx, stream_path);

        let reply = command::encode_publish_start(&app, &stream_key)?;
        self.send_command(reply).await
    }

    async fn on_play(&mut self, message_stream_id: u32, cmd: &command::IncomingCommand<'_>) -> Result<(), Error> {
        let stream_key = match command::parse_play_args(cmd.args) {
            Ok(v) => v,
            Err(e) => {
                warn!("{}: malformed play command: {}", self.ctx, e);
                return Ok(());
            }
        };
        self.media_stream_id = message_stream_id;
        let app = self.app().to_string();

        let (tx, rx) = mpsc::channel(registry::SUBSCRIBER_QUEUE_DEPTH);
        let cached = match self.registry.subscribe(&app, self.id, message_stream_id, tx) {
            Some(cached) => cached,
            None => {
                warn!("{}: play on app {:?} with no publisher", self.ctx, app);
                let reply = command::encode_play_bad_name(&app)?;
                self.send_command(reply).await?;
                return Err(failure::format_err!("no publisher for app {:?}", app)
                    .context(CloseReason::ProtocolState)
                    .into());
            }
        };

        command::ensure_transition(self.state, SessionState::Playing).context(CloseReason::ProtocolState)?;
        self.state = SessionState::Playing;
        self.stream_key = stream_key.clone();
        self.subscriber_rx = Some(rx);
        info!("{}: playing {}/{}", self.ctx, app, stream_key);

        let reply = command::encode_play_start(&stream_key)?;
        self.send_command(reply).await?;

        self.replay_cached_headers(cached).await
    }

    /// Late-joiner replay: metadata first, then the AAC/video sequence
    /// headers, so the player can configure its decoders before the first
    /// coded frame arrives.
    async fn replay_cached_headers(&mut self, cached: CachedHeaders) -> Result<(), Error> {
        if let Some(metadata) = cached.metadata {
            self.framed
                .send(OutboundMessage {
                    csid: self.csids.data,
                    stream_id: self.media_stream_id,
                    type_id: message::TYPE_AMF0_DATA,
                    timestamp: 0,
                    payload: Bytes::from(metadata),
                })
                .await
                .context(CloseReason::Transport)?;
        }
        if let Some(aac) = cached.aac_sequence_header {
            self.framed
                .send(OutboundMessage {
                    csid: self.csids.audio,
                    stream_id: self.media_stream_id,
                    type_id: message::TYPE_AUDIO,
                    timestamp: 0,
                    payload: Bytes::from(aac),
                })
                .await
                .context(CloseReason::Transport)?;
        }
        if let Some(video) = cached.avc_sequence_header {
            self.framed
                .send(OutboundMessage {
                    csid: self.csids.video,
                    stream_id: self.media_stream_id,
                    type_id: message::TYPE_VIDEO,
                    timestamp: 0,
                    payload: Bytes::from(video),
                })
                .await
                .context(CloseReason::Transport)?;
        }
        Ok(())
    }

    // --- Teardown ------------------------------------------------------------

    async fn cleanup(&mut self) {
        let app = self.app().to_string();
        match self.state {
            SessionState::Publishing => {
                let subscribers = self.registry.remove_publisher(&app, self.id);
                if !subscribers.is_empty() {
                    if let Ok(notify) = command::encode_play_unpublish_notify(&self.stream_key) {
                        for (subscriber_id, stream_id, sender) in subscribers {
                            let message = OutboundMessage {
                                csid: self.csids.command,
                                stream_id,
                                type_id: message::TYPE_AMF0_COMMAND,
                                timestamp: 0,
                                payload: Bytes::from(notify.clone()),
                            };
                            if sender.try_send(message).is_err() {
                                debug!(
                                    "{}: could not notify subscriber {} of unpublish",
                                    self.ctx, subscriber_id
                                );
                            }
                        }
                    }
                }
            }
            SessionState::Playing => {
                self.registry.unsubscribe(&app, self.id);
            }
            _ => {}
        }
    }
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}
