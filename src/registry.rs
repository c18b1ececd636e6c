//! The process-wide stream registry: `app` → publisher session, plus
//! per-publisher subscriber set, and media fan-out with a
//! disconnect-slow-consumer back-pressure policy.
//!
//! Fan-out is message passing over a bounded channel per subscriber rather
//! than shared mutable session state, so a slow reader can be dropped
//! without the publisher's send path ever blocking on it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::{info, warn};
use tokio::sync::mpsc;

use crate::chunk::OutboundMessage;

/// Bounded per-subscriber outbound queue; a publisher that outruns this
/// many buffered messages for one subscriber causes that subscriber (only)
/// to be dropped.
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 1024;

pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Hands out a process-wide unique session id; used as the registry key for
/// publisher/subscriber bookkeeping and as a log-line correlator.
pub fn next_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Clone)]
pub struct CachedHeaders {
    pub metadata: Option<Vec<u8>>,
    pub aac_sequence_header: Option<Vec<u8>>,
    pub avc_sequence_header: Option<Vec<u8>>,
}

impl Default for CachedHeaders {
    fn default() -> Self {
        CachedHeaders {
            metadata: None,
            aac_sequence_header: None,
            avc_sequence_header: None,
        }
    }
}

struct Subscriber {
    /// The message stream id this subscriber used in its `play` call;
    /// every fanned-out message to it must be rewritten to carry this id,
    /// not the publisher's.
    stream_id: u32,
    sender: mpsc::Sender<OutboundMessage>,
}

struct StreamEntry {
    publisher: SessionId,
    stream_path: String,
    publish_stream_id: u32,
    cached: CachedHeaders,
    subscribers: HashMap<SessionId, Subscriber>,
}

#[derive(Debug)]
pub struct DuplicatePublish;

#[derive(Default)]
pub struct Registry {
    streams: Mutex<HashMap<String, StreamEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            streams: Mutex::new(HashMap::new()),
        }
    }

    /// Atomic check-then-insert: only one publisher may hold `app` at a
    /// time.
    pub fn try_publish(
        &self,
        app: &str,
        publisher: SessionId,
        stream_path: String,
        publish_stream_id: u32,
    ) -> Result<(), DuplicatePublish> {
        let mut streams = self.streams.lock().unwrap();
        if streams.contains_key(app) {
            return Err(DuplicatePublish);
        }
        streams.insert(
            app.to_string(),
            StreamEntry {
                publisher,
                stream_path,
                publish_stream_id,
                cached: CachedHeaders::default(),
                subscribers: HashMap::new(),
            },
        );
        info!("registry: {} now published by session {}", app, publisher);
        Ok(())
    }

    /// Removes `app`'s entry if it's still owned by `publisher`, returning
    /// the attached subscribers' send handles so the caller can push a
    /// `NetStream.Play.UnpublishNotify` to each before they're dropped.
    pub fn remove_publisher(
        &self,
        app: &str,
        publisher: SessionId,
    ) -> Vec<(SessionId, u32, mpsc::Sender<OutboundMessage>)> {
        let mut streams = self.streams.lock().unwrap();
        match streams.get(app) {
            Some(entry) if entry.publisher == publisher => {
                let entry = streams.remove(app).unwrap();
                info!("registry: {} unpublished by session {}", app, publisher);
                entry
                    .subscribers
                    .into_iter()
                    .map(|(id, sub)| (id, sub.stream_id, sub.sender))
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    /// Attaches `subscriber` to `app`'s publisher, returning the cached
    /// sequence headers/metadata to replay to the late joiner, or `None` if
    /// there's no publisher for `app`. `stream_id` is the message stream id
    /// the subscriber used in its `play` call; every message fanned out to
    /// it is rewritten to carry this id.
    pub fn subscribe(
        &self,
        app: &str,
        subscriber: SessionId,
        stream_id: u32,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Option<CachedHeaders> {
        let mut streams = self.streams.lock().unwrap();
        let entry = streams.get_mut(app)?;
        entry.subscribers.insert(subscriber, Subscriber { stream_id, sender });
        Some(entry.cached.clone())
    }

    pub fn unsubscribe(&self, app: &str, subscriber: SessionId) {
        let mut streams = self.streams.lock().unwrap();
        if let Some(entry) = streams.get_mut(app) {
            entry.subscribers.remove(&subscriber);
        }
    }

    pub fn cache_metadata(&self, app: &str, publisher: SessionId, payload: Vec<u8>) {
        self.with_owned_entry(app, publisher, |entry| entry.cached.metadata = Some(payload));
    }

    pub fn cache_aac_sequence_header(&self, app: &str, publisher: SessionId, payload: Vec<u8>) {
        self.with_owned_entry(app, publisher, |entry| {
            entry.cached.aac_sequence_header = Some(payload)
        });
    }

    pub fn cache_avc_sequence_header(&self, app: &str, publisher: SessionId, payload: Vec<u8>) {
        self.with_owned_entry(app, publisher, |entry| {
            entry.cached.avc_sequence_header = Some(payload)
        });
    }

    fn with_owned_entry(&self, app: &str, publisher: SessionId, f: impl FnOnce(&mut StreamEntry)) {
        let mut streams = self.streams.lock().unwrap();
        if let Some(entry) = streams.get_mut(app) {
            if entry.publisher == publisher {
                f(entry);
            }
        }
    }

    /// Fans a publisher's media message out to every subscriber of `app`,
    /// rewriting `stream_id` per subscriber and disconnecting any
    /// subscriber whose queue is full rather than blocking the publisher.
    pub fn fan_out(&self, app: &str, publisher: SessionId, message: &OutboundMessage) {
        let mut streams = self.streams.lock().unwrap();
        let entry = match streams.get_mut(app) {
            Some(e) if e.publisher == publisher => e,
            _ => return,
        };
        entry.subscribers.retain(|subscriber_id, sub| {
            let mut out = message.clone();
            out.stream_id = sub.stream_id;
            match sub.sender.try_send(out) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "registry: dropping slow subscriber {} of {} (fan-out overflow)",
                        subscriber_id, app
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }

    pub fn stream_path(&self, app: &str) -> Option<String> {
        let streams = self.streams.lock().unwrap();
        streams.get(app).map(|e| e.stream_path.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn msg() -> OutboundMessage {
        OutboundMessage {
            csid: 6,
            stream_id: 1,
            type_id: 9,
            timestamp: 0,
            payload: Bytes::from_static(b"frame"),
        }
    }

    #[test]
    fn rejects_duplicate_publish_on_same_app() {
        let reg = Registry::new();
        reg.try_publish("live", 1, "live/abc".to_string(), 1).unwrap();
        assert!(reg.try_publish("live", 2, "live/abc".to_string(), 1).is_err());
    }

    #[test]
    fn subscriber_receives_fanned_out_message() {
        let reg = Registry::new();
        reg.try_publish("live", 1, "live/abc".to_string(), 1).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let cached = reg.subscribe("live", 2, 7, tx).unwrap();
        assert!(cached.metadata.is_none());

        reg.fan_out("live", 1, &msg());
        let received = rx.try_recv().unwrap();
        assert_eq!(received.stream_id, 7);
        assert_eq!(&received.payload[..], b"frame");
    }

    #[test]
    fn full_subscriber_queue_is_dropped_not_blocked() {
        let reg = Registry::new();
        reg.try_publish("live", 1, "live/abc".to_string(), 1).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        reg.subscribe("live", 2, 1, tx).unwrap();

        reg.fan_out("live", 1, &msg());
        reg.fan_out("live", 1, &msg());

        // second send should have found the channel full and dropped it;
        // a third fan-out must not find the (now-removed) subscriber.
        reg.fan_out("live", 1, &msg());
    }

    #[test]
    fn remove_publisher_returns_subscriber_ids() {
        let reg = Registry::new();
        reg.try_publish("live", 1, "live/abc".to_string(), 1).unwrap();
        let (tx, _rx) = mpsc::channel(8);
        reg.subscribe("live", 2, 1, tx).unwrap();

        let subs = reg.remove_publisher("live", 1);
        let ids: Vec<SessionId> = subs.iter().map(|(id, _, _)| *id).collect();
        assert_eq!(ids, vec![2]);
        assert!(reg.try_publish("live", 3, "live/abc".to_string(), 1).is_ok());
    }
}
