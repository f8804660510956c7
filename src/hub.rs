//! Fan-out of captured backend traffic to passive observers
//!
//! Every observer owns a bounded queue. Publishing never waits on a queue:
//! a keep-alive that does not fit is dropped, a data event that does not fit
//! disconnects that observer. Each observer's session drains its own queue
//! into a `text/event-stream` response.

use chrono::Utc;
use dashmap::DashMap;
use hyper::body::{Body, Bytes, Frame};
use serde::Serialize;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{Instant, Sleep};
use tracing::{debug, warn};

/// Bytes of a captured response considered for its preview
pub const PREVIEW_SCAN_BYTES: usize = 500;
/// Characters kept in a preview
pub const PREVIEW_CHARS: usize = 200;
/// Characters of a sent message echoed to observers
pub const SENT_ECHO_CHARS: usize = 100;

/// An event delivered to observers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HubEvent {
    Connected {
        id: u64,
        version: String,
    },
    Response {
        path: String,
        size: u64,
        preview: String,
        time: f64,
    },
    Sent {
        message: String,
        time: f64,
    },
    Ping {
        t: i64,
    },
}

fn now_secs() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

impl HubEvent {
    /// A captured RPC response; `prefix` holds the first bytes of the body
    pub fn response(path: impl Into<String>, prefix: &[u8], size: u64) -> Self {
        HubEvent::Response {
            path: path.into(),
            size,
            preview: preview(prefix, size),
            time: now_secs(),
        }
    }

    pub fn sent(message: &str) -> Self {
        HubEvent::Sent {
            message: message.chars().take(SENT_ECHO_CHARS).collect(),
            time: now_secs(),
        }
    }

    pub fn ping() -> Self {
        HubEvent::Ping {
            t: Utc::now().timestamp(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HubEvent::Connected { .. } => "connected",
            HubEvent::Response { .. } => "response",
            HubEvent::Sent { .. } => "sent",
            HubEvent::Ping { .. } => "ping",
        }
    }

    pub fn is_keepalive(&self) -> bool {
        matches!(self, HubEvent::Ping { .. })
    }

    /// Wire form: `event: <name>\ndata: <json>\n\n`
    pub fn to_sse(&self) -> Bytes {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        Bytes::from(format!("event: {}\ndata: {}\n\n", self.name(), data))
    }
}

/// Human-readable preview of a response body.
///
/// A multi-byte character cut off at the end of the scanned prefix does not
/// make the body binary.
pub fn preview(prefix: &[u8], size: u64) -> String {
    let scanned = &prefix[..prefix.len().min(PREVIEW_SCAN_BYTES)];
    let text = match std::str::from_utf8(scanned) {
        Ok(text) => text,
        Err(e) if e.error_len().is_none() => {
            // valid up to a truncated trailing character
            std::str::from_utf8(&scanned[..e.valid_up_to()]).unwrap_or_default()
        }
        Err(_) => return format!("[binary {} bytes]", size),
    };
    text.chars().take(PREVIEW_CHARS).collect()
}

struct HubInner {
    observers: DashMap<u64, mpsc::Sender<HubEvent>>,
    next_id: AtomicU64,
    capacity: usize,
    keepalive: Duration,
}

/// Publish side of the push channel; cheap to clone
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(capacity: usize, keepalive: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                observers: DashMap::new(),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                keepalive,
            }),
        }
    }

    /// Register a new observer with its own queue
    pub fn subscribe(&self) -> Observer {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.inner.observers.insert(id, tx);
        debug!(observer = id, observers = self.observer_count(), "Observer subscribed");
        Observer {
            id,
            rx,
            hub: self.clone(),
        }
    }

    pub fn unsubscribe(&self, id: u64) {
        if self.inner.observers.remove(&id).is_some() {
            debug!(observer = id, "Observer unsubscribed");
        }
    }

    pub fn observer_count(&self) -> usize {
        self.inner.observers.len()
    }

    /// Enqueue `event` for every observer without waiting.
    ///
    /// Returns how many observers accepted it.
    pub fn publish(&self, event: HubEvent) -> usize {
        let mut delivered = 0;
        let mut dropped = Vec::new();

        for entry in self.inner.observers.iter() {
            match entry.value().try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(ev)) if ev.is_keepalive() => {}
                Err(TrySendError::Full(_)) => {
                    warn!(observer = *entry.key(), "Observer queue full, disconnecting");
                    dropped.push(*entry.key());
                }
                Err(TrySendError::Closed(_)) => dropped.push(*entry.key()),
            }
        }

        // Removal happens after iteration; DashMap shards stay locked while iterating
        for id in dropped {
            self.unsubscribe(id);
        }
        delivered
    }

    /// Subscribe and wrap the observer in a streaming response body
    pub fn event_stream(&self, version: &str) -> EventStream {
        let observer = self.subscribe();
        let greeting = HubEvent::Connected {
            id: observer.id(),
            version: version.to_string(),
        };
        EventStream::new(observer, greeting, self.inner.keepalive)
    }
}

/// Receive side of one observer. Dropping it unsubscribes.
pub struct Observer {
    id: u64,
    rx: mpsc::Receiver<HubEvent>,
    hub: BroadcastHub,
}

impl Observer {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the hub disconnected this observer
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.rx.recv().await
    }
}

impl Drop for Observer {
    fn drop(&mut self) {
        self.hub.unsubscribe(self.id);
    }
}

/// `text/event-stream` body for one observer session.
///
/// Emits the greeting first, then queued events, and a ping whenever the
/// queue stays quiet for the keep-alive interval. Ends when the hub drops
/// the observer; dropping the body (client gone) unsubscribes it.
pub struct EventStream {
    greeting: Option<HubEvent>,
    observer: Observer,
    keepalive: Duration,
    idle: Pin<Box<Sleep>>,
}

impl EventStream {
    fn new(observer: Observer, greeting: HubEvent, keepalive: Duration) -> Self {
        Self {
            greeting: Some(greeting),
            observer,
            keepalive,
            idle: Box::pin(tokio::time::sleep(keepalive)),
        }
    }

    pub fn observer_id(&self) -> u64 {
        self.observer.id
    }

    fn emit(&mut self, event: &HubEvent) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        let deadline = Instant::now() + self.keepalive;
        self.idle.as_mut().reset(deadline);
        Poll::Ready(Some(Ok(Frame::data(event.to_sse()))))
    }
}

impl Body for EventStream {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();

        if let Some(greeting) = this.greeting.take() {
            return this.emit(&greeting);
        }

        match this.observer.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => return this.emit(&event),
            Poll::Ready(None) => return Poll::Ready(None),
            Poll::Pending => {}
        }

        if this.idle.as_mut().poll(cx).is_ready() {
            return this.emit(&HubEvent::ping());
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    fn response_event(n: usize) -> HubEvent {
        HubEvent::Response {
            path: format!("/exa.Service/Call{}", n),
            size: n as u64,
            preview: String::new(),
            time: 0.0,
        }
    }

    #[test]
    fn test_sse_wire_format() {
        let event = HubEvent::Ping { t: 42 };
        assert_eq!(
            event.to_sse(),
            Bytes::from("event: ping\ndata: {\"type\":\"ping\",\"t\":42}\n\n")
        );
    }

    #[test]
    fn test_preview_text_truncated() {
        let body = "x".repeat(1000);
        let p = preview(body.as_bytes(), 1000);
        assert_eq!(p.len(), PREVIEW_CHARS);
    }

    #[test]
    fn test_preview_binary() {
        let body = [0xff, 0xfe, 0x00, 0x01];
        assert_eq!(preview(&body, 4096), "[binary 4096 bytes]");
    }

    #[test]
    fn test_preview_cut_multibyte_character() {
        let mut body = "a".repeat(PREVIEW_SCAN_BYTES - 1).into_bytes();
        body.extend_from_slice("é".as_bytes());
        let p = preview(&body, body.len() as u64);
        assert!(p.chars().all(|c| c == 'a'));
    }

    #[test]
    fn test_sent_event_truncates_message() {
        let message = "m".repeat(300);
        match HubEvent::sent(&message) {
            HubEvent::Sent { message, .. } => assert_eq!(message.len(), SENT_ECHO_CHARS),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_all_observers() {
        let hub = BroadcastHub::new(8, Duration::from_secs(25));
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.observer_count(), 2);

        assert_eq!(hub.publish(response_event(1)), 2);
        assert_eq!(a.recv().await, Some(response_event(1)));
        assert_eq!(b.recv().await, Some(response_event(1)));
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let hub = BroadcastHub::new(8, Duration::from_secs(25));
        let observer = hub.subscribe();
        assert_eq!(hub.observer_count(), 1);
        drop(observer);
        assert_eq!(hub.observer_count(), 0);
        assert_eq!(hub.publish(response_event(1)), 0);
    }

    #[tokio::test]
    async fn test_slow_observer_does_not_block_others() {
        const OBSERVERS: usize = 4;
        const EVENTS: usize = 20;

        let hub = BroadcastHub::new(4, Duration::from_secs(25));
        let mut idle = hub.subscribe();

        let mut readers = Vec::new();
        for _ in 0..OBSERVERS - 1 {
            let mut observer = hub.subscribe();
            readers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while seen.len() < EVENTS {
                    match observer.recv().await {
                        Some(event) => seen.push(event),
                        None => break,
                    }
                }
                seen
            }));
        }

        for n in 0..EVENTS {
            hub.publish(response_event(n));
            tokio::task::yield_now().await;
        }

        let expected: Vec<HubEvent> = (0..EVENTS).map(response_event).collect();
        for reader in readers {
            assert_eq!(reader.await.unwrap(), expected);
        }

        // The idle observer overflowed and was disconnected
        assert_eq!(hub.observer_count(), 0);
        let mut buffered = 0;
        while idle.recv().await.is_some() {
            buffered += 1;
        }
        assert_eq!(buffered, 4);
    }

    #[tokio::test]
    async fn test_full_queue_drops_pings_only() {
        let hub = BroadcastHub::new(1, Duration::from_secs(25));
        let _observer = hub.subscribe();

        hub.publish(response_event(1));
        hub.publish(HubEvent::Ping { t: 1 });
        assert_eq!(hub.observer_count(), 1);

        hub.publish(response_event(2));
        assert_eq!(hub.observer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_stream_greeting_events_and_keepalive() {
        let hub = BroadcastHub::new(8, Duration::from_secs(25));
        let mut stream = hub.event_stream("1.0");
        assert_eq!(hub.observer_count(), 1);

        let frame = stream.frame().await.unwrap().unwrap().into_data().unwrap();
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.starts_with("event: connected\n"));
        assert!(text.contains("\"version\":\"1.0\""));

        hub.publish(response_event(7));
        let frame = stream.frame().await.unwrap().unwrap().into_data().unwrap();
        assert!(String::from_utf8(frame.to_vec()).unwrap().starts_with("event: response\n"));

        // Nothing published: the virtual clock runs to the keep-alive deadline
        let start = Instant::now();
        let frame = stream.frame().await.unwrap().unwrap().into_data().unwrap();
        assert!(String::from_utf8(frame.to_vec()).unwrap().starts_with("event: ping\n"));
        assert!(start.elapsed() >= Duration::from_secs(25));

        drop(stream);
        assert_eq!(hub.observer_count(), 0);
    }
}
