//! Hub event channel.
//!
//! One persistent bidirectional connection per agent. The listener thread
//! owns the inbound side: it (re)connects with backoff, parses every
//! message into a `LifecycleEvent` and forwards it to the coordinator.
//! Outbound messages go through a cloneable `ChannelHandle`; while the hub is
//! unreachable they are held in a small drop-oldest queue and flushed on the
//! next connect.

mod memory;
mod mqtt;

pub use memory::{MemoryHub, MemoryTransport};
pub use mqtt::{
    parse_mqtt_endpoint, validate_loopback_addr, MqttEndpoint, MqttTransport, TlsMaterials,
};

use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use crate::protocol::LifecycleEvent;
use crate::retry::{retry_with, sleep_unless_shutdown, RetryPolicy};
use crate::session::{AgentInput, HubEvent};

/// Outbound messages held while disconnected.
pub const PENDING_CAPACITY: usize = 32;

/// What a live connection hands back to the listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HubDelivery {
    /// The session with the hub is established (or re-established).
    Connected,
    Payload(String),
}

/// Connection factory for one hub endpoint.
pub trait HubTransport: Send + Sync {
    fn connect(&self) -> Result<(Box<dyn HubConnection>, Arc<dyn HubPublisher>)>;

    fn describe(&self) -> String;
}

/// Inbound half of a connection. `recv` blocks; an error ends the connection.
pub trait HubConnection: Send {
    fn recv(&mut self) -> Result<HubDelivery>;
}

/// Outbound half of a connection.
pub trait HubPublisher: Send + Sync {
    fn publish(&self, payload: &str) -> Result<()>;

    fn close(&self);
}

struct Shared {
    publisher: Mutex<Option<Arc<dyn HubPublisher>>>,
    pending: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Shared {
    fn publisher(&self) -> MutexGuard<'_, Option<Arc<dyn HubPublisher>>> {
        self.publisher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enqueue(&self, payload: String) {
        let mut pending = self.pending();
        Self::push_bounded(&mut pending, payload, self.capacity);
    }

    fn push_bounded(pending: &mut VecDeque<String>, payload: String, capacity: usize) {
        while pending.len() >= capacity {
            pending.pop_front();
            log::warn!("hub: outbound queue full, dropping oldest message");
        }
        pending.push_back(payload);
    }

    /// Send queued messages in order, then install `publisher`.
    ///
    /// The pending lock is held across both steps so a concurrent
    /// `ChannelHandle::publish` cannot overtake the queue.
    fn go_online(&self, publisher: Arc<dyn HubPublisher>) {
        let mut pending = self.pending();
        while let Some(payload) = pending.pop_front() {
            if let Err(e) = publisher.publish(&payload) {
                log::warn!("hub: flush failed: {:#}", e);
                pending.push_front(payload);
                break;
            }
        }
        *self.publisher() = Some(publisher);
    }
}

/// Cloneable outbound side of the channel.
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<Shared>,
}

impl ChannelHandle {
    /// Publish now if connected, otherwise queue for the next connect.
    ///
    /// Only serialization failures are errors; transport failures fall back
    /// to the queue.
    pub fn publish(&self, event: &LifecycleEvent) -> Result<()> {
        let payload = event.to_json()?;
        let publisher = self.shared.publisher().clone();
        match publisher {
            Some(publisher) => {
                if let Err(e) = publisher.publish(&payload) {
                    log::warn!("hub: publish {} failed, queueing: {:#}", event.kind(), e);
                    self.shared.enqueue(payload);
                } else {
                    log::debug!("hub: sent {}", event.kind());
                }
            }
            None => {
                // Re-check under the pending lock: the listener may have come
                // online (and flushed) since the slot was read.
                let mut pending = self.shared.pending();
                let online = self.shared.publisher().clone();
                match online {
                    Some(publisher) if publisher.publish(&payload).is_ok() => {
                        log::debug!("hub: sent {}", event.kind());
                    }
                    _ => {
                        log::debug!("hub: offline, queueing {}", event.kind());
                        Shared::push_bounded(&mut pending, payload, self.shared.capacity);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.shared.publisher().is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.shared.pending().len()
    }
}

pub struct EventChannel {
    transport: Arc<dyn HubTransport>,
    shared: Arc<Shared>,
    policy: RetryPolicy,
    shutdown: Arc<AtomicBool>,
}

impl EventChannel {
    pub fn new(
        transport: Arc<dyn HubTransport>,
        policy: RetryPolicy,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            transport,
            shared: Arc::new(Shared {
                publisher: Mutex::new(None),
                pending: Mutex::new(VecDeque::new()),
                capacity: PENDING_CAPACITY,
            }),
            policy,
            shutdown,
        }
    }

    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Start the listener thread. It runs until shutdown is raised or the
    /// reconnect policy gives up.
    pub fn spawn_listener(&self, inputs: Sender<AgentInput>) -> Result<JoinHandle<()>> {
        let transport = Arc::clone(&self.transport);
        let shared = Arc::clone(&self.shared);
        let policy = self.policy.clone();
        let shutdown = Arc::clone(&self.shutdown);
        std::thread::Builder::new()
            .name("hub-listener".to_string())
            .spawn(move || listen(transport.as_ref(), &shared, &policy, &shutdown, &inputs))
            .context("failed to spawn hub listener")
    }

    /// Disconnect the active connection, if any. Queued messages are kept.
    pub fn close(&self) {
        if let Some(publisher) = self.shared.publisher().take() {
            publisher.close();
        }
    }
}

fn listen(
    transport: &dyn HubTransport,
    shared: &Shared,
    policy: &RetryPolicy,
    shutdown: &AtomicBool,
    inputs: &Sender<AgentInput>,
) {
    let mut backoff = policy.backoff();
    while !shutdown.load(Ordering::SeqCst) {
        let what = format!("connect to hub {}", transport.describe());
        let (mut connection, publisher) = match retry_with(policy, shutdown, &what, || {
            transport.connect()
        }) {
            Ok(pair) => pair,
            Err(e) => {
                if !shutdown.load(Ordering::SeqCst) {
                    log::error!("hub: giving up: {:#}", e);
                }
                return;
            }
        };

        let mut connected = false;
        loop {
            match connection.recv() {
                Ok(HubDelivery::Connected) => {
                    log::info!("hub: connected to {}", transport.describe());
                    shared.go_online(Arc::clone(&publisher));
                    backoff.reset();
                    connected = true;
                    if inputs.send(AgentInput::Hub(HubEvent::Connected)).is_err() {
                        publisher.close();
                        return;
                    }
                }
                Ok(HubDelivery::Payload(text)) => match LifecycleEvent::parse(&text) {
                    Some(event) => {
                        log::debug!("hub: received {}", event.kind());
                        if inputs
                            .send(AgentInput::Hub(HubEvent::Message(event)))
                            .is_err()
                        {
                            publisher.close();
                            return;
                        }
                    }
                    None => log::warn!("hub: dropping malformed message: {}", truncate(&text)),
                },
                Err(e) => {
                    shared.publisher().take();
                    if shutdown.load(Ordering::SeqCst) {
                        return;
                    }
                    log::warn!("hub: connection lost: {:#}", e);
                    if connected {
                        let _ = inputs.send(AgentInput::Hub(HubEvent::Disconnected));
                    }
                    break;
                }
            }
        }

        let Some(delay) = backoff.next_delay() else {
            log::error!("hub: reconnect attempts exhausted");
            return;
        };
        log::info!("hub: reconnecting in {}ms", delay.as_millis());
        sleep_unless_shutdown(delay, shutdown);
    }
}

fn truncate(text: &str) -> &str {
    match text.char_indices().nth(120) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Error for a connection the peer (or `close`) has ended.
pub(crate) fn closed() -> anyhow::Error {
    anyhow!("hub connection closed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    fn wait_for<T>(rx: &mpsc::Receiver<T>) -> T {
        rx.recv_timeout(Duration::from_secs(2))
            .expect("timed out waiting for channel input")
    }

    fn channel(hub: &MemoryHub) -> (EventChannel, Arc<AtomicBool>) {
        let shutdown = Arc::new(AtomicBool::new(false));
        let channel = EventChannel::new(
            Arc::new(hub.transport()),
            RetryPolicy::fixed(Duration::from_millis(10)),
            Arc::clone(&shutdown),
        );
        (channel, shutdown)
    }

    #[test]
    fn inbound_messages_are_parsed_and_malformed_dropped() {
        let hub = MemoryHub::new();
        let (channel, shutdown) = channel(&hub);
        let (tx, rx) = mpsc::channel();
        let listener = channel.spawn_listener(tx).unwrap();

        assert_eq!(wait_for(&rx), AgentInput::Hub(HubEvent::Connected));
        hub.send_raw("{not json");
        hub.send_raw(r#"{"type":"startVision"}"#);
        assert_eq!(
            wait_for(&rx),
            AgentInput::Hub(HubEvent::Message(LifecycleEvent::Start))
        );

        shutdown.store(true, Ordering::SeqCst);
        channel.close();
        listener.join().unwrap();
    }

    #[test]
    fn offline_messages_flush_on_connect_in_order() {
        let hub = MemoryHub::new();
        let (channel, shutdown) = channel(&hub);
        let handle = channel.handle();
        handle
            .publish(&LifecycleEvent::ProximityTrigger { distance: 40 })
            .unwrap();
        handle
            .publish(&LifecycleEvent::StillnessStable { ts: "t".into() })
            .unwrap();
        assert_eq!(handle.pending_len(), 2);
        assert!(!handle.is_connected());

        let (tx, rx) = mpsc::channel();
        let listener = channel.spawn_listener(tx).unwrap();
        wait_for(&rx);
        let sent = hub.published();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].contains("lidarDistance"));
        assert!(sent[1].contains("basketStable"));
        assert_eq!(handle.pending_len(), 0);

        shutdown.store(true, Ordering::SeqCst);
        channel.close();
        listener.join().unwrap();
    }

    /// Records payloads; the first publish starts a racing `ChannelHandle::publish`.
    struct RacingPublisher {
        sent: Mutex<Vec<String>>,
        racer: Mutex<Option<ChannelHandle>>,
        joined: Mutex<Option<JoinHandle<()>>>,
    }

    impl HubPublisher for RacingPublisher {
        fn publish(&self, payload: &str) -> Result<()> {
            if let Some(handle) = self.racer.lock().unwrap().take() {
                let racer = std::thread::spawn(move || {
                    handle
                        .publish(&LifecycleEvent::ProximityTrigger { distance: 99 })
                        .unwrap();
                });
                *self.joined.lock().unwrap() = Some(racer);
                std::thread::sleep(Duration::from_millis(50));
            }
            self.sent.lock().unwrap().push(payload.to_string());
            Ok(())
        }

        fn close(&self) {}
    }

    #[test]
    fn publish_during_flush_waits_for_queue() {
        let hub = MemoryHub::new();
        let (channel, _shutdown) = channel(&hub);
        let handle = channel.handle();
        for distance in [1, 2] {
            handle
                .publish(&LifecycleEvent::ProximityTrigger { distance })
                .unwrap();
        }

        let publisher = Arc::new(RacingPublisher {
            sent: Mutex::new(Vec::new()),
            racer: Mutex::new(Some(handle.clone())),
            joined: Mutex::new(None),
        });
        channel.shared.go_online(publisher.clone());
        let racer = publisher.joined.lock().unwrap().take().unwrap();
        racer.join().unwrap();

        let sent = publisher.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 3);
        assert!(sent[0].contains("\"distance\":1"));
        assert!(sent[1].contains("\"distance\":2"));
        assert!(sent[2].contains("\"distance\":99"));
        assert_eq!(handle.pending_len(), 0);
    }

    #[test]
    fn pending_queue_drops_oldest() {
        let hub = MemoryHub::new();
        let (channel, _shutdown) = channel(&hub);
        let handle = channel.handle();
        for distance in 0..(PENDING_CAPACITY as u32 + 5) {
            handle
                .publish(&LifecycleEvent::ProximityTrigger { distance })
                .unwrap();
        }
        assert_eq!(handle.pending_len(), PENDING_CAPACITY);
        let oldest = channel.shared.pending().front().cloned().unwrap();
        assert!(oldest.contains("\"distance\":5"));
    }

    #[test]
    fn reconnects_after_drop() {
        let hub = MemoryHub::new();
        let (channel, shutdown) = channel(&hub);
        let (tx, rx) = mpsc::channel();
        let listener = channel.spawn_listener(tx).unwrap();

        assert_eq!(wait_for(&rx), AgentInput::Hub(HubEvent::Connected));
        hub.drop_connection();
        assert_eq!(wait_for(&rx), AgentInput::Hub(HubEvent::Disconnected));
        assert_eq!(wait_for(&rx), AgentInput::Hub(HubEvent::Connected));
        assert!(hub.connects() >= 2);

        shutdown.store(true, Ordering::SeqCst);
        channel.close();
        let started = Instant::now();
        listener.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
