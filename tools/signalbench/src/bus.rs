//! Message bus boundary.
//!
//! Deliveries from the bus worker reach the tick/poll loops only through a
//! bounded [`Inbox`] channel, which the loops drain without blocking.

use crate::errors::SignalBenchError;
use crate::logging::RunLogger;
use rumqttc::{Client, Connection, Event, MqttOptions, Outgoing, Packet, QoS};
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

const REQUEST_CAPACITY: usize = 64;
const CLOSE_WAIT_STEPS: u32 = 50;
const CLOSE_WAIT_STEP: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(topic: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.to_string(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    Message(BusMessage),
    ReconnectExhausted { attempts: u32 },
}

pub type InboxSender = mpsc::Sender<BusEvent>;
pub type Inbox = mpsc::Receiver<BusEvent>;

pub fn inbox(capacity: usize) -> (InboxSender, Inbox) {
    mpsc::channel(capacity.max(1))
}

/// Takes every delivery currently queued without waiting for more.
pub fn drain_inbox(inbox: &mut Inbox) -> Result<Vec<BusMessage>, SignalBenchError> {
    let mut messages = Vec::new();
    loop {
        match inbox.try_recv() {
            Ok(BusEvent::Message(message)) => messages.push(message),
            Ok(BusEvent::ReconnectExhausted { attempts }) => {
                return Err(SignalBenchError::ReconnectExhausted { attempts })
            }
            Err(TryRecvError::Empty) => return Ok(messages),
            Err(TryRecvError::Disconnected) => {
                return Err(SignalBenchError::Bus("bus inbox closed".to_string()))
            }
        }
    }
}

pub trait MessageBus: Send + Sync {
    fn subscribe(&self, topic: &str) -> Result<(), SignalBenchError>;
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), SignalBenchError>;
    fn close(&self) -> Result<(), SignalBenchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub first_delay: Duration,
    pub rate: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            first_delay: Duration::from_secs(1),
            rate: 2,
            max_delay: Duration::from_secs(60),
            max_attempts: 12,
        }
    }
}

impl ReconnectPolicy {
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempts: 0,
            next: self.first_delay.min(self.max_delay),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempts: u32,
    next: Duration,
}

impl Backoff {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next reconnect attempt, or `None` once the attempt
    /// budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.policy.max_attempts {
            return None;
        }
        let delay = self.next;
        self.next = self
            .next
            .saturating_mul(self.policy.rate)
            .min(self.policy.max_delay);
        self.attempts += 1;
        Some(delay)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub qos: u8,
    pub keep_alive: Duration,
    pub inbox_capacity: usize,
    pub startup_retry: Duration,
    pub reconnect: ReconnectPolicy,
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

pub struct MqttBus {
    client: Client,
    qos: QoS,
    subscriptions: Arc<Mutex<Vec<String>>>,
    closing: Arc<AtomicBool>,
    driver: Mutex<Option<thread::JoinHandle<()>>>,
    log: RunLogger,
}

impl MqttBus {
    /// Connects to the broker, blocking until the first CONNACK. Connection
    /// failures before that point are retried forever at a fixed pause.
    pub fn connect(settings: &MqttSettings, log: RunLogger) -> Result<(Self, Inbox), SignalBenchError> {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive);
        if let Some(username) = &settings.username {
            options.set_credentials(username, settings.password.clone().unwrap_or_default());
        }

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let (tx, rx) = inbox(settings.inbox_capacity);
        let (ready_tx, ready_rx) = oneshot::channel();
        let qos = qos_from_level(settings.qos);
        let subscriptions = Arc::new(Mutex::new(Vec::new()));
        let closing = Arc::new(AtomicBool::new(false));

        let driver = ConnectionDriver {
            client: client.clone(),
            qos,
            subscriptions: Arc::clone(&subscriptions),
            closing: Arc::clone(&closing),
            tx,
            policy: settings.reconnect,
            startup_retry: settings.startup_retry,
            log: log.for_component("bus"),
        };

        log.info(
            "bus.connecting",
            json!({
                "host": settings.host,
                "port": settings.port,
                "client_id": settings.client_id,
            }),
        );
        let handle = thread::Builder::new()
            .name("mqtt-connection".to_string())
            .spawn(move || driver.run(connection, ready_tx))
            .map_err(|e| SignalBenchError::Io(e.to_string()))?;

        ready_rx.blocking_recv().map_err(|_| {
            SignalBenchError::Bus("connection thread exited before the broker accepted us".to_string())
        })?;

        Ok((
            Self {
                client,
                qos,
                subscriptions,
                closing,
                driver: Mutex::new(Some(handle)),
                log,
            },
            rx,
        ))
    }
}

impl MessageBus for MqttBus {
    fn subscribe(&self, topic: &str) -> Result<(), SignalBenchError> {
        self.subscriptions
            .lock()
            .map_err(|_| SignalBenchError::Bus("subscription lock poisoned".to_string()))?
            .push(topic.to_string());
        self.client
            .subscribe(topic, self.qos)
            .map_err(|e| SignalBenchError::Bus(e.to_string()))?;
        self.log.info("bus.subscribed", json!({ "topic": topic }));
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), SignalBenchError> {
        self.client
            .try_publish(topic, self.qos, false, payload.to_vec())
            .map_err(|e| SignalBenchError::Bus(format!("publish to {topic} failed: {e}")))
    }

    fn close(&self) -> Result<(), SignalBenchError> {
        self.closing.store(true, Ordering::SeqCst);
        self.client
            .disconnect()
            .map_err(|e| SignalBenchError::Bus(e.to_string()))?;

        let handle = self
            .driver
            .lock()
            .map_err(|_| SignalBenchError::Bus("driver lock poisoned".to_string()))?
            .take();
        if let Some(handle) = handle {
            for _ in 0..CLOSE_WAIT_STEPS {
                if handle.is_finished() {
                    let _ = handle.join();
                    break;
                }
                thread::sleep(CLOSE_WAIT_STEP);
            }
        }
        self.log.info("bus.closed", json!({}));
        Ok(())
    }
}

struct ConnectionDriver {
    client: Client,
    qos: QoS,
    subscriptions: Arc<Mutex<Vec<String>>>,
    closing: Arc<AtomicBool>,
    tx: InboxSender,
    policy: ReconnectPolicy,
    startup_retry: Duration,
    log: RunLogger,
}

impl ConnectionDriver {
    fn run(self, mut connection: Connection, ready: oneshot::Sender<()>) {
        let mut ready = Some(ready);
        let mut connected_once = false;
        let mut backoff: Option<Backoff> = None;

        for notification in connection.iter() {
            match notification {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    if connected_once {
                        self.resubscribe();
                        self.log.info("bus.reconnected", json!({}));
                    } else {
                        self.log.info("bus.connected", json!({}));
                    }
                    connected_once = true;
                    backoff = None;
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(());
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = BusMessage {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                    };
                    if self.tx.blocking_send(BusEvent::Message(message)).is_err() {
                        return;
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    if self.closing.load(Ordering::SeqCst) {
                        return;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    if self.closing.load(Ordering::SeqCst) {
                        return;
                    }
                    if !connected_once {
                        self.log.warn(
                            "bus.connect.failed",
                            json!({
                                "error": err.to_string(),
                                "retry_in_ms": self.startup_retry.as_millis() as u64,
                            }),
                        );
                        thread::sleep(self.startup_retry);
                        continue;
                    }

                    let backoff = backoff.get_or_insert_with(|| self.policy.backoff());
                    match backoff.next_delay() {
                        Some(delay) => {
                            self.log.warn(
                                "bus.reconnect.scheduled",
                                json!({
                                    "error": err.to_string(),
                                    "attempt": backoff.attempts(),
                                    "delay_ms": delay.as_millis() as u64,
                                }),
                            );
                            thread::sleep(delay);
                        }
                        None => {
                            let attempts = backoff.attempts();
                            self.log.error(
                                "bus.reconnect.exhausted",
                                json!({ "attempts": attempts, "error": err.to_string() }),
                            );
                            let _ = self
                                .tx
                                .blocking_send(BusEvent::ReconnectExhausted { attempts });
                            return;
                        }
                    }
                }
            }
        }
    }

    fn resubscribe(&self) {
        let topics = match self.subscriptions.lock() {
            Ok(topics) => topics.clone(),
            Err(_) => return,
        };
        for topic in topics {
            if let Err(err) = self.client.try_subscribe(topic.as_str(), self.qos) {
                self.log.warn(
                    "bus.resubscribe.failed",
                    json!({ "topic": topic, "error": err.to_string() }),
                );
            }
        }
    }
}

/// In-memory bus for tests. Publishes are recorded; chosen topics can be made
/// to fail, and publishing to a topic can push scripted replies into the inbox.
#[derive(Clone)]
pub struct FakeBus {
    published: Arc<Mutex<Vec<BusMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    failing_topics: Arc<Mutex<HashSet<String>>>,
    replies: Arc<Mutex<HashMap<String, VecDeque<Vec<BusEvent>>>>>,
    closed: Arc<AtomicBool>,
    tx: InboxSender,
}

impl FakeBus {
    pub fn new(capacity: usize) -> (Self, Inbox) {
        let (tx, rx) = inbox(capacity);
        (
            Self {
                published: Arc::new(Mutex::new(Vec::new())),
                subscriptions: Arc::new(Mutex::new(Vec::new())),
                failing_topics: Arc::new(Mutex::new(HashSet::new())),
                replies: Arc::new(Mutex::new(HashMap::new())),
                closed: Arc::new(AtomicBool::new(false)),
                tx,
            },
            rx,
        )
    }

    pub fn inject(&self, event: BusEvent) {
        self.tx.try_send(event).expect("fake inbox has room");
    }

    pub fn deliver(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.inject(BusEvent::Message(BusMessage::new(topic, payload)));
    }

    pub fn fail_topic(&self, topic: &str) {
        self.failing_topics
            .lock()
            .expect("failing lock")
            .insert(topic.to_string());
    }

    /// Each publish on `topic` pushes the next queued batch into the inbox.
    pub fn reply_on_publish(&self, topic: &str, events: Vec<BusEvent>) {
        self.replies
            .lock()
            .expect("replies lock")
            .entry(topic.to_string())
            .or_default()
            .push_back(events);
    }

    pub fn published(&self) -> Vec<BusMessage> {
        self.published.lock().expect("published lock").clone()
    }

    pub fn published_on(&self, topic: &str) -> Vec<BusMessage> {
        self.published()
            .into_iter()
            .filter(|message| message.topic == topic)
            .collect()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().expect("subscriptions lock").clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl MessageBus for FakeBus {
    fn subscribe(&self, topic: &str) -> Result<(), SignalBenchError> {
        self.subscriptions
            .lock()
            .expect("subscriptions lock")
            .push(topic.to_string());
        Ok(())
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), SignalBenchError> {
        if self.failing_topics.lock().expect("failing lock").contains(topic) {
            return Err(SignalBenchError::Bus(format!("publish to {topic} failed")));
        }
        self.published
            .lock()
            .expect("published lock")
            .push(BusMessage::new(topic, payload));

        let batch = self
            .replies
            .lock()
            .expect("replies lock")
            .get_mut(topic)
            .and_then(|queue| queue.pop_front());
        for event in batch.unwrap_or_default() {
            self.inject(event);
        }
        Ok(())
    }

    fn close(&self) -> Result<(), SignalBenchError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{drain_inbox, BusEvent, BusMessage, FakeBus, MessageBus, ReconnectPolicy};
    use crate::errors::SignalBenchError;
    use std::time::Duration;

    #[test]
    fn backoff_doubles_up_to_the_cap_and_gives_up() {
        let mut backoff = ReconnectPolicy::default().backoff();
        let delays = std::iter::from_fn(|| backoff.next_delay())
            .map(|delay| delay.as_secs())
            .collect::<Vec<_>>();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60, 60, 60, 60, 60]);
        assert_eq!(backoff.attempts(), 12);
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn backoff_respects_a_first_delay_above_the_cap() {
        let policy = ReconnectPolicy {
            first_delay: Duration::from_secs(90),
            rate: 2,
            max_delay: Duration::from_secs(30),
            max_attempts: 2,
        };
        let mut backoff = policy.backoff();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(30)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(30)));
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn drain_returns_queued_messages_then_stops_at_empty() {
        let (bus, mut inbox) = FakeBus::new(8);
        bus.deliver("mqtt/a", b"1".to_vec());
        bus.deliver("mqtt/b", b"2".to_vec());

        let drained = drain_inbox(&mut inbox).expect("drain");
        assert_eq!(
            drained,
            vec![BusMessage::new("mqtt/a", b"1".to_vec()), BusMessage::new("mqtt/b", b"2".to_vec())]
        );
        assert!(drain_inbox(&mut inbox).expect("empty").is_empty());
    }

    #[test]
    fn drain_surfaces_reconnect_exhaustion() {
        let (bus, mut inbox) = FakeBus::new(8);
        bus.inject(BusEvent::ReconnectExhausted { attempts: 12 });
        let err = drain_inbox(&mut inbox).expect_err("fatal");
        assert!(matches!(err, SignalBenchError::ReconnectExhausted { attempts: 12 }));
    }

    #[test]
    fn fake_bus_fails_chosen_topics_and_scripts_replies() {
        let (bus, mut inbox) = FakeBus::new(8);
        bus.fail_topic("mqtt/broken");
        bus.reply_on_publish(
            "signalPlayer/start",
            vec![BusEvent::Message(BusMessage::new("mqtt/a", b"{}".to_vec()))],
        );

        assert!(bus.publish("mqtt/broken", b"x").is_err());
        bus.publish("signalPlayer/start", b"go").expect("publish");
        bus.publish("signalPlayer/start", b"again").expect("publish");

        assert_eq!(bus.published().len(), 2);
        assert_eq!(drain_inbox(&mut inbox).expect("drain").len(), 1);
        bus.close().expect("close");
        assert!(bus.is_closed());
    }
}
