//! In-memory connection factory used by the integration tests.
//!
//! Request payloads select the producer's behaviour: data `error` fails the stream,
//! data `late` delivers one item from a background thread after the configured delay,
//! anything else is echoed (once for request-response, `stream_length` times for
//! request-stream, forever for request-subscription). Channel peers echo every item
//! they receive and record what they observed.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use reactive_tck_driver::{
    BoxPublisher, ConnectionFactory, DriverError, DriverResult, Payload, Publisher,
    ReactiveConnection, StreamError, Subscriber, Subscription,
};

pub const ERROR_DATA: &str = "error";
pub const LATE_DATA: &str = "late";

/// What a channel peer saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Subscribed,
    Item(Payload),
    Completed,
    Errored(String),
}

#[derive(Clone)]
pub struct LoopbackFactory {
    inner: Arc<Inner>,
}

struct Inner {
    stream_length: usize,
    late_delay: Duration,
    refuse_connections: bool,
    channel_subscribe_delay: Option<Duration>,
    channel_credit: u64,
    connections: AtomicUsize,
    open: AtomicUsize,
    fire_and_forget: Mutex<Vec<Payload>>,
    peers: Mutex<Vec<Arc<ChannelPeer>>>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::build(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        Self::build(options)
    }

    fn build(options: Options) -> Self {
        Self {
            inner: Arc::new(Inner {
                stream_length: options.stream_length,
                late_delay: options.late_delay,
                refuse_connections: options.refuse_connections,
                channel_subscribe_delay: options.channel_subscribe_delay,
                channel_credit: options.channel_credit,
                connections: AtomicUsize::new(0),
                open: AtomicUsize::new(0),
                fire_and_forget: Mutex::new(Vec::new()),
                peers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn shared(&self) -> Arc<dyn ConnectionFactory> {
        Arc::new(self.clone())
    }

    pub fn connections(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// Connections handed out and not yet dropped.
    pub fn open_connections(&self) -> usize {
        self.inner.open.load(Ordering::SeqCst)
    }

    pub fn fire_and_forget_payloads(&self) -> Vec<Payload> {
        self.inner.fire_and_forget.lock().clone()
    }

    pub fn shutdowns(&self) -> usize {
        self.fire_and_forget_payloads()
            .iter()
            .filter(|payload| payload.is_shutdown())
            .count()
    }

    pub fn peers(&self) -> Vec<Arc<ChannelPeer>> {
        self.inner.peers.lock().clone()
    }
}

impl Default for LoopbackFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct Options {
    pub stream_length: usize,
    pub late_delay: Duration,
    pub refuse_connections: bool,
    /// Subscribe channel peers to the outbound side from another thread after this delay.
    pub channel_subscribe_delay: Option<Duration>,
    pub channel_credit: u64,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            stream_length: 3,
            late_delay: Duration::from_millis(600),
            refuse_connections: false,
            channel_subscribe_delay: None,
            channel_credit: 16,
        }
    }
}

impl ConnectionFactory for LoopbackFactory {
    fn connect(&self) -> DriverResult<Arc<dyn ReactiveConnection>> {
        if self.inner.refuse_connections {
            return Err(DriverError::Connect {
                endpoint: "loopback".to_string(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
            });
        }
        self.inner.connections.fetch_add(1, Ordering::SeqCst);
        self.inner.open.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LoopbackConnection {
            inner: self.inner.clone(),
        }))
    }
}

struct LoopbackConnection {
    inner: Arc<Inner>,
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        self.inner.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl LoopbackConnection {
    fn scripted(&self, payload: Payload, count: Option<usize>, ending: Ending) -> BoxPublisher<Payload> {
        let behaviour = match payload.data.as_str() {
            ERROR_DATA => Behaviour {
                count: Some(0),
                ending: Ending::Error(format!("requested error for {payload}")),
                delay: None,
            },
            LATE_DATA => Behaviour {
                count: Some(1),
                ending: Ending::Complete,
                delay: Some(self.inner.late_delay),
            },
            _ => Behaviour {
                count,
                ending,
                delay: None,
            },
        };
        Box::new(ScriptedPublisher {
            item: payload,
            behaviour,
        })
    }
}

impl ReactiveConnection for LoopbackConnection {
    fn request_response(&self, payload: Payload) -> BoxPublisher<Payload> {
        self.scripted(payload, Some(1), Ending::Complete)
    }

    fn request_stream(&self, payload: Payload) -> BoxPublisher<Payload> {
        let length = self.inner.stream_length;
        self.scripted(payload, Some(length), Ending::Complete)
    }

    fn request_subscription(&self, payload: Payload) -> BoxPublisher<Payload> {
        self.scripted(payload, None, Ending::Never)
    }

    fn fire_and_forget(&self, payload: Payload) -> BoxPublisher<()> {
        Box::new(FireAndForget {
            inner: self.inner.clone(),
            payload,
        })
    }

    fn request_channel(&self, outbound: BoxPublisher<Payload>) -> BoxPublisher<Payload> {
        let peer = Arc::new(ChannelPeer::new(self.inner.channel_credit));
        self.inner.peers.lock().push(peer.clone());
        Box::new(PeerPublisher {
            peer,
            outbound,
            subscribe_delay: self.inner.channel_subscribe_delay,
        })
    }
}

#[derive(Clone)]
enum Ending {
    Complete,
    Error(String),
    Never,
}

struct Behaviour {
    count: Option<usize>,
    ending: Ending,
    delay: Option<Duration>,
}

struct ScriptedPublisher {
    item: Payload,
    behaviour: Behaviour,
}

impl Publisher<Payload> for ScriptedPublisher {
    fn subscribe(self: Box<Self>, subscriber: Arc<dyn Subscriber<Payload>>) {
        let ScriptedPublisher { item, behaviour } = *self;
        let subscription = Arc::new(ScriptedSubscription {
            item,
            behaviour,
            subscriber: subscriber.clone(),
            state: Mutex::new(ScriptedState::default()),
        });
        subscriber.on_subscribe(subscription);
    }
}

#[derive(Default)]
struct ScriptedState {
    emitted: usize,
    demand: u64,
    done: bool,
    draining: bool,
    late_started: bool,
}

struct ScriptedSubscription {
    item: Payload,
    behaviour: Behaviour,
    subscriber: Arc<dyn Subscriber<Payload>>,
    state: Mutex<ScriptedState>,
}

enum Step {
    Item,
    End(Ending),
    Idle,
}

impl ScriptedSubscription {
    fn drain(&self) {
        {
            let mut state = self.state.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }
        loop {
            let step = {
                let mut state = self.state.lock();
                if state.done {
                    Step::Idle
                } else if self.behaviour.count.is_some_and(|count| state.emitted >= count) {
                    state.done = true;
                    Step::End(self.behaviour.ending.clone())
                } else if state.demand > 0 {
                    state.demand -= 1;
                    state.emitted += 1;
                    Step::Item
                } else {
                    Step::Idle
                }
            };
            match step {
                Step::Item => self.subscriber.on_next(self.item.clone()),
                Step::End(Ending::Complete) => self.subscriber.on_complete(),
                Step::End(Ending::Error(message)) => {
                    self.subscriber.on_error(StreamError::new(message))
                }
                Step::End(Ending::Never) | Step::Idle => {
                    self.state.lock().draining = false;
                    return;
                }
            }
        }
    }

    fn start_late(&self, delay: Duration) {
        {
            let mut state = self.state.lock();
            if state.late_started || state.done {
                return;
            }
            state.late_started = true;
        }
        let subscriber = self.subscriber.clone();
        let item = self.item.clone();
        thread::spawn(move || {
            thread::sleep(delay);
            subscriber.on_next(item);
            subscriber.on_complete();
        });
    }
}

impl Subscription for ScriptedSubscription {
    fn request(&self, n: u64) {
        if let Some(delay) = self.behaviour.delay {
            self.start_late(delay);
            return;
        }
        {
            let mut state = self.state.lock();
            state.demand = state.demand.saturating_add(n);
        }
        self.drain();
    }

    fn cancel(&self) {
        self.state.lock().done = true;
    }
}

struct FireAndForget {
    inner: Arc<Inner>,
    payload: Payload,
}

impl Publisher<()> for FireAndForget {
    fn subscribe(self: Box<Self>, subscriber: Arc<dyn Subscriber<()>>) {
        subscriber.on_subscribe(Arc::new(NoDemand));
        self.inner.fire_and_forget.lock().push(self.payload);
        subscriber.on_complete();
    }
}

struct NoDemand;

impl Subscription for NoDemand {
    fn request(&self, _n: u64) {}
    fn cancel(&self) {}
}

#[derive(Default)]
struct PeerState {
    events: Vec<PeerEvent>,
    queue: VecDeque<Payload>,
    inbound: Option<Arc<dyn Subscriber<Payload>>>,
    inbound_demand: u64,
    outbound: Option<Arc<dyn Subscription>>,
    outbound_done: bool,
    inbound_done: bool,
    draining: bool,
}

/// Remote end of a channel: echoes every outbound item back on the inbound side.
pub struct ChannelPeer {
    credit: u64,
    state: Mutex<PeerState>,
}

impl ChannelPeer {
    fn new(credit: u64) -> Self {
        Self {
            credit,
            state: Mutex::new(PeerState::default()),
        }
    }

    pub fn events(&self) -> Vec<PeerEvent> {
        self.state.lock().events.clone()
    }

    pub fn items(&self) -> Vec<Payload> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PeerEvent::Item(payload) => Some(payload),
                _ => None,
            })
            .collect()
    }

    fn drain(&self) {
        {
            let mut state = self.state.lock();
            if state.draining {
                return;
            }
            state.draining = true;
        }
        loop {
            let next = {
                let mut state = self.state.lock();
                let inbound = match state.inbound.clone() {
                    Some(inbound) if !state.inbound_done => inbound,
                    _ => {
                        state.draining = false;
                        return;
                    }
                };
                if state.inbound_demand > 0 && !state.queue.is_empty() {
                    state.inbound_demand -= 1;
                    state.queue.pop_front().map(|item| (inbound, Some(item)))
                } else if state.queue.is_empty() && state.outbound_done {
                    state.inbound_done = true;
                    Some((inbound, None))
                } else {
                    state.draining = false;
                    None
                }
            };
            match next {
                Some((inbound, Some(item))) => inbound.on_next(item),
                Some((inbound, None)) => {
                    inbound.on_complete();
                    self.state.lock().draining = false;
                    return;
                }
                None => return,
            }
        }
    }
}

impl Subscriber<Payload> for ChannelPeer {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        {
            let mut state = self.state.lock();
            state.events.push(PeerEvent::Subscribed);
            state.outbound = Some(subscription.clone());
        }
        subscription.request(self.credit);
    }

    fn on_next(&self, item: Payload) {
        {
            let mut state = self.state.lock();
            state.events.push(PeerEvent::Item(item.clone()));
            state.queue.push_back(item);
        }
        self.drain();
    }

    fn on_error(&self, error: StreamError) {
        let inbound = {
            let mut state = self.state.lock();
            state.events.push(PeerEvent::Errored(error.message.clone()));
            state.outbound_done = true;
            state.inbound_done = true;
            state.inbound.clone()
        };
        if let Some(inbound) = inbound {
            inbound.on_error(error);
        }
    }

    fn on_complete(&self) {
        {
            let mut state = self.state.lock();
            state.events.push(PeerEvent::Completed);
            state.outbound_done = true;
        }
        self.drain();
    }
}

struct PeerInbound {
    peer: Arc<ChannelPeer>,
}

impl Subscription for PeerInbound {
    fn request(&self, n: u64) {
        {
            let mut state = self.peer.state.lock();
            state.inbound_demand = state.inbound_demand.saturating_add(n);
        }
        self.peer.drain();
    }

    fn cancel(&self) {
        let outbound = {
            let mut state = self.peer.state.lock();
            state.inbound_done = true;
            state.queue.clear();
            state.outbound.take()
        };
        if let Some(outbound) = outbound {
            outbound.cancel();
        }
    }
}

struct PeerPublisher {
    peer: Arc<ChannelPeer>,
    outbound: BoxPublisher<Payload>,
    subscribe_delay: Option<Duration>,
}

impl Publisher<Payload> for PeerPublisher {
    fn subscribe(self: Box<Self>, subscriber: Arc<dyn Subscriber<Payload>>) {
        let PeerPublisher {
            peer,
            outbound,
            subscribe_delay,
        } = *self;
        peer.state.lock().inbound = Some(subscriber.clone());
        subscriber.on_subscribe(Arc::new(PeerInbound { peer: peer.clone() }));

        match subscribe_delay {
            Some(delay) => {
                thread::spawn(move || {
                    thread::sleep(delay);
                    outbound.subscribe(peer);
                });
            }
            None => outbound.subscribe(peer),
        }
    }
}

/// Parse a script and hand back the commands of its only test.
pub fn single_test(script: &str) -> reactive_tck_driver::TestCase {
    let parsed = reactive_tck_driver::TestScript::parse(script);
    assert_eq!(parsed.len(), 1, "expected exactly one test in {script:?}");
    parsed.tests()[0].clone()
}
