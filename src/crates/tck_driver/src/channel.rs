//! Local side of request-channel interactions.
//!
//! The publisher handed to [`ReactiveConnection::request_channel`] does nothing until
//! the peer subscribes to it. At that point it builds a [`ChannelDriver`] around the
//! peer's subscriber, installs an [`InitialPayloadSubscription`] and fires a
//! [`HandshakeGate`] carrying the driver. The dispatcher waits on the gate before it
//! starts the channel script, so scripted emissions never precede the peer's
//! subscription.
//!
//! [`ReactiveConnection::request_channel`]: crate::connection::ReactiveConnection::request_channel

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::dispatcher::Consumer;
use crate::marble::{Marble, MarbleEvent};
use crate::reactive::{Payload, Publisher, StreamError, Subscriber, Subscription};
use crate::script::Command;
use crate::subscriber::{Forward, TestSubscriber};

/// Single-fire cell: the first `fire` stores a value and wakes every waiter; later
/// waits return that value immediately.
pub struct HandshakeGate<T> {
    slot: Mutex<Option<T>>,
    fired: Condvar,
}

impl<T: Clone> HandshakeGate<T> {
    /// Gate that has not fired yet.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            fired: Condvar::new(),
        }
    }

    /// Store `value` unless the gate already fired. Returns whether this call fired it.
    pub fn fire(&self, value: T) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.fired.notify_all();
        true
    }

    /// Block until the gate fires and return its value.
    pub fn wait(&self) -> T {
        let mut slot = self.slot.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            self.fired.wait(&mut slot);
        }
    }

    /// Whether `fire` already ran.
    pub fn is_fired(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<T: Clone> Default for HandshakeGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct DriverState {
    demand: u64,
    canceled: bool,
    finished: bool,
}

/// Emits scripted items to the peer, one unit of peer demand per item.
pub struct ChannelDriver {
    remote: Arc<dyn Subscriber<Payload>>,
    state: Mutex<DriverState>,
    signal: Condvar,
}

impl ChannelDriver {
    /// Driver emitting to `remote`, starting without demand.
    pub fn new(remote: Arc<dyn Subscriber<Payload>>) -> Self {
        Self {
            remote,
            state: Mutex::new(DriverState {
                demand: 0,
                canceled: false,
                finished: false,
            }),
            signal: Condvar::new(),
        }
    }

    /// Add peer demand and wake a waiting `respond`.
    pub fn request(&self, n: u64) {
        let mut state = self.state.lock();
        state.demand = state.demand.saturating_add(n);
        self.signal.notify_all();
    }

    /// Stop emitting; pending and later events are dropped.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.canceled = true;
        self.signal.notify_all();
    }

    /// Peer demand not yet spent on items.
    pub fn demand(&self) -> u64 {
        self.state.lock().demand
    }

    /// Whether the peer canceled the outbound side.
    pub fn is_canceled(&self) -> bool {
        self.state.lock().canceled
    }

    /// Play every event of `marble`, stopping early if the peer cancels or the outbound
    /// side already terminated.
    pub fn respond(&self, marble: &Marble) {
        for event in marble.events() {
            if !self.emit(event.clone()) {
                debug!(?event, "outbound side closed; dropping remaining marble events");
                break;
            }
        }
    }

    /// Emit one event, waiting for peer demand before items.
    pub fn emit(&self, event: MarbleEvent) -> bool {
        let mut state = self.state.lock();
        match event {
            MarbleEvent::Next(payload) => {
                while state.demand == 0 && !state.canceled && !state.finished {
                    self.signal.wait(&mut state);
                }
                if state.canceled || state.finished {
                    return false;
                }
                state.demand -= 1;
                drop(state);
                self.remote.on_next(payload);
            }
            MarbleEvent::Complete => {
                if state.canceled || state.finished {
                    return false;
                }
                state.finished = true;
                drop(state);
                self.remote.on_complete();
            }
            MarbleEvent::Error(message) => {
                if state.canceled || state.finished {
                    return false;
                }
                state.finished = true;
                drop(state);
                self.remote.on_error(StreamError::new(message));
            }
        }
        true
    }
}

enum InitialState {
    Pending(Payload),
    Emitting { deferred: u64 },
    Sent,
}

/// Subscription given to the peer: the first request emits the channel's initial payload
/// and the rest of the demand goes to the driver.
pub struct InitialPayloadSubscription {
    remote: Arc<dyn Subscriber<Payload>>,
    driver: Arc<ChannelDriver>,
    state: Mutex<InitialState>,
}

impl InitialPayloadSubscription {
    /// Subscription emitting `initial` to `remote` ahead of anything `driver` sends.
    pub fn new(
        initial: Payload,
        remote: Arc<dyn Subscriber<Payload>>,
        driver: Arc<ChannelDriver>,
    ) -> Self {
        Self {
            remote,
            driver,
            state: Mutex::new(InitialState::Pending(initial)),
        }
    }
}

impl Subscription for InitialPayloadSubscription {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        let initial = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, InitialState::Sent) {
                InitialState::Pending(payload) => {
                    *state = InitialState::Emitting { deferred: 0 };
                    Some(payload)
                }
                InitialState::Emitting { deferred } => {
                    *state = InitialState::Emitting {
                        deferred: deferred.saturating_add(n),
                    };
                    return;
                }
                InitialState::Sent => None,
            }
        };

        let Some(payload) = initial else {
            self.driver.request(n);
            return;
        };

        self.remote.on_next(payload);
        let deferred = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, InitialState::Sent) {
                InitialState::Emitting { deferred } => deferred,
                _ => 0,
            }
        };
        let remainder = (n - 1).saturating_add(deferred);
        if remainder > 0 {
            self.driver.request(remainder);
        }
    }

    fn cancel(&self) {
        *self.state.lock() = InitialState::Sent;
        self.driver.cancel();
    }
}

/// Local producer for a scripted channel.
pub struct ChannelPublisher {
    initial: Payload,
    gate: Arc<HandshakeGate<Arc<ChannelDriver>>>,
}

impl ChannelPublisher {
    /// Publisher that fires `gate` with its driver once the peer subscribes.
    pub fn new(initial: Payload, gate: Arc<HandshakeGate<Arc<ChannelDriver>>>) -> Self {
        Self { initial, gate }
    }
}

impl Publisher<Payload> for ChannelPublisher {
    fn subscribe(self: Box<Self>, remote: Arc<dyn Subscriber<Payload>>) {
        let driver = Arc::new(ChannelDriver::new(remote.clone()));
        let subscription = Arc::new(InitialPayloadSubscription::new(
            self.initial,
            remote.clone(),
            driver.clone(),
        ));
        remote.on_subscribe(subscription);
        if !self.gate.fire(driver) {
            warn!("channel producer subscribed more than once");
        }
    }
}

struct EchoState {
    demand: u64,
    queue: VecDeque<Payload>,
    canceled: bool,
    draining: bool,
}

/// Sends every item it is given back to the peer, in order, as peer demand allows.
pub struct EchoSubscription {
    remote: Arc<dyn Subscriber<Payload>>,
    state: Mutex<EchoState>,
}

impl EchoSubscription {
    /// Echo with an empty queue and no peer demand.
    pub fn new(remote: Arc<dyn Subscriber<Payload>>) -> Self {
        Self {
            remote,
            state: Mutex::new(EchoState {
                demand: 0,
                queue: VecDeque::new(),
                canceled: false,
                draining: false,
            }),
        }
    }

    /// Queue `item` for the peer and send whatever demand allows.
    pub fn push(&self, item: Payload) {
        {
            let mut state = self.state.lock();
            if state.canceled {
                return;
            }
            state.queue.push_back(item);
        }
        self.drain();
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
                if state.canceled {
                    state.queue.clear();
                }
                match state.queue.front() {
                    Some(_) if state.demand > 0 => {
                        state.demand -= 1;
                        state.queue.pop_front()
                    }
                    _ => {
                        state.draining = false;
                        None
                    }
                }
            };
            match next {
                Some(item) => self.remote.on_next(item),
                None => return,
            }
        }
    }
}

impl Subscription for EchoSubscription {
    fn request(&self, n: u64) {
        {
            let mut state = self.state.lock();
            state.demand = state.demand.saturating_add(n);
        }
        self.drain();
    }

    fn cancel(&self) {
        let mut state = self.state.lock();
        state.canceled = true;
        state.queue.clear();
    }
}

impl Forward<Payload> for EchoSubscription {
    fn forward(&self, item: Payload) {
        self.push(item);
    }
}

/// Local producer for an echo channel: emits `initial`, then mirrors everything the
/// consumer receives.
pub struct EchoPublisher {
    initial: Payload,
    consumer: Arc<TestSubscriber<Payload>>,
}

impl EchoPublisher {
    /// Publisher echoing every item `consumer` receives, starting with `initial`.
    pub fn new(initial: Payload, consumer: Arc<TestSubscriber<Payload>>) -> Self {
        Self { initial, consumer }
    }
}

impl Publisher<Payload> for EchoPublisher {
    fn subscribe(self: Box<Self>, remote: Arc<dyn Subscriber<Payload>>) {
        let echo = Arc::new(EchoSubscription::new(remote.clone()));
        self.consumer.set_forward(echo.clone());
        echo.push(self.initial);
        remote.on_subscribe(echo);
    }
}

/// Commands of one channel block, run on their own thread once the handshake completed.
pub struct ChannelScript {
    name: String,
    commands: Vec<Command>,
    consumer: Arc<TestSubscriber<Payload>>,
    driver: Arc<ChannelDriver>,
    should_pass: bool,
}

impl ChannelScript {
    /// Script for the channel of test `name`, starting from the test's pass/fail expectation.
    pub fn new(
        name: impl Into<String>,
        commands: Vec<Command>,
        consumer: Arc<TestSubscriber<Payload>>,
        driver: Arc<ChannelDriver>,
        should_pass: bool,
    ) -> Self {
        Self {
            name: name.into(),
            commands,
            consumer,
            driver,
            should_pass,
        }
    }

    /// Execute the block and report whether the channel met its expected outcome.
    pub fn run(mut self) -> bool {
        let consumer = Consumer::Payload(self.consumer.clone());
        for command in std::mem::take(&mut self.commands) {
            match command {
                Command::Respond { marble } => self.driver.respond(&marble),
                Command::Await { wait, .. } => consumer.wait(&wait),
                Command::Assert { check, .. } => {
                    consumer.check(&check);
                }
                Command::Take { n, .. } => {
                    consumer.take(n);
                }
                Command::Request { n, .. } => consumer.request(n),
                Command::Cancel { .. } => consumer.cancel(),
                Command::Pass => self.should_pass = true,
                Command::Fail => self.should_pass = false,
                Command::Unknown(line) => debug!(test = %self.name, %line, "skipping unrecognized channel command"),
                Command::Malformed { line, reason } => {
                    error!(test = %self.name, %line, %reason, "malformed channel command");
                    self.consumer.fail_assertion(&format!("malformed command {line:?}: {reason}"));
                }
                other @ (Command::Subscribe { .. }
                | Command::Channel { .. }
                | Command::EchoChannel { .. }
                | Command::Eof) => {
                    warn!(test = %self.name, command = ?other, "command not supported inside a channel block");
                }
            }
        }

        let passed = self.consumer.has_passed() == self.should_pass;
        info!(test = %self.name, passed, "channel script finished");
        passed
    }
}
