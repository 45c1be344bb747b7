//! Consumer side of a scripted interaction.
//!
//! A [`TestSubscriber`] buffers everything its producer delivers, tracks the demand it
//! has granted and the terminal signal it saw, and keeps a ledger of the assertions the
//! script ran against it. Blocking waits park on a condition variable that every
//! delivery and terminal transition notifies.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::reactive::{StreamError, Subscriber, Subscription};

/// Set-once end state of a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Completed,
    Errored(StreamError),
    Canceled,
}

/// Receives a copy of every item a consumer accepts.
pub trait Forward<T>: Send + Sync {
    fn forward(&self, item: T);
}

struct ConsumerState<T> {
    values: Vec<T>,
    received: u64,
    // Items plus completion/error signals; cancellation is local and not counted.
    events: u64,
    outstanding: u64,
    pending: u64,
    terminal: Option<Terminal>,
    upstream: Option<Arc<dyn Subscription>>,
    forward: Option<Arc<dyn Forward<T>>>,
    passed: u32,
    failed: u32,
}

/// Buffering, demand-tracking consumer with blocking assertion primitives.
pub struct TestSubscriber<T> {
    label: String,
    initial_demand: u64,
    state: Mutex<ConsumerState<T>>,
    signal: Condvar,
}

enum SubscribeAction {
    Request(u64),
    Cancel,
    Keep,
}

impl<T> TestSubscriber<T>
where
    T: Clone + fmt::Debug + Send + 'static,
{
    /// Create a consumer that requests `initial_demand` items as soon as it is subscribed.
    pub fn new(label: impl Into<String>, initial_demand: u64) -> Self {
        Self {
            label: label.into(),
            initial_demand,
            state: Mutex::new(ConsumerState {
                values: Vec::new(),
                received: 0,
                events: 0,
                outstanding: 0,
                pending: 0,
                terminal: None,
                upstream: None,
                forward: None,
                passed: 0,
                failed: 0,
            }),
            signal: Condvar::new(),
        }
    }

    /// Name used in log lines.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Mirror every accepted item into `forward` (used by echo channels).
    pub fn set_forward(&self, forward: Arc<dyn Forward<T>>) {
        self.state.lock().forward = Some(forward);
    }

    /// Grant `n` more items. Demand granted before the producer subscribes is held and
    /// forwarded together with the initial demand.
    pub fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        let upstream = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                debug!(consumer = %self.label, n, "ignoring request on terminated consumer");
                return;
            }
            match &state.upstream {
                Some(subscription) => {
                    let subscription = subscription.clone();
                    state.outstanding = state.outstanding.saturating_add(n);
                    Some(subscription)
                }
                None => {
                    state.pending = state.pending.saturating_add(n);
                    None
                }
            }
        };
        if let Some(subscription) = upstream {
            subscription.request(n);
        }
    }

    /// Cancel the interaction. A no-op once any terminal state has been reached.
    pub fn cancel(&self) {
        let upstream = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return;
            }
            state.terminal = Some(Terminal::Canceled);
            self.signal.notify_all();
            state.upstream.take()
        };
        if let Some(subscription) = upstream {
            subscription.cancel();
        }
    }

    /// Request `n` items and wait until at least `n` have arrived.
    pub fn take(&self, n: u64) -> bool {
        self.request(n);
        self.await_at_least(n)
    }

    /// Block until completion, error or cancellation. Returns immediately if the consumer
    /// already terminated.
    pub fn await_terminal_event(&self) {
        let mut state = self.state.lock();
        while state.terminal.is_none() {
            self.signal.wait(&mut state);
        }
    }

    /// Block until `n` items have been received. Returns `false` when the stream
    /// terminated first.
    pub fn await_at_least(&self, n: u64) -> bool {
        let mut state = self.state.lock();
        while state.received < n && state.terminal.is_none() {
            self.signal.wait(&mut state);
        }
        if state.received >= n {
            return true;
        }
        warn!(
            consumer = %self.label,
            wanted = n,
            received = state.received,
            terminal = ?state.terminal,
            "interrupted while awaiting items"
        );
        false
    }

    /// Block for the whole `window` and record whether any item, error or completion
    /// arrived inside it. Events arriving after the window are not considered.
    pub fn await_no_events(&self, window: Duration) -> bool {
        let deadline = Instant::now() + window;
        let mut state = self.state.lock();
        let baseline = state.events;
        while Instant::now() < deadline {
            self.signal.wait_until(&mut state, deadline);
        }
        let quiet = state.events == baseline;
        let observed = state.events - baseline;
        self.record(
            &mut state,
            quiet,
            format_args!("no events within {window:?} (observed {observed})"),
        )
    }

    /// Passes unless the consumer terminated with an error.
    pub fn assert_no_errors(&self) -> bool {
        let mut state = self.state.lock();
        let ok = !matches!(state.terminal, Some(Terminal::Errored(_)));
        let terminal = state.terminal.clone();
        self.record(&mut state, ok, format_args!("no error (terminal {terminal:?})"))
    }

    /// Passes when the consumer terminated with an error.
    pub fn assert_error(&self) -> bool {
        let mut state = self.state.lock();
        let ok = matches!(state.terminal, Some(Terminal::Errored(_)));
        let terminal = state.terminal.clone();
        self.record(&mut state, ok, format_args!("error (terminal {terminal:?})"))
    }

    /// Passes when the consumer completed normally.
    pub fn assert_complete(&self) -> bool {
        let mut state = self.state.lock();
        let ok = matches!(state.terminal, Some(Terminal::Completed));
        let terminal = state.terminal.clone();
        self.record(&mut state, ok, format_args!("completed (terminal {terminal:?})"))
    }

    /// Passes unless the consumer completed normally.
    pub fn assert_not_complete(&self) -> bool {
        let mut state = self.state.lock();
        let ok = !matches!(state.terminal, Some(Terminal::Completed));
        let terminal = state.terminal.clone();
        self.record(&mut state, ok, format_args!("not completed (terminal {terminal:?})"))
    }

    /// Passes when the interaction was canceled locally.
    pub fn assert_canceled(&self) -> bool {
        let mut state = self.state.lock();
        let ok = matches!(state.terminal, Some(Terminal::Canceled));
        let terminal = state.terminal.clone();
        self.record(&mut state, ok, format_args!("canceled (terminal {terminal:?})"))
    }

    /// Passes when exactly `n` items were received.
    pub fn assert_value_count(&self, n: u64) -> bool {
        let mut state = self.state.lock();
        let received = state.received;
        self.record(
            &mut state,
            received == n,
            format_args!("received exactly {n} (got {received})"),
        )
    }

    /// Passes when `n` or more items were received.
    pub fn assert_received_at_least(&self, n: u64) -> bool {
        let mut state = self.state.lock();
        let received = state.received;
        self.record(
            &mut state,
            received >= n,
            format_args!("received at least {n} (got {received})"),
        )
    }

    /// Record an assertion that could not be evaluated against this consumer.
    pub fn fail_assertion(&self, reason: &str) -> bool {
        let mut state = self.state.lock();
        self.record(&mut state, false, format_args!("{reason}"))
    }

    /// True when no assertion recorded against this consumer has failed.
    pub fn has_passed(&self) -> bool {
        self.state.lock().failed == 0
    }

    /// Number of (passed, failed) assertions recorded so far.
    pub fn assertion_counts(&self) -> (u32, u32) {
        let state = self.state.lock();
        (state.passed, state.failed)
    }

    /// Snapshot of the items received so far, in arrival order.
    pub fn values(&self) -> Vec<T> {
        self.state.lock().values.clone()
    }

    /// Items received so far.
    pub fn received_count(&self) -> u64 {
        self.state.lock().received
    }

    /// Demand granted upstream and not yet consumed by an item.
    pub fn outstanding_demand(&self) -> u64 {
        self.state.lock().outstanding
    }

    /// The end state, once reached.
    pub fn terminal(&self) -> Option<Terminal> {
        self.state.lock().terminal.clone()
    }

    fn record(&self, state: &mut ConsumerState<T>, ok: bool, what: fmt::Arguments<'_>) -> bool {
        if ok {
            state.passed += 1;
            debug!(consumer = %self.label, "assertion passed: {what}");
        } else {
            state.failed += 1;
            warn!(consumer = %self.label, "assertion failed: {what}");
        }
        ok
    }

    fn terminate(&self, terminal: Terminal) {
        let mut state = self.state.lock();
        if let Some(existing) = &state.terminal {
            debug!(consumer = %self.label, ?existing, ignored = ?terminal, "terminal signal after termination");
            return;
        }
        state.terminal = Some(terminal);
        state.events += 1;
        state.upstream = None;
        self.signal.notify_all();
    }
}

impl<T> TestSubscriber<T>
where
    T: Clone + fmt::Debug + PartialEq + Send + 'static,
{
    /// Check the buffered items equal `expected`, in order.
    pub fn assert_values(&self, expected: &[T]) -> bool {
        let mut state = self.state.lock();
        let ok = state.values.as_slice() == expected;
        let actual = state.values.clone();
        self.record(
            &mut state,
            ok,
            format_args!("received {expected:?} (got {actual:?})"),
        )
    }
}

impl<T> Subscriber<T> for TestSubscriber<T>
where
    T: Clone + fmt::Debug + Send + 'static,
{
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        let action = {
            let mut state = self.state.lock();
            if matches!(state.terminal, Some(Terminal::Canceled)) {
                SubscribeAction::Cancel
            } else if state.upstream.is_some() {
                warn!(consumer = %self.label, "rejecting second subscription");
                SubscribeAction::Cancel
            } else {
                state.upstream = Some(subscription.clone());
                let n = self.initial_demand.saturating_add(state.pending);
                state.pending = 0;
                state.outstanding = state.outstanding.saturating_add(n);
                if n > 0 {
                    SubscribeAction::Request(n)
                } else {
                    SubscribeAction::Keep
                }
            }
        };
        match action {
            SubscribeAction::Request(n) => subscription.request(n),
            SubscribeAction::Cancel => subscription.cancel(),
            SubscribeAction::Keep => {}
        }
    }

    fn on_next(&self, item: T) {
        let forward = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                debug!(consumer = %self.label, ?item, "dropping item delivered after termination");
                return;
            }
            if state.outstanding == 0 {
                warn!(consumer = %self.label, ?item, "item delivered without outstanding demand");
            } else {
                state.outstanding -= 1;
            }
            let forward = state.forward.clone().map(|target| (target, item.clone()));
            state.values.push(item);
            state.received += 1;
            state.events += 1;
            self.signal.notify_all();
            forward
        };
        if let Some((target, item)) = forward {
            target.forward(item);
        }
    }

    fn on_error(&self, error: StreamError) {
        self.terminate(Terminal::Errored(error));
    }

    fn on_complete(&self) {
        self.terminate(Terminal::Completed);
    }
}
