use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, info, warn};

use crate::channel::{ChannelPublisher, ChannelScript, EchoPublisher, HandshakeGate};
use crate::connection::{ConnectionFactory, ReactiveConnection};
use crate::error::{DriverError, DriverResult};
use crate::reactive::Payload;
use crate::script::{Check, Command, InteractionKind, Wait};
use crate::subscriber::TestSubscriber;

/// Initial demand of the consumer attached to a channel, so the peer's first item flows
/// without an explicit `request`.
pub const CHANNEL_INITIAL_DEMAND: u64 = 1;

/// Result of executing one test's commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Consumers met the test's pass/fail expectation.
    Pass,
    Fail,
    /// No subscriber was registered; carries the channel scripts' own results.
    Channel { passed: bool },
}

/// Consumer registered under a script id, by item type.
#[derive(Clone)]
pub enum Consumer {
    Payload(Arc<TestSubscriber<Payload>>),
    Void(Arc<TestSubscriber<()>>),
}

impl Consumer {
    /// Signal demand upstream.
    pub fn request(&self, n: u64) {
        match self {
            Consumer::Payload(sub) => sub.request(n),
            Consumer::Void(sub) => sub.request(n),
        }
    }

    /// Cancel the interaction; a terminal state that is not an error.
    pub fn cancel(&self) {
        match self {
            Consumer::Payload(sub) => sub.cancel(),
            Consumer::Void(sub) => sub.cancel(),
        }
    }

    /// Request `n`, then block until `n` items have arrived in total or the stream ends.
    pub fn take(&self, n: u64) -> bool {
        match self {
            Consumer::Payload(sub) => sub.take(n),
            Consumer::Void(sub) => sub.take(n),
        }
    }

    /// No failed assertion was recorded.
    pub fn has_passed(&self) -> bool {
        match self {
            Consumer::Payload(sub) => sub.has_passed(),
            Consumer::Void(sub) => sub.has_passed(),
        }
    }

    /// Block according to `wait`. Failed waits are logged, never raised.
    pub fn wait(&self, wait: &Wait) {
        match self {
            Consumer::Payload(sub) => wait_on(sub, wait),
            Consumer::Void(sub) => wait_on(sub, wait),
        }
    }

    /// Evaluate `check`, recording it in the consumer's ledger.
    pub fn check(&self, check: &Check) -> bool {
        match (self, check) {
            (Consumer::Payload(sub), Check::Received(expected)) => sub.assert_values(expected),
            (Consumer::Void(sub), Check::Received(_)) => {
                sub.fail_assertion("fire-and-forget interactions carry no values")
            }
            (Consumer::Payload(sub), check) => check_state(sub, check),
            (Consumer::Void(sub), check) => check_state(sub, check),
        }
    }
}

fn wait_on<T>(sub: &TestSubscriber<T>, wait: &Wait)
where
    T: Clone + std::fmt::Debug + Send + 'static,
{
    match wait {
        Wait::Terminal => sub.await_terminal_event(),
        Wait::AtLeast(n) => {
            sub.await_at_least(*n);
        }
        Wait::NoEvents(window) => {
            sub.await_no_events(*window);
        }
    }
}

fn check_state<T>(sub: &TestSubscriber<T>, check: &Check) -> bool
where
    T: Clone + std::fmt::Debug + Send + 'static,
{
    match check {
        Check::NoError => sub.assert_no_errors(),
        Check::Error => sub.assert_error(),
        Check::Completed => sub.assert_complete(),
        Check::NoCompleted => sub.assert_not_complete(),
        Check::Canceled => sub.assert_canceled(),
        Check::ReceivedN(n) => sub.assert_value_count(*n),
        Check::ReceivedAtLeast(n) => sub.assert_received_at_least(*n),
        Check::Received(_) => sub.fail_assertion("value comparison is not supported here"),
    }
}

struct Interaction {
    kind: InteractionKind,
    consumer: Consumer,
}

/// Executes the commands of a single test against fresh connections.
pub struct Dispatcher {
    name: String,
    factory: Arc<dyn ConnectionFactory>,
    interactions: HashMap<String, Interaction>,
    registered: Vec<Consumer>,
    should_pass: bool,
    channel_results: Vec<bool>,
    channel_ran: bool,
    /// Held until the dispatcher is dropped, which closes them.
    connections: Vec<Arc<dyn ReactiveConnection>>,
}

impl Dispatcher {
    /// Dispatcher for the test `name`, dialing through `factory` once per interaction.
    pub fn new(name: impl Into<String>, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            name: name.into(),
            factory,
            interactions: HashMap::new(),
            registered: Vec::new(),
            should_pass: true,
            channel_results: Vec::new(),
            channel_ran: false,
            connections: Vec::new(),
        }
    }

    /// Execute `commands` in order and compute the verdict. The test's connections are
    /// closed on return.
    pub fn run(mut self, commands: Vec<Command>) -> DriverResult<Verdict> {
        for command in commands {
            self.execute(command)?;
        }
        self.verdict()
    }

    /// Execute a single command. Only malformed commands and connection failures are errors.
    pub fn execute(&mut self, command: Command) -> DriverResult<()> {
        match command {
            Command::Subscribe { kind, id, payload } => self.subscribe(kind, id, payload)?,
            Command::Channel { initial, script } => {
                let passed = self.run_channel(initial, script)?;
                self.channel_results.push(passed);
                self.channel_ran = true;
            }
            Command::EchoChannel { initial } => {
                self.echo_channel(initial)?;
                self.channel_ran = true;
            }
            Command::Await { id, wait } => {
                if let Some(consumer) = self.lookup(&id) {
                    consumer.wait(&wait);
                }
            }
            Command::Assert { id, check } => {
                if let Some(consumer) = self.lookup(&id) {
                    consumer.check(&check);
                }
            }
            Command::Take { n, id } => {
                if let Some(consumer) = self.lookup(&id) {
                    consumer.take(n);
                }
            }
            Command::Request { n, id } => {
                if let Some(consumer) = self.lookup(&id) {
                    consumer.request(n);
                }
            }
            Command::Cancel { id } => {
                if let Some(consumer) = self.lookup(&id) {
                    consumer.cancel();
                }
            }
            Command::Respond { .. } => {
                warn!(test = %self.name, "respond outside a channel block ignored");
            }
            Command::Eof => self.send_shutdown()?,
            Command::Pass => self.should_pass = true,
            Command::Fail => self.should_pass = false,
            Command::Unknown(line) => {
                debug!(test = %self.name, %line, "skipping unrecognized command");
            }
            Command::Malformed { line, reason } => {
                return Err(DriverError::MalformedCommand { line, reason });
            }
        }
        Ok(())
    }

    /// Final verdict once every command ran.
    pub fn verdict(&self) -> DriverResult<Verdict> {
        if !self.registered.is_empty() {
            let passed = self.registered.iter().all(Consumer::has_passed);
            return Ok(if passed == self.should_pass {
                Verdict::Pass
            } else {
                Verdict::Fail
            });
        }
        if self.channel_ran {
            return Ok(Verdict::Channel {
                passed: self.channel_results.iter().all(|passed| *passed),
            });
        }
        Err(DriverError::NoInteraction(self.name.clone()))
    }

    fn connect(&mut self) -> DriverResult<Arc<dyn ReactiveConnection>> {
        let connection = self.factory.connect()?;
        self.connections.push(connection.clone());
        Ok(connection)
    }

    fn lookup(&self, id: &str) -> Option<&Consumer> {
        let found = self.interactions.get(id).map(|interaction| &interaction.consumer);
        if found.is_none() {
            error!(test = %self.name, %id, "could not find subscriber with given id");
        }
        found
    }

    fn subscribe(&mut self, kind: InteractionKind, id: String, payload: Payload) -> DriverResult<()> {
        let connection = self.connect()?;
        debug!(test = %self.name, %id, %kind, %payload, "subscribing");
        let consumer = match kind {
            InteractionKind::RequestResponse => {
                let sub = Arc::new(TestSubscriber::<Payload>::new(id.as_str(), 0));
                connection.request_response(payload).subscribe(sub.clone());
                Consumer::Payload(sub)
            }
            InteractionKind::RequestStream => {
                let sub = Arc::new(TestSubscriber::<Payload>::new(id.as_str(), 0));
                connection.request_stream(payload).subscribe(sub.clone());
                Consumer::Payload(sub)
            }
            InteractionKind::RequestSubscription => {
                let sub = Arc::new(TestSubscriber::<Payload>::new(id.as_str(), 0));
                connection.request_subscription(payload).subscribe(sub.clone());
                Consumer::Payload(sub)
            }
            InteractionKind::FireAndForget => {
                let sub = Arc::new(TestSubscriber::<()>::new(id.as_str(), 0));
                connection.fire_and_forget(payload).subscribe(sub.clone());
                Consumer::Void(sub)
            }
        };

        self.registered.push(consumer.clone());
        if let Some(previous) = self.interactions.insert(id.clone(), Interaction { kind, consumer }) {
            warn!(
                test = %self.name,
                %id,
                previous = %previous.kind,
                "id registered twice; the earlier interaction still counts towards the verdict"
            );
        }
        Ok(())
    }

    fn run_channel(&mut self, initial: Payload, script: Vec<Command>) -> DriverResult<bool> {
        let consumer = Arc::new(TestSubscriber::<Payload>::new(
            format!("{}/channel", self.name),
            CHANNEL_INITIAL_DEMAND,
        ));
        let gate = Arc::new(HandshakeGate::new());
        let connection = self.connect()?;

        let inbound = connection.request_channel(Box::new(ChannelPublisher::new(initial, gate.clone())));
        inbound.subscribe(consumer.clone());

        let driver = gate.wait();
        debug!(test = %self.name, "channel handshake complete");

        let runner = ChannelScript::new(self.name.clone(), script, consumer, driver, self.should_pass);
        let handle = thread::Builder::new()
            .name(format!("channel-{}", self.name))
            .spawn(move || runner.run())?;
        handle
            .join()
            .map_err(|_| DriverError::ChannelThread(self.name.clone()))
    }

    fn echo_channel(&mut self, initial: Payload) -> DriverResult<()> {
        let consumer = Arc::new(TestSubscriber::<Payload>::new(
            format!("{}/echo", self.name),
            CHANNEL_INITIAL_DEMAND,
        ));
        let connection = self.connect()?;
        let inbound = connection.request_channel(Box::new(EchoPublisher::new(initial, consumer.clone())));
        inbound.subscribe(consumer);
        info!(test = %self.name, "echo channel open");
        Ok(())
    }

    fn send_shutdown(&mut self) -> DriverResult<()> {
        let connection = self.connect()?;
        let ack = Arc::new(TestSubscriber::<()>::new("EOF", 0));
        connection.fire_and_forget(Payload::shutdown()).subscribe(ack.clone());
        ack.request(1);
        debug!(test = %self.name, "shutdown sent");
        Ok(())
    }
}
