use std::collections::HashMap;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::Endpoint;
use crate::connection::{ConnectionFactory, ReactiveConnection};
use crate::error::{DriverError, DriverResult};
use crate::reactive::{BoxPublisher, Payload, Publisher, StreamError, Subscriber, Subscription};
use crate::transport::frame::{read_frame, write_frame, Frame};

/// Dials a fresh TCP connection for every `connect` call.
#[derive(Debug, Clone)]
pub struct TcpConnectionFactory {
    endpoint: Endpoint,
    connect_timeout: Duration,
    wire_logging: bool,
}

impl TcpConnectionFactory {
    /// Factory for `endpoint` with a five second connect timeout and wire logging off.
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            connect_timeout: Duration::from_secs(5),
            wire_logging: false,
        }
    }

    /// Give up on each resolved address after `timeout`.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Trace every frame sent and received.
    pub fn with_wire_logging(mut self, enabled: bool) -> Self {
        self.wire_logging = enabled;
        self
    }
}

impl ConnectionFactory for TcpConnectionFactory {
    fn connect(&self) -> DriverResult<Arc<dyn ReactiveConnection>> {
        let connection =
            TcpConnection::connect(&self.endpoint, self.connect_timeout, self.wire_logging)?;
        Ok(Arc::new(connection))
    }
}

/// One TCP connection multiplexing any number of interactions.
///
/// Dropping it shuts the socket down; streams still live on it are errored by the reader.
pub struct TcpConnection {
    shared: Arc<Shared>,
}

impl TcpConnection {
    /// Dial `endpoint`, trying each resolved address in turn, and start the reader thread.
    pub fn connect(
        endpoint: &Endpoint,
        timeout: Duration,
        wire_logging: bool,
    ) -> DriverResult<Self> {
        let name = endpoint.to_string();
        let addrs = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(|err| DriverError::connect(name.as_str(), err))?;

        let mut last_error = None;
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(connected) => {
                    stream = Some(connected);
                    break;
                }
                Err(err) => last_error = Some(err),
            }
        }
        let stream = match (stream, last_error) {
            (Some(stream), _) => stream,
            (None, Some(err)) => return Err(DriverError::connect(name, err)),
            (None, None) => {
                return Err(DriverError::connect(
                    name,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved"),
                ))
            }
        };
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;

        let shared = Arc::new(Shared {
            endpoint: name,
            writer: Mutex::new(stream),
            routes: Mutex::new(HashMap::new()),
            next_stream_id: AtomicU32::new(1),
            closed: AtomicBool::new(false),
            wire_logging,
        });
        spawn_reader(shared.clone(), reader)?;
        debug!(endpoint = %shared.endpoint, "connected");

        Ok(Self { shared })
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        if self.shared.closed.load(Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.shared.writer.lock().shutdown(Shutdown::Both) {
            debug!(endpoint = %self.shared.endpoint, error = %err, "socket shutdown failed");
        }
    }
}

impl ReactiveConnection for TcpConnection {
    fn request_response(&self, payload: Payload) -> BoxPublisher<Payload> {
        Box::new(RequestPublisher {
            shared: self.shared.clone(),
            kind: RequestKind::Response,
            payload,
        })
    }

    fn request_stream(&self, payload: Payload) -> BoxPublisher<Payload> {
        Box::new(RequestPublisher {
            shared: self.shared.clone(),
            kind: RequestKind::Stream,
            payload,
        })
    }

    fn request_subscription(&self, payload: Payload) -> BoxPublisher<Payload> {
        Box::new(RequestPublisher {
            shared: self.shared.clone(),
            kind: RequestKind::Subscription,
            payload,
        })
    }

    fn fire_and_forget(&self, payload: Payload) -> BoxPublisher<()> {
        Box::new(FireAndForgetPublisher {
            shared: self.shared.clone(),
            payload,
        })
    }

    fn request_channel(&self, outbound: BoxPublisher<Payload>) -> BoxPublisher<Payload> {
        Box::new(ChannelRequestPublisher {
            shared: self.shared.clone(),
            outbound,
        })
    }
}

#[derive(Default)]
struct Route {
    inbound: Option<Arc<dyn Subscriber<Payload>>>,
    outbound: Option<Arc<ChannelLink>>,
}

impl Route {
    fn is_empty(&self) -> bool {
        self.inbound.is_none() && self.outbound.is_none()
    }
}

struct Shared {
    endpoint: String,
    writer: Mutex<TcpStream>,
    routes: Mutex<HashMap<u32, Route>>,
    next_stream_id: AtomicU32,
    closed: AtomicBool,
    wire_logging: bool,
}

impl Shared {
    /// Requester streams use odd ids.
    fn allocate_stream_id(&self) -> u32 {
        self.next_stream_id.fetch_add(2, Ordering::SeqCst)
    }

    fn send(&self, frame: &Frame) -> DriverResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DriverError::ConnectionClosed);
        }
        if self.wire_logging {
            trace!(endpoint = %self.endpoint, ?frame, "send");
        }
        let mut writer = self.writer.lock();
        write_frame(&mut *writer, frame)
    }

    fn register(&self, stream_id: u32, route: Route) {
        self.routes.lock().insert(stream_id, route);
    }

    fn inbound(&self, stream_id: u32) -> Option<Arc<dyn Subscriber<Payload>>> {
        self.routes
            .lock()
            .get(&stream_id)
            .and_then(|route| route.inbound.clone())
    }

    fn take_inbound(&self, stream_id: u32) -> Option<Arc<dyn Subscriber<Payload>>> {
        let mut routes = self.routes.lock();
        let route = routes.get_mut(&stream_id)?;
        let inbound = route.inbound.take();
        if route.is_empty() {
            routes.remove(&stream_id);
        }
        inbound
    }

    fn outbound(&self, stream_id: u32) -> Option<Arc<ChannelLink>> {
        self.routes
            .lock()
            .get(&stream_id)
            .and_then(|route| route.outbound.clone())
    }

    fn take_outbound(&self, stream_id: u32) -> Option<Arc<ChannelLink>> {
        let mut routes = self.routes.lock();
        let route = routes.get_mut(&stream_id)?;
        let outbound = route.outbound.take();
        if route.is_empty() {
            routes.remove(&stream_id);
        }
        outbound
    }

    /// Terminate the local consumer of a stream after a failed write.
    fn fail_stream(&self, stream_id: u32, err: DriverError) {
        warn!(endpoint = %self.endpoint, stream_id, error = %err, "stream failed");
        if let Some(inbound) = self.take_inbound(stream_id) {
            inbound.on_error(StreamError::new(err.to_string()));
        }
    }

    fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::Next { stream_id, payload } => match self.inbound(stream_id) {
                Some(inbound) => inbound.on_next(payload),
                None => debug!(stream_id, "next for unknown stream"),
            },
            Frame::Complete { stream_id } => {
                if let Some(inbound) = self.take_inbound(stream_id) {
                    inbound.on_complete();
                }
            }
            Frame::Error { stream_id, message } => {
                if let Some(inbound) = self.take_inbound(stream_id) {
                    inbound.on_error(StreamError::new(message));
                }
                if let Some(link) = self.take_outbound(stream_id) {
                    link.peer_cancel();
                }
            }
            Frame::RequestN { stream_id, n } => match self.outbound(stream_id) {
                Some(link) => link.peer_request(n),
                None => debug!(stream_id, n, "request_n for unknown stream"),
            },
            Frame::Cancel { stream_id } => {
                if let Some(link) = self.take_outbound(stream_id) {
                    link.peer_cancel();
                }
            }
            other => warn!(frame = ?other, "ignoring peer-initiated request"),
        }
    }

    fn close(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        let routes: Vec<Route> = self.routes.lock().drain().map(|(_, route)| route).collect();
        debug!(endpoint = %self.endpoint, %reason, live_streams = routes.len(), "connection closed");
        for route in routes {
            if let Some(inbound) = route.inbound {
                inbound.on_error(StreamError::new(reason));
            }
            if let Some(link) = route.outbound {
                link.peer_cancel();
            }
        }
    }
}

fn spawn_reader(shared: Arc<Shared>, mut stream: TcpStream) -> DriverResult<()> {
    thread::Builder::new()
        .name("tck-reader".to_string())
        .spawn(move || loop {
            match read_frame(&mut stream) {
                Ok(Some(frame)) => {
                    if shared.wire_logging {
                        trace!(endpoint = %shared.endpoint, ?frame, "recv");
                    }
                    shared.dispatch(frame);
                }
                Ok(None) => {
                    shared.close("connection closed by peer");
                    break;
                }
                Err(err) => {
                    shared.close(&format!("connection failed: {err}"));
                    break;
                }
            }
        })?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Response,
    Stream,
    Subscription,
}

struct RequestPublisher {
    shared: Arc<Shared>,
    kind: RequestKind,
    payload: Payload,
}

impl Publisher<Payload> for RequestPublisher {
    fn subscribe(self: Box<Self>, subscriber: Arc<dyn Subscriber<Payload>>) {
        let stream_id = self.shared.allocate_stream_id();
        self.shared.register(
            stream_id,
            Route {
                inbound: Some(subscriber.clone()),
                outbound: None,
            },
        );
        subscriber.on_subscribe(Arc::new(RequestSubscription {
            shared: self.shared,
            stream_id,
            kind: self.kind,
            state: Mutex::new(RequestState::Unsent(self.payload)),
        }));
    }
}

enum RequestState {
    Unsent(Payload),
    Sent,
    Done,
}

/// The request frame goes out with the first demand; later demand becomes `request_n`.
struct RequestSubscription {
    shared: Arc<Shared>,
    stream_id: u32,
    kind: RequestKind,
    state: Mutex<RequestState>,
}

impl Subscription for RequestSubscription {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        let stream_id = self.stream_id;
        let frame = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, RequestState::Sent) {
                RequestState::Unsent(payload) => match self.kind {
                    RequestKind::Response => Frame::RequestResponse { stream_id, payload },
                    RequestKind::Stream => Frame::RequestStream {
                        stream_id,
                        initial_n: n,
                        payload,
                    },
                    RequestKind::Subscription => Frame::RequestSubscription {
                        stream_id,
                        initial_n: n,
                        payload,
                    },
                },
                RequestState::Sent if self.kind == RequestKind::Response => return,
                RequestState::Sent => Frame::RequestN { stream_id, n },
                RequestState::Done => {
                    *state = RequestState::Done;
                    return;
                }
            }
        };
        if let Err(err) = self.shared.send(&frame) {
            self.shared.fail_stream(stream_id, err);
        }
    }

    fn cancel(&self) {
        let was_sent = {
            let mut state = self.state.lock();
            matches!(
                std::mem::replace(&mut *state, RequestState::Done),
                RequestState::Sent
            )
        };
        self.shared.take_inbound(self.stream_id);
        if was_sent {
            if let Err(err) = self.shared.send(&Frame::Cancel {
                stream_id: self.stream_id,
            }) {
                debug!(stream_id = self.stream_id, error = %err, "cancel not delivered");
            }
        }
    }
}

struct FireAndForgetPublisher {
    shared: Arc<Shared>,
    payload: Payload,
}

/// Fire-and-forget needs no demand; the message leaves as soon as it is subscribed.
impl Publisher<()> for FireAndForgetPublisher {
    fn subscribe(self: Box<Self>, subscriber: Arc<dyn Subscriber<()>>) {
        subscriber.on_subscribe(Arc::new(Detached));
        let frame = Frame::FireAndForget {
            stream_id: self.shared.allocate_stream_id(),
            payload: self.payload,
        };
        match self.shared.send(&frame) {
            Ok(()) => subscriber.on_complete(),
            Err(err) => subscriber.on_error(StreamError::new(err.to_string())),
        }
    }
}

struct Detached;

impl Subscription for Detached {
    fn request(&self, _n: u64) {}
    fn cancel(&self) {}
}

struct ChannelRequestPublisher {
    shared: Arc<Shared>,
    outbound: BoxPublisher<Payload>,
}

impl Publisher<Payload> for ChannelRequestPublisher {
    fn subscribe(self: Box<Self>, subscriber: Arc<dyn Subscriber<Payload>>) {
        let stream_id = self.shared.allocate_stream_id();
        let link = Arc::new(ChannelLink {
            shared: self.shared.clone(),
            stream_id,
            state: Mutex::new(LinkState {
                opened: false,
                inbound_demand: 0,
                inbound_done: false,
                outbound_done: false,
                upstream: None,
            }),
        });
        self.shared.register(
            stream_id,
            Route {
                inbound: Some(subscriber.clone()),
                outbound: Some(link.clone()),
            },
        );
        subscriber.on_subscribe(Arc::new(ChannelInbound { link: link.clone() }));
        self.outbound.subscribe(Arc::new(ChannelOutbound { link }));
    }
}

struct LinkState {
    opened: bool,
    inbound_demand: u64,
    inbound_done: bool,
    outbound_done: bool,
    upstream: Option<Arc<dyn Subscription>>,
}

/// Both directions of one channel stream. The channel opens with the local producer's
/// first item; inbound demand granted before that travels in the opening frame.
struct ChannelLink {
    shared: Arc<Shared>,
    stream_id: u32,
    state: Mutex<LinkState>,
}

impl ChannelLink {
    fn request_inbound(&self, n: u64) {
        let state = {
            let mut state = self.state.lock();
            if state.inbound_done || n == 0 {
                return;
            }
            if !state.opened {
                state.inbound_demand = state.inbound_demand.saturating_add(n);
                return;
            }
            state
        };
        let result = self.shared.send(&Frame::RequestN {
            stream_id: self.stream_id,
            n,
        });
        drop(state);
        if let Err(err) = result {
            self.shared.fail_stream(self.stream_id, err);
        }
    }

    fn cancel_inbound(&self) {
        let opened = {
            let mut state = self.state.lock();
            if state.inbound_done {
                return;
            }
            state.inbound_done = true;
            state.opened
        };
        self.shared.take_inbound(self.stream_id);
        if opened {
            if let Err(err) = self.shared.send(&Frame::Cancel {
                stream_id: self.stream_id,
            }) {
                debug!(stream_id = self.stream_id, error = %err, "cancel not delivered");
            }
        }
    }

    fn peer_request(&self, n: u64) {
        let upstream = self.state.lock().upstream.clone();
        match upstream {
            Some(subscription) => subscription.request(n),
            None => debug!(stream_id = self.stream_id, n, "peer demand before local producer subscribed"),
        }
    }

    fn peer_cancel(&self) {
        let upstream = {
            let mut state = self.state.lock();
            state.outbound_done = true;
            state.upstream.take()
        };
        if let Some(subscription) = upstream {
            subscription.cancel();
        }
    }

    fn attach_producer(&self, subscription: Arc<dyn Subscription>) {
        let accepted = {
            let mut state = self.state.lock();
            if state.outbound_done || state.upstream.is_some() {
                false
            } else {
                state.upstream = Some(subscription.clone());
                true
            }
        };
        if accepted {
            // The opening frame needs the producer's first item.
            subscription.request(1);
        } else {
            subscription.cancel();
        }
    }

    fn send_outbound(&self, payload: Payload) {
        let mut state = self.state.lock();
        if state.outbound_done {
            return;
        }
        let frame = if state.opened {
            Frame::Next {
                stream_id: self.stream_id,
                payload,
            }
        } else {
            state.opened = true;
            let initial_n = std::mem::take(&mut state.inbound_demand);
            Frame::RequestChannel {
                stream_id: self.stream_id,
                initial_n,
                payload,
            }
        };
        let result = self.shared.send(&frame);
        drop(state);
        if let Err(err) = result {
            self.shared.fail_stream(self.stream_id, err);
        }
    }

    fn finish_outbound(&self, error: Option<StreamError>) {
        let mut state = self.state.lock();
        if state.outbound_done {
            return;
        }
        state.outbound_done = true;
        state.upstream = None;
        if !state.opened {
            warn!(stream_id = self.stream_id, "channel producer terminated before its first item");
            return;
        }
        let frame = match error {
            Some(error) => Frame::Error {
                stream_id: self.stream_id,
                message: error.message,
            },
            None => Frame::Complete {
                stream_id: self.stream_id,
            },
        };
        let result = self.shared.send(&frame);
        drop(state);
        if let Err(err) = result {
            debug!(stream_id = self.stream_id, error = %err, "outbound terminal not delivered");
        }
    }
}

struct ChannelInbound {
    link: Arc<ChannelLink>,
}

impl Subscription for ChannelInbound {
    fn request(&self, n: u64) {
        self.link.request_inbound(n);
    }

    fn cancel(&self) {
        self.link.cancel_inbound();
    }
}

struct ChannelOutbound {
    link: Arc<ChannelLink>,
}

impl Subscriber<Payload> for ChannelOutbound {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        self.link.attach_producer(subscription);
    }

    fn on_next(&self, item: Payload) {
        self.link.send_outbound(item);
    }

    fn on_error(&self, error: StreamError) {
        self.link.finish_outbound(Some(error));
    }

    fn on_complete(&self) {
        self.link.finish_outbound(None);
    }
}
