use std::collections::{HashMap, VecDeque};
use std::net::{TcpListener, TcpStream};
use std::thread;

use reactive_tck_driver::transport::{read_frame, write_frame, Frame};
use reactive_tck_driver::{DriverResult, Payload};
use tracing::{debug, info, warn};

const STREAM_LENGTH: u64 = 3;
const CHANNEL_CREDIT: u64 = 256;
const ERROR_TRIGGER: &str = "error";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    let listener = TcpListener::bind("127.0.0.1:0")?;
    let addr = listener.local_addr()?;
    println!("listening on {addr}");

    for (index, stream) in listener.incoming().enumerate() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };
        thread::Builder::new()
            .name(format!("conn-{index}"))
            .spawn(move || {
                let peer = stream.peer_addr().ok();
                match serve(stream) {
                    Ok(()) => debug!(?peer, "connection finished"),
                    Err(err) => warn!(?peer, error = %err, "connection failed"),
                }
            })?;
    }
    Ok(())
}

enum Responder {
    Stream { remaining: u64, payload: Payload, demand: u64 },
    Subscription { payload: Payload, demand: u64 },
    Channel(EchoChannel),
}

struct EchoChannel {
    queue: VecDeque<Payload>,
    demand: u64,
    received: u64,
    client_done: bool,
}

struct Connection {
    stream: TcpStream,
    responders: HashMap<u32, Responder>,
}

fn serve(stream: TcpStream) -> DriverResult<()> {
    let mut reader = stream.try_clone()?;
    let mut connection = Connection {
        stream,
        responders: HashMap::new(),
    };
    while let Some(frame) = read_frame(&mut reader)? {
        if !connection.handle(frame)? {
            info!("shutdown requested");
            break;
        }
    }
    Ok(())
}

impl Connection {
    /// Returns `false` once the connection should close.
    fn handle(&mut self, frame: Frame) -> DriverResult<bool> {
        match frame {
            Frame::RequestResponse { stream_id, payload } => {
                if !self.reject(stream_id, &payload)? {
                    self.send(Frame::Next { stream_id, payload })?;
                    self.send(Frame::Complete { stream_id })?;
                }
            }
            Frame::RequestStream {
                stream_id,
                initial_n,
                payload,
            } => {
                if !self.reject(stream_id, &payload)? {
                    let responder = Responder::Stream {
                        remaining: STREAM_LENGTH,
                        payload,
                        demand: initial_n,
                    };
                    self.responders.insert(stream_id, responder);
                    self.flush(stream_id)?;
                }
            }
            Frame::RequestSubscription {
                stream_id,
                initial_n,
                payload,
            } => {
                if !self.reject(stream_id, &payload)? {
                    let responder = Responder::Subscription {
                        payload,
                        demand: initial_n,
                    };
                    self.responders.insert(stream_id, responder);
                    self.flush(stream_id)?;
                }
            }
            Frame::FireAndForget { payload, .. } => {
                if payload.is_shutdown() {
                    return Ok(false);
                }
                debug!(%payload, "fire and forget");
            }
            Frame::RequestChannel {
                stream_id,
                initial_n,
                payload,
            } => {
                let mut queue = VecDeque::new();
                queue.push_back(payload);
                self.responders.insert(
                    stream_id,
                    Responder::Channel(EchoChannel {
                        queue,
                        demand: initial_n,
                        received: 1,
                        client_done: false,
                    }),
                );
                self.send(Frame::RequestN {
                    stream_id,
                    n: CHANNEL_CREDIT,
                })?;
                self.flush(stream_id)?;
            }
            Frame::Next { stream_id, payload } => {
                let mut grant = false;
                if let Some(Responder::Channel(channel)) = self.responders.get_mut(&stream_id) {
                    channel.queue.push_back(payload);
                    channel.received += 1;
                    grant = channel.received % CHANNEL_CREDIT == 0;
                }
                if grant {
                    self.send(Frame::RequestN {
                        stream_id,
                        n: CHANNEL_CREDIT,
                    })?;
                }
                self.flush(stream_id)?;
            }
            Frame::Complete { stream_id } => {
                if let Some(Responder::Channel(channel)) = self.responders.get_mut(&stream_id) {
                    channel.client_done = true;
                }
                self.flush(stream_id)?;
            }
            Frame::Error { stream_id, message } => {
                debug!(stream_id, %message, "client errored stream");
                self.responders.remove(&stream_id);
            }
            Frame::RequestN { stream_id, n } => {
                match self.responders.get_mut(&stream_id) {
                    Some(Responder::Stream { demand, .. })
                    | Some(Responder::Subscription { demand, .. }) => {
                        *demand = demand.saturating_add(n)
                    }
                    Some(Responder::Channel(channel)) => {
                        channel.demand = channel.demand.saturating_add(n)
                    }
                    None => {}
                }
                self.flush(stream_id)?;
            }
            Frame::Cancel { stream_id } => {
                self.responders.remove(&stream_id);
            }
        }
        Ok(true)
    }

    /// Answer requests carrying the error trigger with an error frame.
    fn reject(&mut self, stream_id: u32, payload: &Payload) -> DriverResult<bool> {
        if payload.data != ERROR_TRIGGER {
            return Ok(false);
        }
        self.send(Frame::Error {
            stream_id,
            message: format!("requested error for {payload}"),
        })?;
        Ok(true)
    }

    fn flush(&mut self, stream_id: u32) -> DriverResult<()> {
        let mut outgoing = Vec::new();
        let mut finished = false;
        match self.responders.get_mut(&stream_id) {
            Some(Responder::Stream {
                remaining,
                payload,
                demand,
            }) => {
                while *demand > 0 && *remaining > 0 {
                    *demand -= 1;
                    *remaining -= 1;
                    outgoing.push(Frame::Next {
                        stream_id,
                        payload: payload.clone(),
                    });
                }
                finished = *remaining == 0;
            }
            Some(Responder::Subscription { payload, demand }) => {
                while *demand > 0 {
                    *demand -= 1;
                    let frame = Frame::Next {
                        stream_id,
                        payload: payload.clone(),
                    };
                    write_frame(&mut self.stream, &frame)?;
                }
            }
            Some(Responder::Channel(channel)) => {
                while channel.demand > 0 {
                    let Some(payload) = channel.queue.pop_front() else {
                        break;
                    };
                    channel.demand -= 1;
                    outgoing.push(Frame::Next { stream_id, payload });
                }
                finished = channel.client_done && channel.queue.is_empty();
            }
            None => return Ok(()),
        }
        if finished {
            self.responders.remove(&stream_id);
            outgoing.push(Frame::Complete { stream_id });
        }
        for frame in outgoing {
            self.send(frame)?;
        }
        Ok(())
    }

    fn send(&mut self, frame: Frame) -> DriverResult<()> {
        write_frame(&mut self.stream, &frame)
    }
}
