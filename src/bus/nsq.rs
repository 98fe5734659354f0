//! # Minimal NSQ client (TCP protocol V2).
//!
//! Just enough of the protocol to generate and absorb load:
//!
//! ```text
//! client ──► "  V2" IDENTIFY ──► OK
//! producer:  PUB <topic> | MPUB <topic> ──► OK | E_*
//! consumer:  SUB <topic> <channel> ──► OK ; RDY <qos>
//!            ◄── message frames ; FIN <id> | TOUCH <id>
//! both:      ◄── _heartbeat_ ; NOP
//! ```
//!
//! Frames are `[size u32][type u32][data]`, big-endian, decoded by [`NsqCodec`].
//! Lost connections are redialled with the run's reconnect [`BackoffPolicy`];
//! once `max_reconnect_attempts` is exhausted the client reports
//! [`ConnectionEvent::Closed`] and fails every further operation with
//! [`BusError::Closed`].

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ConnectionEvent, Delivery, Payload, Publisher, Signals, Subscription};
use crate::config::WorkerConfig;
use crate::error::BusError;
use crate::policies::BackoffPolicy;

const MAGIC_V2: &[u8] = b"  V2";
const HEARTBEAT: &[u8] = b"_heartbeat_";
const OK: &[u8] = b"OK";

const FRAME_RESPONSE: u32 = 0;
const FRAME_ERROR: u32 = 1;
const FRAME_MESSAGE: u32 = 2;

const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
/// timestamp (8) + attempts (2) + id (16)
const MESSAGE_HEADER_BYTES: usize = 26;
const HEARTBEAT_INTERVAL_MS: u64 = 30_000;

type Conn = Framed<TcpStream, NsqCodec>;

/// A decoded server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(RawMessage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawMessage {
    pub id: Bytes,
    pub attempts: u16,
    pub body: Bytes,
}

/// A client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Identify(Bytes),
    Sub { topic: String, channel: String },
    Rdy(u32),
    Fin(Bytes),
    Touch(Bytes),
    Pub { topic: String, body: Bytes },
    Mpub { topic: String, bodies: Vec<Bytes> },
    Nop,
    Cls,
}

#[derive(Debug, Default)]
pub(crate) struct NsqCodec;

impl Decoder for NsqCodec {
    type Item = Frame;
    type Error = BusError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, BusError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let size = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if !(4..=MAX_FRAME_BYTES).contains(&size) {
            return Err(BusError::Protocol(format!("invalid frame size {size}")));
        }
        if src.len() < 4 + size {
            src.reserve(4 + size - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_type = src.get_u32();
        let mut data = src.split_to(size - 4).freeze();

        match frame_type {
            FRAME_RESPONSE => Ok(Some(Frame::Response(data))),
            FRAME_ERROR => Ok(Some(Frame::Error(data))),
            FRAME_MESSAGE => {
                if data.len() < MESSAGE_HEADER_BYTES {
                    return Err(BusError::Protocol(format!(
                        "message frame of {} bytes is shorter than its header",
                        data.len()
                    )));
                }
                let _timestamp = data.get_i64();
                let attempts = data.get_u16();
                let id = data.split_to(16);
                Ok(Some(Frame::Message(RawMessage {
                    id,
                    attempts,
                    body: data,
                })))
            }
            other => Err(BusError::Protocol(format!("unknown frame type {other}"))),
        }
    }
}

impl Encoder<Command> for NsqCodec {
    type Error = BusError;

    fn encode(&mut self, cmd: Command, dst: &mut BytesMut) -> Result<(), BusError> {
        match cmd {
            Command::Identify(body) => {
                dst.put_slice(b"IDENTIFY\n");
                put_sized(dst, &body)?;
            }
            Command::Sub { topic, channel } => {
                dst.put_slice(format!("SUB {topic} {channel}\n").as_bytes());
            }
            Command::Rdy(count) => dst.put_slice(format!("RDY {count}\n").as_bytes()),
            Command::Fin(id) => put_with_id(dst, b"FIN ", &id),
            Command::Touch(id) => put_with_id(dst, b"TOUCH ", &id),
            Command::Pub { topic, body } => {
                dst.put_slice(format!("PUB {topic}\n").as_bytes());
                put_sized(dst, &body)?;
            }
            Command::Mpub { topic, bodies } => {
                dst.put_slice(format!("MPUB {topic}\n").as_bytes());
                let size = bodies.iter().map(|b| 4 + b.len()).sum::<usize>() + 4;
                dst.put_u32(frame_len(size)?);
                dst.put_u32(frame_len(bodies.len())?);
                for body in &bodies {
                    put_sized(dst, body)?;
                }
            }
            Command::Nop => dst.put_slice(b"NOP\n"),
            Command::Cls => dst.put_slice(b"CLS\n"),
        }
        Ok(())
    }
}

fn frame_len(n: usize) -> Result<u32, BusError> {
    u32::try_from(n).map_err(|_| BusError::Protocol(format!("body of {n} bytes is too large")))
}

fn put_sized(dst: &mut BytesMut, body: &[u8]) -> Result<(), BusError> {
    dst.put_u32(frame_len(body.len())?);
    dst.put_slice(body);
    Ok(())
}

fn put_with_id(dst: &mut BytesMut, verb: &[u8], id: &[u8]) {
    dst.put_slice(verb);
    dst.put_slice(id);
    dst.put_u8(b'\n');
}

fn closed_by_broker() -> BusError {
    BusError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        "connection closed by broker",
    ))
}

/// Reads frames until the pending request is answered, replying to heartbeats on the way.
async fn expect_ok(conn: &mut Conn) -> Result<(), BusError> {
    loop {
        match conn.next().await {
            Some(Ok(Frame::Response(data))) if data.as_ref() == HEARTBEAT => {
                conn.send(Command::Nop).await?;
            }
            Some(Ok(Frame::Response(data))) if data.as_ref() == OK => return Ok(()),
            Some(Ok(Frame::Response(data))) => {
                return Err(BusError::Protocol(format!(
                    "unexpected response '{}'",
                    String::from_utf8_lossy(&data)
                )));
            }
            Some(Ok(Frame::Error(data))) => {
                return Err(BusError::Rejected(String::from_utf8_lossy(&data).into_owned()));
            }
            Some(Ok(Frame::Message(_))) => {
                return Err(BusError::Protocol("message frame on request path".into()));
            }
            Some(Err(e)) => return Err(e),
            None => return Err(closed_by_broker()),
        }
    }
}

/// Connection parameters shared by the first dial and every redial.
#[derive(Clone)]
struct Dialer {
    addr: String,
    identify: Bytes,
    backoff: BackoffPolicy,
    limit: Option<u32>,
    signals: Signals,
}

impl Dialer {
    fn new(cfg: &WorkerConfig) -> Result<Self, BusError> {
        if cfg.run.deflate || cfg.run.snappy {
            warn!(
                deflate = cfg.run.deflate,
                snappy = cfg.run.snappy,
                "compression is not negotiated by the built-in nsq client; sending uncompressed"
            );
        }
        let identify = serde_json::json!({
            "client_id": cfg.alias,
            "hostname": cfg.alias,
            "user_agent": concat!("wd40/", env!("CARGO_PKG_VERSION")),
            "feature_negotiation": false,
            "heartbeat_interval": HEARTBEAT_INTERVAL_MS,
        });
        let identify = serde_json::to_vec(&identify)
            .map_err(|e| BusError::Protocol(format!("identify body: {e}")))?;

        Ok(Self {
            addr: cfg.run.addr(),
            identify: Bytes::from(identify),
            backoff: cfg.run.reconnect_backoff(),
            limit: cfg.run.reconnect_limit(),
            signals: Signals::default(),
        })
    }

    async fn dial(&self) -> Result<Conn, BusError> {
        let connect_err = |e: io::Error| BusError::Connect {
            addr: self.addr.clone(),
            error: e.to_string(),
        };
        let mut stream = TcpStream::connect(&self.addr).await.map_err(connect_err)?;
        stream.set_nodelay(true).map_err(connect_err)?;
        stream.write_all(MAGIC_V2).await.map_err(connect_err)?;

        let mut conn = Framed::new(stream, NsqCodec);
        conn.send(Command::Identify(self.identify.clone())).await?;
        expect_ok(&mut conn).await?;

        self.signals.publish(ConnectionEvent::Connected {
            addr: self.addr.clone(),
        });
        Ok(conn)
    }

    /// Redials with backoff. `attempt` persists across calls within one outage.
    async fn redial(&self, attempt: &mut u32) -> Result<Conn, BusError> {
        loop {
            if self.limit.is_some_and(|limit| *attempt >= limit) {
                self.signals.publish(ConnectionEvent::Closed);
                return Err(BusError::Closed);
            }
            let delay = self.backoff.next(*attempt);
            *attempt += 1;
            self.signals.publish(ConnectionEvent::Reconnecting {
                attempt: *attempt,
                delay,
            });
            tokio::time::sleep(delay).await;

            match self.dial().await {
                Ok(conn) => return Ok(conn),
                Err(e) => warn!(addr = %self.addr, attempt = *attempt, error = %e, "reconnect failed"),
            }
        }
    }
}

/// Publisher over one NSQ connection; requests are serialized on it.
pub struct NsqPublisher {
    dialer: Dialer,
    conn: Mutex<Option<Conn>>,
    closed: AtomicBool,
}

impl NsqPublisher {
    /// Dials once; a refused connection is a setup failure.
    pub async fn connect(cfg: &WorkerConfig) -> Result<Self, BusError> {
        let dialer = Dialer::new(cfg)?;
        let conn = dialer.dial().await?;
        Ok(Self {
            dialer,
            conn: Mutex::new(Some(conn)),
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Publisher for NsqPublisher {
    async fn publish(&self, topic: &str, payload: &Payload) -> Result<(), BusError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            if self.closed.load(Ordering::Relaxed) {
                return Err(BusError::Closed);
            }
            let mut attempt = 0;
            match self.dialer.redial(&mut attempt).await {
                Ok(conn) => *guard = Some(conn),
                Err(e) => {
                    self.closed.store(true, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
        let Some(conn) = guard.as_mut() else {
            return Err(BusError::Closed);
        };

        let cmd = match payload {
            Payload::Single(body) => Command::Pub {
                topic: topic.to_string(),
                body: body.clone(),
            },
            Payload::Batch(bodies) => Command::Mpub {
                topic: topic.to_string(),
                bodies: bodies.clone(),
            },
        };
        let sent = match conn.send(cmd).await {
            Ok(()) => expect_ok(conn).await,
            Err(e) => Err(e),
        };

        match sent {
            Ok(()) => Ok(()),
            Err(BusError::Rejected(reason)) => Err(BusError::Rejected(reason)),
            Err(e) => {
                *guard = None;
                self.dialer.signals.publish(ConnectionEvent::Disconnected {
                    reason: e.to_string(),
                });
                Err(e)
            }
        }
    }

    fn signals(&self) -> &Signals {
        &self.dialer.signals
    }
}

/// Dials, subscribes and starts the connection task feeding the returned subscription.
pub async fn subscribe(cfg: &WorkerConfig) -> Result<Subscription, BusError> {
    let dialer = Dialer::new(cfg)?;
    let conn = dialer.dial().await?;

    let consumer = ConsumerConn {
        topic: cfg.run.topic.clone(),
        channel: cfg.run.channel.clone(),
        qos: cfg.run.qos,
        signals: dialer.signals.clone(),
        dialer,
        stop: CancellationToken::new(),
        intake: CancellationToken::new(),
        deliveries: None,
        faults: None,
    };
    let conn = consumer.start(conn).await?;

    // RDY bounds the number of units in flight
    let (tx, rx) = mpsc::unbounded_channel();
    let (faults_tx, faults_rx) = mpsc::unbounded_channel();
    let stop = consumer.stop.clone();
    let intake = consumer.intake.clone();
    let signals = consumer.signals.clone();
    let task = tokio::spawn(
        ConsumerConn {
            deliveries: Some(tx),
            faults: Some(faults_tx),
            ..consumer
        }
        .run(conn),
    );

    Ok(Subscription::new(rx, signals, stop)
        .with_intake(intake)
        .with_faults(faults_rx)
        .with_task(task))
}

enum Pump {
    Stopped,
    Lost(String),
}

struct ConsumerConn {
    topic: String,
    channel: String,
    qos: u32,
    dialer: Dialer,
    signals: Signals,
    stop: CancellationToken,
    /// Cancelled when the subscription stops taking units.
    intake: CancellationToken,
    deliveries: Option<mpsc::UnboundedSender<Box<dyn Delivery>>>,
    faults: Option<mpsc::UnboundedSender<BusError>>,
}

impl ConsumerConn {
    async fn start(&self, mut conn: Conn) -> Result<Conn, BusError> {
        conn.send(Command::Sub {
            topic: self.topic.clone(),
            channel: self.channel.clone(),
        })
        .await?;
        expect_ok(&mut conn).await?;
        conn.send(Command::Rdy(self.qos)).await?;
        Ok(conn)
    }

    async fn run(self, mut conn: Conn) {
        let (cmd_tx, mut cmd_rx) = mpsc::unbounded_channel::<Command>();

        loop {
            match self.pump(&mut conn, &cmd_tx, &mut cmd_rx).await {
                Pump::Stopped => {
                    // flush acknowledgements issued while halting, then leave politely
                    while let Ok(cmd) = cmd_rx.try_recv() {
                        if conn.feed(cmd).await.is_err() {
                            break;
                        }
                    }
                    let _ = conn.send(Command::Cls).await;
                    self.signals.publish(ConnectionEvent::Closed);
                    return;
                }
                Pump::Lost(reason) => {
                    self.signals
                        .publish(ConnectionEvent::Disconnected { reason });
                    let reconnected = tokio::select! {
                        _ = self.stop.cancelled() => None,
                        res = self.reconnect() => res,
                    };
                    match reconnected {
                        Some(fresh) => conn = fresh,
                        None => return,
                    }
                }
            }
        }
    }

    async fn reconnect(&self) -> Option<Conn> {
        let mut attempt = 0;
        loop {
            let conn = self.dialer.redial(&mut attempt).await.ok()?;
            match self.start(conn).await {
                Ok(conn) => return Some(conn),
                Err(e) => warn!(error = %e, "resubscribe failed"),
            }
        }
    }

    async fn pump(
        &self,
        conn: &mut Conn,
        cmd_tx: &mpsc::UnboundedSender<Command>,
        cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Pump {
        let Some(deliveries) = self.deliveries.as_ref() else {
            return Pump::Stopped;
        };
        let mut paused = false;
        loop {
            tokio::select! {
                biased;
                _ = self.intake.cancelled(), if !paused => {
                    paused = true;
                    if let Err(e) = conn.send(Command::Rdy(0)).await {
                        return Pump::Lost(e.to_string());
                    }
                }
                _ = self.stop.cancelled() => return Pump::Stopped,
                Some(cmd) = cmd_rx.recv() => {
                    if let Err(e) = conn.send(cmd).await {
                        return Pump::Lost(e.to_string());
                    }
                }
                frame = conn.next() => match frame {
                    None => return Pump::Lost("connection closed by broker".into()),
                    Some(Err(e)) => return Pump::Lost(e.to_string()),
                    Some(Ok(Frame::Response(data))) if data.as_ref() == HEARTBEAT => {
                        if let Err(e) = conn.send(Command::Nop).await {
                            return Pump::Lost(e.to_string());
                        }
                    }
                    Some(Ok(Frame::Response(data))) => {
                        debug!(response = %String::from_utf8_lossy(&data), "broker response");
                    }
                    Some(Ok(Frame::Error(data))) => {
                        let reason = String::from_utf8_lossy(&data).into_owned();
                        warn!(error = %reason, "broker error");
                        if let Some(faults) = &self.faults {
                            let _ = faults.send(BusError::Rejected(reason));
                        }
                    }
                    Some(Ok(Frame::Message(msg))) => {
                        let delivery = NsqDelivery {
                            msg,
                            commands: cmd_tx.clone(),
                        };
                        if deliveries.send(Box::new(delivery)).is_err() {
                            if !self.intake.is_cancelled() {
                                return Pump::Stopped;
                            }
                            // sent before RDY 0 reached the broker; requeued on CLS
                            debug!("unit arrived after intake stopped; left to the broker");
                        }
                    }
                },
            }
        }
    }
}

struct NsqDelivery {
    msg: RawMessage,
    commands: mpsc::UnboundedSender<Command>,
}

impl Delivery for NsqDelivery {
    fn attempts(&self) -> u16 {
        self.msg.attempts
    }

    fn body(&self) -> &[u8] {
        &self.msg.body
    }

    fn touch(&self) {
        let _ = self.commands.send(Command::Touch(self.msg.id.clone()));
    }

    fn finish(self: Box<Self>) {
        let _ = self.commands.send(Command::Fin(self.msg.id));
    }
}

/// Scripted stand-in for nsqd, one client per [`Session`].
#[cfg(test)]
pub(crate) mod fake_broker {
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    use super::{FRAME_ERROR, FRAME_MESSAGE, FRAME_RESPONSE, MAGIC_V2, OK};

    pub(crate) fn frame(frame_type: u32, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((data.len() + 4) as u32).to_be_bytes());
        out.extend_from_slice(&frame_type.to_be_bytes());
        out.extend_from_slice(data);
        out
    }

    pub(crate) fn message_frame(id: &[u8; 16], attempts: u16, body: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&0i64.to_be_bytes());
        data.extend_from_slice(&attempts.to_be_bytes());
        data.extend_from_slice(id);
        data.extend_from_slice(body);
        frame(FRAME_MESSAGE, &data)
    }

    pub(crate) async fn read_handshake(reader: &mut BufReader<OwnedReadHalf>) {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).await.unwrap();
        assert_eq!(&magic, MAGIC_V2);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "IDENTIFY\n");
        let len = reader.read_u32().await.unwrap();
        let mut body = vec![0u8; len as usize];
        reader.read_exact(&mut body).await.unwrap();
        let identify: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(identify["feature_negotiation"], false);
    }

    /// One accepted client, past `IDENTIFY`.
    pub(crate) struct Session {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl Session {
        pub(crate) async fn accept(listener: &TcpListener) -> Self {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, writer) = socket.into_split();
            let mut session = Self {
                reader: BufReader::new(read),
                writer,
            };
            read_handshake(&mut session.reader).await;
            session.ok().await;
            session
        }

        /// Next command line; empty at EOF.
        pub(crate) async fn line(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            line
        }

        /// Reads command lines up to and including `last` (or EOF).
        pub(crate) async fn lines_until(&mut self, last: &str) -> Vec<String> {
            let mut lines = Vec::new();
            loop {
                let line = self.line().await;
                if line.is_empty() {
                    return lines;
                }
                let done = line == last;
                lines.push(line);
                if done {
                    return lines;
                }
            }
        }

        pub(crate) async fn ok(&mut self) {
            self.writer.write_all(&frame(FRAME_RESPONSE, OK)).await.unwrap();
        }

        pub(crate) async fn error(&mut self, code: &[u8]) {
            self.writer.write_all(&frame(FRAME_ERROR, code)).await.unwrap();
        }

        pub(crate) async fn message(&mut self, id: &[u8; 16], attempts: u16, body: &[u8]) {
            self.writer
                .write_all(&message_frame(id, attempts, body))
                .await
                .unwrap();
        }
    }
}
