//! Serializing actor around [`RasCore`].
//!
//! Every mutation of the record store and every engine transition runs on one
//! task. Transport callbacks, procedure results and application calls reach it
//! as messages through a cloneable [`RasHandle`]. Ack and retry deadlines are
//! kept by the same task, so cancelling one is a map removal and cannot race
//! with its expiry.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::{CoreError, OutboundAction, RasCore, RasEvent};
use crate::ingest::SubeventResult;
use crate::protocol::{Channel, ConnId, Pdu};
use crate::requester::GetError;
use crate::segment::RecordBuffer;

/// Link the service sends PDUs over. `Ok` means the PDU was taken; the next
/// segment of a transfer is produced right after.
pub trait Transport: Send + 'static {
    fn send(&mut self, conn: ConnId, pdu: &Pdu) -> Result<(), SendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Out of transmit buffers; try again later.
    #[error("transport has no free buffers")]
    NoBuffers,
    #[error("connection is gone")]
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    #[error("ranging service stopped")]
    Stopped,
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error(transparent)]
    Get(#[from] GetError),
}

enum Message {
    AllocResponder {
        conn: ConnId,
        mtu: u16,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    AllocRequester {
        conn: ConnId,
        reply: oneshot::Sender<Result<(), CoreError>>,
    },
    MtuChanged {
        conn: ConnId,
        mtu: u16,
    },
    Disconnected {
        conn: ConnId,
    },
    Subevent {
        conn: ConnId,
        result: SubeventResult,
    },
    Received {
        conn: ConnId,
        pdu: Pdu,
    },
    GetRecord {
        conn: ConnId,
        ranging_counter: u16,
        limit: usize,
        reply: oneshot::Sender<Result<RecordBuffer, GetError>>,
    },
    ReadFeatures {
        conn: ConnId,
        reply: oneshot::Sender<Result<u32, GetError>>,
    },
    Subscribe {
        conn: ConnId,
        channel: Channel,
        enable: bool,
    },
    ReadRecord {
        conn: ConnId,
        ranging_counter: u16,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    ReadyCheck {
        conn: ConnId,
        ranging_counter: u16,
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable entry point into the service task.
#[derive(Clone)]
pub struct RasHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl RasHandle {
    fn post(&self, msg: Message) -> Result<(), ServiceError> {
        self.tx.send(msg).map_err(|_| ServiceError::Stopped)
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Message,
    ) -> Result<T, ServiceError> {
        let (reply, rx) = oneshot::channel();
        self.post(make(reply))?;
        rx.await.map_err(|_| ServiceError::Stopped)
    }

    pub async fn alloc_responder(&self, conn: ConnId, mtu: u16) -> Result<(), ServiceError> {
        Ok(self
            .call(|reply| Message::AllocResponder { conn, mtu, reply })
            .await??)
    }

    pub async fn alloc_requester(&self, conn: ConnId) -> Result<(), ServiceError> {
        Ok(self
            .call(|reply| Message::AllocRequester { conn, reply })
            .await??)
    }

    pub fn mtu_changed(&self, conn: ConnId, mtu: u16) -> Result<(), ServiceError> {
        self.post(Message::MtuChanged { conn, mtu })
    }

    pub fn disconnected(&self, conn: ConnId) -> Result<(), ServiceError> {
        self.post(Message::Disconnected { conn })
    }

    /// Procedure data measured on `conn`.
    pub fn subevent(&self, conn: ConnId, result: SubeventResult) -> Result<(), ServiceError> {
        self.post(Message::Subevent { conn, result })
    }

    /// PDU received from the peer.
    pub fn received(&self, conn: ConnId, pdu: Pdu) -> Result<(), ServiceError> {
        self.post(Message::Received { conn, pdu })
    }

    /// Fetch a record from the peer, reading at most `limit` bytes.
    pub async fn get_record(
        &self,
        conn: ConnId,
        ranging_counter: u16,
        limit: usize,
    ) -> Result<RecordBuffer, ServiceError> {
        Ok(self
            .call(|reply| Message::GetRecord {
                conn,
                ranging_counter,
                limit,
                reply,
            })
            .await??)
    }

    pub async fn read_features(&self, conn: ConnId) -> Result<u32, ServiceError> {
        Ok(self
            .call(|reply| Message::ReadFeatures { conn, reply })
            .await??)
    }

    pub fn subscribe(&self, conn: ConnId, channel: Channel, enable: bool) -> Result<(), ServiceError> {
        self.post(Message::Subscribe {
            conn,
            channel,
            enable,
        })
    }

    /// Copy of a local record, if it is ready.
    pub async fn read_record(
        &self,
        conn: ConnId,
        ranging_counter: u16,
    ) -> Result<Option<Vec<u8>>, ServiceError> {
        self.call(|reply| Message::ReadRecord {
            conn,
            ranging_counter,
            reply,
        })
        .await
    }

    pub async fn ready_check(&self, conn: ConnId, ranging_counter: u16) -> Result<bool, ServiceError> {
        self.call(|reply| Message::ReadyCheck {
            conn,
            ranging_counter,
            reply,
        })
        .await
    }
}

pub struct RasService<T: Transport> {
    core: RasCore,
    transport: T,
    rx: mpsc::UnboundedReceiver<Message>,
    events: mpsc::UnboundedSender<RasEvent>,
    ack_deadlines: HashMap<ConnId, Instant>,
    retry_deadlines: HashMap<ConnId, Instant>,
    pending_gets: HashMap<ConnId, oneshot::Sender<Result<RecordBuffer, GetError>>>,
    pending_features: HashMap<ConnId, oneshot::Sender<Result<u32, GetError>>>,
}

impl<T: Transport> RasService<T> {
    /// Start the service task. Events not claimed by a pending call are
    /// delivered on the returned receiver.
    pub fn spawn(config: Config, transport: T) -> (RasHandle, mpsc::UnboundedReceiver<RasEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let service = RasService {
            core: RasCore::new(config),
            transport,
            rx,
            events,
            ack_deadlines: HashMap::new(),
            retry_deadlines: HashMap::new(),
            pending_gets: HashMap::new(),
            pending_features: HashMap::new(),
        };
        tokio::spawn(service.run());
        (RasHandle { tx }, events_rx)
    }

    async fn run(mut self) {
        info!(slots = self.core.store().capacity(), "ranging service started");
        loop {
            let next = self.next_deadline();
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                _ = sleep_until_opt(next) => self.fire_due(),
            }
        }
        debug!("ranging service stopped");
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.ack_deadlines
            .values()
            .chain(self.retry_deadlines.values())
            .min()
            .copied()
    }

    fn fire_due(&mut self) {
        let now = Instant::now();
        let due_acks: Vec<ConnId> = self
            .ack_deadlines
            .iter()
            .filter(|&(_, &t)| t <= now)
            .map(|(&c, _)| c)
            .collect();
        for conn in due_acks {
            self.ack_deadlines.remove(&conn);
            self.core.on_ack_timeout(conn);
        }
        let due_retries: Vec<ConnId> = self
            .retry_deadlines
            .iter()
            .filter(|&(_, &t)| t <= now)
            .map(|(&c, _)| c)
            .collect();
        for conn in due_retries {
            self.retry_deadlines.remove(&conn);
            let actions = self.core.on_retry(conn);
            self.execute(actions);
        }
    }

    fn handle(&mut self, msg: Message) {
        match msg {
            Message::AllocResponder { conn, mtu, reply } => {
                let _ = reply.send(self.core.alloc_responder(conn, mtu));
            }
            Message::AllocRequester { conn, reply } => {
                let _ = reply.send(self.core.alloc_requester(conn));
            }
            Message::MtuChanged { conn, mtu } => self.core.on_mtu_changed(conn, mtu),
            Message::Disconnected { conn } => {
                info!(conn = %conn, "connection closed");
                self.retry_deadlines.remove(&conn);
                let actions = self.core.on_disconnected(conn);
                self.execute(actions);
            }
            Message::Subevent { conn, result } => match self.core.on_subevent_result(conn, &result) {
                Ok(actions) => self.execute(actions),
                Err(e) => warn!(conn = %conn, error = %e, "subevent ignored"),
            },
            Message::Received { conn, pdu } => match self.core.on_pdu_received(conn, pdu) {
                Ok(actions) => self.execute(actions),
                Err(e) => warn!(conn = %conn, error = %e, "PDU ignored"),
            },
            Message::GetRecord {
                conn,
                ranging_counter,
                limit,
                reply,
            } => match self
                .core
                .get_record(conn, ranging_counter, RecordBuffer::with_limit(limit))
            {
                Ok(actions) => {
                    self.pending_gets.insert(conn, reply);
                    self.execute(actions);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Message::ReadFeatures { conn, reply } => match self.core.read_features(conn) {
                Ok(actions) => {
                    self.pending_features.insert(conn, reply);
                    self.execute(actions);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Message::Subscribe {
                conn,
                channel,
                enable,
            } => match self.core.subscribe(conn, channel, enable) {
                Ok(actions) => self.execute(actions),
                Err(e) => warn!(conn = %conn, error = %e, "subscribe ignored"),
            },
            Message::ReadRecord {
                conn,
                ranging_counter,
                reply,
            } => {
                let _ = reply.send(self.core.read_record(conn, ranging_counter));
            }
            Message::ReadyCheck {
                conn,
                ranging_counter,
                reply,
            } => {
                let _ = reply.send(self.core.ready_check(conn, ranging_counter));
            }
        }
    }

    fn execute(&mut self, actions: Vec<OutboundAction>) {
        let mut queue: VecDeque<OutboundAction> = actions.into();
        while let Some(action) = queue.pop_front() {
            match action {
                OutboundAction::Send { conn, pdu } => match self.transport.send(conn, &pdu) {
                    Ok(()) => queue.extend(self.core.on_sent(conn, &pdu)),
                    Err(e) => {
                        debug!(conn = %conn, error = %e, "send failed");
                        queue.extend(self.core.on_send_failed(conn, &pdu));
                    }
                },
                OutboundAction::StartAckTimer { conn } => {
                    let deadline = Instant::now() + self.core.config().ack_timeout();
                    self.ack_deadlines.insert(conn, deadline);
                }
                OutboundAction::CancelAckTimer { conn } => {
                    self.ack_deadlines.remove(&conn);
                }
                OutboundAction::ScheduleRetry { conn } => {
                    let deadline = Instant::now() + self.core.config().send_retry();
                    self.retry_deadlines.insert(conn, deadline);
                }
                OutboundAction::Event(event) => self.dispatch(event),
            }
        }
    }

    fn dispatch(&mut self, event: RasEvent) {
        let event = match event {
            RasEvent::GetComplete {
                conn,
                ranging_counter,
                result,
            } => match self.pending_gets.remove(&conn) {
                Some(reply) => {
                    let _ = reply.send(result);
                    return;
                }
                None => RasEvent::GetComplete {
                    conn,
                    ranging_counter,
                    result,
                },
            },
            RasEvent::FeaturesRead { conn, result } => match self.pending_features.remove(&conn) {
                Some(reply) => {
                    let _ = reply.send(result);
                    return;
                }
                None => RasEvent::FeaturesRead { conn, result },
            },
            other => other,
        };
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => sleep_until(d).await,
        None => std::future::pending().await,
    }
}
