//! Responder transfer engine: one instance per connection.
//!
//! Idle -> GetRecord -> Streaming (one segment in flight) -> CompleteRecord ->
//! AckPending -> AckRecord or ack timeout -> Idle. The engine never touches a
//! transport; it pushes [`OutboundAction`]s for the host to execute and is told
//! about send results through `on_segment_sent` / `on_segment_send_failed`.

use tracing::{debug, info, warn};

use crate::core::OutboundAction;
use crate::protocol::{Channel, ConnId, Pdu, RascpCommand, RascpResponse, ResponseCode};
use crate::segment::{SegmentWriter, MIN_MTU};
use crate::store::{RecordHandle, RecordStore};
use crate::wire::{self, DecodeError};

/// Channels the peer enabled notifications/indications on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Subscriptions {
    pub control_point: bool,
    pub on_demand: bool,
    pub realtime: bool,
    pub ready: bool,
    pub overwritten: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    #[error("on-demand and real-time ranging data cannot both be enabled")]
    ModeConflict,
    #[error("{0:?} does not support notifications")]
    NotSubscribable(Channel),
}

struct Transfer {
    ranging_counter: u16,
    handle: RecordHandle,
    writer: SegmentWriter,
    /// Segment handed to the transport and not yet confirmed.
    in_flight: Option<(Vec<u8>, bool)>,
}

enum State {
    Idle,
    Streaming(Transfer),
    AckPending(Transfer),
}

/// Coarse state, for inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    Idle,
    Streaming { ranging_counter: u16 },
    AckPending { ranging_counter: u16 },
}

pub struct Responder {
    conn: ConnId,
    mtu: u16,
    abort_supported: bool,
    subs: Subscriptions,
    state: State,
    last_ready: u16,
    last_overwritten: u16,
}

impl Responder {
    pub fn new(conn: ConnId, mtu: u16, abort_supported: bool) -> Self {
        Self {
            conn,
            mtu: mtu.max(MIN_MTU),
            abort_supported,
            subs: Subscriptions::default(),
            state: State::Idle,
            last_ready: 0,
            last_overwritten: 0,
        }
    }

    pub fn state(&self) -> ResponderState {
        match &self.state {
            State::Idle => ResponderState::Idle,
            State::Streaming(t) => ResponderState::Streaming {
                ranging_counter: t.ranging_counter,
            },
            State::AckPending(t) => ResponderState::AckPending {
                ranging_counter: t.ranging_counter,
            },
        }
    }

    /// Takes effect from the next segment.
    pub fn set_mtu(&mut self, mtu: u16) {
        self.mtu = mtu.max(MIN_MTU);
    }

    pub fn subscribe(&mut self, channel: Channel, enable: bool) -> Result<(), SubscribeError> {
        let slot = match channel {
            Channel::ControlPoint => &mut self.subs.control_point,
            Channel::RecordReady => &mut self.subs.ready,
            Channel::RecordOverwritten => &mut self.subs.overwritten,
            Channel::OnDemandData => {
                if enable && self.subs.realtime {
                    return Err(SubscribeError::ModeConflict);
                }
                &mut self.subs.on_demand
            }
            Channel::RealtimeData => {
                if enable && self.subs.on_demand {
                    return Err(SubscribeError::ModeConflict);
                }
                &mut self.subs.realtime
            }
            Channel::Features => return Err(SubscribeError::NotSubscribable(channel)),
        };
        *slot = enable;
        debug!(conn = %self.conn, ?channel, enable, "subscription changed");
        Ok(())
    }

    /// Value returned for a read of `channel`; empty when it is not readable.
    pub fn read(&self, channel: Channel, feature_bits: u32) -> Vec<u8> {
        match channel {
            Channel::Features => wire::encode_features(feature_bits),
            Channel::RecordReady => wire::encode_counter(self.last_ready),
            Channel::RecordOverwritten => wire::encode_counter(self.last_overwritten),
            _ => Vec::new(),
        }
    }

    fn indicate(&self, rsp: RascpResponse, out: &mut Vec<OutboundAction>) {
        if !self.subs.control_point {
            warn!(conn = %self.conn, ?rsp, "control point indications disabled, dropping response");
            return;
        }
        out.push(OutboundAction::Send {
            conn: self.conn,
            pdu: Pdu::Notify {
                channel: Channel::ControlPoint,
                payload: wire::encode_response(&rsp),
            },
        });
    }

    fn respond(&self, code: ResponseCode, out: &mut Vec<OutboundAction>) {
        self.indicate(RascpResponse::ResponseCode(code), out);
    }

    /// Handle a write to the control point.
    pub fn on_cp_write(
        &mut self,
        store: &mut RecordStore,
        bytes: &[u8],
        out: &mut Vec<OutboundAction>,
    ) {
        if !self.subs.control_point {
            warn!(conn = %self.conn, "control point written without indications enabled");
            return;
        }
        let cmd = match wire::decode_command(bytes) {
            Ok(cmd) => cmd,
            Err(DecodeError::UnknownOpcode(op)) => {
                warn!(conn = %self.conn, op, "unknown RAS-CP opcode");
                return self.respond(ResponseCode::OpcodeNotSupported, out);
            }
            Err(e) => {
                warn!(conn = %self.conn, error = %e, "malformed RAS-CP command");
                return self.respond(ResponseCode::InvalidParameter, out);
            }
        };
        debug!(conn = %self.conn, ?cmd, "RAS-CP command");

        if cmd == RascpCommand::AbortOperation && self.abort_supported {
            return self.abort(store, out);
        }
        if self.subs.realtime || matches!(self.state, State::Streaming(_)) {
            return self.respond(ResponseCode::InvalidParameter, out);
        }

        match cmd {
            RascpCommand::GetRecord { ranging_counter } => {
                self.get_record(store, ranging_counter, out)
            }
            RascpCommand::AckRecord { ranging_counter } => {
                self.ack_record(store, ranging_counter, out)
            }
            RascpCommand::RetrieveLostSegments { .. }
            | RascpCommand::SetFilter { .. }
            | RascpCommand::AbortOperation => {
                self.respond(ResponseCode::OpcodeNotSupported, out)
            }
        }
    }

    fn get_record(
        &mut self,
        store: &mut RecordStore,
        ranging_counter: u16,
        out: &mut Vec<OutboundAction>,
    ) {
        if !matches!(self.state, State::Idle) {
            return self.respond(ResponseCode::ServerBusy, out);
        }
        if !self.subs.on_demand {
            warn!(conn = %self.conn, "GetRecord without on-demand data enabled");
            return self.respond(ResponseCode::InvalidParameter, out);
        }
        match store.state(self.conn, ranging_counter) {
            Some(s) if s.ready && s.refcount > 0 => {
                return self.respond(ResponseCode::ServerBusy, out);
            }
            Some(s) if s.ready => {}
            _ => return self.respond(ResponseCode::NoRecordsFound, out),
        }
        let Some(handle) = store.claim(self.conn, ranging_counter) else {
            return self.respond(ResponseCode::NoRecordsFound, out);
        };
        info!(conn = %self.conn, ranging_counter, "sending ranging record");
        self.respond(ResponseCode::Success, out);
        self.state = State::Streaming(Transfer {
            ranging_counter,
            handle,
            writer: SegmentWriter::new(),
            in_flight: None,
        });
        self.pump(store, out);
    }

    fn ack_record(
        &mut self,
        store: &mut RecordStore,
        ranging_counter: u16,
        out: &mut Vec<OutboundAction>,
    ) {
        let matches = matches!(&self.state, State::AckPending(t) if t.ranging_counter == ranging_counter);
        if !matches {
            return self.respond(ResponseCode::NoRecordsFound, out);
        }
        if let State::AckPending(t) = std::mem::replace(&mut self.state, State::Idle) {
            out.push(OutboundAction::CancelAckTimer { conn: self.conn });
            if let Err(e) = store.mark_acked(t.handle) {
                warn!(conn = %self.conn, error = %e, "acked record vanished");
            }
            self.release(store, t.handle);
            debug!(conn = %self.conn, ranging_counter, "record acknowledged");
            self.respond(ResponseCode::Success, out);
        }
    }

    fn abort(&mut self, store: &mut RecordStore, out: &mut Vec<OutboundAction>) {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Idle => self.respond(ResponseCode::AbortUnsuccessful, out),
            State::Streaming(t) => {
                debug!(conn = %self.conn, ranging_counter = t.ranging_counter, "transfer aborted");
                self.release(store, t.handle);
                self.respond(ResponseCode::Success, out);
            }
            State::AckPending(t) => {
                out.push(OutboundAction::CancelAckTimer { conn: self.conn });
                self.release(store, t.handle);
                self.respond(ResponseCode::Success, out);
            }
        }
    }

    fn release(&self, store: &mut RecordStore, handle: RecordHandle) {
        if let Err(e) = store.release(handle) {
            warn!(conn = %self.conn, error = %e, "releasing record failed");
        }
    }

    /// Send the next segment if none is in flight.
    fn pump(&mut self, store: &mut RecordStore, out: &mut Vec<OutboundAction>) {
        let State::Streaming(t) = &mut self.state else {
            return;
        };
        if t.in_flight.is_some() {
            return;
        }
        match t.writer.next_segment(store, t.handle, self.mtu) {
            Ok(Some((bytes, last))) => {
                t.in_flight = Some((bytes.clone(), last));
                out.push(OutboundAction::Send {
                    conn: self.conn,
                    pdu: Pdu::Notify {
                        channel: Channel::OnDemandData,
                        payload: bytes,
                    },
                });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(conn = %self.conn, error = %e, "record unreadable, ending transfer");
                let handle = t.handle;
                self.state = State::Idle;
                self.release(store, handle);
                self.respond(ResponseCode::ProcedureNotCompleted, out);
            }
        }
    }

    /// The in-flight segment reached the transport.
    pub fn on_segment_sent(&mut self, store: &mut RecordStore, out: &mut Vec<OutboundAction>) {
        let State::Streaming(t) = &mut self.state else {
            return;
        };
        let Some((_, last)) = t.in_flight.take() else {
            return;
        };
        if !last {
            return self.pump(store, out);
        }
        if let State::Streaming(t) = std::mem::replace(&mut self.state, State::Idle) {
            let ranging_counter = t.ranging_counter;
            debug!(conn = %self.conn, ranging_counter, bytes = t.writer.bytes_sent(), "all segments sent");
            self.state = State::AckPending(t);
            self.indicate(RascpResponse::CompleteRecord { ranging_counter }, out);
            out.push(OutboundAction::StartAckTimer { conn: self.conn });
        }
    }

    /// The transport refused the in-flight segment; it is kept for a retry.
    pub fn on_segment_send_failed(&mut self, out: &mut Vec<OutboundAction>) {
        if let State::Streaming(Transfer {
            in_flight: Some(_), ..
        }) = &self.state
        {
            out.push(OutboundAction::ScheduleRetry { conn: self.conn });
        }
    }

    /// Resend the in-flight segment.
    pub fn on_retry(&mut self, out: &mut Vec<OutboundAction>) {
        if let State::Streaming(Transfer {
            in_flight: Some((bytes, _)),
            ..
        }) = &self.state
        {
            out.push(OutboundAction::Send {
                conn: self.conn,
                pdu: Pdu::Notify {
                    channel: Channel::OnDemandData,
                    payload: bytes.clone(),
                },
            });
        }
    }

    /// No AckRecord arrived in time. The record stays stored but is released.
    pub fn on_ack_timeout(&mut self, store: &mut RecordStore) {
        if !matches!(self.state, State::AckPending(_)) {
            return;
        }
        if let State::AckPending(t) = std::mem::replace(&mut self.state, State::Idle) {
            warn!(conn = %self.conn, ranging_counter = t.ranging_counter, "ack timeout, releasing record");
            self.release(store, t.handle);
        }
    }

    pub fn on_record_ready(&mut self, ranging_counter: u16, out: &mut Vec<OutboundAction>) {
        self.last_ready = ranging_counter;
        if self.subs.ready {
            out.push(OutboundAction::Send {
                conn: self.conn,
                pdu: Pdu::Notify {
                    channel: Channel::RecordReady,
                    payload: wire::encode_counter(ranging_counter),
                },
            });
        }
    }

    /// A record of this connection was overwritten. Ends the transfer when it
    /// is the one being sent.
    pub fn on_record_overwritten(
        &mut self,
        store: &mut RecordStore,
        ranging_counter: u16,
        out: &mut Vec<OutboundAction>,
    ) {
        self.last_overwritten = ranging_counter;
        if self.subs.overwritten {
            out.push(OutboundAction::Send {
                conn: self.conn,
                pdu: Pdu::Notify {
                    channel: Channel::RecordOverwritten,
                    payload: wire::encode_counter(ranging_counter),
                },
            });
        }
        let active = match &self.state {
            State::Streaming(t) | State::AckPending(t) => t.ranging_counter == ranging_counter,
            State::Idle => false,
        };
        if !active {
            return;
        }
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Streaming(t) => self.release(store, t.handle),
            State::AckPending(t) => {
                out.push(OutboundAction::CancelAckTimer { conn: self.conn });
                self.release(store, t.handle);
            }
            State::Idle => {}
        }
        warn!(conn = %self.conn, ranging_counter, "record overwritten during transfer");
        self.respond(ResponseCode::ProcedureNotCompleted, out);
    }

    /// Connection is going away: drop any claim.
    pub fn close(&mut self, store: &mut RecordStore) {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Streaming(t) | State::AckPending(t) => self.release(store, t.handle),
            State::Idle => {}
        }
    }
}
