//! Host-driven API: RasCore receives events from the host, returns actions.
//!
//! Owns the record store and one responder and/or requester per connection.
//! Nothing here performs I/O or keeps time; sends, timers and application
//! events all leave as [`OutboundAction`]s.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::Config;
use crate::ingest::{self, IngestOutcome, SubeventResult};
use crate::protocol::{Channel, ConnId, Pdu};
use crate::requester::{GetError, Requester};
use crate::responder::{Responder, ResponderState};
use crate::segment::RecordBuffer;
use crate::store::{RecordStore, StoreEvent};

/// Something the application should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RasEvent {
    /// A local record was finalized.
    RecordReady { conn: ConnId, ranging_counter: u16 },
    /// A local record was overwritten before the peer acknowledged it.
    RecordOverwritten { conn: ConnId, ranging_counter: u16 },
    /// The peer announced a new record.
    PeerRecordReady { conn: ConnId, ranging_counter: u16 },
    /// The peer announced it overwrote a record.
    PeerRecordOverwritten { conn: ConnId, ranging_counter: u16 },
    /// A `get_record` finished.
    GetComplete {
        conn: ConnId,
        ranging_counter: u16,
        result: Result<RecordBuffer, GetError>,
    },
    FeaturesRead {
        conn: ConnId,
        result: Result<u32, GetError>,
    },
}

/// Work for the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundAction {
    /// Hand a PDU to the transport, then report the outcome through
    /// [`RasCore::on_sent`] or [`RasCore::on_send_failed`].
    Send { conn: ConnId, pdu: Pdu },
    /// Arm the ack deadline (`Config::ack_timeout`), replacing any armed one.
    StartAckTimer { conn: ConnId },
    CancelAckTimer { conn: ConnId },
    /// Call [`RasCore::on_retry`] after `Config::send_retry`.
    ScheduleRetry { conn: ConnId },
    Event(RasEvent),
}

/// Main coordinator. Host passes events; core returns actions.
pub struct RasCore {
    config: Config,
    store: RecordStore,
    responders: HashMap<ConnId, Responder>,
    requesters: HashMap<ConnId, Requester>,
}

impl RasCore {
    pub fn new(config: Config) -> Self {
        let store = RecordStore::new(
            config.pool_slots(),
            config.buffers_per_conn,
            config.max_procedure_len(),
        );
        Self {
            config,
            store,
            responders: HashMap::new(),
            requesters: HashMap::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn responder_state(&self, conn: ConnId) -> Option<ResponderState> {
        self.responders.get(&conn).map(Responder::state)
    }

    /// Serve the ranging service on `conn`.
    pub fn alloc_responder(&mut self, conn: ConnId, mtu: u16) -> Result<(), CoreError> {
        if self.responders.contains_key(&conn) {
            return Err(CoreError::AlreadyAllocated(conn));
        }
        if self.responders.len() >= self.config.max_connections {
            return Err(CoreError::TooManyConnections);
        }
        self.responders
            .insert(conn, Responder::new(conn, mtu, self.config.abort_supported));
        debug!(conn = %conn, mtu, "responder allocated");
        Ok(())
    }

    /// Use the peer's ranging service on `conn`.
    pub fn alloc_requester(&mut self, conn: ConnId) -> Result<(), CoreError> {
        if self.requesters.contains_key(&conn) {
            return Err(CoreError::AlreadyAllocated(conn));
        }
        if self.requesters.len() >= self.config.max_connections {
            return Err(CoreError::TooManyConnections);
        }
        self.requesters.insert(conn, Requester::new(conn));
        debug!(conn = %conn, "requester allocated");
        Ok(())
    }

    pub fn on_mtu_changed(&mut self, conn: ConnId, mtu: u16) {
        if let Some(r) = self.responders.get_mut(&conn) {
            r.set_mtu(mtu);
        }
    }

    /// Connection torn down: drop engines and every record of the connection.
    pub fn on_disconnected(&mut self, conn: ConnId) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        if let Some(mut r) = self.responders.remove(&conn) {
            r.close(&mut self.store);
            actions.push(OutboundAction::CancelAckTimer { conn });
        }
        if let Some(mut r) = self.requesters.remove(&conn) {
            r.on_disconnected(&mut actions);
        }
        self.store.free_connection(conn);
        actions
    }

    /// Feed one subevent of a ranging procedure measured on `conn`. A subevent
    /// that cannot be stored is logged and dropped along with its procedure.
    pub fn on_subevent_result(
        &mut self,
        conn: ConnId,
        result: &SubeventResult,
    ) -> Result<Vec<OutboundAction>, CoreError> {
        if !self.responders.contains_key(&conn) {
            return Err(CoreError::UnknownConnection(conn));
        }
        let mut actions = Vec::new();
        match ingest::ingest_subevent(&mut self.store, conn, result) {
            Ok(IngestOutcome::Finalized { ranging_counter }) => {
                debug!(conn = %conn, ranging_counter, "procedure complete");
            }
            Ok(IngestOutcome::Appended { .. }) => {}
            Err(e) => warn!(conn = %conn, error = %e, "subevent dropped"),
        }
        // Evictions caused before a failure still have to be announced.
        self.drain_store_events(&mut actions);
        Ok(actions)
    }

    /// A PDU arrived from the peer on `conn`.
    pub fn on_pdu_received(
        &mut self,
        conn: ConnId,
        pdu: Pdu,
    ) -> Result<Vec<OutboundAction>, CoreError> {
        let mut actions = Vec::new();
        match pdu {
            Pdu::Write { channel, payload } => {
                let r = self
                    .responders
                    .get_mut(&conn)
                    .ok_or(CoreError::UnknownConnection(conn))?;
                if channel == Channel::ControlPoint {
                    r.on_cp_write(&mut self.store, &payload, &mut actions);
                } else {
                    warn!(conn = %conn, ?channel, "write to read-only channel");
                }
            }
            Pdu::Subscribe { channel, enable } => {
                let r = self
                    .responders
                    .get_mut(&conn)
                    .ok_or(CoreError::UnknownConnection(conn))?;
                let accepted = match r.subscribe(channel, enable) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(conn = %conn, error = %e, "subscription refused");
                        false
                    }
                };
                actions.push(OutboundAction::Send {
                    conn,
                    pdu: Pdu::SubscribeResponse { channel, accepted },
                });
            }
            Pdu::ReadRequest { channel } => {
                let r = self
                    .responders
                    .get(&conn)
                    .ok_or(CoreError::UnknownConnection(conn))?;
                actions.push(OutboundAction::Send {
                    conn,
                    pdu: Pdu::ReadResponse {
                        channel,
                        value: r.read(channel, self.config.feature_bits()),
                    },
                });
            }
            Pdu::Notify { channel, payload } => {
                self.requester(conn)?
                    .on_notify(channel, &payload, &mut actions);
            }
            Pdu::ReadResponse { channel, value } => {
                self.requester(conn)?
                    .on_read_response(channel, &value, &mut actions);
            }
            Pdu::SubscribeResponse { channel, accepted } => {
                self.requester(conn)?
                    .on_subscribe_response(channel, accepted);
            }
        }
        Ok(actions)
    }

    fn requester(&mut self, conn: ConnId) -> Result<&mut Requester, CoreError> {
        self.requesters
            .get_mut(&conn)
            .ok_or(CoreError::UnknownConnection(conn))
    }

    /// The transport accepted `pdu`.
    pub fn on_sent(&mut self, conn: ConnId, pdu: &Pdu) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        if let Pdu::Notify {
            channel: Channel::OnDemandData,
            ..
        } = pdu
        {
            if let Some(r) = self.responders.get_mut(&conn) {
                r.on_segment_sent(&mut self.store, &mut actions);
            }
        }
        actions
    }

    /// The transport refused `pdu`. Segments are retried; a failed control
    /// point write ends the requester's exchange; anything else is dropped.
    pub fn on_send_failed(&mut self, conn: ConnId, pdu: &Pdu) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        match pdu {
            Pdu::Notify {
                channel: Channel::OnDemandData,
                ..
            } => {
                if let Some(r) = self.responders.get_mut(&conn) {
                    r.on_segment_send_failed(&mut actions);
                }
            }
            Pdu::Write {
                channel: Channel::ControlPoint,
                ..
            } => {
                if let Some(r) = self.requesters.get_mut(&conn) {
                    r.on_write_failed(&mut actions);
                }
            }
            other => warn!(conn = %conn, channel = ?other.channel(), "send failed, dropping"),
        }
        actions
    }

    pub fn on_retry(&mut self, conn: ConnId) -> Vec<OutboundAction> {
        let mut actions = Vec::new();
        if let Some(r) = self.responders.get_mut(&conn) {
            r.on_retry(&mut actions);
        }
        actions
    }

    pub fn on_ack_timeout(&mut self, conn: ConnId) {
        if let Some(r) = self.responders.get_mut(&conn) {
            r.on_ack_timeout(&mut self.store);
        }
    }

    /// Fetch `ranging_counter` from the peer on `conn`.
    pub fn get_record(
        &mut self,
        conn: ConnId,
        ranging_counter: u16,
        out: RecordBuffer,
    ) -> Result<Vec<OutboundAction>, GetError> {
        let mut actions = Vec::new();
        self.requesters
            .get_mut(&conn)
            .ok_or(GetError::NoContext)?
            .get_record(ranging_counter, out, &mut actions)?;
        Ok(actions)
    }

    pub fn read_features(&mut self, conn: ConnId) -> Result<Vec<OutboundAction>, GetError> {
        let mut actions = Vec::new();
        self.requesters
            .get_mut(&conn)
            .ok_or(GetError::NoContext)?
            .read_features(&mut actions)?;
        Ok(actions)
    }

    pub fn subscribe(
        &mut self,
        conn: ConnId,
        channel: Channel,
        enable: bool,
    ) -> Result<Vec<OutboundAction>, CoreError> {
        let mut actions = Vec::new();
        self.requester(conn)?.subscribe(channel, enable, &mut actions);
        Ok(actions)
    }

    pub fn ready_check(&self, conn: ConnId, ranging_counter: u16) -> bool {
        self.store.ready_check(conn, ranging_counter)
    }

    /// Copy a local record out of the store (claim, copy, release).
    pub fn read_record(&mut self, conn: ConnId, ranging_counter: u16) -> Option<Vec<u8>> {
        let handle = self.store.claim(conn, ranging_counter)?;
        let bytes = self.store.bytes(handle).map(<[u8]>::to_vec).ok();
        if let Err(e) = self.store.release(handle) {
            warn!(conn = %conn, error = %e, "release after read failed");
        }
        bytes
    }

    fn drain_store_events(&mut self, actions: &mut Vec<OutboundAction>) {
        for event in self.store.take_events() {
            match event {
                StoreEvent::Ready {
                    conn,
                    ranging_counter,
                } => {
                    if let Some(r) = self.responders.get_mut(&conn) {
                        r.on_record_ready(ranging_counter, actions);
                    }
                    actions.push(OutboundAction::Event(RasEvent::RecordReady {
                        conn,
                        ranging_counter,
                    }));
                }
                StoreEvent::Overwritten {
                    conn,
                    ranging_counter,
                } => {
                    if let Some(r) = self.responders.get_mut(&conn) {
                        r.on_record_overwritten(&mut self.store, ranging_counter, actions);
                    }
                    actions.push(OutboundAction::Event(RasEvent::RecordOverwritten {
                        conn,
                        ranging_counter,
                    }));
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("connection limit reached")]
    TooManyConnections,
    #[error("no ranging service instance for connection {0}")]
    UnknownConnection(ConnId),
    #[error("connection {0} already has an instance")]
    AlreadyAllocated(ConnId),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::StepResult;
    use crate::protocol::{RascpCommand, RascpResponse, ResponseCode};
    use crate::ranging::{DONE_STATUS_COMPLETE, RANGING_HEADER_LEN};
    use crate::wire;

    const C: ConnId = ConnId(1);

    fn procedure(counter: u16, steps: usize) -> SubeventResult {
        SubeventResult {
            procedure_counter: counter,
            antenna_paths_mask: 1,
            procedure_done_status: DONE_STATUS_COMPLETE,
            steps: (0..steps)
                .map(|i| StepResult {
                    mode: 2,
                    channel: i as u8,
                    data: vec![i as u8; 9],
                })
                .collect(),
            ..Default::default()
        }
    }

    fn config(buffers: usize, slots: usize) -> Config {
        Config {
            max_connections: 2,
            buffers_per_conn: buffers,
            pool_size: slots,
            ..Config::default()
        }
    }

    fn responder_core(cfg: Config) -> RasCore {
        let mut core = RasCore::new(cfg);
        core.alloc_responder(C, 23).unwrap();
        for ch in [
            Channel::ControlPoint,
            Channel::OnDemandData,
            Channel::RecordReady,
            Channel::RecordOverwritten,
        ] {
            core.on_pdu_received(
                C,
                Pdu::Subscribe {
                    channel: ch,
                    enable: true,
                },
            )
            .unwrap();
        }
        core
    }

    fn write(core: &mut RasCore, cmd: RascpCommand) -> Vec<OutboundAction> {
        core.on_pdu_received(
            C,
            Pdu::Write {
                channel: Channel::ControlPoint,
                payload: wire::encode_command(&cmd),
            },
        )
        .unwrap()
    }

    /// Confirm every send as delivered, collecting the PDUs. Returns the
    /// remaining actions.
    fn pump(core: &mut RasCore, actions: Vec<OutboundAction>, sent: &mut Vec<Pdu>) -> Vec<OutboundAction> {
        let mut queue: std::collections::VecDeque<_> = actions.into();
        let mut rest = Vec::new();
        while let Some(a) = queue.pop_front() {
            match a {
                OutboundAction::Send { conn, pdu } => {
                    queue.extend(core.on_sent(conn, &pdu));
                    sent.push(pdu);
                }
                other => rest.push(other),
            }
        }
        rest
    }

    #[test]
    fn connection_limits() {
        let mut core = RasCore::new(config(1, 0));
        core.alloc_responder(ConnId(1), 23).unwrap();
        assert_eq!(
            core.alloc_responder(ConnId(1), 23),
            Err(CoreError::AlreadyAllocated(ConnId(1)))
        );
        core.alloc_responder(ConnId(2), 23).unwrap();
        assert_eq!(
            core.alloc_responder(ConnId(3), 23),
            Err(CoreError::TooManyConnections)
        );
        core.alloc_requester(ConnId(3)).unwrap();
        assert_eq!(
            core.on_subevent_result(ConnId(9), &procedure(1, 1)),
            Err(CoreError::UnknownConnection(ConnId(9)))
        );
        assert_eq!(
            core.get_record(ConnId(1), 1, RecordBuffer::with_limit(8)),
            Err(GetError::NoContext)
        );
    }

    #[test]
    fn ready_event_and_notification() {
        let mut core = responder_core(config(2, 0));
        let actions = core.on_subevent_result(C, &procedure(0x2003, 4)).unwrap();
        assert!(actions.contains(&OutboundAction::Event(RasEvent::RecordReady {
            conn: C,
            ranging_counter: 3
        })));
        assert!(actions.contains(&OutboundAction::Send {
            conn: C,
            pdu: Pdu::Notify {
                channel: Channel::RecordReady,
                payload: vec![3, 0]
            }
        }));
        assert!(core.ready_check(C, 3));
        let bytes = core.read_record(C, 3).unwrap();
        assert_eq!(bytes.len(), RANGING_HEADER_LEN + 8 + 4 * 10);
        assert_eq!(core.store().state(C, 3).unwrap().refcount, 0);
    }

    #[test]
    fn features_read_reflects_config() {
        let mut core = RasCore::new(Config {
            abort_supported: true,
            ..Config::default()
        });
        core.alloc_responder(C, 23).unwrap();
        let actions = core
            .on_pdu_received(
                C,
                Pdu::ReadRequest {
                    channel: Channel::Features,
                },
            )
            .unwrap();
        assert_eq!(
            actions,
            vec![OutboundAction::Send {
                conn: C,
                pdu: Pdu::ReadResponse {
                    channel: Channel::Features,
                    value: vec![4, 0, 0, 0]
                }
            }]
        );
    }

    #[test]
    fn conflicting_subscription_is_refused() {
        let mut core = responder_core(config(1, 0));
        let actions = core
            .on_pdu_received(
                C,
                Pdu::Subscribe {
                    channel: Channel::RealtimeData,
                    enable: true,
                },
            )
            .unwrap();
        assert_eq!(
            actions,
            vec![OutboundAction::Send {
                conn: C,
                pdu: Pdu::SubscribeResponse {
                    channel: Channel::RealtimeData,
                    accepted: false
                }
            }]
        );
    }

    #[test]
    fn new_record_revokes_the_one_in_transfer() {
        let mut core = responder_core(config(1, 2));
        core.on_subevent_result(C, &procedure(1, 30)).unwrap();
        let actions = write(&mut core, RascpCommand::GetRecord { ranging_counter: 1 });
        // Stop after the first segment: do not confirm it.
        assert_eq!(actions.len(), 2);
        assert_eq!(
            core.responder_state(C),
            Some(ResponderState::Streaming { ranging_counter: 1 })
        );

        let actions = core.on_subevent_result(C, &procedure(2, 1)).unwrap();
        let overwritten_notify = OutboundAction::Send {
            conn: C,
            pdu: Pdu::Notify {
                channel: Channel::RecordOverwritten,
                payload: vec![1, 0],
            },
        };
        let abort_rsp = OutboundAction::Send {
            conn: C,
            pdu: Pdu::Notify {
                channel: Channel::ControlPoint,
                payload: wire::encode_response(&RascpResponse::ResponseCode(
                    ResponseCode::ProcedureNotCompleted,
                )),
            },
        };
        let pos_notify = actions.iter().position(|a| *a == overwritten_notify).unwrap();
        let pos_rsp = actions.iter().position(|a| *a == abort_rsp).unwrap();
        assert!(pos_notify < pos_rsp);
        assert!(actions.contains(&OutboundAction::Event(RasEvent::RecordOverwritten {
            conn: C,
            ranging_counter: 1
        })));
        assert_eq!(core.responder_state(C), Some(ResponderState::Idle));
        assert!(core.ready_check(C, 2));
        assert!(!core.ready_check(C, 1));
    }

    #[test]
    fn full_transfer_through_core() {
        let mut core = responder_core(config(1, 0));
        core.on_subevent_result(C, &procedure(5, 20)).unwrap();
        let expected = core.read_record(C, 5).unwrap();

        let mut sent = Vec::new();
        let actions = write(&mut core, RascpCommand::GetRecord { ranging_counter: 5 });
        let rest = pump(&mut core, actions, &mut sent);
        assert_eq!(rest, vec![OutboundAction::StartAckTimer { conn: C }]);

        let mut rx = crate::segment::Reassembly::new();
        let mut buf = RecordBuffer::with_limit(expected.len());
        for pdu in &sent {
            if let Pdu::Notify {
                channel: Channel::OnDemandData,
                payload,
            } = pdu
            {
                rx.on_segment(payload, &mut buf);
            }
        }
        assert_eq!(buf.as_slice(), &expected[..]);

        let actions = write(&mut core, RascpCommand::AckRecord { ranging_counter: 5 });
        let rest = pump(&mut core, actions, &mut sent);
        assert_eq!(rest, vec![OutboundAction::CancelAckTimer { conn: C }]);
        assert!(core.store().state(C, 5).unwrap().acked);
    }

    #[test]
    fn segment_send_failure_schedules_retry() {
        let mut core = responder_core(config(1, 0));
        core.on_subevent_result(C, &procedure(5, 20)).unwrap();
        let actions = write(&mut core, RascpCommand::GetRecord { ranging_counter: 5 });
        let segment = actions
            .iter()
            .find_map(|a| match a {
                OutboundAction::Send { pdu, .. } if pdu.channel() == Channel::OnDemandData => {
                    Some(pdu.clone())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(
            core.on_send_failed(C, &segment),
            vec![OutboundAction::ScheduleRetry { conn: C }]
        );
        assert_eq!(
            core.on_retry(C),
            vec![OutboundAction::Send { conn: C, pdu: segment }]
        );
    }

    #[test]
    fn disconnect_frees_everything() {
        let mut core = responder_core(config(1, 0));
        core.alloc_requester(C).unwrap();
        core.on_subevent_result(C, &procedure(5, 2)).unwrap();
        write(&mut core, RascpCommand::GetRecord { ranging_counter: 5 });
        core.get_record(C, 1, RecordBuffer::with_limit(8)).unwrap();

        let actions = core.on_disconnected(C);
        assert!(actions.contains(&OutboundAction::CancelAckTimer { conn: C }));
        assert!(actions.contains(&OutboundAction::Event(RasEvent::GetComplete {
            conn: C,
            ranging_counter: 1,
            result: Err(GetError::NotConnected)
        })));
        assert!(!core.ready_check(C, 5));
        assert_eq!(core.responder_state(C), None);
        // Slot is reusable by a new connection.
        core.alloc_responder(ConnId(2), 23).unwrap();
        core.on_subevent_result(ConnId(2), &procedure(1, 1)).unwrap();
    }

    #[test]
    fn requester_and_responder_cores_talk() {
        let responder_conn = ConnId(1);
        let requester_conn = ConnId(2);
        let mut rsp_core = responder_core(config(2, 0));
        let mut req_core = RasCore::new(config(1, 0));
        req_core.alloc_requester(requester_conn).unwrap();

        rsp_core.on_subevent_result(responder_conn, &procedure(11, 40)).unwrap();
        let expected = rsp_core.read_record(responder_conn, 11).unwrap();

        let mut to_responder: std::collections::VecDeque<Pdu> = std::collections::VecDeque::new();
        let mut to_requester: std::collections::VecDeque<Pdu> = std::collections::VecDeque::new();
        let mut events = Vec::new();

        let route = |actions: Vec<OutboundAction>,
                     core: &mut RasCore,
                     conn: ConnId,
                     outbox: &mut std::collections::VecDeque<Pdu>,
                     events: &mut Vec<RasEvent>| {
            let mut queue: std::collections::VecDeque<_> = actions.into();
            while let Some(a) = queue.pop_front() {
                match a {
                    OutboundAction::Send { pdu, .. } => {
                        queue.extend(core.on_sent(conn, &pdu));
                        outbox.push_back(pdu);
                    }
                    OutboundAction::Event(e) => events.push(e),
                    _ => {}
                }
            }
        };

        let a = req_core
            .get_record(requester_conn, 11, RecordBuffer::with_limit(4096))
            .unwrap();
        route(a, &mut req_core, requester_conn, &mut to_responder, &mut events);

        for _ in 0..1000 {
            if to_responder.is_empty() && to_requester.is_empty() {
                break;
            }
            while let Some(pdu) = to_responder.pop_front() {
                let a = rsp_core.on_pdu_received(responder_conn, pdu).unwrap();
                route(a, &mut rsp_core, responder_conn, &mut to_requester, &mut events);
            }
            while let Some(pdu) = to_requester.pop_front() {
                let a = req_core.on_pdu_received(requester_conn, pdu).unwrap();
                route(a, &mut req_core, requester_conn, &mut to_responder, &mut events);
            }
        }

        let got = events.iter().find_map(|e| match e {
            RasEvent::GetComplete { result, .. } => Some(result.clone()),
            _ => None,
        });
        assert_eq!(got.unwrap().unwrap().as_slice(), &expected[..]);
        assert!(rsp_core.store().state(responder_conn, 11).unwrap().acked);
        assert_eq!(rsp_core.responder_state(responder_conn), Some(ResponderState::Idle));
    }
}
