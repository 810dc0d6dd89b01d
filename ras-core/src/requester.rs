//! Requester transfer engine: fetch records from a peer's ranging service.

use tracing::{debug, info, warn};

use crate::core::{OutboundAction, RasEvent};
use crate::protocol::{Channel, ConnId, Pdu, RascpCommand, RascpResponse, ResponseCode};
use crate::segment::{Reassembly, ReassemblyError, RecordBuffer, SegmentReceiveResult};
use crate::wire;

/// Why a record fetch (or a feature read) did not produce data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum GetError {
    #[error("another request is in progress")]
    Busy,
    #[error("malformed segment")]
    InvalidFormat,
    #[error("segment received out of order")]
    OutOfOrder,
    #[error("output buffer too small")]
    OutOfMemory,
    #[error("transfer ended before the last segment")]
    Incomplete,
    #[error("record was overwritten during the transfer")]
    Overwritten,
    #[error("transfer aborted by the peer")]
    Aborted,
    #[error("request rejected: {0:?}")]
    Rejected(ResponseCode),
    #[error("connection closed")]
    NotConnected,
    #[error("control point write failed")]
    Transport,
    #[error("no requester for this connection")]
    NoContext,
}

impl From<ReassemblyError> for GetError {
    fn from(e: ReassemblyError) -> Self {
        match e {
            ReassemblyError::TooShort(_) | ReassemblyError::BadFirstCounter(_) => {
                GetError::InvalidFormat
            }
            ReassemblyError::OutOfOrder { .. } => GetError::OutOfOrder,
            ReassemblyError::OutOfMemory => GetError::OutOfMemory,
        }
    }
}

/// Outstanding control point command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CpState {
    None,
    GetWritten,
    AckWritten,
}

struct Fetch {
    ranging_counter: u16,
    out: RecordBuffer,
    reassembly: Reassembly,
    status: Option<GetError>,
}

pub struct Requester {
    conn: ConnId,
    cp: CpState,
    fetch: Option<Fetch>,
    features_pending: bool,
}

impl Requester {
    pub fn new(conn: ConnId) -> Self {
        Self {
            conn,
            cp: CpState::None,
            fetch: None,
            features_pending: false,
        }
    }

    pub fn in_progress(&self) -> Option<u16> {
        self.fetch.as_ref().map(|f| f.ranging_counter)
    }

    /// Start fetching `ranging_counter` into `out`. Completion is reported as
    /// [`RasEvent::GetComplete`].
    pub fn get_record(
        &mut self,
        ranging_counter: u16,
        out: RecordBuffer,
        actions: &mut Vec<OutboundAction>,
    ) -> Result<(), GetError> {
        if self.cp != CpState::None || self.fetch.is_some() {
            return Err(GetError::Busy);
        }
        self.fetch = Some(Fetch {
            ranging_counter,
            out,
            reassembly: Reassembly::new(),
            status: None,
        });
        self.cp = CpState::GetWritten;
        debug!(conn = %self.conn, ranging_counter, "requesting record");
        actions.push(self.cp_write(RascpCommand::GetRecord { ranging_counter }));
        Ok(())
    }

    pub fn read_features(&mut self, actions: &mut Vec<OutboundAction>) -> Result<(), GetError> {
        if self.features_pending {
            return Err(GetError::Busy);
        }
        self.features_pending = true;
        actions.push(OutboundAction::Send {
            conn: self.conn,
            pdu: Pdu::ReadRequest {
                channel: Channel::Features,
            },
        });
        Ok(())
    }

    pub fn subscribe(&self, channel: Channel, enable: bool, actions: &mut Vec<OutboundAction>) {
        actions.push(OutboundAction::Send {
            conn: self.conn,
            pdu: Pdu::Subscribe { channel, enable },
        });
    }

    fn cp_write(&self, cmd: RascpCommand) -> OutboundAction {
        OutboundAction::Send {
            conn: self.conn,
            pdu: Pdu::Write {
                channel: Channel::ControlPoint,
                payload: wire::encode_command(&cmd),
            },
        }
    }

    fn finish(&mut self, actions: &mut Vec<OutboundAction>) {
        let Some(fetch) = self.fetch.take() else {
            return;
        };
        let mut status = fetch.status;
        if status.is_none() && !fetch.reassembly.last_seen() {
            warn!(conn = %self.conn, "record completed with missing segments");
            status = Some(GetError::Incomplete);
        }
        let result = match status {
            None => {
                info!(conn = %self.conn, ranging_counter = fetch.ranging_counter, bytes = fetch.out.len(), "record received");
                Ok(fetch.out)
            }
            Some(e) => {
                warn!(conn = %self.conn, ranging_counter = fetch.ranging_counter, error = %e, "record fetch failed");
                Err(e)
            }
        };
        actions.push(OutboundAction::Event(RasEvent::GetComplete {
            conn: self.conn,
            ranging_counter: fetch.ranging_counter,
            result,
        }));
    }

    fn fail(&mut self, error: GetError, actions: &mut Vec<OutboundAction>) {
        if let Some(f) = self.fetch.as_mut() {
            f.status = Some(error);
        }
        self.finish(actions);
    }

    /// Notification or indication from the peer.
    pub fn on_notify(&mut self, channel: Channel, payload: &[u8], actions: &mut Vec<OutboundAction>) {
        match channel {
            Channel::OnDemandData => self.on_segment(payload),
            Channel::ControlPoint => self.on_cp_indication(payload, actions),
            Channel::RecordReady => match wire::decode_counter(payload) {
                Ok(ranging_counter) => actions.push(OutboundAction::Event(RasEvent::PeerRecordReady {
                    conn: self.conn,
                    ranging_counter,
                })),
                Err(e) => warn!(conn = %self.conn, error = %e, "bad ranging data ready value"),
            },
            Channel::RecordOverwritten => match wire::decode_counter(payload) {
                Ok(ranging_counter) => self.on_overwritten(ranging_counter, actions),
                Err(e) => warn!(conn = %self.conn, error = %e, "bad ranging data overwritten value"),
            },
            Channel::RealtimeData | Channel::Features => {
                warn!(conn = %self.conn, ?channel, "unexpected notification");
            }
        }
    }

    fn on_segment(&mut self, payload: &[u8]) {
        let Some(fetch) = self.fetch.as_mut() else {
            warn!(conn = %self.conn, "segment received without a transfer in progress");
            return;
        };
        if fetch.status.is_some() {
            return;
        }
        if let SegmentReceiveResult::Failed(e) = fetch.reassembly.on_segment(payload, &mut fetch.out) {
            fetch.status = Some(e.into());
        }
    }

    fn on_overwritten(&mut self, ranging_counter: u16, actions: &mut Vec<OutboundAction>) {
        let current = self
            .fetch
            .as_ref()
            .filter(|f| f.ranging_counter == ranging_counter)
            .map(|f| f.status.is_none());
        match current {
            Some(clean) => {
                if self.cp != CpState::None {
                    debug!(conn = %self.conn, ranging_counter, "overwritten while a command is pending, waiting for response");
                } else if clean {
                    debug!(conn = %self.conn, ranging_counter, "record overwritten while receiving");
                    self.fail(GetError::Overwritten, actions);
                }
            }
            None => actions.push(OutboundAction::Event(RasEvent::PeerRecordOverwritten {
                conn: self.conn,
                ranging_counter,
            })),
        }
    }

    fn on_cp_indication(&mut self, payload: &[u8], actions: &mut Vec<OutboundAction>) {
        let rsp = match wire::decode_response(payload) {
            Ok(rsp) => rsp,
            Err(e) => {
                warn!(conn = %self.conn, error = %e, "malformed RAS-CP response");
                return;
            }
        };
        match rsp {
            RascpResponse::CompleteRecord { ranging_counter } => {
                if self.in_progress() != Some(ranging_counter) {
                    warn!(conn = %self.conn, ranging_counter, "complete record for unexpected counter");
                    return;
                }
                self.cp = CpState::AckWritten;
                debug!(conn = %self.conn, ranging_counter, "acknowledging record");
                actions.push(self.cp_write(RascpCommand::AckRecord { ranging_counter }));
            }
            RascpResponse::CompleteLostSegments { .. } => {
                warn!(conn = %self.conn, "unexpected complete lost segments response");
            }
            RascpResponse::ResponseCode(code) => self.on_response_code(code, actions),
        }
    }

    fn on_response_code(&mut self, code: ResponseCode, actions: &mut Vec<OutboundAction>) {
        match self.cp {
            CpState::None => {
                if self.fetch.is_some() && code == ResponseCode::ProcedureNotCompleted {
                    debug!(conn = %self.conn, "transfer aborted by peer");
                    self.fail(GetError::Aborted, actions);
                } else {
                    warn!(conn = %self.conn, ?code, "unexpected response code");
                }
            }
            CpState::GetWritten => {
                self.cp = CpState::None;
                if code != ResponseCode::Success {
                    self.fail(GetError::Rejected(code), actions);
                }
            }
            CpState::AckWritten => {
                self.cp = CpState::None;
                if code != ResponseCode::Success {
                    warn!(conn = %self.conn, ?code, "ack rejected, ignoring");
                }
                self.finish(actions);
            }
        }
    }

    pub fn on_read_response(&mut self, channel: Channel, value: &[u8], actions: &mut Vec<OutboundAction>) {
        if channel != Channel::Features || !self.features_pending {
            warn!(conn = %self.conn, ?channel, "unexpected read response");
            return;
        }
        self.features_pending = false;
        let result = wire::decode_features(value).map_err(|e| {
            warn!(conn = %self.conn, error = %e, "bad features value");
            GetError::InvalidFormat
        });
        actions.push(OutboundAction::Event(RasEvent::FeaturesRead {
            conn: self.conn,
            result,
        }));
    }

    pub fn on_subscribe_response(&self, channel: Channel, accepted: bool) {
        if accepted {
            debug!(conn = %self.conn, ?channel, "subscribed");
        } else {
            warn!(conn = %self.conn, ?channel, "subscription rejected");
        }
    }

    /// A control point write never left. A failed GetRecord ends the fetch; a
    /// failed AckRecord ends it with whatever was received.
    pub fn on_write_failed(&mut self, actions: &mut Vec<OutboundAction>) {
        match std::mem::replace(&mut self.cp, CpState::None) {
            CpState::GetWritten => self.fail(GetError::Transport, actions),
            CpState::AckWritten => {
                warn!(conn = %self.conn, "ack write failed, peer will time out");
                self.finish(actions);
            }
            CpState::None => {}
        }
    }

    pub fn on_disconnected(&mut self, actions: &mut Vec<OutboundAction>) {
        self.cp = CpState::None;
        self.fail(GetError::NotConnected, actions);
        if std::mem::take(&mut self.features_pending) {
            actions.push(OutboundAction::Event(RasEvent::FeaturesRead {
                conn: self.conn,
                result: Err(GetError::NotConnected),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentHeader;

    const C: ConnId = ConnId(9);

    fn seg(first: bool, last: bool, counter: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![SegmentHeader {
            first,
            last,
            counter,
        }
        .to_byte()];
        v.extend_from_slice(payload);
        v
    }

    fn rsp(code: ResponseCode) -> Vec<u8> {
        wire::encode_response(&RascpResponse::ResponseCode(code))
    }

    fn complete(counter: u16) -> Vec<u8> {
        wire::encode_response(&RascpResponse::CompleteRecord {
            ranging_counter: counter,
        })
    }

    fn written(actions: &[OutboundAction]) -> Vec<RascpCommand> {
        actions
            .iter()
            .filter_map(|a| match a {
                OutboundAction::Send {
                    pdu:
                        Pdu::Write {
                            channel: Channel::ControlPoint,
                            payload,
                        },
                    ..
                } => wire::decode_command(payload).ok(),
                _ => None,
            })
            .collect()
    }

    fn completion(actions: &[OutboundAction]) -> Option<Result<Vec<u8>, GetError>> {
        actions.iter().find_map(|a| match a {
            OutboundAction::Event(RasEvent::GetComplete { result, .. }) => {
                Some(result.clone().map(RecordBuffer::into_inner))
            }
            _ => None,
        })
    }

    fn started(counter: u16) -> (Requester, Vec<OutboundAction>) {
        let mut r = Requester::new(C);
        let mut actions = Vec::new();
        r.get_record(counter, RecordBuffer::with_limit(64), &mut actions)
            .unwrap();
        assert_eq!(
            written(&actions),
            vec![RascpCommand::GetRecord {
                ranging_counter: counter
            }]
        );
        r.on_notify(Channel::ControlPoint, &rsp(ResponseCode::Success), &mut actions);
        actions.clear();
        (r, actions)
    }

    #[test]
    fn happy_path() {
        let (mut r, mut a) = started(7);
        r.on_notify(Channel::OnDemandData, &seg(true, false, 0, &[1, 2]), &mut a);
        r.on_notify(Channel::OnDemandData, &seg(false, true, 1, &[3]), &mut a);
        assert!(a.is_empty());
        r.on_notify(Channel::ControlPoint, &complete(7), &mut a);
        assert_eq!(
            written(&a),
            vec![RascpCommand::AckRecord { ranging_counter: 7 }]
        );
        assert!(completion(&a).is_none());
        r.on_notify(Channel::ControlPoint, &rsp(ResponseCode::Success), &mut a);
        assert_eq!(completion(&a), Some(Ok(vec![1, 2, 3])));
        assert_eq!(r.in_progress(), None);
    }

    #[test]
    fn short_overwritten_value_is_ignored() {
        let (mut r, mut a) = started(7);
        r.on_notify(Channel::RecordOverwritten, &[5], &mut a);
        assert!(a.is_empty());
        assert_eq!(r.in_progress(), Some(7));

        r.on_notify(Channel::OnDemandData, &seg(true, true, 0, &[4, 5]), &mut a);
        r.on_notify(Channel::ControlPoint, &complete(7), &mut a);
        r.on_notify(Channel::ControlPoint, &rsp(ResponseCode::Success), &mut a);
        assert_eq!(completion(&a), Some(Ok(vec![4, 5])));
        assert!(!a.iter().any(|x| matches!(
            x,
            OutboundAction::Event(RasEvent::PeerRecordOverwritten { .. })
        )));
    }

    #[test]
    fn failed_ack_write_keeps_received_record() {
        let (mut r, mut a) = started(7);
        r.on_notify(Channel::OnDemandData, &seg(true, true, 0, &[1, 2]), &mut a);
        r.on_notify(Channel::ControlPoint, &complete(7), &mut a);
        assert_eq!(
            written(&a),
            vec![RascpCommand::AckRecord { ranging_counter: 7 }]
        );
        a.clear();

        r.on_write_failed(&mut a);
        assert_eq!(completion(&a), Some(Ok(vec![1, 2])));
        assert_eq!(r.in_progress(), None);
        r.get_record(8, RecordBuffer::with_limit(8), &mut a).unwrap();
        assert_eq!(r.in_progress(), Some(8));
    }

    #[test]
    fn busy_while_in_progress() {
        let (mut r, mut a) = started(7);
        assert_eq!(
            r.get_record(8, RecordBuffer::with_limit(8), &mut a),
            Err(GetError::Busy)
        );
    }

    #[test]
    fn rejected_get_completes_immediately() {
        let mut r = Requester::new(C);
        let mut a = Vec::new();
        r.get_record(3, RecordBuffer::with_limit(8), &mut a).unwrap();
        r.on_notify(Channel::ControlPoint, &rsp(ResponseCode::NoRecordsFound), &mut a);
        assert_eq!(
            completion(&a),
            Some(Err(GetError::Rejected(ResponseCode::NoRecordsFound)))
        );
        // Free for a new request.
        r.get_record(3, RecordBuffer::with_limit(8), &mut a).unwrap();
    }

    #[test]
    fn out_of_order_segment_fails_after_ack() {
        let (mut r, mut a) = started(7);
        r.on_notify(Channel::OnDemandData, &seg(false, false, 1, &[9]), &mut a);
        r.on_notify(Channel::OnDemandData, &seg(true, false, 0, &[1]), &mut a);
        r.on_notify(Channel::ControlPoint, &complete(7), &mut a);
        // Still acknowledged so the peer releases the record.
        assert_eq!(written(&a).len(), 1);
        r.on_notify(Channel::ControlPoint, &rsp(ResponseCode::Success), &mut a);
        assert_eq!(completion(&a), Some(Err(GetError::OutOfOrder)));
    }

    #[test]
    fn invalid_segments() {
        let (mut r, mut a) = started(1);
        r.on_notify(Channel::OnDemandData, &[0x01], &mut a);
        r.on_notify(Channel::ControlPoint, &complete(1), &mut a);
        r.on_notify(Channel::ControlPoint, &rsp(ResponseCode::Success), &mut a);
        assert_eq!(completion(&a), Some(Err(GetError::InvalidFormat)));

        let (mut r, mut a) = started(1);
        r.on_notify(Channel::OnDemandData, &seg(true, false, 5, &[1]), &mut a);
        r.on_notify(Channel::ControlPoint, &complete(1), &mut a);
        r.on_notify(Channel::ControlPoint, &rsp(ResponseCode::Success), &mut a);
        assert_eq!(completion(&a), Some(Err(GetError::InvalidFormat)));
    }

    #[test]
    fn buffer_overflow() {
        let mut r = Requester::new(C);
        let mut a = Vec::new();
        r.get_record(2, RecordBuffer::with_limit(2), &mut a).unwrap();
        r.on_notify(Channel::ControlPoint, &rsp(ResponseCode::Success), &mut a);
        r.on_notify(Channel::OnDemandData, &seg(true, true, 0, &[1, 2, 3]), &mut a);
        r.on_notify(Channel::ControlPoint, &complete(2), &mut a);
        r.on_notify(Channel::ControlPoint, &rsp(ResponseCode::Success), &mut a);
        assert_eq!(completion(&a), Some(Err(GetError::OutOfMemory)));
    }

    #[test]
    fn missing_last_segment_is_incomplete() {
        let (mut r, mut a) = started(4);
        r.on_notify(Channel::OnDemandData, &seg(true, false, 0, &[1]), &mut a);
        r.on_notify(Channel::ControlPoint, &complete(4), &mut a);
        r.on_notify(Channel::ControlPoint, &rsp(ResponseCode::Success), &mut a);
        assert_eq!(completion(&a), Some(Err(GetError::Incomplete)));
    }

    #[test]
    fn overwritten_mid_transfer_completes_immediately() {
        let (mut r, mut a) = started(7);
        r.on_notify(Channel::OnDemandData, &seg(true, false, 0, &[1]), &mut a);
        r.on_notify(Channel::RecordOverwritten, &wire::encode_counter(7), &mut a);
        assert_eq!(completion(&a), Some(Err(GetError::Overwritten)));
        a.clear();
        // The peer's follow-up response code is stray now.
        r.on_notify(Channel::ControlPoint, &rsp(ResponseCode::ProcedureNotCompleted), &mut a);
        assert!(a.is_empty());
    }

    #[test]
    fn overwritten_other_counter_is_forwarded() {
        let (mut r, mut a) = started(7);
        r.on_notify(Channel::RecordOverwritten, &wire::encode_counter(6), &mut a);
        assert_eq!(
            a,
            vec![OutboundAction::Event(RasEvent::PeerRecordOverwritten {
                conn: C,
                ranging_counter: 6
            })]
        );
        assert_eq!(r.in_progress(), Some(7));
    }

    #[test]
    fn overwritten_while_cp_pending_waits() {
        let mut r = Requester::new(C);
        let mut a = Vec::new();
        r.get_record(7, RecordBuffer::with_limit(8), &mut a).unwrap();
        r.on_notify(Channel::RecordOverwritten, &wire::encode_counter(7), &mut a);
        assert!(completion(&a).is_none());
        r.on_notify(Channel::ControlPoint, &rsp(ResponseCode::NoRecordsFound), &mut a);
        assert_eq!(
            completion(&a),
            Some(Err(GetError::Rejected(ResponseCode::NoRecordsFound)))
        );
    }

    #[test]
    fn procedure_not_completed_means_aborted() {
        let (mut r, mut a) = started(7);
        r.on_notify(Channel::ControlPoint, &rsp(ResponseCode::ProcedureNotCompleted), &mut a);
        assert_eq!(completion(&a), Some(Err(GetError::Aborted)));
    }

    #[test]
    fn disconnect_fails_transfer() {
        let (mut r, mut a) = started(7);
        r.read_features(&mut a).unwrap();
        a.clear();
        r.on_disconnected(&mut a);
        assert_eq!(completion(&a), Some(Err(GetError::NotConnected)));
        assert!(a.contains(&OutboundAction::Event(RasEvent::FeaturesRead {
            conn: C,
            result: Err(GetError::NotConnected)
        })));
    }

    #[test]
    fn get_write_failure_is_transport_error() {
        let mut r = Requester::new(C);
        let mut a = Vec::new();
        r.get_record(7, RecordBuffer::with_limit(8), &mut a).unwrap();
        r.on_write_failed(&mut a);
        assert_eq!(completion(&a), Some(Err(GetError::Transport)));
    }

    #[test]
    fn features_read_one_at_a_time() {
        let mut r = Requester::new(C);
        let mut a = Vec::new();
        r.read_features(&mut a).unwrap();
        assert_eq!(r.read_features(&mut a), Err(GetError::Busy));
        a.clear();
        r.on_read_response(Channel::Features, &[4, 0, 0, 0], &mut a);
        assert_eq!(
            a,
            vec![OutboundAction::Event(RasEvent::FeaturesRead {
                conn: C,
                result: Ok(4)
            })]
        );
        r.read_features(&mut a).unwrap();
        a.clear();
        r.on_read_response(Channel::Features, &[4, 0], &mut a);
        assert_eq!(
            a,
            vec![OutboundAction::Event(RasEvent::FeaturesRead {
                conn: C,
                result: Err(GetError::InvalidFormat)
            })]
        );
    }

    #[test]
    fn ready_notifications() {
        let mut r = Requester::new(C);
        let mut a = Vec::new();
        r.on_notify(Channel::RecordReady, &[5, 0], &mut a);
        r.on_notify(Channel::RecordReady, &[5], &mut a);
        assert_eq!(
            a,
            vec![OutboundAction::Event(RasEvent::PeerRecordReady {
                conn: C,
                ranging_counter: 5
            })]
        );
    }

    #[test]
    fn stray_segments_are_ignored() {
        let mut r = Requester::new(C);
        let mut a = Vec::new();
        r.on_notify(Channel::OnDemandData, &seg(true, true, 0, &[1]), &mut a);
        assert!(a.is_empty());
    }
}
