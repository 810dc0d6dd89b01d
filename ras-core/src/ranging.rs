//! Ranging data body: ranging header, subevent headers, step entries.
//!
//! A record's byte stream is one 4-byte ranging header followed by, for each
//! subevent, an 8-byte subevent header and `num_steps_reported` steps. Each step
//! is a mode byte (bit 7 set when the step was aborted) plus mode-dependent data.
//! Step channel and step length are not carried; the requester recovers them from
//! its own local step data when parsing.

use tracing::{debug, warn};

pub const RANGING_HEADER_LEN: usize = 4;
pub const SUBEVENT_HEADER_LEN: usize = 8;
pub const STEP_MODE_LEN: usize = 1;

pub const MAX_SUBEVENTS_PER_PROCEDURE: usize = 32;
pub const MAX_STEPS_PER_PROCEDURE: usize = 256;

/// Length of one tone info entry (phase correction term + quality indicator).
const TONE_INFO_LEN: usize = 4;
const MODE_0_INITIATOR_LEN: usize = 5;
const MODE_0_REFLECTOR_LEN: usize = 3;
const MODE_1_LEN: usize = 6;
const MODE_2_FIXED_LEN: usize = 1;
const MODE_3_FIXED_LEN: usize = 7;

/// Bit 7 of a step mode byte: the step was aborted and carries no valid data.
pub const STEP_ABORTED: u8 = 0x80;

/// Procedure / subevent done status: all results complete.
pub const DONE_STATUS_COMPLETE: u8 = 0x0;
/// Partial results, more to follow.
pub const DONE_STATUS_PARTIAL: u8 = 0x1;
/// Aborted.
pub const DONE_STATUS_ABORTED: u8 = 0xF;

/// Ranging counter carried by a record: the lower 12 bits of the procedure counter.
pub fn ranging_counter(procedure_counter: u16) -> u16 {
    procedure_counter & 0x0FFF
}

/// Channel sounding role of the local device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsRole {
    Initiator,
    Reflector,
}

impl CsRole {
    pub fn opposite(self) -> Self {
        match self {
            CsRole::Initiator => CsRole::Reflector,
            CsRole::Reflector => CsRole::Initiator,
        }
    }
}

/// Step data length for `mode` when reported by `role` with `antenna_paths` paths.
/// Returns None for modes outside 0..=3.
pub fn step_data_len(mode: u8, role: CsRole, antenna_paths: u8) -> Option<usize> {
    let tones = (antenna_paths as usize + 1) * TONE_INFO_LEN;
    match mode & !STEP_ABORTED {
        0 => Some(match role {
            CsRole::Initiator => MODE_0_INITIATOR_LEN,
            CsRole::Reflector => MODE_0_REFLECTOR_LEN,
        }),
        1 => Some(MODE_1_LEN),
        2 => Some(MODE_2_FIXED_LEN + tones),
        3 => Some(MODE_3_FIXED_LEN + tones),
        _ => None,
    }
}

/// Largest step payload that has to fit in a record.
pub fn max_step_data_len(antenna_paths: u8, mode_3: bool) -> usize {
    let tones = (antenna_paths as usize + 1) * TONE_INFO_LEN;
    let mut len = MODE_0_INITIATOR_LEN
        .max(MODE_1_LEN)
        .max(MODE_2_FIXED_LEN + tones);
    if mode_3 {
        len = len.max(MODE_3_FIXED_LEN + tones);
    }
    len
}

/// Memory needed to store the largest possible procedure.
pub fn procedure_mem(antenna_paths: u8, mode_3: bool) -> usize {
    RANGING_HEADER_LEN
        + MAX_SUBEVENTS_PER_PROCEDURE * SUBEVENT_HEADER_LEN
        + MAX_STEPS_PER_PROCEDURE * STEP_MODE_LEN
        + MAX_STEPS_PER_PROCEDURE * max_step_data_len(antenna_paths, mode_3)
}

/// Largest record any peer configuration can produce: four antenna paths with mode 3.
pub fn max_record_len() -> usize {
    procedure_mem(4, true)
}

/// Ranging header: first four bytes of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RangingHeader {
    /// 12 bits.
    pub ranging_counter: u16,
    /// 4 bits, 0..=3 in practice.
    pub config_id: u8,
    /// dBm, -127..=20.
    pub selected_tx_power: i8,
    /// Bit n set when antenna path n+1 is reported.
    pub antenna_paths_mask: u8,
}

impl RangingHeader {
    pub fn to_bytes(&self) -> [u8; RANGING_HEADER_LEN] {
        let packed = (self.ranging_counter & 0x0FFF) | ((self.config_id as u16 & 0x0F) << 12);
        let p = packed.to_le_bytes();
        [
            p[0],
            p[1],
            self.selected_tx_power as u8,
            self.antenna_paths_mask,
        ]
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < RANGING_HEADER_LEN {
            return None;
        }
        let packed = u16::from_le_bytes([b[0], b[1]]);
        Some(Self {
            ranging_counter: packed & 0x0FFF,
            config_id: (packed >> 12) as u8,
            selected_tx_power: b[2] as i8,
            antenna_paths_mask: b[3],
        })
    }

    /// Number of antenna paths reported (bits 0..=3 of the mask).
    pub fn antenna_paths(&self) -> u8 {
        (self.antenna_paths_mask & 0x0F).count_ones() as u8
    }
}

/// Subevent header preceding each subevent's steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubeventHeader {
    pub start_acl_conn_event: u16,
    /// Units of 0.01 ppm, 15-bit signed.
    pub freq_compensation: u16,
    pub ranging_done_status: u8,
    pub subevent_done_status: u8,
    pub ranging_abort_reason: u8,
    pub subevent_abort_reason: u8,
    pub ref_power_level: i8,
    pub num_steps_reported: u8,
}

impl SubeventHeader {
    pub fn to_bytes(&self) -> [u8; SUBEVENT_HEADER_LEN] {
        let ev = self.start_acl_conn_event.to_le_bytes();
        let fc = self.freq_compensation.to_le_bytes();
        [
            ev[0],
            ev[1],
            fc[0],
            fc[1],
            (self.ranging_done_status & 0x0F) | ((self.subevent_done_status & 0x0F) << 4),
            (self.ranging_abort_reason & 0x0F) | ((self.subevent_abort_reason & 0x0F) << 4),
            self.ref_power_level as u8,
            self.num_steps_reported,
        ]
    }

    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.len() < SUBEVENT_HEADER_LEN {
            return None;
        }
        Some(Self {
            start_acl_conn_event: u16::from_le_bytes([b[0], b[1]]),
            freq_compensation: u16::from_le_bytes([b[2], b[3]]),
            ranging_done_status: b[4] & 0x0F,
            subevent_done_status: b[4] >> 4,
            ranging_abort_reason: b[5] & 0x0F,
            subevent_abort_reason: b[5] >> 4,
            ref_power_level: b[6] as i8,
            num_steps_reported: b[7],
        })
    }
}

/// One step as seen by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step<'a> {
    pub mode: u8,
    pub channel: u8,
    pub data: &'a [u8],
}

/// Receives parsed ranging data. Returning false from any method stops parsing.
pub trait RangingVisitor {
    fn ranging_header(&mut self, _header: &RangingHeader) -> bool {
        true
    }
    fn subevent_header(&mut self, _header: &SubeventHeader) -> bool {
        true
    }
    fn step(&mut self, local: &Step<'_>, peer: &Step<'_>) -> bool;
}

/// Why parsing stopped before both buffers were drained.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("no data to parse")]
    Empty,
    #[error("peer ranging data is malformed")]
    PeerMalformed,
    #[error("local step data is malformed")]
    LocalMalformed,
    #[error("step mode mismatch: local {local}, peer {peer}")]
    ModeMismatch { local: u8, peer: u8 },
    #[error("peer step aborted")]
    PeerStepAborted,
    #[error("stopped by visitor")]
    Stopped,
}

/// Walk a peer's ranging data body alongside the local controller's step data.
///
/// `local_steps` is the raw controller step stream: `mode, channel, data_len, data...`
/// per step. Peer mode-0 steps carry the opposite role's layout; every other mode
/// has the same length on both sides.
pub fn parse_ranging_data<V: RangingVisitor>(
    peer: &[u8],
    local_steps: &[u8],
    role: CsRole,
    visitor: &mut V,
) -> Result<(), ParseError> {
    if peer.is_empty() || local_steps.is_empty() {
        return Err(ParseError::Empty);
    }
    let header = RangingHeader::from_bytes(peer).ok_or(ParseError::PeerMalformed)?;
    if !visitor.ranging_header(&header) {
        return Err(ParseError::Stopped);
    }
    let mut peer = &peer[RANGING_HEADER_LEN..];
    let mut local = local_steps;

    while peer.len() >= SUBEVENT_HEADER_LEN {
        let sub = SubeventHeader::from_bytes(peer).ok_or(ParseError::PeerMalformed)?;
        peer = &peer[SUBEVENT_HEADER_LEN..];
        if !visitor.subevent_header(&sub) {
            return Err(ParseError::Stopped);
        }
        if sub.num_steps_reported == 0 {
            debug!("skipping subevent with no steps");
            continue;
        }
        if peer.is_empty() {
            warn!("empty peer step data where steps were expected");
            return Err(ParseError::PeerMalformed);
        }
        for _ in 0..sub.num_steps_reported {
            if local.len() < 3 {
                return Err(ParseError::LocalMalformed);
            }
            let (&peer_mode, peer_rest) = peer.split_first().ok_or(ParseError::PeerMalformed)?;
            let (local_mode, channel, local_len) = (local[0], local[1], local[2] as usize);
            local = &local[3..];

            if peer_mode != local_mode {
                warn!(local_mode, peer_mode, "step mode mismatch");
                return Err(ParseError::ModeMismatch {
                    local: local_mode,
                    peer: peer_mode,
                });
            }
            if local_len == 0 {
                warn!("zero-length local step data");
                return Err(ParseError::LocalMalformed);
            }
            if peer_mode & STEP_ABORTED != 0 {
                debug!("peer step aborted");
                return Err(ParseError::PeerStepAborted);
            }
            let peer_len = if peer_mode == 0 {
                step_data_len(0, role.opposite(), 0).unwrap_or(local_len)
            } else {
                local_len
            };
            if local_len > local.len() {
                return Err(ParseError::LocalMalformed);
            }
            if peer_len > peer_rest.len() {
                return Err(ParseError::PeerMalformed);
            }
            let local_step = Step {
                mode: local_mode,
                channel,
                data: &local[..local_len],
            };
            let peer_step = Step {
                mode: peer_mode,
                channel,
                data: &peer_rest[..peer_len],
            };
            if !visitor.step(&local_step, &peer_step) {
                return Err(ParseError::Stopped);
            }
            peer = &peer_rest[peer_len..];
            local = &local[local_len..];
        }
    }

    if !peer.is_empty() || !local.is_empty() {
        warn!(
            peer_left = peer.len(),
            local_left = local.len(),
            "buffers not fully drained after parsing"
        );
    }
    Ok(())
}
