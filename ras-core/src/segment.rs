//! Segmentation: split a record stream into MTU-sized notifications and
//! reassemble them strictly in order on the other side.

use tracing::warn;

use crate::store::{RecordHandle, RecordStore, StoreError};

/// Smallest ATT MTU a connection can have.
pub const MIN_MTU: u16 = 23;
/// Opcode + handle of a notification.
pub const ATT_OVERHEAD: usize = 3;
pub const SEGMENT_HEADER_LEN: usize = 1;
/// Rolling segment counter is 6 bits.
pub const SEGMENT_COUNTER_MOD: u8 = 64;

/// Payload bytes per segment for a connection MTU.
pub fn payload_len(mtu: u16) -> usize {
    mtu.max(MIN_MTU) as usize - ATT_OVERHEAD - SEGMENT_HEADER_LEN
}

/// First byte of every segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub first: bool,
    pub last: bool,
    /// 0..=63.
    pub counter: u8,
}

impl SegmentHeader {
    pub fn to_byte(self) -> u8 {
        (self.first as u8) | ((self.last as u8) << 1) | ((self.counter % SEGMENT_COUNTER_MOD) << 2)
    }

    pub fn from_byte(b: u8) -> Self {
        Self {
            first: b & 0x01 != 0,
            last: b & 0x02 != 0,
            counter: b >> 2,
        }
    }
}

/// Responder-side cursor over a claimed record.
#[derive(Debug, Clone, Default)]
pub struct SegmentWriter {
    cursor: usize,
    counter: u8,
    done: bool,
}

impl SegmentWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the next segment (header + payload). Returns the bytes and whether
    /// this is the last one. Calling again after the last segment yields None.
    pub fn next_segment(
        &mut self,
        store: &RecordStore,
        handle: RecordHandle,
        mtu: u16,
    ) -> Result<Option<(Vec<u8>, bool)>, StoreError> {
        if self.done {
            return Ok(None);
        }
        let first = self.cursor == 0;
        let (chunk, last) = store.pull_bytes(handle, payload_len(mtu), &mut self.cursor)?;
        let header = SegmentHeader {
            first,
            last,
            counter: self.counter,
        };
        let mut out = Vec::with_capacity(SEGMENT_HEADER_LEN + chunk.len());
        out.push(header.to_byte());
        out.extend_from_slice(chunk);
        self.counter = (self.counter + 1) % SEGMENT_COUNTER_MOD;
        self.done = last;
        Ok(Some((out, last)))
    }

    pub fn bytes_sent(&self) -> usize {
        self.cursor
    }
}

/// Caller-owned output of a record fetch, bounded by an explicit limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBuffer {
    data: Vec<u8>,
    limit: usize,
}

impl RecordBuffer {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
        }
    }

    pub fn remaining(&self) -> usize {
        self.limit - self.data.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn push(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining() {
            return false;
        }
        self.data.extend_from_slice(bytes);
        true
    }
}

/// Why a segment ended reassembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyError {
    #[error("segment of {0} bytes carries no payload")]
    TooShort(usize),
    #[error("first segment has counter {0}")]
    BadFirstCounter(u8),
    #[error("segment {got} received, expected {expected}")]
    OutOfOrder { expected: u8, got: u8 },
    #[error("output buffer full")]
    OutOfMemory,
}

/// Outcome of feeding one segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentReceiveResult {
    /// Payload appended; more expected.
    InProgress,
    /// Payload appended; it carried the last-segment flag.
    LastSegment,
    /// Nothing to do (already finished or already failed).
    Ignored,
    /// Transfer failed; later segments are ignored.
    Failed(ReassemblyError),
}

/// Requester-side in-order reassembly.
#[derive(Debug, Clone, Default)]
pub struct Reassembly {
    expected: u8,
    last_seen: bool,
    error: Option<ReassemblyError>,
}

impl Reassembly {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_seen(&self) -> bool {
        self.last_seen
    }

    pub fn error(&self) -> Option<ReassemblyError> {
        self.error
    }

    pub fn on_segment(&mut self, segment: &[u8], out: &mut RecordBuffer) -> SegmentReceiveResult {
        if self.last_seen {
            warn!("segment received after last segment");
            return SegmentReceiveResult::Ignored;
        }
        if self.error.is_some() {
            return SegmentReceiveResult::Ignored;
        }
        let result = self.accept(segment, out);
        match result {
            Ok(true) => {
                self.last_seen = true;
                SegmentReceiveResult::LastSegment
            }
            Ok(false) => SegmentReceiveResult::InProgress,
            Err(e) => {
                warn!(error = %e, "segment rejected");
                self.error = Some(e);
                SegmentReceiveResult::Failed(e)
            }
        }
    }

    fn accept(&mut self, segment: &[u8], out: &mut RecordBuffer) -> Result<bool, ReassemblyError> {
        if segment.len() <= SEGMENT_HEADER_LEN {
            return Err(ReassemblyError::TooShort(segment.len()));
        }
        let header = SegmentHeader::from_byte(segment[0]);
        if header.first && header.counter != 0 {
            return Err(ReassemblyError::BadFirstCounter(header.counter));
        }
        if header.counter != self.expected {
            return Err(ReassemblyError::OutOfOrder {
                expected: self.expected,
                got: header.counter,
            });
        }
        if !out.push(&segment[SEGMENT_HEADER_LEN..]) {
            return Err(ReassemblyError::OutOfMemory);
        }
        self.expected = (header.counter + 1) % SEGMENT_COUNTER_MOD;
        Ok(header.last)
    }
}
