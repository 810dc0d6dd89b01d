//! Ranging record store: fixed pool of record slots shared by all connections.
//!
//! Slots are addressed by `RecordHandle` (index + generation). Every time a slot
//! is freed or reused its generation is bumped, so a handle kept past eviction is
//! rejected instead of reading someone else's record.
//!
//! A slot is reused only when it is `ready`, not `busy` and has no claims. When a
//! connection's quota is full, the oldest such slot (by ranging counter distance
//! from the new one, modulo 2^16) is overwritten. If every ready slot of the
//! connection is claimed, the oldest claimed one is revoked instead: it is
//! announced as overwritten, can no longer be claimed, and its memory goes back to
//! the pool when its last claim is released.

use tracing::{debug, warn};

use crate::protocol::ConnId;
use crate::ranging::{RangingHeader, RANGING_HEADER_LEN};

/// Stable reference to a record slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordHandle {
    index: u32,
    generation: u32,
}

/// Notification produced by store transitions; drained with [`RecordStore::take_events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// A record was finalized and can be claimed.
    Ready { conn: ConnId, ranging_counter: u16 },
    /// A record that the peer never acknowledged was evicted or revoked.
    Overwritten { conn: ConnId, ranging_counter: u16 },
}

/// Snapshot of one record's flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordState {
    pub handle: RecordHandle,
    pub busy: bool,
    pub ready: bool,
    pub acked: bool,
    pub refcount: u32,
}

struct Record {
    conn: ConnId,
    ranging_counter: u16,
    /// Ranging header followed by subevent data.
    data: Vec<u8>,
    busy: bool,
    ready: bool,
    acked: bool,
    revoked: bool,
    refcount: u32,
}

impl Record {
    fn evictable(&self) -> bool {
        self.ready && !self.busy && self.refcount == 0 && !self.revoked
    }
}

#[derive(Default)]
struct Slot {
    generation: u32,
    record: Option<Record>,
}

/// The record pool.
pub struct RecordStore {
    slots: Vec<Slot>,
    buffers_per_conn: usize,
    max_len: usize,
    events: Vec<StoreEvent>,
}

impl RecordStore {
    /// `slots` records in total, at most `buffers_per_conn` live per connection,
    /// each holding up to `max_len` bytes including the ranging header.
    pub fn new(slots: usize, buffers_per_conn: usize, max_len: usize) -> Self {
        Self {
            slots: (0..slots).map(|_| Slot::default()).collect(),
            buffers_per_conn: buffers_per_conn.max(1),
            max_len: max_len.max(RANGING_HEADER_LEN),
            events: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn max_record_len(&self) -> usize {
        self.max_len
    }

    /// Start a new record for `conn`. The record is `busy` and holds a zeroed
    /// ranging header carrying `ranging_counter`. Returns None when no slot can be
    /// freed for it.
    pub fn begin(&mut self, conn: ConnId, ranging_counter: u16) -> Option<RecordHandle> {
        let mut live = 0usize;
        let mut free = None;
        let mut oldest: Option<(usize, u16)> = None;
        let mut oldest_claimed: Option<(usize, u16)> = None;

        for (i, slot) in self.slots.iter().enumerate() {
            let Some(rec) = &slot.record else {
                if free.is_none() {
                    free = Some(i);
                }
                continue;
            };
            if rec.conn != conn || rec.revoked {
                continue;
            }
            live += 1;
            if !rec.ready || rec.busy {
                continue;
            }
            let age = ranging_counter.wrapping_sub(rec.ranging_counter);
            let target = if rec.evictable() {
                &mut oldest
            } else {
                &mut oldest_claimed
            };
            if target.map_or(true, |(_, a)| age > a) {
                *target = Some((i, age));
            }
        }

        let index = if let (true, Some(i)) = (live < self.buffers_per_conn, free) {
            i
        } else if let Some((i, _)) = oldest {
            self.evict(i);
            i
        } else if let (Some((victim, _)), Some(i)) = (oldest_claimed, free) {
            self.revoke(victim);
            i
        } else {
            warn!(conn = %conn, ranging_counter, live, "no record slot available");
            return None;
        };

        let slot = &mut self.slots[index];
        slot.generation = slot.generation.wrapping_add(1);
        let mut data = Vec::with_capacity(self.max_len);
        data.extend_from_slice(
            &RangingHeader {
                ranging_counter,
                ..RangingHeader::default()
            }
            .to_bytes(),
        );
        slot.record = Some(Record {
            conn,
            ranging_counter,
            data,
            busy: true,
            ready: false,
            acked: false,
            revoked: false,
            refcount: 0,
        });
        debug!(conn = %conn, ranging_counter, index, "record begun");
        Some(RecordHandle {
            index: index as u32,
            generation: slot.generation,
        })
    }

    fn evict(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        if let Some(rec) = slot.record.take() {
            debug!(conn = %rec.conn, ranging_counter = rec.ranging_counter, "record evicted");
            if !rec.acked {
                self.events.push(StoreEvent::Overwritten {
                    conn: rec.conn,
                    ranging_counter: rec.ranging_counter,
                });
            }
        }
        slot.generation = slot.generation.wrapping_add(1);
    }

    fn revoke(&mut self, index: usize) {
        if let Some(rec) = self.slots[index].record.as_mut() {
            debug!(
                conn = %rec.conn,
                ranging_counter = rec.ranging_counter,
                refcount = rec.refcount,
                "claimed record revoked"
            );
            rec.revoked = true;
            if !rec.acked {
                self.events.push(StoreEvent::Overwritten {
                    conn: rec.conn,
                    ranging_counter: rec.ranging_counter,
                });
            }
        }
    }

    fn free_slot(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        slot.record = None;
        slot.generation = slot.generation.wrapping_add(1);
    }

    fn get(&self, handle: RecordHandle) -> Result<&Record, StoreError> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.record.as_ref())
            .ok_or(StoreError::StaleHandle)
    }

    fn get_mut(&mut self, handle: RecordHandle) -> Result<&mut Record, StoreError> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.record.as_mut())
            .ok_or(StoreError::StaleHandle)
    }

    fn get_busy(&mut self, handle: RecordHandle) -> Result<&mut Record, StoreError> {
        let rec = self.get_mut(handle)?;
        if !rec.busy {
            return Err(StoreError::NotBusy);
        }
        Ok(rec)
    }

    /// Find the busy record being filled for `conn`, if any.
    pub fn busy_record(&self, conn: ConnId) -> Option<(RecordHandle, u16)> {
        self.slots.iter().enumerate().find_map(|(i, s)| {
            s.record
                .as_ref()
                .filter(|r| r.conn == conn && r.busy)
                .map(|r| {
                    (
                        RecordHandle {
                            index: i as u32,
                            generation: s.generation,
                        },
                        r.ranging_counter,
                    )
                })
        })
    }

    /// Replace the ranging header of a busy record.
    pub fn write_header(
        &mut self,
        handle: RecordHandle,
        header: &RangingHeader,
    ) -> Result<(), StoreError> {
        let rec = self.get_busy(handle)?;
        rec.data[..RANGING_HEADER_LEN].copy_from_slice(&header.to_bytes());
        Ok(())
    }

    /// Append subevent bytes to a busy record.
    pub fn append(&mut self, handle: RecordHandle, bytes: &[u8]) -> Result<(), StoreError> {
        let max = self.max_len;
        let rec = self.get_busy(handle)?;
        if rec.data.len() + bytes.len() > max {
            return Err(StoreError::OutOfSpace {
                needed: rec.data.len() + bytes.len(),
                max,
            });
        }
        rec.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Bytes still available in a busy record.
    pub fn remaining(&self, handle: RecordHandle) -> Result<usize, StoreError> {
        let rec = self.get(handle)?;
        Ok(self.max_len.saturating_sub(rec.data.len()))
    }

    /// busy -> ready. Emits [`StoreEvent::Ready`].
    pub fn finalize(&mut self, handle: RecordHandle) -> Result<(), StoreError> {
        let rec = self.get_busy(handle)?;
        rec.busy = false;
        rec.ready = true;
        let (conn, ranging_counter) = (rec.conn, rec.ranging_counter);
        debug!(conn = %conn, ranging_counter, "record ready");
        self.events.push(StoreEvent::Ready {
            conn,
            ranging_counter,
        });
        Ok(())
    }

    /// Discard a busy record and free its slot.
    pub fn abort(&mut self, handle: RecordHandle) -> Result<(), StoreError> {
        self.get_busy(handle)?;
        debug!(index = handle.index, "record aborted");
        self.free_slot(handle.index as usize);
        Ok(())
    }

    /// True when a complete record for `(conn, ranging_counter)` can be claimed.
    pub fn ready_check(&self, conn: ConnId, ranging_counter: u16) -> bool {
        self.find_ready(conn, ranging_counter).is_some()
    }

    fn find_ready(&self, conn: ConnId, ranging_counter: u16) -> Option<usize> {
        self.slots.iter().position(|s| {
            s.record.as_ref().map_or(false, |r| {
                r.conn == conn
                    && r.ranging_counter == ranging_counter
                    && r.ready
                    && !r.busy
                    && !r.revoked
            })
        })
    }

    /// Flags of the record `(conn, ranging_counter)`; revoked records are invisible.
    pub fn state(&self, conn: ConnId, ranging_counter: u16) -> Option<RecordState> {
        self.slots.iter().enumerate().find_map(|(i, s)| {
            let r = s.record.as_ref()?;
            if r.conn != conn || r.ranging_counter != ranging_counter || r.revoked {
                return None;
            }
            Some(RecordState {
                handle: RecordHandle {
                    index: i as u32,
                    generation: s.generation,
                },
                busy: r.busy,
                ready: r.ready,
                acked: r.acked,
                refcount: r.refcount,
            })
        })
    }

    /// Take a read reference on a ready record.
    pub fn claim(&mut self, conn: ConnId, ranging_counter: u16) -> Option<RecordHandle> {
        let index = self.find_ready(conn, ranging_counter)?;
        let slot = &mut self.slots[index];
        let rec = slot.record.as_mut()?;
        rec.refcount += 1;
        Some(RecordHandle {
            index: index as u32,
            generation: slot.generation,
        })
    }

    /// Drop a read reference. The record stays stored until it is overwritten; a
    /// revoked record is freed here once its last reference goes.
    pub fn release(&mut self, handle: RecordHandle) -> Result<(), StoreError> {
        let rec = self.get_mut(handle)?;
        if rec.refcount == 0 {
            return Err(StoreError::NotClaimed);
        }
        rec.refcount -= 1;
        if rec.refcount == 0 && rec.revoked {
            debug!(index = handle.index, "revoked record reclaimed");
            self.free_slot(handle.index as usize);
        }
        Ok(())
    }

    /// Peer confirmed receipt: no overwritten event will be emitted for this record.
    pub fn mark_acked(&mut self, handle: RecordHandle) -> Result<(), StoreError> {
        self.get_mut(handle)?.acked = true;
        Ok(())
    }

    /// Copy up to `max_len` bytes from `*cursor`, advancing it. The bool is true
    /// once the cursor reached the end of the record. Requires a claim.
    pub fn pull_bytes(
        &self,
        handle: RecordHandle,
        max_len: usize,
        cursor: &mut usize,
    ) -> Result<(&[u8], bool), StoreError> {
        let rec = self.get(handle)?;
        if rec.refcount == 0 {
            return Err(StoreError::NotClaimed);
        }
        let len = rec.data.len();
        if *cursor >= len {
            return Ok((&[], true));
        }
        let n = max_len.min(len - *cursor);
        let out = &rec.data[*cursor..*cursor + n];
        *cursor += n;
        Ok((out, *cursor >= len))
    }

    /// Full byte stream of a claimed record.
    pub fn bytes(&self, handle: RecordHandle) -> Result<&[u8], StoreError> {
        let rec = self.get(handle)?;
        if rec.refcount == 0 {
            return Err(StoreError::NotClaimed);
        }
        Ok(&rec.data)
    }

    /// Connection torn down: free its slots. Claimed slots are revoked and freed
    /// when released. No overwritten events are emitted.
    pub fn free_connection(&mut self, conn: ConnId) -> usize {
        let mut freed = 0;
        for i in 0..self.slots.len() {
            let Some(rec) = self.slots[i].record.as_mut() else {
                continue;
            };
            if rec.conn != conn {
                continue;
            }
            if rec.refcount == 0 {
                self.free_slot(i);
                freed += 1;
            } else {
                rec.revoked = true;
            }
        }
        debug!(conn = %conn, freed, "connection records freed");
        freed
    }

    /// Drain events produced since the last call.
    pub fn take_events(&mut self) -> Vec<StoreEvent> {
        std::mem::take(&mut self.events)
    }
}

/// Error from a store operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("record handle is stale")]
    StaleHandle,
    #[error("record is not being written")]
    NotBusy,
    #[error("record full: {needed} bytes needed, {max} available")]
    OutOfSpace { needed: usize, max: usize },
    #[error("record is not claimed")]
    NotClaimed,
}
