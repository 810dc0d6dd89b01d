//! Procedure ingestion: turn channel sounding subevent results into records.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::protocol::ConnId;
use crate::ranging::{
    ranging_counter, RangingHeader, SubeventHeader, DONE_STATUS_ABORTED, DONE_STATUS_COMPLETE,
    STEP_MODE_LEN, SUBEVENT_HEADER_LEN,
};
use crate::store::{RecordStore, StoreError};

/// One step reported by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    /// Bit 7 set when the step was aborted.
    pub mode: u8,
    pub channel: u8,
    pub data: Vec<u8>,
}

/// One subevent of a ranging procedure, as delivered by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubeventResult {
    pub procedure_counter: u16,
    pub config_id: u8,
    pub selected_tx_power: i8,
    pub antenna_paths_mask: u8,
    pub start_acl_conn_event: u16,
    pub freq_compensation: u16,
    pub procedure_done_status: u8,
    pub subevent_done_status: u8,
    pub procedure_abort_reason: u8,
    pub subevent_abort_reason: u8,
    pub reference_power_level: i8,
    pub steps: Vec<StepResult>,
}

impl SubeventResult {
    fn subevent_header(&self) -> SubeventHeader {
        SubeventHeader {
            start_acl_conn_event: self.start_acl_conn_event,
            freq_compensation: self.freq_compensation,
            ranging_done_status: self.procedure_done_status,
            subevent_done_status: self.subevent_done_status,
            ranging_abort_reason: self.procedure_abort_reason,
            subevent_abort_reason: self.subevent_abort_reason,
            ref_power_level: self.reference_power_level,
            num_steps_reported: self.steps.len().min(u8::MAX as usize) as u8,
        }
    }

    fn procedure_finished(&self) -> bool {
        matches!(
            self.procedure_done_status,
            DONE_STATUS_COMPLETE | DONE_STATUS_ABORTED
        )
    }

    fn encoded_len(&self) -> usize {
        SUBEVENT_HEADER_LEN
            + self
                .steps
                .iter()
                .take(u8::MAX as usize)
                .map(|s| STEP_MODE_LEN + s.data.len())
                .sum::<usize>()
    }
}

/// What happened to a subevent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Appended; the procedure continues.
    Appended { ranging_counter: u16 },
    /// Appended and the record was finalized.
    Finalized { ranging_counter: u16 },
}

/// Append one subevent to the record for its procedure, starting the record on
/// the first subevent and finalizing it when the procedure is done.
///
/// A record still being filled for an older procedure on the same connection is
/// discarded. When the subevent does not fit, the whole record is discarded.
pub fn ingest_subevent(
    store: &mut RecordStore,
    conn: ConnId,
    result: &SubeventResult,
) -> Result<IngestOutcome, IngestError> {
    let counter = ranging_counter(result.procedure_counter);

    let handle = match store.busy_record(conn) {
        Some((h, c)) if c == counter => h,
        stale => {
            if let Some((h, old)) = stale {
                warn!(conn = %conn, old, new = counter, "discarding unfinished procedure");
                store.abort(h)?;
            }
            let h = store.begin(conn, counter).ok_or_else(|| {
                error!(conn = %conn, ranging_counter = counter, "no record slot for procedure");
                IngestError::NoSlot {
                    ranging_counter: counter,
                }
            })?;
            store.write_header(
                h,
                &RangingHeader {
                    ranging_counter: counter,
                    config_id: result.config_id,
                    selected_tx_power: result.selected_tx_power,
                    antenna_paths_mask: result.antenna_paths_mask,
                },
            )?;
            h
        }
    };

    if result.steps.len() > u8::MAX as usize {
        warn!(steps = result.steps.len(), "subevent step count truncated");
    }
    if store.remaining(handle)? < result.encoded_len() {
        error!(conn = %conn, ranging_counter = counter, "procedure does not fit in record");
        store.abort(handle)?;
        return Err(IngestError::Store(StoreError::OutOfSpace {
            needed: result.encoded_len(),
            max: store.max_record_len(),
        }));
    }

    let mut bytes = Vec::with_capacity(result.encoded_len());
    bytes.extend_from_slice(&result.subevent_header().to_bytes());
    for step in result.steps.iter().take(u8::MAX as usize) {
        bytes.push(step.mode);
        bytes.extend_from_slice(&step.data);
    }
    store.append(handle, &bytes)?;

    if result.procedure_finished() {
        store.finalize(handle)?;
        debug!(conn = %conn, ranging_counter = counter, "procedure stored");
        Ok(IngestOutcome::Finalized {
            ranging_counter: counter,
        })
    } else {
        Ok(IngestOutcome::Appended {
            ranging_counter: counter,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IngestError {
    #[error("no record slot for ranging counter {ranging_counter}")]
    NoSlot { ranging_counter: u16 },
    #[error(transparent)]
    Store(#[from] StoreError),
}
