//! Synthetic channel sounding procedures, standing in for the controller.

use rand::Rng;
use ras_core::ranging::{
    step_data_len, CsRole, DONE_STATUS_COMPLETE, DONE_STATUS_PARTIAL, STEP_ABORTED,
};
use ras_core::{StepResult, SubeventResult};

/// Produces one procedure at a time, as a sequence of subevent results.
pub struct ProcedureSynth {
    role: CsRole,
    antenna_paths: u8,
    subevents: u8,
    steps_per_subevent: u8,
    procedure_counter: u16,
}

impl ProcedureSynth {
    pub fn new(role: CsRole, antenna_paths: u8, subevents: u8, steps_per_subevent: u8) -> Self {
        Self {
            role,
            antenna_paths: antenna_paths.clamp(1, 4),
            subevents: subevents.max(1),
            steps_per_subevent,
            procedure_counter: 0,
        }
    }

    /// Next procedure. Only the last subevent reports the procedure complete.
    pub fn next_procedure<R: Rng>(&mut self, rng: &mut R) -> Vec<SubeventResult> {
        let counter = self.procedure_counter;
        self.procedure_counter = self.procedure_counter.wrapping_add(1);
        let mask = (1u8 << self.antenna_paths) - 1;
        let config_id = rng.gen_range(0..4);
        let tx_power = rng.gen_range(-20..=10);

        (0..self.subevents)
            .map(|i| {
                let last = i + 1 == self.subevents;
                let status = if last {
                    DONE_STATUS_COMPLETE
                } else {
                    DONE_STATUS_PARTIAL
                };
                SubeventResult {
                    procedure_counter: counter,
                    config_id,
                    selected_tx_power: tx_power,
                    antenna_paths_mask: mask,
                    start_acl_conn_event: counter.wrapping_mul(8).wrapping_add(i as u16),
                    freq_compensation: rng.gen(),
                    procedure_done_status: status,
                    subevent_done_status: DONE_STATUS_COMPLETE,
                    reference_power_level: rng.gen_range(-40..=0),
                    steps: self.steps(i == 0, rng),
                    ..Default::default()
                }
            })
            .collect()
    }

    /// Mode 0 opens the first subevent; the rest are mode 2 with the odd
    /// aborted step.
    fn steps<R: Rng>(&self, first_subevent: bool, rng: &mut R) -> Vec<StepResult> {
        (0..self.steps_per_subevent)
            .map(|n| {
                let mode = if first_subevent && n < 2 { 0 } else { 2 };
                let aborted = mode == 2 && rng.gen_ratio(1, 50);
                let len = if aborted {
                    0
                } else {
                    step_data_len(mode, self.role, self.antenna_paths).unwrap_or(0)
                };
                let mut data = vec![0u8; len];
                rng.fill(&mut data[..]);
                StepResult {
                    mode: if aborted { mode | STEP_ABORTED } else { mode },
                    channel: rng.gen_range(2..=78),
                    data,
                }
            })
            .collect()
    }
}
