// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Closed-loop per-GOP bit budgeting and per-frame QP decisions.
//!
//! Ported field-for-field and formula-for-formula from the reference
//! hardware's rate controller. The one deliberate departure: "no feedback
//! collected yet" is its own [`Option::None`] state rather than being folded
//! into a computed rate of zero, so the distinction is visible in the type
//! instead of living only in a comment.

use crate::params::EncoderSetup;

const RLC_UPSCALE: u32 = 256;

/// Estimation thresholds the hardware was characterized against, paired
/// with the QP each threshold bucket should start at. The final threshold
/// is an open upper bound so the lookup always terminates.
const QP_ESTIMATION_THRESHOLDS: [u32; 11] = [27, 44, 72, 119, 192, 314, 453, 653, 952, 1395, u32::MAX];
const QP_ESTIMATION_VALUES: [u32; 11] = [51, 47, 43, 39, 35, 31, 27, 23, 19, 15, 11];

/// Per-session, per-GOP and per-frame rate-control state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateController {
    bits_per_frame: u32,
    bits_per_gop: u32,

    bits_target: u32,
    bits_left: u32,
    gop_left: u32,

    /// `None` until the first [`RateController::feedback`] call; `Some(0)`
    /// is a genuine (if unusual) measured rate and is treated the same as
    /// the reference hardware treats it: too little signal to size
    /// checkpoints from.
    bits_per_rlc_upscaled: Option<u32>,

    cp_enabled: bool,
    cp_count: usize,
    cp_distance_mbs: u32,
    cp_target: [u32; 10],
    cp_target_error: [i32; 6],
    cp_qp_delta: [i32; 7],

    qp: u32,
    qp_sum: u32,
    qp_intra_privilege: bool,

    intra_request: bool,
}

impl RateController {
    /// Initialize rate-control state for a freshly configured session.
    /// Starts with an intra request pending, guaranteeing the first step
    /// is treated as a GOP start.
    pub fn setup(setup: &EncoderSetup) -> Self {
        let bits_per_frame = ((setup.bitrate * setup.fps_den as u64) / setup.fps_num as u64) as u32;
        let bits_per_gop = bits_per_frame.wrapping_mul(setup.gop_size);

        let cp_count = (setup.height_mbs.saturating_sub(1) as usize).min(10);
        let cp_distance_mbs = setup.macroblocks() / (cp_count as u32 + 1);

        let mut rc = Self {
            bits_per_frame,
            bits_per_gop,
            bits_target: 0,
            bits_left: 0,
            gop_left: 0,
            bits_per_rlc_upscaled: None,
            cp_enabled: false,
            cp_count,
            cp_distance_mbs,
            cp_target: [0; 10],
            cp_target_error: [0; 6],
            cp_qp_delta: [0; 7],
            qp: 0,
            qp_sum: 0,
            qp_intra_privilege: false,
            intra_request: true,
        };

        rc.qp = hantro_qp_initial_estimate(setup, bits_per_frame);
        rc
    }

    /// Request that the next frame start a new GOP (an IDR picture),
    /// regardless of where the orchestrator's own GOP counter sits.
    pub fn intra_request(&mut self) {
        self.intra_request = true;
    }

    /// Decide this frame's bit target and QP, and size its checkpoint
    /// ladder. `gop_index` is the orchestrator's own `gop_index`, already
    /// wrapped modulo `setup.gop_size`.
    pub fn step(&mut self, setup: &EncoderSetup, gop_index: u32) {
        let gop_start = gop_index == 0 || self.intra_request;

        if gop_start {
            self.gop_left = setup.gop_size;

            // Start from the previous GOP's average QP, unless this is an
            // intra request mid-GOP (keep the current QP) or there is no
            // prior average yet (keep the initial estimate).
            if self.qp_sum != 0 && !self.intra_request {
                self.qp = self.qp_sum / setup.gop_size;
            }
            self.qp_sum = 0;

            self.qp = self.qp.saturating_sub(setup.qp_intra_delta);
            self.qp_intra_privilege = true;

            // Keep the benefit (or debt) of the previous GOP's leftover bits.
            self.bits_left = self.bits_left.wrapping_add(self.bits_per_gop);
            self.bits_target = self.bits_per_frame;
        } else if self.bits_left == 0 {
            self.bits_target = 0;
        } else {
            self.bits_target = self.bits_left.checked_div(self.gop_left).unwrap_or(0);
            // Cap the target once it climbs past two thirds of the average.
            if self.bits_target > 2 * self.bits_per_frame / 3 {
                self.bits_target = self.bits_per_frame;
            }
        }

        self.gop_left = self.gop_left.saturating_sub(1);

        self.prepare_checkpoints(setup, gop_start);

        if self.intra_request {
            self.intra_request = false;
        }
    }

    /// Fold per-frame encode feedback (bytes produced, non-zero
    /// coefficients, summed macroblock QP) back into the running state and
    /// adjust `qp` for the next frame.
    pub fn feedback(&mut self, setup: &EncoderSetup, bytes_used: u32, rlc_count: u32, qp_sum: u32) {
        let bits_used = bytes_used * 8;
        let macroblocks = setup.macroblocks();
        let qp_average = qp_sum / macroblocks;

        self.qp_sum += qp_average;

        if rlc_count == 0 {
            tracing::warn!("rate control feedback reported zero RLC count; coefficient rate not updated");
        } else {
            self.bits_per_rlc_upscaled = Some(bits_used * RLC_UPSCALE / rlc_count);
        }

        if self.qp_intra_privilege {
            self.qp += setup.qp_intra_delta;
            self.qp_intra_privilege = false;
        }

        if self.bits_left == 0 || bits_used >= self.bits_left {
            self.bits_left = 0;
            self.qp += 2;
        } else if bits_used < (7 * self.bits_target / 8) && self.qp > 0 {
            self.qp -= 1;
        } else if bits_used > (9 * self.bits_target / 8) {
            self.qp += 1;
        }

        self.qp = self.qp.clamp(setup.qp_min, setup.qp_max);

        if self.bits_left != 0 {
            self.bits_left -= bits_used;
        }

        tracing::trace!(qp = self.qp, bits_used, bits_target = self.bits_target, "rate control feedback applied");
    }

    fn prepare_checkpoints(&mut self, setup: &EncoderSetup, gop_start: bool) {
        let Some(bits_per_rlc_upscaled) = self.bits_per_rlc_upscaled else {
            self.cp_enabled = false;
            return;
        };

        // No statistics, GOP start (intra frames go unconstrained), or an
        // under-budget final GOP frame: skip checkpoints.
        if bits_per_rlc_upscaled == 0
            || gop_start
            || (self.gop_left == 0 && self.bits_target < self.bits_per_frame)
        {
            self.cp_enabled = false;
            return;
        }

        let macroblocks = setup.macroblocks() as u64;
        let rlc_max = macroblocks * 24 * 16;

        let mut rlc_target = self.bits_target as u64 * RLC_UPSCALE as u64 / bits_per_rlc_upscaled as u64;
        if rlc_target > rlc_max {
            rlc_target = rlc_max;
        }

        let cp_distance_mbs = self.cp_distance_mbs as u64;

        // Widened to u64: (i+1) * rlc_target * cp_distance_mbs can exceed
        // u32 well before the final, divided-down result does (spec.md §9's
        // overflow note applies here just as it does to the QP estimator).
        for i in 0..self.cp_count {
            self.cp_target[i] =
                ((((i as u64 + 1) * rlc_target * cp_distance_mbs / macroblocks) + 31) / 32) as u32;
        }

        let error_base = (rlc_target * cp_distance_mbs / macroblocks / 4) as i32;

        self.cp_qp_delta = [-3, -2, -1, 0, 1, 2, 3];
        self.cp_target_error = [
            -error_base * 3 / 4,
            -error_base * 2 / 4,
            -error_base / 4,
            error_base / 4,
            error_base * 2 / 4,
            error_base * 3 / 4,
        ];

        self.cp_enabled = true;
    }

    pub fn qp(&self) -> u32 {
        self.qp
    }

    pub fn cp_enabled(&self) -> bool {
        self.cp_enabled
    }

    pub fn cp_count(&self) -> usize {
        self.cp_count
    }

    pub fn cp_distance_mbs(&self) -> u32 {
        self.cp_distance_mbs
    }

    pub fn cp_target(&self) -> &[u32] {
        &self.cp_target[..self.cp_count]
    }

    pub fn cp_target_error(&self) -> &[i32; 6] {
        &self.cp_target_error
    }

    pub fn cp_qp_delta(&self) -> &[i32; 7] {
        &self.cp_qp_delta
    }
}

/// Estimate a starting QP from the configured bitrate and picture size,
/// clamped to the configured QP range. All intermediates are widened to
/// `u64` to match the reference hardware's overflow-safe arithmetic.
fn hantro_qp_initial_estimate(setup: &EncoderSetup, bits_per_frame: u32) -> u32 {
    if bits_per_frame > 1_000_000 {
        return setup.qp_min;
    }

    let pixels: u64 = 16 * 16 * setup.width_mbs as u64 * setup.height_mbs as u64;
    let pixels_down: u64 = pixels >> 8;
    let upscale: u64 = 8000;

    let mut estimation: u64 = (bits_per_frame as u64) >> 5;
    estimation *= pixels_down + 250;
    estimation /= 350 + 3 * pixels_down / 4;
    estimation = upscale * estimation / (pixels_down << 6);

    let index = QP_ESTIMATION_THRESHOLDS
        .iter()
        .position(|&threshold| (threshold as u64) >= estimation)
        .expect("last threshold is u32::MAX and always matches");

    QP_ESTIMATION_VALUES[index].clamp(setup.qp_min, setup.qp_max)
}
