// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Owns the per-session frame loop.
//!
//! Session bring-up emits the SPS and PPS NAL units through [`crate::bitstream`]
//! and [`crate::nal_unit`] and initializes the [`RateController`]; the
//! per-frame loop advances it, submits a request through the caller's
//! [`Transport`], and folds the completion feedback back into rate control.
//! Everything this module does not do — device enumeration, buffer mapping,
//! request-object lifecycle — belongs to the `T: Transport` implementation
//! the caller supplies.

use std::io::Write;
use std::time::Duration;

use crate::bitstream::BitstreamBuffer;
use crate::nal_unit::{self, NalUnitType};
use crate::params::{EncoderSetup, Pps, SliceType, Sps};
use crate::rate_control::RateController;
use crate::transport::{
    BufferHandle, EncodeFeedback, EncodeParams, EncodeRc, EncodeRequest, Transport,
    DEFAULT_REQUEST_TIMEOUT,
};
use crate::{Error, Result};

/// Number of I/O buffers requested on each side, per spec.md §4.4 step 3.
pub const IO_BUFFER_COUNT: usize = 3;

/// `log2_max_frame_num_minus4`, fixed by this profile (spec.md §4.4 step 4).
const LOG2_MAX_FRAME_NUM_MINUS4: u32 = 12;

/// Lifecycle states a session moves through. `setup_*`-style reconfiguration
/// is not offered by this crate (`EncoderSetup` is immutable once built), so
/// the only way to observe [`Error::Busy`] is by calling [`EncodeSession::open`]
/// twice; it is kept as an explicit state regardless, matching the original
/// driver's `encoder->up` guard described in spec.md §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Constructed, not yet brought up: no SPS/PPS emitted, no RC state.
    Idle,
    /// SPS/PPS emitted, rate control initialized; the per-frame loop may run.
    Configured,
    /// Torn down, either explicitly or because a transport error aborted it.
    Closed,
}

/// Drives one encode session: session bring-up (SPS/PPS emission, rate
/// control setup) and the per-frame loop (rate control step, transport
/// submit/wait, feedback, output write), in the order spec.md §4.4 lays out.
///
/// Generic over the output sink `W` and the transport `T`, so tests exercise
/// the whole loop against an in-memory sink and a mock transport without a
/// kernel device anywhere in the picture.
pub struct EncodeSession<T, W> {
    setup: EncoderSetup,
    sps: Sps,
    pps: Pps,
    rc: RateController,
    transport: T,
    sink: W,
    state: SessionState,

    bitstream: BitstreamBuffer,
    output_buffers: [BufferHandle; IO_BUFFER_COUNT],
    capture_buffers: [BufferHandle; IO_BUFFER_COUNT],
    output_index: usize,
    capture_index: usize,

    gop_index: u32,
    frame_num: u32,
    idr_pic_id: u32,
    reference_ts: Option<u64>,
    timeout: Duration,
}

impl<T, W> EncodeSession<T, W> {
    /// Build a session in the [`SessionState::Idle`] state. `output_buffers`
    /// and `capture_buffers` are the handles returned by the external
    /// "request I/O buffers" step (spec.md §4.4 step 3) — this crate never
    /// allocates or maps them, only cycles through them in ring order.
    pub fn new(
        setup: EncoderSetup,
        transport: T,
        sink: W,
        output_buffers: [BufferHandle; IO_BUFFER_COUNT],
        capture_buffers: [BufferHandle; IO_BUFFER_COUNT],
    ) -> Self {
        let sps = Sps::new(&setup);
        let pps = Pps::new();
        let rc = RateController::setup(&setup);

        Self {
            setup,
            sps,
            pps,
            rc,
            transport,
            sink,
            state: SessionState::Idle,
            bitstream: BitstreamBuffer::new(),
            output_buffers,
            capture_buffers,
            output_index: 0,
            capture_index: 0,
            gop_index: 0,
            frame_num: 0,
            idr_pic_id: 0,
            reference_ts: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Override the per-request wait bound (default 300ms, matching the
    /// reference driver's `v4l2_encoder_run`).
    pub fn set_request_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Request that the next frame be an IDR, regardless of where the
    /// session's own GOP counter sits. Resets `gop_index` to 0 so the
    /// per-frame slice-type decision (driven purely by `gop_index`, per
    /// spec.md §4.4 step 1) stays in lockstep with the rate controller's own
    /// GOP-start treatment of the forced intra frame.
    pub fn intra_request(&mut self) {
        self.rc.intra_request();
        self.gop_index = 0;
    }

    /// Consume the session and return the underlying transport and sink.
    pub fn into_parts(self) -> (T, W) {
        (self.transport, self.sink)
    }
}

impl<T: Transport, W: Write> EncodeSession<T, W> {
    /// Session bring-up: fill and emit the SPS and PPS NAL units, then
    /// initialize rate control. Corresponds to spec.md §4.4 steps 4-6 (steps
    /// 1-3 — transport probing, format configuration, buffer requests — are
    /// the caller's responsibility before constructing this session).
    ///
    /// Fails with [`Error::Busy`] if the session has already been brought up.
    pub fn open(&mut self) -> Result<()> {
        if self.state != SessionState::Idle {
            return Err(Error::Busy);
        }

        tracing::info!(
            width = self.setup.width,
            height = self.setup.height,
            bitrate = self.setup.bitrate,
            gop_size = self.setup.gop_size,
            "bringing up encode session"
        );

        self.emit_parameter_set(NalUnitType::SequenceParameterSet)?;
        self.emit_parameter_set(NalUnitType::PictureParameterSet)?;

        // Parameter-set emission is not retried (spec.md §7): any failure
        // above has already propagated via `?`, leaving the session `Idle`.
        self.rc = RateController::setup(&self.setup);
        self.state = SessionState::Configured;
        Ok(())
    }

    fn emit_parameter_set(&mut self, which: NalUnitType) -> Result<()> {
        match which {
            NalUnitType::SequenceParameterSet => self.sps.to_rbsp(&mut self.bitstream)?,
            NalUnitType::PictureParameterSet => self.pps.to_rbsp(&mut self.bitstream)?,
            other => unreachable!("emit_parameter_set called with {other:?}"),
        }
        let nal = nal_unit::pack(&mut self.bitstream, 3, which);
        self.write_to_sink(nal.as_bytes())
    }

    fn write_to_sink(&mut self, bytes: &[u8]) -> Result<()> {
        self.sink
            .write_all(bytes)
            .map_err(|e| Error::TransportFailure(Box::new(e)))
    }

    /// Run one frame through the loop: rate control, transport submit/wait,
    /// output write, rate control feedback. Corresponds to spec.md §4.4's
    /// per-frame steps 1-7.
    ///
    /// Any transport error or timeout aborts the whole session — the
    /// session transitions to [`SessionState::Closed`] and the error
    /// propagates, per the failure policy in spec.md §7 (rate-control
    /// statistics would otherwise be left inconsistent).
    pub fn encode_frame(&mut self) -> Result<EncodeFeedback> {
        if self.state != SessionState::Configured {
            return Err(Error::NotReady);
        }

        let slice_type = if self.gop_index == 0 {
            self.frame_num = 0;
            self.idr_pic_id = self.idr_pic_id.wrapping_add(1);
            SliceType::Idr
        } else {
            self.frame_num = (self.frame_num + 1) % (1 << (LOG2_MAX_FRAME_NUM_MINUS4 + 4));
            SliceType::P
        };

        let params = EncodeParams {
            slice_type,
            frame_num: self.frame_num,
            idr_pic_id: self.idr_pic_id,
            reference_ts: match slice_type {
                SliceType::P => self.reference_ts,
                SliceType::Idr => None,
            },
        };

        self.rc.step(&self.setup, self.gop_index);

        let mut cp_target = [0u32; 10];
        let (cp_target_count, cp_target_error, cp_qp_delta) = if self.rc.cp_enabled() {
            let src = self.rc.cp_target();
            cp_target[..src.len()].copy_from_slice(src);
            (src.len(), *self.rc.cp_target_error(), *self.rc.cp_qp_delta())
        } else {
            (0, [0; 6], [0; 7])
        };

        let rc_block = EncodeRc {
            qp: self.rc.qp(),
            qp_min: self.setup.qp_min,
            qp_max: self.setup.qp_max,
            cp_distance_mbs: self.rc.cp_distance_mbs(),
            cp_target,
            cp_target_count,
            cp_target_error,
            cp_qp_delta,
        };

        tracing::debug!(
            gop_index = self.gop_index,
            ?slice_type,
            qp = rc_block.qp,
            cp_enabled = self.rc.cp_enabled(),
            "submitting frame"
        );

        let request = EncodeRequest {
            output_buffer: self.output_buffers[self.output_index],
            capture_buffer: self.capture_buffers[self.capture_index],
            params: &params,
            rc: &rc_block,
        };

        let feedback = self.run_request(request)?;

        if let Err(e) = self.write_to_sink(&feedback.slice_nal) {
            self.state = SessionState::Closed;
            return Err(e);
        }

        self.rc
            .feedback(&self.setup, feedback.bytes_used, feedback.rlc_count, feedback.qp_sum);
        self.reference_ts = Some(feedback.output_timestamp);

        self.gop_index = (self.gop_index + 1) % self.setup.gop_size;
        self.output_index = (self.output_index + 1) % IO_BUFFER_COUNT;
        self.capture_index = (self.capture_index + 1) % IO_BUFFER_COUNT;

        Ok(feedback)
    }

    fn run_request(&mut self, request: EncodeRequest<'_>) -> Result<EncodeFeedback> {
        let handle = match self.transport.submit(request) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(error = %e, "transport submit failed, aborting session");
                self.state = SessionState::Closed;
                return Err(e);
            }
        };

        match self.transport.wait(handle, self.timeout) {
            Ok(feedback) => Ok(feedback),
            Err(e) => {
                tracing::error!(error = %e, "transport wait failed, aborting session");
                self.state = SessionState::Closed;
                Err(e)
            }
        }
    }

    /// Release all resources and transition to [`SessionState::Closed`].
    /// Idempotent: closing an already-closed or never-opened session is a
    /// no-op, mirroring `v4l2_encoder_teardown`'s every-exit-path guarantee.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            tracing::info!("tearing down encode session");
        }
        self.state = SessionState::Closed;
    }
}

impl<T, W> Drop for EncodeSession<T, W> {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            tracing::warn!("encode session dropped without an explicit close()");
        }
    }
}
