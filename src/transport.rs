// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The boundary between this crate and the kernel video M2M device.
//!
//! Nothing here talks to a real device: no ioctls, no `mmap`, no request
//! file descriptors. [`Transport`] is the seam the orchestrator is written
//! against, so a `tests`-only mock can stand in for hardware that exists
//! only as `external_source_code/` in this workspace.

use std::time::Duration;

use crate::params::SliceType;
use crate::Result;

/// Per-frame encode parameters handed to the device alongside the raw
/// frame, mirroring the fields `h264_prepare` fills in on the real driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeParams {
    pub slice_type: SliceType,
    pub frame_num: u32,
    pub idr_pic_id: u32,
    /// Timestamp of the reference picture, valid only for `SliceType::P`.
    pub reference_ts: Option<u64>,
}

/// Per-frame rate-control parameters, mirroring
/// `v4l2_ctrl_h264_encode_rc`'s fields that this crate populates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeRc {
    pub qp: u32,
    pub qp_min: u32,
    pub qp_max: u32,
    pub cp_distance_mbs: u32,
    pub cp_target: [u32; 10],
    pub cp_target_count: usize,
    pub cp_target_error: [i32; 6],
    pub cp_qp_delta: [i32; 7],
}

/// Opaque handle identifying a raw frame buffer in the caller's buffer ring.
/// This crate never dereferences it; the real transport maps it to an
/// `mmap`ed plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub usize);

/// Everything the transport needs to submit one frame for encoding.
#[derive(Debug, Clone, Copy)]
pub struct EncodeRequest<'a> {
    pub output_buffer: BufferHandle,
    pub capture_buffer: BufferHandle,
    pub params: &'a EncodeParams,
    pub rc: &'a EncodeRc,
}

/// A handle to a request in flight, returned by [`Transport::submit`] and
/// consumed by [`Transport::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestHandle(pub u64);

/// Bits produced, the coefficient count, and the summed macroblock QP for a
/// completed frame — exactly the triple `h264_rate_control_feedback` needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeFeedback {
    pub bytes_used: u32,
    pub rlc_count: u32,
    pub qp_sum: u32,
    /// Timestamp the device stamped on the completed output buffer; becomes
    /// `reference_ts` for the next P-slice.
    pub output_timestamp: u64,
    /// The capture buffer's contents: one complete, already start-code
    /// framed coded-slice NAL unit, as the hardware produced it. Reading
    /// this out of the `mmap`ed plane is the memory-mapping concern this
    /// crate does not implement; a real transport copies it out here so the
    /// orchestrator can write it to the output stream without touching the
    /// mapping itself.
    pub slice_nal: Vec<u8>,
}

/// The kernel M2M device boundary: submit a frame, wait for it to land.
///
/// A session is generic over `T: Transport`, so a `tests`-only mock and a
/// real kernel-backed implementation are interchangeable without touching
/// the orchestrator, the bitstream assembler, the NAL packer, or the rate
/// controller.
pub trait Transport {
    /// Queue buffers and per-frame controls for one frame and return a
    /// handle to the in-flight request. Mirrors `v4l2_encoder_run`'s queue
    /// half.
    fn submit(&mut self, request: EncodeRequest<'_>) -> Result<RequestHandle>;

    /// Block until `handle` completes or `timeout` elapses. Mirrors
    /// `v4l2_encoder_run`'s poll/dequeue half; the reference driver polls
    /// with a 300ms timeout per request.
    fn wait(&mut self, handle: RequestHandle, timeout: Duration) -> Result<EncodeFeedback>;
}

/// The timeout the reference driver waits on each submitted request before
/// giving up (`struct timeval timeout = { 0, 300000 }` in `v4l2_encoder_run`).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(300);
