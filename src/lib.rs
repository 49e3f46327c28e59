// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Orchestrator for a stateless hardware H.264 baseline/main-profile encoder.
//!
//! This crate is the *core* that survives porting to any other stateless
//! H.264 hardware exposed as a kernel video-memory-to-memory (M2M) device
//! with per-frame request objects: the bitstream assembler, the NAL unit
//! packer and the closed-loop rate controller, tied together by a frame-loop
//! orchestrator. The kernel driver transport itself (device enumeration,
//! buffer mapping, request queue/dequeue), the raw pixel source, and process
//! entry points are external collaborators, represented here only by the
//! [`transport::Transport`] trait.

#![deny(unsafe_code)]

pub mod bitstream;
pub mod nal_unit;
pub mod params;
pub mod rate_control;
pub mod transport;

mod orchestrator;
pub use orchestrator::{EncodeSession, SessionState, IO_BUFFER_COUNT};

/// Errors produced by this crate.
///
/// These map onto the error kinds from the design: bad caller input,
/// allocation failure, transport-layer failure, request timeout, and calls
/// made in the wrong lifecycle state.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bad caller input: oversized bit width, out-of-range Exp-Golomb value,
    /// or an invalid encoder configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// Allocation failed while growing an internal buffer.
    #[error("out of memory")]
    OutOfMemory,

    /// The external kernel transport reported a failure.
    #[error("transport failure: {0}")]
    TransportFailure(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A submitted request did not complete within the configured bound.
    #[error("request timed out")]
    Timeout,

    /// The operation requires a session that has not yet been configured.
    #[error("encoder session not ready")]
    NotReady,

    /// The operation is not allowed while the session is up.
    #[error("encoder session busy")]
    Busy,
}

/// Convenience alias for this crate's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;
