// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT
// or http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Drives a full multi-GOP session through only the public API, standing in
//! for the kernel transport with an in-memory mock, and checks the output
//! stream is exactly SPS, PPS, then one NAL per frame in submission order.

use std::collections::VecDeque;
use std::time::Duration;

use stateless_h264_core::nal_unit::START_CODE_PREFIX;
use stateless_h264_core::params::{EncoderSetup, PixelFormat};
use stateless_h264_core::transport::{
    BufferHandle, EncodeFeedback, EncodeRequest, RequestHandle, Transport,
};
use stateless_h264_core::{EncodeSession, Error, Result, SessionState, IO_BUFFER_COUNT};

struct ScriptedTransport {
    next_handle: u64,
    responses: VecDeque<EncodeFeedback>,
}

impl ScriptedTransport {
    fn new(frame_count: u32, macroblocks: u32) -> Self {
        let mut responses = VecDeque::new();
        for i in 0..frame_count {
            responses.push_back(EncodeFeedback {
                bytes_used: 1200 + i * 10,
                rlc_count: 4_000,
                qp_sum: 28 * macroblocks,
                output_timestamp: i as u64,
                slice_nal: {
                    let mut bytes = START_CODE_PREFIX.to_vec();
                    bytes.push(0x20 | (i as u8 & 0x0F)); // fake slice NAL header + marker
                    bytes
                },
            });
        }
        Self {
            next_handle: 0,
            responses,
        }
    }
}

impl Transport for ScriptedTransport {
    fn submit(&mut self, _request: EncodeRequest<'_>) -> Result<RequestHandle> {
        let handle = RequestHandle(self.next_handle);
        self.next_handle += 1;
        Ok(handle)
    }

    fn wait(&mut self, _handle: RequestHandle, _timeout: Duration) -> Result<EncodeFeedback> {
        self.responses.pop_front().ok_or(Error::Timeout)
    }
}

fn buffer_ring(base: usize) -> [BufferHandle; IO_BUFFER_COUNT] {
    std::array::from_fn(|i| BufferHandle(base + i))
}

#[test]
fn full_session_emits_parameter_sets_then_one_nal_per_frame_in_order() {
    let _ = tracing_subscriber::fmt::try_init();

    let setup = EncoderSetup::new(640, 480, PixelFormat::Nv12, 25, 1, 500_000, 5, 2, 11, 51).unwrap();
    let frame_count = 12u32; // spans more than two GOPs
    let transport = ScriptedTransport::new(frame_count, setup.macroblocks());

    let mut session = EncodeSession::new(
        setup,
        transport,
        Vec::<u8>::new(),
        buffer_ring(0),
        buffer_ring(100),
    );

    session.open().unwrap();
    assert_eq!(session.state(), SessionState::Configured);

    for i in 0..frame_count {
        let feedback = session.encode_frame().unwrap();
        assert_eq!(feedback.output_timestamp, i as u64);
    }

    let (_transport, stream) = session.into_parts();

    let start_positions: Vec<usize> = (0..stream.len().saturating_sub(3))
        .filter(|&i| stream[i..i + 4] == START_CODE_PREFIX)
        .collect();

    // SPS + PPS + one NAL per frame, strictly FIFO.
    assert_eq!(start_positions.len() as u32, 2 + frame_count);
    assert_eq!(start_positions[0], 0);
    for w in start_positions.windows(2) {
        assert!(w[0] < w[1]);
    }
}

#[test]
fn session_rejects_frames_after_transport_failure() {
    let setup = EncoderSetup::new(320, 240, PixelFormat::Nv12, 25, 1, 200_000, 4, 2, 11, 51).unwrap();
    let transport = ScriptedTransport::new(1, setup.macroblocks()); // only one scripted response

    let mut session = EncodeSession::new(
        setup,
        transport,
        Vec::<u8>::new(),
        buffer_ring(0),
        buffer_ring(100),
    );
    session.open().unwrap();

    session.encode_frame().unwrap();
    // The mock has no more scripted responses; the next wait() times out.
    assert!(matches!(session.encode_frame(), Err(Error::Timeout)));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(session.encode_frame(), Err(Error::NotReady)));
}
