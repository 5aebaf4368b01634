//! The simulator must answer or ignore any request frame without panicking,
//! and whatever it answers must be a well-formed frame.

#![no_main]

use libfuzzer_sys::fuzz_target;
use voltage_relay::{FrameCodec, RelaySimulator};

fuzz_target!(|data: &[u8]| {
    if data.len() >= 7 {
        let _ = FrameCodec::request_len(data);
    }

    let simulator = RelaySimulator::new(1, 32);
    if let Some(reply) = simulator.handle_frame(data) {
        assert!(reply.len() >= 5);
        assert!(FrameCodec::response_len(&reply[..3]).is_ok());
    }
});
