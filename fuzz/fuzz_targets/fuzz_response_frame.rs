//! Client-side response decoding must never panic on arbitrary bytes.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use voltage_relay::{Command, FrameCodec};

#[derive(Arbitrary, Debug)]
enum Expected {
    Read { start: u16, count: u16 },
    Write { address: u16, value: bool },
    WriteMany { start: u16, bits: Vec<bool> },
}

#[derive(Arbitrary, Debug)]
struct Input {
    device: u8,
    expected: Expected,
    frame: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let codec = FrameCodec::new(input.device);
    let command = match input.expected {
        Expected::Read { start, count } => Command::ReadCoils { start, count },
        Expected::Write { address, value } => Command::WriteCoil { address, value },
        Expected::WriteMany { start, bits } => Command::WriteCoils { start, bits },
    };

    let _ = codec.decode(&input.frame, &command);
    if input.frame.len() >= 3 {
        let _ = FrameCodec::response_len(&input.frame[..3]);
    }
});
