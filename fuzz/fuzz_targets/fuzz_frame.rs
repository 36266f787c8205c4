//! Fuzz target for transport frame parsing.

#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;
use shardmesh_p2p::frame::Frame;

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = Frame::decode(Bytes::copy_from_slice(data)) {
        let _ = shardmesh_p2p::decode_hello(&frame.payload);
    }
});
