//! Fuzz target for the wire codec
//!
//! # Strategy
//!
//! - Arbitrary byte buffers fed straight into `Message::decode`
//! - Re-encode any successful decode and decode it again
//!
//! # Invariants
//!
//! - `decode` NEVER panics, whatever the bytes
//! - A successful decode re-encodes deterministically
//! - `decode(encode(m)) == m` for every decoded message

#![no_main]

use libfuzzer_sys::fuzz_target;
use tactus_proto::Message;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = Message::decode(data) {
        let encoded = message.encode_to_vec();
        let reencoded = message.encode_to_vec();
        assert_eq!(encoded, reencoded, "encoding must be deterministic");

        let decoded = Message::decode(&encoded).expect("re-decode of valid encoding");
        assert_eq!(decoded, message, "round trip must be lossless");
    }
});
