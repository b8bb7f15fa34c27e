//! Fuzz target for the CSV row payload codec.
//!
//! Decoding must never panic, and anything that decodes must survive a
//! re-encode unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use trigger_replication::payload::{decode_row, encode_values};

fuzz_target!(|line: &str| {
    // Should never panic
    if let Ok(values) = decode_row(line) {
        let encoded = encode_values(&values);
        assert_eq!(decode_row(&encoded).ok(), Some(values));
    }
});
