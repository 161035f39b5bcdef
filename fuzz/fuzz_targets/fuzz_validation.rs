//! Fuzz testing for request input validation.
//!
//! Destination ids, the derived topic names and the `start` query value come
//! straight from the request line. None of their parsers may panic.
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_validation -- -max_total_time=60
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;
use topic_gateway::StartOffset;
use topic_gateway::models::Destination;
use topic_gateway::validation::{validate_destination_id, validate_topic_name};

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let _ = validate_destination_id(s);
        let _ = validate_topic_name(s);
        let _ = StartOffset::from_query(Some(s));

        if let Ok(destination) = Destination::from_id(s, "messages-") {
            // Anything accepted must map onto a valid broker topic name
            assert!(validate_topic_name(destination.topic()).is_ok());
            assert!(destination.topic().ends_with(s));
        }
    }
});
