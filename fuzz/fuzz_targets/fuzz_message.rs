//! Fuzz testing for message payload parsing.
//!
//! Publish bodies and stored records are parsed with the same function;
//! arbitrary bytes must produce `Ok` or `Err`, never a panic.
//!
//! ```bash
//! cargo +nightly fuzz run fuzz_message -- -max_total_time=60
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;
use topic_gateway::models::Message;

fuzz_target!(|data: &[u8]| {
    let parsed = Message::parse(data);
    assert_eq!(parsed.is_ok(), Message::is_valid(data));
});
