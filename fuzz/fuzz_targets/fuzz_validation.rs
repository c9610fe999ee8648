//! Fuzz testing for validation functions.
//!
//! This fuzz target tests the robustness of the validation module against
//! arbitrary input strings. It ensures that validation functions:
//!
//! - Never panic on any input
//! - Always return a valid Result (Ok or Err)
//! - Handle edge cases like empty strings, long strings, and special characters
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! # Install cargo-fuzz (requires nightly)
//! cargo +nightly install cargo-fuzz
//!
//! # Run the validation fuzz target
//! cargo +nightly fuzz run fuzz_validation
//!
//! # Run with a time limit (e.g., 60 seconds)
//! cargo +nightly fuzz run fuzz_validation -- -max_total_time=60
//! ```
//!
//! # What This Tests
//!
//! - `validate_identifier`: message-id / correlation-id / lock-token rules
//! - `validate_property_name` / `validate_property_value`: user property rules
//! - `Message::set_message_id` / `set_property`: the same rules applied
//!   through the message surface

#![no_main]

use iothub_device_transport::Message;
use iothub_device_transport::validation::{
    validate_identifier, validate_property_name, validate_property_value,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Try to interpret the bytes as a UTF-8 string for string validation
    if let Ok(s) = std::str::from_utf8(data) {
        // Identifier validation (shouldn't panic)
        let _ = validate_identifier(s, "message-id");
        let _ = validate_identifier(s, "lock-token");

        // Property validation (shouldn't panic)
        let _ = validate_property_name(s);
        let _ = validate_property_value(s);

        // The same rules exercised through the message setters
        let mut message = Message::new(data.to_vec());
        let _ = message.set_message_id(s);
        let _ = message.set_correlation_id(s);
        let _ = message.set_property(s, s);
    }
});
