use crate::error::{TransportError, TransportResult};

// =============================================================================
// Validation Constants
// =============================================================================

/// Maximum length for message identifiers (message-id, correlation-id,
/// lock-token).
///
/// The hub rejects identifiers longer than this, so the client refuses
/// them up front instead of burning a round-trip.
pub const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Maximum length for a user property name or value.
pub const MAX_PROPERTY_LENGTH: usize = 255;

/// Characters allowed in an identifier besides ASCII alphanumerics.
///
/// This is the URN-safe set the hub accepts for message identifiers.
const IDENTIFIER_SPECIALS: &str = "-:.+%_#*?!(),=@;$'";

/// Validate a message identifier (message-id, correlation-id, lock-token).
///
/// Rules:
/// - Must be between 1 and 128 characters
/// - Must be ASCII
/// - Only alphanumerics and the URN-safe special characters are allowed
pub fn validate_identifier(value: &str, field: &str) -> TransportResult<()> {
    if value.is_empty() {
        return Err(TransportError::InvalidArgument(format!(
            "{field} cannot be empty"
        )));
    }

    if value.len() > MAX_IDENTIFIER_LENGTH {
        return Err(TransportError::InvalidArgument(format!(
            "{field} cannot exceed {MAX_IDENTIFIER_LENGTH} characters"
        )));
    }

    for (i, c) in value.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && !IDENTIFIER_SPECIALS.contains(c) {
            return Err(TransportError::InvalidArgument(format!(
                "{field} contains invalid character {c:?} at position {i}. \
                 Only ASCII alphanumerics and \"{IDENTIFIER_SPECIALS}\" are allowed"
            )));
        }
    }

    Ok(())
}

/// Validate a user property name.
///
/// Property names ride in protocol headers, so whitespace, control
/// characters, and non-ASCII text are rejected.
pub fn validate_property_name(name: &str) -> TransportResult<()> {
    if name.is_empty() {
        return Err(TransportError::InvalidArgument(
            "property name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_PROPERTY_LENGTH {
        return Err(TransportError::InvalidArgument(format!(
            "property name cannot exceed {MAX_PROPERTY_LENGTH} characters"
        )));
    }

    if let Some(c) = name.chars().find(|c| !c.is_ascii_graphic()) {
        return Err(TransportError::InvalidArgument(format!(
            "property name contains invalid character {c:?}"
        )));
    }

    Ok(())
}

/// Validate a user property value.
///
/// Values allow spaces but no control characters.
pub fn validate_property_value(value: &str) -> TransportResult<()> {
    if value.len() > MAX_PROPERTY_LENGTH {
        return Err(TransportError::InvalidArgument(format!(
            "property value cannot exceed {MAX_PROPERTY_LENGTH} characters"
        )));
    }

    if let Some(c) = value
        .chars()
        .find(|&c| !c.is_ascii() || c.is_ascii_control())
    {
        return Err(TransportError::InvalidArgument(format!(
            "property value contains invalid character {c:?}"
        )));
    }

    Ok(())
}
