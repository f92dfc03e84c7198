//! Handshake version negotiation.
//!
//! Clients send only a major version in `Connect`; the server accepts any
//! major it still speaks and echoes it back in `Connected`.

/// Major version this build speaks natively.
pub const PROTOCOL_VERSION: u8 = 1;

/// Oldest client major still accepted.
pub const MIN_SUPPORTED_VERSION: u8 = 1;

/// Version to echo in `Connected`, or `None` when `client_major` is outside
/// the supported range.
#[must_use]
pub fn negotiate(client_major: u8) -> Option<u8> {
    (MIN_SUPPORTED_VERSION..=PROTOCOL_VERSION)
        .contains(&client_major)
        .then_some(client_major)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate() {
        assert_eq!(negotiate(PROTOCOL_VERSION), Some(PROTOCOL_VERSION));
        assert_eq!(negotiate(PROTOCOL_VERSION + 1), None);
        assert_eq!(negotiate(0), None);
    }
}
