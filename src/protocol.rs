//! Fixed-width ping/pong wire protocol.
//!
//! ```text
//! Request:  ping
//! Response: pong
//! ```
//!
//! Exactly four bytes each way, no length prefix and no terminator. One
//! readiness notification carries exactly one message, which is what makes
//! edge-triggered coalescing safe on both sides.

use std::fmt;

/// Size of every message on the wire.
pub const TOKEN_LEN: usize = 4;

/// Request sent by clients.
pub const REQUEST: &[u8; TOKEN_LEN] = b"ping";

/// Reply sent by the server.
pub const RESPONSE: &[u8; TOKEN_LEN] = b"pong";

/// A malformed token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Read returned fewer (or more) bytes than a token.
    Truncated { len: usize },
    /// Token had the right size but the wrong content.
    Unexpected {
        expected: &'static [u8; TOKEN_LEN],
        got: [u8; TOKEN_LEN],
    },
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Truncated { len } => {
                write!(f, "expected {TOKEN_LEN} bytes, read {len}")
            }
            ProtocolError::Unexpected { expected, got } => write!(
                f,
                "expected {:?}, got {:?}",
                String::from_utf8_lossy(&expected[..]),
                String::from_utf8_lossy(&got[..])
            ),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Validate a request read by the server.
pub fn check_request(input: &[u8]) -> Result<(), ProtocolError> {
    check(REQUEST, input)
}

/// Validate a reply read by a client.
pub fn check_response(input: &[u8]) -> Result<(), ProtocolError> {
    check(RESPONSE, input)
}

fn check(expected: &'static [u8; TOKEN_LEN], input: &[u8]) -> Result<(), ProtocolError> {
    let got: [u8; TOKEN_LEN] = input
        .try_into()
        .map_err(|_| ProtocolError::Truncated { len: input.len() })?;
    if &got != expected {
        return Err(ProtocolError::Unexpected { expected, got });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_request() {
        assert_eq!(check_request(b"ping"), Ok(()));
        assert_eq!(check_response(b"pong"), Ok(()));
    }

    #[test]
    fn test_truncated() {
        assert_eq!(
            check_request(b"pin"),
            Err(ProtocolError::Truncated { len: 3 })
        );
        assert_eq!(
            check_request(b"pingping"),
            Err(ProtocolError::Truncated { len: 8 })
        );
    }

    #[test]
    fn test_wrong_direction() {
        // A reply arriving where a request is expected is a violation.
        match check_request(b"pong") {
            Err(ProtocolError::Unexpected { expected, got }) => {
                assert_eq!(expected, REQUEST);
                assert_eq!(&got, b"pong");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_case_sensitive() {
        assert!(check_request(b"PING").is_err());
    }
}
