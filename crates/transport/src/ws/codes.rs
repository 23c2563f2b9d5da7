//! WebSocket close codes and reasons shared with other node implementations

use crate::error::ConnectionError;
use std::borrow::Cow;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

/// Close frame payloads are capped at 125 bytes, two of which hold the code
pub const MAX_REASON_LEN: usize = 123;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisconnectionReason {
    GracefulShutdown,
    DuplicateSocket,
    MissingRequiredParameter,
    DeadConnection,
    NoSharedStreams,
}

impl DisconnectionReason {
    pub fn code(&self) -> u16 {
        match self {
            DisconnectionReason::GracefulShutdown | DisconnectionReason::NoSharedStreams => 1000,
            DisconnectionReason::DuplicateSocket
            | DisconnectionReason::MissingRequiredParameter
            | DisconnectionReason::DeadConnection => 1002,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            DisconnectionReason::GracefulShutdown => "streamr:node:graceful-shutdown",
            DisconnectionReason::DuplicateSocket => "streamr:endpoint:duplicate-connection",
            DisconnectionReason::MissingRequiredParameter => {
                "streamr:node:missing-required-parameter"
            }
            DisconnectionReason::DeadConnection => "dead connection",
            DisconnectionReason::NoSharedStreams => "streamr:node:no-shared-streams",
        }
    }

    pub fn from_reason(reason: &str) -> Option<Self> {
        [
            DisconnectionReason::GracefulShutdown,
            DisconnectionReason::DuplicateSocket,
            DisconnectionReason::MissingRequiredParameter,
            DisconnectionReason::DeadConnection,
            DisconnectionReason::NoSharedStreams,
        ]
        .into_iter()
        .find(|candidate| candidate.reason() == reason)
    }
}

/// Cut `reason` to fit a close frame without splitting a character
pub fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_REASON_LEN {
        return reason;
    }
    let mut end = MAX_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

pub fn close_frame(code: u16, reason: &str) -> CloseFrame<'static> {
    CloseFrame {
        code: CloseCode::from(code),
        reason: Cow::Owned(truncate_reason(reason).to_string()),
    }
}

/// Close frame sent to the peer when we close for `reason`
pub fn close_frame_for(reason: &ConnectionError) -> CloseFrame<'static> {
    let known = |known: DisconnectionReason| close_frame(known.code(), known.reason());
    match reason {
        ConnectionError::DuplicateSocket => known(DisconnectionReason::DuplicateSocket),
        ConnectionError::DeadConnection => known(DisconnectionReason::DeadConnection),
        ConnectionError::MissingParameter(_) => close_frame(
            DisconnectionReason::MissingRequiredParameter.code(),
            &reason.to_string(),
        ),
        ConnectionError::Closed(text) => match DisconnectionReason::from_reason(text) {
            Some(reason) => known(reason),
            None => close_frame(1000, text),
        },
        other => close_frame(1000, &other.to_string()),
    }
}

/// Error a connection closes with after receiving `code`/`reason` from the peer
pub fn error_from_close(code: u16, reason: &str) -> ConnectionError {
    match DisconnectionReason::from_reason(reason) {
        Some(DisconnectionReason::DuplicateSocket) if code == 1002 => {
            ConnectionError::DuplicateSocket
        }
        Some(DisconnectionReason::DeadConnection) => ConnectionError::DeadConnection,
        _ => match reason.strip_suffix(" not given") {
            Some(parameter) if code == 1002 => {
                ConnectionError::MissingParameter(parameter.to_string())
            }
            _ => ConnectionError::Closed(format!("{}: {}", code, reason)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_reasons() {
        assert_eq!(DisconnectionReason::GracefulShutdown.code(), 1000);
        assert_eq!(DisconnectionReason::DuplicateSocket.code(), 1002);
        assert_eq!(DisconnectionReason::MissingRequiredParameter.code(), 1002);
        assert_eq!(DisconnectionReason::DeadConnection.code(), 1002);
        assert_eq!(DisconnectionReason::NoSharedStreams.code(), 1000);
        assert_eq!(
            DisconnectionReason::from_reason("streamr:endpoint:duplicate-connection"),
            Some(DisconnectionReason::DuplicateSocket)
        );
    }

    #[test]
    fn test_close_frame_round_trips_known_errors() {
        for err in [
            ConnectionError::DuplicateSocket,
            ConnectionError::DeadConnection,
            ConnectionError::MissingParameter("streamr-peer-id".to_string()),
        ] {
            let frame = close_frame_for(&err);
            assert_eq!(error_from_close(u16::from(frame.code), &frame.reason), err);
        }
    }

    #[test]
    fn test_unknown_reason_keeps_code() {
        assert_eq!(
            error_from_close(1001, "going away"),
            ConnectionError::Closed("1001: going away".to_string())
        );
    }

    #[test]
    fn test_reason_truncated_on_char_boundary() {
        let long = "é".repeat(100);
        let cut = truncate_reason(&long);
        assert!(cut.len() <= MAX_REASON_LEN);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
