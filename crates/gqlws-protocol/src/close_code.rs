use std::fmt;

use crate::MAX_CLOSE_REASON_BYTES;

/// Connection-level close codes used by the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    NormalClosure,
    GoingAway,
    InternalServerError,
    BadRequest,
    Unauthorized,
    SubprotocolNotAcceptable,
    ConnectionInitialisationTimeout,
    SubscriberAlreadyExists,
    TooManyInitialisationRequests,
}

impl CloseCode {
    pub fn code(&self) -> u16 {
        match self {
            CloseCode::NormalClosure => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::InternalServerError => 1011,
            CloseCode::BadRequest => 4400,
            CloseCode::Unauthorized => 4401,
            CloseCode::SubprotocolNotAcceptable => 4406,
            CloseCode::ConnectionInitialisationTimeout => 4408,
            CloseCode::SubscriberAlreadyExists => 4409,
            CloseCode::TooManyInitialisationRequests => 4429,
        }
    }

    /// Canonical close reason for this code
    pub fn reason(&self) -> &'static str {
        match self {
            CloseCode::NormalClosure => "Normal Closure",
            CloseCode::GoingAway => "Going away",
            CloseCode::InternalServerError => "Internal server error",
            CloseCode::BadRequest => "Bad request",
            CloseCode::Unauthorized => "Unauthorized",
            CloseCode::SubprotocolNotAcceptable => "Subprotocol not acceptable",
            CloseCode::ConnectionInitialisationTimeout => "Connection initialisation timeout",
            CloseCode::SubscriberAlreadyExists => "Subscriber already exists",
            CloseCode::TooManyInitialisationRequests => "Too many initialisation requests",
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            1000 => Some(CloseCode::NormalClosure),
            1001 => Some(CloseCode::GoingAway),
            1011 => Some(CloseCode::InternalServerError),
            4400 => Some(CloseCode::BadRequest),
            4401 => Some(CloseCode::Unauthorized),
            4406 => Some(CloseCode::SubprotocolNotAcceptable),
            4408 => Some(CloseCode::ConnectionInitialisationTimeout),
            4409 => Some(CloseCode::SubscriberAlreadyExists),
            4429 => Some(CloseCode::TooManyInitialisationRequests),
            _ => None,
        }
    }

    /// Codes in the 4400 range signal a client protocol violation
    pub fn is_protocol_violation(&self) -> bool {
        (4400..4500).contains(&self.code())
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code(), self.reason())
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> Self {
        code.code()
    }
}

/// Truncate a close reason to the WebSocket limit without splitting a UTF-8 character
pub fn clamp_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON_BYTES {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON_BYTES;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}
