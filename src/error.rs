use std::fmt;

/// Stable error codes carried from the core to the HTTP boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidPayload,
    Unauthorized,
    SessionNotFound,
    SessionNotReady,
    MediaTooLarge,
    RateLimited,
    BadGateway,
    AiDownstreamError,
    AiTimeout,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidPayload => "INVALID_PAYLOAD",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionNotReady => "SESSION_NOT_READY",
            Self::MediaTooLarge => "MEDIA_TOO_LARGE",
            Self::RateLimited => "RATE_LIMITED",
            Self::BadGateway => "BAD_GATEWAY",
            Self::AiDownstreamError => "AI_DOWNSTREAM_ERROR",
            Self::AiTimeout => "AI_TIMEOUT",
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidPayload => 400,
            Self::Unauthorized => 401,
            Self::SessionNotFound => 404,
            Self::SessionNotReady => 409,
            Self::MediaTooLarge => 413,
            Self::RateLimited => 429,
            Self::BadGateway | Self::AiDownstreamError => 502,
            Self::AiTimeout => 504,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A coded failure. Everything the core raises on purpose goes through
/// this type so the HTTP layer can translate code -> status without
/// string matching.
#[derive(Debug, Clone)]
pub struct GatewayError {
    pub code: ErrorCode,
    pub message: String,
}

impl GatewayError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for GatewayError {}

/// Shorthand for raising a coded error through `anyhow`.
pub fn coded(code: ErrorCode, message: impl Into<String>) -> anyhow::Error {
    anyhow::Error::new(GatewayError::new(code, message))
}

/// Recover the code from an `anyhow` chain; uncoded failures collapse to
/// the generic 502 wrap.
pub fn code_of(err: &anyhow::Error) -> ErrorCode {
    err.downcast_ref::<GatewayError>()
        .map(|e| e.code)
        .unwrap_or(ErrorCode::BadGateway)
}
