//! Error types: engine result codes, attach failures, endpoint operation errors.

use std::os::raw::c_int;

/// Failure code reported by the native engine. `0` is success and never appears here.
/// Codes the binding does not know are carried through unchanged in `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum KmError {
    #[error("failed")]
    Failed,
    #[error("fatal error")]
    Fatal,
    #[error("rejected")]
    Rejected,
    #[error("closed")]
    Closed,
    #[error("try again")]
    Again,
    #[error("aborted")]
    Aborted,
    #[error("timed out")]
    Timeout,
    #[error("invalid state")]
    InvalidState,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("invalid protocol")]
    InvalidProto,
    #[error("already exists")]
    AlreadyExist,
    #[error("does not exist")]
    NotExist,
    #[error("socket error")]
    SockError,
    #[error("poll error")]
    PollError,
    #[error("protocol error")]
    ProtoError,
    #[error("ssl error")]
    SslError,
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("buffer too long")]
    BufferTooLong,
    #[error("not supported")]
    NotSupported,
    #[error("not implemented")]
    NotImplemented,
    #[error("not authorized")]
    NotAuthorized,
    #[error("destroyed")]
    Destroyed,
    #[error("engine error {0}")]
    Other(i32),
}

/// Outcome carried by connect / handshake / send / open upcalls.
pub type Status = Result<(), KmError>;

impl KmError {
    /// Map a non-zero engine code. A zero code (only seen on a malformed error upcall)
    /// becomes `Other(0)` so the raw value stays visible.
    pub fn from_code(code: i32) -> Self {
        match code {
            -1 => KmError::Failed,
            -2 => KmError::Fatal,
            -3 => KmError::Rejected,
            -4 => KmError::Closed,
            -5 => KmError::Again,
            -6 => KmError::Aborted,
            -7 => KmError::Timeout,
            -8 => KmError::InvalidState,
            -9 => KmError::InvalidParam,
            -10 => KmError::InvalidProto,
            -11 => KmError::AlreadyExist,
            -12 => KmError::NotExist,
            -13 => KmError::SockError,
            -14 => KmError::PollError,
            -15 => KmError::ProtoError,
            -16 => KmError::SslError,
            -17 => KmError::BufferTooSmall,
            -18 => KmError::BufferTooLong,
            -19 => KmError::NotSupported,
            -20 => KmError::NotImplemented,
            -21 => KmError::NotAuthorized,
            -699 => KmError::Destroyed,
            other => KmError::Other(other),
        }
    }

    /// The engine's integer code for this error.
    pub fn code(&self) -> i32 {
        match self {
            KmError::Failed => -1,
            KmError::Fatal => -2,
            KmError::Rejected => -3,
            KmError::Closed => -4,
            KmError::Again => -5,
            KmError::Aborted => -6,
            KmError::Timeout => -7,
            KmError::InvalidState => -8,
            KmError::InvalidParam => -9,
            KmError::InvalidProto => -10,
            KmError::AlreadyExist => -11,
            KmError::NotExist => -12,
            KmError::SockError => -13,
            KmError::PollError => -14,
            KmError::ProtoError => -15,
            KmError::SslError => -16,
            KmError::BufferTooSmall => -17,
            KmError::BufferTooLong => -18,
            KmError::NotSupported => -19,
            KmError::NotImplemented => -20,
            KmError::NotAuthorized => -21,
            KmError::Destroyed => -699,
            KmError::Other(code) => *code,
        }
    }

    /// Interpret an upcall status code: 0 is success, anything else an error.
    pub fn check(code: c_int) -> Status {
        if code == 0 {
            Ok(())
        } else {
            Err(KmError::from_code(code))
        }
    }
}

/// Why the native engine could not be attached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AttachError {
    /// No engine has been registered with the binding.
    #[error("no native engine registered")]
    NoEngine,
    /// The engine library could not be loaded.
    #[error("native engine unavailable: {0}")]
    Unavailable(String),
    /// The engine loaded but rejected global initialization.
    #[error("native engine init failed: {0}")]
    InitFailed(KmError),
}

/// Error returned synchronously by endpoint operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    /// The endpoint was constructed while the engine was not attached.
    #[error(transparent)]
    Detached(#[from] AttachError),
    /// The operation needs a live handle and there is none (never created, or closed).
    #[error("endpoint has no live native handle")]
    NoHandle,
    /// The engine rejected the operation immediately.
    #[error("engine rejected operation: {0}")]
    Engine(#[from] KmError),
}

pub type Result<T, E = EndpointError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_map_both_ways() {
        for code in (-21..=-1).chain(std::iter::once(-699)) {
            let err = KmError::from_code(code);
            assert!(!matches!(err, KmError::Other(_)), "code {code} unmapped");
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn unknown_codes_pass_through() {
        assert_eq!(KmError::from_code(-42), KmError::Other(-42));
        assert_eq!(KmError::from_code(7).code(), 7);
        assert_eq!(KmError::from_code(0), KmError::Other(0));
    }

    #[test]
    fn check_zero_is_success() {
        assert_eq!(KmError::check(0), Ok(()));
        assert_eq!(KmError::check(-7), Err(KmError::Timeout));
    }
}
