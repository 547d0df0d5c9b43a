use std::fmt::{Display, Formatter};

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Outcome code of a transfer, carried on the wire by terminal chunks.
///
/// The same codes double as the error type of the consumed resource and
///  handler-directory operations, so a failure can be forwarded to the peer
///  without translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    /// The numeric code as encoded into a chunk's `status` field.
    pub fn code(self) -> u8 {
        self.into()
    }

    /// Decodes a wire value into a status code.
    ///
    /// A value outside the known code set maps to [`Status::Unknown`] rather
    ///  than failing the whole chunk - a peer speaking a newer revision may
    ///  legitimately send codes this implementation does not know.
    pub fn from_wire(raw: u64) -> Status {
        u8::try_from(raw)
            .ok()
            .and_then(|code| Status::try_from(code).ok())
            .unwrap_or(Status::Unknown)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Status::Ok => "ok",
            Status::Cancelled => "cancelled",
            Status::Unknown => "unknown",
            Status::InvalidArgument => "invalid argument",
            Status::DeadlineExceeded => "deadline exceeded",
            Status::NotFound => "not found",
            Status::AlreadyExists => "already exists",
            Status::PermissionDenied => "permission denied",
            Status::ResourceExhausted => "resource exhausted",
            Status::FailedPrecondition => "failed precondition",
            Status::Aborted => "aborted",
            Status::OutOfRange => "out of range",
            Status::Unimplemented => "unimplemented",
            Status::Internal => "internal",
            Status::Unavailable => "unavailable",
            Status::DataLoss => "data loss",
            Status::Unauthenticated => "unauthenticated",
        };
        write!(f, "{}", text)
    }
}

impl std::error::Error for Status {}
