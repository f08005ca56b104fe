//! Guest-visible result codes.
//!
//! Result codes use the console layout: description in bits 0-9, module in bits 10-17, summary in
//! bits 21-26 and level in bits 27-31. Every error a syscall can return maps to exactly one code,
//! and guest code compares against those exact values.

use std::fmt;

use thiserror::Error;

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ResultCode(u32);

impl ResultCode {
    pub const SUCCESS: ResultCode = ResultCode(0);

    pub const fn new(description: u32, module: u32, summary: u32, level: u32) -> ResultCode {
        ResultCode(
            (description & 0x3FF) |
            (module & 0xFF) << 10 |
            (summary & 0x3F) << 21 |
            (level & 0x1F) << 27
        )
    }

    pub const fn from_raw(raw: u32) -> ResultCode {
        ResultCode(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_success(self) -> bool {
        (self.0 as i32) >= 0
    }

    pub const fn description(self) -> u32 {
        self.0 & 0x3FF
    }

    pub const fn module(self) -> u32 {
        (self.0 >> 10) & 0xFF
    }

    pub const fn summary(self) -> u32 {
        (self.0 >> 21) & 0x3F
    }

    pub const fn level(self) -> u32 {
        self.0 >> 27
    }
}

impl fmt::Debug for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ResultCode({:#010X})", self.0)
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#010X}", self.0)
    }
}

impl From<KernelError> for ResultCode {
    fn from(err: KernelError) -> ResultCode {
        err.code()
    }
}

pub mod module {
    pub const KERNEL: u32 = 1;
    pub const OS: u32 = 6;
    pub const SRV: u32 = 25;
}

pub mod summary {
    pub const WOULD_BLOCK: u32 = 2;
    pub const OUT_OF_RESOURCE: u32 = 3;
    pub const NOT_FOUND: u32 = 4;
    pub const INVALID_STATE: u32 = 5;
    pub const NOT_SUPPORTED: u32 = 6;
    pub const INVALID_ARGUMENT: u32 = 7;
    pub const WRONG_ARGUMENT: u32 = 8;
    pub const CANCELED: u32 = 9;
    pub const STATUS_CHANGED: u32 = 10;
}

pub mod level {
    pub const INFO: u32 = 1;
    pub const STATUS: u32 = 25;
    pub const TEMPORARY: u32 = 26;
    pub const PERMANENT: u32 = 27;
    pub const USAGE: u32 = 28;
}

pub type KResult<T> = Result<T, KernelError>;

/// Every failure a syscall or HLE handler can report to the guest.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Error)]
pub enum KernelError {
    #[error("wait timed out")]
    Timeout,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("invalid address")]
    InvalidAddress,
    #[error("address range is in the wrong state")]
    InvalidAddressState,
    #[error("misaligned address")]
    MisalignedAddress,
    #[error("misaligned size")]
    MisalignedSize,
    #[error("resource limit exceeded")]
    ResourceLimitExceeded,
    #[error("mutex is not owned by the calling thread")]
    PermissionDenied,
    #[error("not authorized")]
    NotAuthorized,
    #[error("session closed by remote")]
    SessionClosed,
    #[error("value out of range")]
    OutOfRange,
    #[error("invalid enum value")]
    InvalidEnumValue,
    #[error("invalid combination of arguments")]
    InvalidCombination,
    #[error("not found")]
    NotFound,
    #[error("port name too long")]
    PortNameTooLong,
    #[error("maximum number of connections reached")]
    MaxConnectionsReached,
    #[error("no pending sessions")]
    NoPendingSessions,
    #[error("invalid buffer descriptor")]
    InvalidBufferDescriptor,
    #[error("not implemented")]
    NotImplemented,
    #[error("service already registered")]
    AlreadyRegistered,
    #[error("service not registered")]
    ServiceNotRegistered,
    #[error("invalid service name size")]
    InvalidNameSize,
    #[error("service name contains a NUL byte")]
    NameContainsNul,
}

impl KernelError {
    pub const fn code(self) -> ResultCode {
        use self::KernelError::*;
        use self::level::*;
        use self::module::*;
        use self::summary::*;

        match self {
            Timeout => ResultCode::new(1022, OS, STATUS_CHANGED, INFO),
            InvalidHandle => ResultCode::new(1015, KERNEL, INVALID_ARGUMENT, PERMANENT),
            InvalidAddress => ResultCode::new(1013, OS, INVALID_ARGUMENT, USAGE),
            InvalidAddressState => ResultCode::new(1013, OS, INVALID_STATE, USAGE),
            MisalignedAddress => ResultCode::new(1009, OS, INVALID_ARGUMENT, USAGE),
            MisalignedSize => ResultCode::new(1010, OS, INVALID_ARGUMENT, USAGE),
            ResourceLimitExceeded => ResultCode::new(1011, KERNEL, OUT_OF_RESOURCE, PERMANENT),
            PermissionDenied => ResultCode::new(31, KERNEL, INVALID_ARGUMENT, PERMANENT),
            NotAuthorized => ResultCode::new(1002, OS, WRONG_ARGUMENT, PERMANENT),
            SessionClosed => ResultCode::new(26, OS, CANCELED, STATUS),
            OutOfRange => ResultCode::new(1021, KERNEL, INVALID_ARGUMENT, PERMANENT),
            InvalidEnumValue => ResultCode::new(1005, KERNEL, INVALID_ARGUMENT, PERMANENT),
            InvalidCombination => ResultCode::new(1006, KERNEL, WRONG_ARGUMENT, PERMANENT),
            NotFound => ResultCode::new(1018, KERNEL, summary::NOT_FOUND, PERMANENT),
            PortNameTooLong => ResultCode::new(30, OS, INVALID_ARGUMENT, USAGE),
            MaxConnectionsReached => ResultCode::new(52, OS, WOULD_BLOCK, TEMPORARY),
            NoPendingSessions => ResultCode::new(35, OS, WOULD_BLOCK, PERMANENT),
            InvalidBufferDescriptor => ResultCode::new(48, OS, WRONG_ARGUMENT, PERMANENT),
            NotImplemented => ResultCode::new(1012, OS, NOT_SUPPORTED, PERMANENT),
            AlreadyRegistered => ResultCode::new(1020, OS, WRONG_ARGUMENT, PERMANENT),
            ServiceNotRegistered => ResultCode::new(1, SRV, WOULD_BLOCK, TEMPORARY),
            InvalidNameSize => ResultCode::new(5, SRV, WRONG_ARGUMENT, PERMANENT),
            NameContainsNul => ResultCode::new(7, SRV, WRONG_ARGUMENT, PERMANENT),
        }
    }

    pub const fn raw(self) -> u32 {
        self.code().raw()
    }
}

/// Collapses a kernel result into the raw word written to r0.
pub fn result_word<T>(result: &KResult<T>) -> u32 {
    match result {
        Ok(_) => ResultCode::SUCCESS.raw(),
        Err(err) => err.raw(),
    }
}
