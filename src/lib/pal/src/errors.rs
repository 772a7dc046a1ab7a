/// Error codes reported by platform operations.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PalError {
    NotImplemented,
    NotDefined,
    NotSupported,
    Invalid,
    TooLong,
    Denied,
    BadHandle,
    StreamExist,
    StreamNotExist,
    StreamIsFile,
    StreamIsDir,
    StreamIsDevice,
    Interrupted,
    Overflow,
    BadAddress,
    NoMem,
    Inconsistent,
    TryAgain,
    NotServer,
    NotConnection,
    ConnFailed,
    AddrNotExist,
    AfNotSupported,
    ConnFailedPipe,
}

impl PalError {
    pub fn description(&self) -> &'static str {
        match self {
            Self::NotImplemented => "function not implemented",
            Self::NotDefined => "symbol not defined",
            Self::NotSupported => "function not supported",
            Self::Invalid => "invalid argument",
            Self::TooLong => "name or message too long",
            Self::Denied => "operation denied",
            Self::BadHandle => "handle corrupted",
            Self::StreamExist => "stream already exists",
            Self::StreamNotExist => "stream does not exist",
            Self::StreamIsFile => "stream is a file",
            Self::StreamIsDir => "stream is a directory",
            Self::StreamIsDevice => "stream is a device",
            Self::Interrupted => "operation interrupted",
            Self::Overflow => "buffer overflowed",
            Self::BadAddress => "invalid address",
            Self::NoMem => "not enough memory",
            Self::Inconsistent => "inconsistent system state",
            Self::TryAgain => "resource temporarily unavailable",
            Self::NotServer => "not a server",
            Self::NotConnection => "not a connection",
            Self::ConnFailed => "connection failed",
            Self::AddrNotExist => "resource address does not exist",
            Self::AfNotSupported => "address family not supported by protocol",
            Self::ConnFailedPipe => "broken pipe",
        }
    }
}

impl std::fmt::Display for PalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl std::error::Error for PalError {}
