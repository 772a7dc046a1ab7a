use libos_pal::PalError;
use nix::errno::Errno;

/// Translate a platform error into the errno reported to the application. Call sites that give a
/// platform error a more specific meaning (for example an existing stream on `bind`) check for it
/// before falling back to this table.
pub fn pal_to_unix_errno(err: PalError) -> Errno {
    match err {
        PalError::NotImplemented => Errno::ENOSYS,
        PalError::NotDefined => Errno::ENOSYS,
        PalError::NotSupported => Errno::EACCES,
        PalError::Invalid => Errno::EINVAL,
        PalError::TooLong => Errno::ENAMETOOLONG,
        PalError::Denied => Errno::EACCES,
        PalError::BadHandle => Errno::EBADF,
        PalError::StreamExist => Errno::EEXIST,
        PalError::StreamNotExist => Errno::ENOENT,
        PalError::StreamIsFile => Errno::ENOTDIR,
        PalError::StreamIsDir => Errno::EISDIR,
        PalError::StreamIsDevice => Errno::ESPIPE,
        PalError::Interrupted => Errno::EINTR,
        PalError::Overflow => Errno::EFAULT,
        PalError::BadAddress => Errno::EFAULT,
        PalError::NoMem => Errno::ENOMEM,
        PalError::Inconsistent => Errno::EFAULT,
        PalError::TryAgain => Errno::EAGAIN,
        PalError::NotServer => Errno::EINVAL,
        PalError::NotConnection => Errno::ENOTCONN,
        PalError::ConnFailed => Errno::ECONNRESET,
        PalError::AddrNotExist => Errno::EADDRNOTAVAIL,
        PalError::AfNotSupported => Errno::EAFNOSUPPORT,
        PalError::ConnFailedPipe => Errno::EPIPE,
    }
}
