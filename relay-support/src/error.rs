use std::io;

/// Result alias used throughout the relay engine.
pub type RelayResult<T> = Result<T, RelayError>;

/// The relay's error taxonomy distinguishes conditions a worker should
/// retry later (`Wait`) from conditions that must tear down the flow, or
/// the whole engine, immediately.
#[derive(Debug, Eq, PartialEq)]
pub enum RelayError {
    /// The operation would have blocked. Not an error: the caller should
    /// simply move on and try again on the next loop iteration.
    Wait,
    Fatal(FatalReason),
}

#[derive(Debug, Eq, PartialEq)]
pub enum FatalReason {
    /// An I/O error other than `WouldBlock`.
    Io(io::ErrorKind),
    /// A packet or segment violated an assumption the engine relies on.
    Protocol(&'static str),
    /// The socket protection callback failed.
    Protect,
}

impl From<io::Error> for RelayError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => RelayError::Wait,
            kind => RelayError::Fatal(FatalReason::Io(kind)),
        }
    }
}

/// Convenience trait mirroring `ErrorUtils` from the engine this crate is
/// descended from: `Wait` doesn't count as a failure, everything else does.
pub trait ResultExt {
    fn has_failed(&self) -> bool;
}

impl<T> ResultExt for RelayResult<T> {
    #[inline]
    fn has_failed(&self) -> bool {
        !matches!(self, Ok(_) | Err(RelayError::Wait))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_maps_to_wait() {
        let io_err: io::Error = io::ErrorKind::WouldBlock.into();
        assert_eq!(RelayError::from(io_err), RelayError::Wait);
    }

    #[test]
    fn other_io_errors_are_fatal() {
        let io_err: io::Error = io::ErrorKind::ConnectionReset.into();
        assert_eq!(
            RelayError::from(io_err),
            RelayError::Fatal(FatalReason::Io(io::ErrorKind::ConnectionReset))
        );
    }

    #[test]
    fn has_failed_ignores_wait() {
        let wait: RelayResult<()> = Err(RelayError::Wait);
        let fatal: RelayResult<()> = Err(RelayError::Fatal(FatalReason::Protect));
        let ok: RelayResult<()> = Ok(());

        assert!(!wait.has_failed());
        assert!(fatal.has_failed());
        assert!(!ok.has_failed());
    }
}
