use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

/// The capability to exempt a socket from being routed back through the
/// tunnel it belongs to. Acquiring this capability is platform-specific and
/// out of scope here — the engine only needs to invoke it on every socket
/// it opens, so it's modeled as an injected function object.
pub type ProtectFn = Arc<dyn Fn(RawFd) -> io::Result<()> + Send + Sync>;

/// A protect function that does nothing, for use in tests and on platforms
/// where no protection is required.
pub fn noop_protect() -> ProtectFn {
    Arc::new(|_fd| Ok(()))
}
