//! Fatal-error reporting.
//!
//! The allocator has exactly one way to fail hard: address-space exhaustion at the
//! minimum megablock size, and configuration errors caught during `initialize()`.
//! Neither has a recoverable path in the reference implementation, so neither does
//! here — `fatal` logs and aborts the process rather than returning an error up
//! through allocation call sites that have no way to propagate one (`malloc` itself
//! cannot fail upward except by returning null, which is reserved for the fallback
//! heap's own, separate, error semantics).

/// Log `msg` at error level and abort the process. Never returns.
pub fn fatal(msg: &str) -> ! {
    log::error!("{}", msg);
    std::process::abort();
}
