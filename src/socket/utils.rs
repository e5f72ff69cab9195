//! Utility functions for socket operations

/// Check if running as root
pub fn is_root() -> bool {
    #[cfg(unix)]
    {
        // SAFETY: geteuid has no preconditions and cannot fail
        unsafe { libc::geteuid() == 0 }
    }
    #[cfg(not(unix))]
    {
        // No cheap equivalent of euid 0 elsewhere
        false
    }
}

/// Hint printed by the CLI before probing without privileges
pub fn privilege_hint() -> Option<&'static str> {
    if is_root() {
        None
    } else if cfg!(target_os = "linux") {
        Some("raw sockets need root or CAP_NET_RAW; probes will fail without them")
    } else {
        Some("raw sockets need administrator privileges; probes will fail without them")
    }
}
