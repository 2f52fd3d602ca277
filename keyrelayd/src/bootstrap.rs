//! Process hardening for a daemon that holds private keys in memory.
//!
//! [`harden_process`] runs right after logging is set up and before any key
//! file is read.  Each step is best-effort: failure is logged and startup
//! continues.
//!
//! - `PR_SET_DUMPABLE 0` (Linux): no core dumps, and other processes of the
//!   same user cannot attach or read `/proc/<pid>/mem`.
//! - `mlockall(MCL_CURRENT | MCL_FUTURE)`: key pages stay out of swap.  Needs
//!   `CAP_IPC_LOCK` or a sufficient `RLIMIT_MEMLOCK`.

/// Apply all hardening steps.  Returns how many succeeded.
pub fn harden_process() -> usize {
    usize::from(disable_dumps()) + usize::from(lock_memory())
}

#[cfg(target_os = "linux")]
fn disable_dumps() -> bool {
    // SAFETY: PR_SET_DUMPABLE takes plain integer arguments and touches no
    // memory we own.
    let zero: libc::c_ulong = 0;
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, zero, zero, zero, zero) };
    if ret == 0 {
        tracing::info!("core dumps disabled");
        true
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!(error = %err, "PR_SET_DUMPABLE failed, continuing");
        false
    }
}

#[cfg(not(target_os = "linux"))]
fn disable_dumps() -> bool {
    tracing::debug!("core dump suppression not supported on this platform");
    false
}

#[cfg(unix)]
fn lock_memory() -> bool {
    // SAFETY: mlockall has no memory-safety preconditions.
    let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if ret == 0 {
        tracing::info!("process memory locked");
        true
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!(error = %err, "mlockall failed, keys may be swapped");
        false
    }
}

#[cfg(not(unix))]
fn lock_memory() -> bool {
    false
}
