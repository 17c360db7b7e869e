//! plugin::sandbox
//!
//! Process-level sandboxing for plugin children.
//!
//! # Architecture
//!
//! Before `exec`, a plugin child gets:
//!
//! - A filtered environment: the essential set plus the configured
//!   allow-list, unless the plugin's capabilities permit full env read
//! - Its own process group (`setpgid`), so timeouts and kills reach the
//!   whole descendant tree
//! - Best-effort resource limits: on Linux `RLIMIT_AS`/`RLIMIT_DATA`,
//!   `RLIMIT_NOFILE`, and `RLIMIT_CPU` from the configured limits plus a
//!   nice level derived from the CPU share; on macOS only `RLIMIT_DATA`
//!   (weaker enforcement, logged); elsewhere nothing, and the host
//!   relies on timeouts alone.

use std::collections::HashMap;

use crate::core::config::{PluginCapabilities, PluginLimits};

/// Environment variables always forwarded to plugin children.
pub const ESSENTIAL_ENV: [&str; 8] = [
    "PATH", "HOME", "USER", "SHELL", "LANG", "LC_ALL", "TZ", "TMPDIR",
];

/// Compute the environment for a plugin child.
///
/// With `read_env` granted and no allow-list, the full parent
/// environment passes through. Otherwise only [`ESSENTIAL_ENV`] plus the
/// allow-list is forwarded.
pub fn filtered_env(
    capabilities: &PluginCapabilities,
    allowlist: &[String],
) -> HashMap<String, String> {
    if capabilities.read_env && allowlist.is_empty() {
        return std::env::vars().collect();
    }

    let mut env = HashMap::new();
    for key in ESSENTIAL_ENV {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.to_string(), value);
        }
    }
    for key in allowlist {
        if let Ok(value) = std::env::var(key) {
            env.insert(key.clone(), value);
        }
    }
    env
}

/// Apply the sandbox to a command: env filtering, process group, and
/// resource limits.
pub fn apply(
    command: &mut tokio::process::Command,
    capabilities: &PluginCapabilities,
    allowlist: &[String],
    limits: &PluginLimits,
) {
    command.env_clear();
    command.envs(filtered_env(capabilities, allowlist));

    #[cfg(target_os = "macos")]
    if limits.max_memory_mb.is_some() || limits.max_cpu_seconds.is_some() {
        tracing::warn!(
            "resource limit enforcement on macOS is best-effort (RLIMIT_DATA only)"
        );
    }

    #[cfg(unix)]
    {
        let limits = limits.clone();
        // SAFETY: pre_exec runs after fork and before exec; only
        // async-signal-safe calls are made (setpgid, setrlimit, nice).
        unsafe {
            command.pre_exec(move || {
                // Own process group so signals reach descendants.
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                apply_rlimits(&limits);
                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    {
        let _ = limits;
        tracing::warn!("no process sandbox on this platform; relying on timeouts");
    }
}

#[cfg(target_os = "linux")]
fn apply_rlimits(limits: &PluginLimits) {
    if let Some(mb) = limits.max_memory_mb {
        let bytes = mb.saturating_mul(1024 * 1024);
        set_rlimit(libc::RLIMIT_AS as libc::c_int, bytes);
        set_rlimit(libc::RLIMIT_DATA as libc::c_int, bytes);
    }
    if let Some(fds) = limits.max_file_descriptors {
        set_rlimit(libc::RLIMIT_NOFILE as libc::c_int, fds);
    }
    if let Some(secs) = limits.max_cpu_seconds {
        set_rlimit(libc::RLIMIT_CPU as libc::c_int, secs);
    }
    if let Some(percent) = limits.max_cpu_percent {
        // Map a reduced CPU share onto a positive nice level.
        if percent < 100 {
            let level = (100u32.saturating_sub(percent) / 10).min(19) as libc::c_int;
            // SAFETY: nice is async-signal-safe.
            unsafe {
                libc::nice(level);
            }
        }
    }
}

#[cfg(target_os = "macos")]
fn apply_rlimits(limits: &PluginLimits) {
    if let Some(mb) = limits.max_memory_mb {
        set_rlimit(libc::RLIMIT_DATA as libc::c_int, mb.saturating_mul(1024 * 1024));
    }
}

#[cfg(all(unix, not(any(target_os = "linux", target_os = "macos"))))]
fn apply_rlimits(_limits: &PluginLimits) {}

#[cfg(unix)]
fn set_rlimit(resource: libc::c_int, value: u64) {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    // SAFETY: passing a valid rlimit struct; failure is tolerated
    // (best-effort limits).
    unsafe {
        libc::setrlimit(resource as _, &limit);
    }
}
