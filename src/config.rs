//! Runtime configuration.
//!
//! Mirrors the shape of the teacher's `broker::state::RingConfig`: a
//! small plain struct built once from CLI flags and threaded through to
//! whichever subsystem needs it, rather than each module reading the
//! environment itself.

use std::time::Duration;

/// Knobs that don't change once a controller process has started.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Path to the `ssh` binary used for remote contexts (spec §4.7).
    pub ssh_path: String,
    /// Path to this runtime's binary on a remote host, for SSH-spawned
    /// contexts (spec §4.7, Non-goals: provisioning it there is out of
    /// scope).
    pub remote_binary: String,
    /// Default deadline for `Call` when the caller doesn't specify one.
    /// `None` mirrors the source material's `Call` (spec §4.5) blocking
    /// forever.
    pub default_call_deadline: Option<Duration>,
    /// Maximum frame payload size accepted on any stream (spec §4.1).
    pub max_frame_len: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ssh_path: "ssh".to_string(),
            remote_binary: "remctxd".to_string(),
            default_call_deadline: None,
            max_frame_len: crate::stream::MAX_FRAME_LEN,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_blocks_forever_by_default() {
        let config = RuntimeConfig::default();
        assert_eq!(config.default_call_deadline, None);
        assert_eq!(config.ssh_path, "ssh");
    }
}
