//! Runtime tunables for contexts and communicators.

/// Context configuration.
///
/// All fields have environment overrides read by [`Config::from_env`];
/// the builder starts from those and individual `with_*` setters win.
#[derive(Debug, Clone)]
pub struct Config {
    /// Payloads at or below this size take the eager inject path where the
    /// transport supports one (synchronous local completion, no
    /// completion-queue entry). Env: `TAGCOMM_INJECT_SIZE`.
    pub inject_size: usize,
    /// Maximum completion-queue entries consumed per progress pass.
    /// Env: `TAGCOMM_POLL_BATCH`.
    pub poll_batch: usize,
    /// Nesting depth at which callback-triggered reentrant progress stops
    /// invoking callbacks inline and defers them instead.
    /// Env: `TAGCOMM_PROGRESS_DEPTH`.
    pub progress_depth: u32,
}

pub(crate) const DEFAULT_INJECT_SIZE: usize = 128;
pub(crate) const DEFAULT_POLL_BATCH: usize = 16;
pub(crate) const DEFAULT_PROGRESS_DEPTH: u32 = 8;
/// Per-rank mailbox capacity of the in-process transport, settable per
/// fabric through [`crate::InprocFabric::with_capacity`].
pub(crate) const DEFAULT_MAILBOX_CAPACITY: usize = 1024;

impl Default for Config {
    fn default() -> Self {
        Self {
            inject_size: DEFAULT_INJECT_SIZE,
            poll_batch: DEFAULT_POLL_BATCH,
            progress_depth: DEFAULT_PROGRESS_DEPTH,
        }
    }
}

impl Config {
    /// Default configuration with environment overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_usize("TAGCOMM_INJECT_SIZE") {
            cfg.inject_size = v;
        }
        if let Some(v) = env_usize("TAGCOMM_POLL_BATCH") {
            cfg.poll_batch = v.max(1);
        }
        if let Some(v) = env_usize("TAGCOMM_PROGRESS_DEPTH") {
            cfg.progress_depth = v as u32;
        }
        cfg
    }
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.inject_size, DEFAULT_INJECT_SIZE);
        assert_eq!(cfg.poll_batch, DEFAULT_POLL_BATCH);
        assert_eq!(cfg.progress_depth, DEFAULT_PROGRESS_DEPTH);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("TAGCOMM_POLL_BATCH", "3");
        let cfg = Config::from_env();
        assert_eq!(cfg.poll_batch, 3);
        std::env::remove_var("TAGCOMM_POLL_BATCH");
    }
}
