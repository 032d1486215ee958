use std::path::PathBuf;

use heapdump_types::Flags;

use crate::isolation::ForkFallback;
use crate::trigger::parse_signal;

pub const OPTIONS_ENV: &str = "HEAPDUMP_OPTIONS";
pub const DIR_ENV: &str = "HEAPDUMP_DIR";
pub const SIGNAL_ENV: &str = "HEAPDUMP_SIGNAL";
pub const FORK_FALLBACK_ENV: &str = "HEAPDUMP_FORK_FALLBACK";

pub const DEFAULT_SIGNAL: i32 = libc::SIGUSR2;

/// Everything a [`Dumper`](crate::Dumper) needs besides the heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub flags: Flags,
    /// Directory for auto-generated snapshot paths.
    pub output_dir: PathBuf,
    pub signal: i32,
    pub fork_fallback: ForkFallback,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flags: Flags::default(),
            output_dir: PathBuf::from("."),
            signal: DEFAULT_SIGNAL,
            fork_fallback: ForkFallback::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`Config::from_env`], reading variables through `lookup`.
    ///
    /// Bad values are reported with `tracing::warn!` and replaced by the
    /// default; configuration never fails here.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(raw) = lookup(OPTIONS_ENV) {
            let parsed = Flags::parse_options(&raw);
            for token in &parsed.unrecognized {
                tracing::warn!(option = %token, env = OPTIONS_ENV, "unrecognized option");
            }
            config.flags = parsed.flags;
        }

        if let Some(dir) = lookup(DIR_ENV).filter(|dir| !dir.trim().is_empty()) {
            config.output_dir = PathBuf::from(dir);
        }

        if let Some(raw) = lookup(SIGNAL_ENV) {
            match parse_signal(&raw) {
                Some(signal) => config.signal = signal,
                None => tracing::warn!(
                    value = %raw,
                    env = SIGNAL_ENV,
                    default = DEFAULT_SIGNAL,
                    "invalid signal, using default"
                ),
            }
        }

        if let Some(raw) = lookup(FORK_FALLBACK_ENV) {
            match raw.trim().to_ascii_lowercase().as_str() {
                "inprocess" | "in_process" | "in-process" => {
                    config.fork_fallback = ForkFallback::InProcess
                }
                "fail" => config.fork_fallback = ForkFallback::Fail,
                _ => tracing::warn!(
                    value = %raw,
                    env = FORK_FALLBACK_ENV,
                    "invalid fork fallback, using inprocess"
                ),
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = config_from(&[]);
        assert_eq!(config, Config::default());
        assert!(config.flags.no_fork());
        assert!(!config.flags.no_signal());
        assert_eq!(config.signal, libc::SIGUSR2);
    }

    #[test]
    fn every_variable_is_applied() {
        let config = config_from(&[
            (OPTIONS_ENV, "fork, nosignal"),
            (DIR_ENV, "/var/tmp/dumps"),
            (SIGNAL_ENV, "SIGUSR1"),
            (FORK_FALLBACK_ENV, "fail"),
        ]);
        assert!(!config.flags.no_fork());
        assert!(config.flags.no_signal());
        assert_eq!(config.output_dir, PathBuf::from("/var/tmp/dumps"));
        assert_eq!(config.signal, libc::SIGUSR1);
        assert_eq!(config.fork_fallback, ForkFallback::Fail);
    }

    #[test]
    fn bad_values_fall_back_to_defaults() {
        let config = config_from(&[
            (OPTIONS_ENV, "bogus,fork"),
            (DIR_ENV, "  "),
            (SIGNAL_ENV, "SIGNOPE"),
            (FORK_FALLBACK_ENV, "maybe"),
        ]);
        assert!(!config.flags.no_fork());
        assert_eq!(config.output_dir, PathBuf::from("."));
        assert_eq!(config.signal, DEFAULT_SIGNAL);
        assert_eq!(config.fork_fallback, ForkFallback::InProcess);
    }

    #[test]
    fn unusable_signals_fall_back_to_default() {
        for raw in ["9", "SIGSTOP", "11", "SEGV", "0"] {
            let config = config_from(&[(SIGNAL_ENV, raw)]);
            assert_eq!(config.signal, DEFAULT_SIGNAL, "{raw}");
        }
    }
}
