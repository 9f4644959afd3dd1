use std::sync::Arc;
use std::time::Duration;

use crate::command::ObjectPosition;
use crate::spawn::{CommandLineLauncher, ToolLauncher};

pub const ENV_CALL_TIMEOUT_MS: &str = "TCLBRIDGE_CALL_TIMEOUT_MS";
pub const ENV_HANDSHAKE_TIMEOUT_MS: &str = "TCLBRIDGE_HANDSHAKE_TIMEOUT_MS";
pub const ENV_EXIT_GRACE_MS: &str = "TCLBRIDGE_EXIT_GRACE_MS";
pub const ENV_DEBUG_REMOTE: &str = "TCLBRIDGE_DEBUG_REMOTE";
pub const ENV_LOG_COMMANDS: &str = "TCLBRIDGE_LOG_COMMANDS";
pub const ENV_LOG_RESULTS: &str = "TCLBRIDGE_LOG_RESULTS";

/// Settings for one [`Session`](crate::Session).
#[derive(Clone)]
pub struct SessionConfig {
    pub launcher: Arc<dyn ToolLauncher>,
    /// Bound on spawn-to-Hello. `None` waits forever.
    pub handshake_timeout: Option<Duration>,
    /// Default bound on each call. `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// How long `close(quit = true)` waits before signalling the child.
    pub exit_grace: Duration,
    pub object_position: ObjectPosition,
    /// Log every command at info level on `tclbridge::command`.
    pub log_commands: bool,
    /// Log every result at info level on `tclbridge::result`.
    pub log_results: bool,
    /// Ask the companion script for debug output on the tool's stderr.
    pub debug_remote: bool,
}

impl std::fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionConfig")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("call_timeout", &self.call_timeout)
            .field("exit_grace", &self.exit_grace)
            .field("object_position", &self.object_position)
            .field("log_commands", &self.log_commands)
            .field("log_results", &self.log_results)
            .field("debug_remote", &self.debug_remote)
            .finish_non_exhaustive()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new(CommandLineLauncher::tclsh())
    }
}

impl SessionConfig {
    pub fn new(launcher: impl ToolLauncher + 'static) -> Self {
        Self {
            launcher: Arc::new(launcher),
            handshake_timeout: Some(Duration::from_secs(300)),
            call_timeout: None,
            exit_grace: Duration::from_secs(10),
            object_position: ObjectPosition::Second,
            log_commands: true,
            log_results: false,
            debug_remote: false,
        }
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn ToolLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.exit_grace = grace;
        self
    }

    pub fn with_object_position(mut self, position: ObjectPosition) -> Self {
        self.object_position = position;
        self
    }

    pub fn with_log_commands(mut self, on: bool) -> Self {
        self.log_commands = on;
        self
    }

    pub fn with_log_results(mut self, on: bool) -> Self {
        self.log_results = on;
        self
    }

    pub fn with_debug_remote(mut self, on: bool) -> Self {
        self.debug_remote = on;
        self
    }

    /// Apply `TCLBRIDGE_*` overrides from the process environment.
    pub fn with_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`. Unparseable values are ignored with a
    /// warning. A timeout of `0` means no timeout.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let millis = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(ms) => Some(ms),
                Err(e) => {
                    tracing::warn!(key, value = %raw, error = %e, "Ignoring invalid duration override");
                    None
                }
            }
        };
        let flag = |key: &str| -> Option<bool> {
            let raw = lookup(key)?;
            match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => {
                    tracing::warn!(key, value = %raw, "Ignoring invalid boolean override");
                    None
                }
            }
        };
        let optional = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));

        if let Some(ms) = millis(ENV_CALL_TIMEOUT_MS) {
            self.call_timeout = optional(ms);
        }
        if let Some(ms) = millis(ENV_HANDSHAKE_TIMEOUT_MS) {
            self.handshake_timeout = optional(ms);
        }
        if let Some(ms) = millis(ENV_EXIT_GRACE_MS) {
            self.exit_grace = Duration::from_millis(ms);
        }
        if let Some(on) = flag(ENV_DEBUG_REMOTE) {
            self.debug_remote = on;
        }
        if let Some(on) = flag(ENV_LOG_COMMANDS) {
            self.log_commands = on;
        }
        if let Some(on) = flag(ENV_LOG_RESULTS) {
            self.log_results = on;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.handshake_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.call_timeout, None);
        assert_eq!(config.exit_grace, Duration::from_secs(10));
        assert_eq!(config.object_position, ObjectPosition::Second);
        assert!(config.log_commands);
        assert!(!config.log_results);
        assert!(!config.debug_remote);

        let spec = config.launcher.spawn_spec(Path::new("/s.tcl"));
        assert_eq!(spec.program, "tclsh");
    }

    #[test]
    fn overrides_apply() {
        let config = SessionConfig::default().apply_overrides(env(&[
            (ENV_CALL_TIMEOUT_MS, "1500"),
            (ENV_HANDSHAKE_TIMEOUT_MS, "0"),
            (ENV_EXIT_GRACE_MS, "250"),
            (ENV_DEBUG_REMOTE, "true"),
            (ENV_LOG_COMMANDS, "0"),
            (ENV_LOG_RESULTS, "yes"),
        ]));
        assert_eq!(config.call_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.handshake_timeout, None);
        assert_eq!(config.exit_grace, Duration::from_millis(250));
        assert!(config.debug_remote);
        assert!(!config.log_commands);
        assert!(config.log_results);
    }

    #[test]
    fn invalid_overrides_are_ignored() {
        let config = SessionConfig::default()
            .with_call_timeout(Some(Duration::from_secs(5)))
            .apply_overrides(env(&[
                (ENV_CALL_TIMEOUT_MS, "soon"),
                (ENV_LOG_COMMANDS, "maybe"),
            ]));
        assert_eq!(config.call_timeout, Some(Duration::from_secs(5)));
        assert!(config.log_commands);
    }

    #[test]
    fn builder_chain() {
        let config = SessionConfig::new(CommandLineLauncher::new("yosys").arg("-c"))
            .with_handshake_timeout(Some(Duration::from_secs(5)))
            .with_object_position(ObjectPosition::Last)
            .with_log_results(true);
        assert_eq!(config.handshake_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.object_position, ObjectPosition::Last);
        assert!(config.log_results);
        let spec = config.launcher.spawn_spec(Path::new("/s.tcl"));
        assert_eq!(spec.program, "yosys");
    }
}
