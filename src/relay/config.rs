//! Configuration resolution for the session relay.
//!
//! This module handles configuration values with a three-tier priority system:
//!
//! 1. **Parameter** - Command-line flag ([`CliArgs`], highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `RELAY_PORT` | 8787 | WebSocket listen port |
//! | `SSH_CONNECT_TIMEOUT` | 30s | Handshake timeout per connection attempt |
//! | `SSH_MAX_RETRIES` | 2 | Maximum retry attempts for transient failures |
//! | `SSH_RETRY_DELAY_MS` | 1000ms | Initial retry delay in milliseconds |
//! | `SSH_COMPRESSION` | true | Enable zlib compression |
//! | `RELAY_TERMINAL_BACKEND` | auto | `auto`, `zellij`, `tmux` or `direct` |
//! | `RELAY_ASSISTANT_CLI` | claude | Assistant CLI binary name |
//! | `RELAY_ASSISTANT_LAUNCH_DELAY_MS` | 1500ms | Delay before typing the CLI invocation |
//! | `RELAY_TAIL_DEBOUNCE_MS` | 150ms | Debounce window for log change notifications |

use std::env;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

use crate::relay::terminal::BackendPreference;

/// Default WebSocket listen port
pub(crate) const DEFAULT_PORT: u16 = 8787;

/// Default SSH connection timeout in seconds
pub(crate) const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default maximum retry attempts for SSH connection
pub(crate) const DEFAULT_MAX_RETRIES: u32 = 2;

/// Default retry delay in milliseconds
pub(crate) const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// Maximum retry delay cap
pub(crate) const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Default assistant CLI binary
pub(crate) const DEFAULT_ASSISTANT_CLI: &str = "claude";

/// Default delay before the assistant invocation is typed into a new session
pub(crate) const DEFAULT_ASSISTANT_LAUNCH_DELAY_MS: u64 = 1500;

/// Default log tailer debounce window in milliseconds
pub(crate) const DEFAULT_TAIL_DEBOUNCE_MS: u64 = 150;

pub(crate) const PORT_ENV_VAR: &str = "RELAY_PORT";
pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";
pub(crate) const MAX_RETRIES_ENV_VAR: &str = "SSH_MAX_RETRIES";
pub(crate) const RETRY_DELAY_MS_ENV_VAR: &str = "SSH_RETRY_DELAY_MS";
pub(crate) const COMPRESSION_ENV_VAR: &str = "SSH_COMPRESSION";
pub(crate) const TERMINAL_BACKEND_ENV_VAR: &str = "RELAY_TERMINAL_BACKEND";
pub(crate) const ASSISTANT_CLI_ENV_VAR: &str = "RELAY_ASSISTANT_CLI";
pub(crate) const ASSISTANT_LAUNCH_DELAY_ENV_VAR: &str = "RELAY_ASSISTANT_LAUNCH_DELAY_MS";
pub(crate) const TAIL_DEBOUNCE_ENV_VAR: &str = "RELAY_TAIL_DEBOUNCE_MS";

/// Resolve a value with priority: parameter -> env var -> default.
///
/// Environment values that fail to parse are ignored.
fn resolve<T: FromStr>(param: Option<T>, env_var: &str, default: T) -> T {
    // Priority 1: Use parameter if provided
    if let Some(value) = param {
        return value;
    }

    // Priority 2: Use environment variable if set
    if let Ok(raw) = env::var(env_var)
        && let Ok(value) = raw.trim().parse::<T>()
    {
        return value;
    }

    // Priority 3: Default value
    default
}

pub(crate) fn resolve_port(port_param: Option<u16>) -> u16 {
    resolve(port_param, PORT_ENV_VAR, DEFAULT_PORT)
}

pub(crate) fn resolve_connect_timeout(timeout_param: Option<u64>) -> Duration {
    Duration::from_secs(resolve(
        timeout_param,
        CONNECT_TIMEOUT_ENV_VAR,
        DEFAULT_CONNECT_TIMEOUT_SECS,
    ))
}

pub(crate) fn resolve_max_retries(max_retries_param: Option<u32>) -> u32 {
    resolve(max_retries_param, MAX_RETRIES_ENV_VAR, DEFAULT_MAX_RETRIES)
}

pub(crate) fn resolve_retry_delay(retry_delay_param: Option<u64>) -> Duration {
    Duration::from_millis(resolve(
        retry_delay_param,
        RETRY_DELAY_MS_ENV_VAR,
        DEFAULT_RETRY_DELAY_MS,
    ))
}

/// Resolve the compression setting with priority: parameter -> env var -> default (true)
pub(crate) fn resolve_compression(compress_param: Option<bool>) -> bool {
    if let Some(compress) = compress_param {
        return compress;
    }

    if let Ok(env_compress) = env::var(COMPRESSION_ENV_VAR) {
        return env_compress.eq_ignore_ascii_case("true") || env_compress == "1";
    }

    true
}

pub(crate) fn resolve_terminal_backend(param: Option<BackendPreference>) -> BackendPreference {
    resolve(param, TERMINAL_BACKEND_ENV_VAR, BackendPreference::Auto)
}

pub(crate) fn resolve_assistant_cli(param: Option<String>) -> String {
    resolve(
        param,
        ASSISTANT_CLI_ENV_VAR,
        DEFAULT_ASSISTANT_CLI.to_string(),
    )
}

pub(crate) fn resolve_assistant_launch_delay(param: Option<u64>) -> Duration {
    Duration::from_millis(resolve(
        param,
        ASSISTANT_LAUNCH_DELAY_ENV_VAR,
        DEFAULT_ASSISTANT_LAUNCH_DELAY_MS,
    ))
}

pub(crate) fn resolve_tail_debounce(param: Option<u64>) -> Duration {
    Duration::from_millis(resolve(
        param,
        TAIL_DEBOUNCE_ENV_VAR,
        DEFAULT_TAIL_DEBOUNCE_MS,
    ))
}

/// SSH connection settings shared by every connection the relay opens.
#[derive(Debug, Clone)]
pub struct SshSettings {
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub compress: bool,
}

/// Local terminal settings.
#[derive(Debug, Clone)]
pub struct TerminalSettings {
    pub backend: BackendPreference,
    pub assistant_cli: String,
    pub assistant_launch_delay: Duration,
}

/// Fully resolved relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    pub ssh: SshSettings,
    pub terminal: TerminalSettings,
    pub tail_debounce: Duration,
}

/// Command-line overrides. A flag left out falls through to its env var.
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "session-relay")]
#[command(about = "Multiplexed SSH shells, persistent local terminals and log tails over WebSocket")]
pub struct CliArgs {
    /// WebSocket listen port
    #[arg(long)]
    pub port: Option<u16>,

    /// SSH handshake timeout per attempt, in seconds
    #[arg(long, value_name = "SECS")]
    pub connect_timeout: Option<u64>,

    /// Retries for transient SSH connect failures
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Initial SSH retry delay, in milliseconds
    #[arg(long, value_name = "MS")]
    pub retry_delay_ms: Option<u64>,

    /// Prefer zlib compression on SSH transports
    #[arg(long)]
    pub compression: Option<bool>,

    /// auto, zellij, tmux or direct
    #[arg(long, value_name = "BACKEND")]
    pub terminal_backend: Option<BackendPreference>,

    /// Assistant CLI binary name
    #[arg(long, value_name = "NAME")]
    pub assistant_cli: Option<String>,

    /// Delay before the assistant invocation is typed, in milliseconds
    #[arg(long, value_name = "MS")]
    pub assistant_launch_delay_ms: Option<u64>,

    /// Log tailer debounce window, in milliseconds
    #[arg(long, value_name = "MS")]
    pub tail_debounce_ms: Option<u64>,
}

impl RelayConfig {
    /// Resolve every setting: flag, then env var, then default.
    pub fn from_args(args: CliArgs) -> Self {
        Self {
            port: resolve_port(args.port),
            ssh: SshSettings {
                connect_timeout: resolve_connect_timeout(args.connect_timeout),
                max_retries: resolve_max_retries(args.max_retries),
                retry_delay: resolve_retry_delay(args.retry_delay_ms),
                compress: resolve_compression(args.compression),
            },
            terminal: TerminalSettings {
                backend: resolve_terminal_backend(args.terminal_backend),
                assistant_cli: resolve_assistant_cli(args.assistant_cli),
                assistant_launch_delay: resolve_assistant_launch_delay(
                    args.assistant_launch_delay_ms,
                ),
            },
            tail_debounce: resolve_tail_debounce(args.tail_debounce_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    // Use a mutex to serialize env var tests to avoid race conditions
    static ENV_TEST_MUTEX: once_cell::sync::Lazy<StdMutex<()>> =
        once_cell::sync::Lazy::new(|| StdMutex::new(()));

    /// SAFETY: Must be called while holding ENV_TEST_MUTEX to prevent data races.
    unsafe fn set_env(key: &str, value: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::set_var(key, value) };
    }

    /// SAFETY: Must be called while holding ENV_TEST_MUTEX to prevent data races.
    unsafe fn remove_env(key: &str) {
        // SAFETY: Caller ensures ENV_TEST_MUTEX is held
        unsafe { env::remove_var(key) };
    }

    mod connect_timeout {
        use super::*;

        #[test]
        fn test_uses_param_when_provided() {
            assert_eq!(resolve_connect_timeout(Some(60)), Duration::from_secs(60));
        }

        #[test]
        fn test_param_takes_priority_over_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(CONNECT_TIMEOUT_ENV_VAR, "120");
            }
            let result = resolve_connect_timeout(Some(45));
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(CONNECT_TIMEOUT_ENV_VAR);
            }
            assert_eq!(result, Duration::from_secs(45));
        }

        #[test]
        fn test_uses_env_var_when_no_param() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(CONNECT_TIMEOUT_ENV_VAR, "90");
            }
            let result = resolve_connect_timeout(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(CONNECT_TIMEOUT_ENV_VAR);
            }
            assert_eq!(result, Duration::from_secs(90));
        }

        #[test]
        fn test_ignores_negative_env_var() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(CONNECT_TIMEOUT_ENV_VAR, "-10");
            }
            let result = resolve_connect_timeout(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(CONNECT_TIMEOUT_ENV_VAR);
            }
            assert_eq!(result, Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS));
        }
    }

    mod retries {
        use super::*;

        #[test]
        fn test_zero_retries_is_valid() {
            assert_eq!(resolve_max_retries(Some(0)), 0);
        }

        #[test]
        fn test_ignores_invalid_env_var() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(MAX_RETRIES_ENV_VAR, "abc");
            }
            let result = resolve_max_retries(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(MAX_RETRIES_ENV_VAR);
            }
            assert_eq!(result, DEFAULT_MAX_RETRIES);
        }

        #[test]
        fn test_retry_delay_from_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(RETRY_DELAY_MS_ENV_VAR, "250");
            }
            let result = resolve_retry_delay(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(RETRY_DELAY_MS_ENV_VAR);
            }
            assert_eq!(result, Duration::from_millis(250));
        }

        #[test]
        fn test_max_retry_delay_is_reasonable() {
            assert!(MAX_RETRY_DELAY.as_secs() >= 5);
            assert!(MAX_RETRY_DELAY.as_secs() <= 60);
        }
    }

    mod compression {
        use super::*;

        #[test]
        fn test_uses_param_false_when_provided() {
            assert!(!resolve_compression(Some(false)));
        }

        #[test]
        fn test_env_var_one_enables() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(COMPRESSION_ENV_VAR, "1");
            }
            let result = resolve_compression(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(COMPRESSION_ENV_VAR);
            }
            assert!(result);
        }

        #[test]
        fn test_env_var_other_disables() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(COMPRESSION_ENV_VAR, "no");
            }
            let result = resolve_compression(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(COMPRESSION_ENV_VAR);
            }
            assert!(!result);
        }
    }

    mod terminal {
        use super::*;

        #[test]
        fn test_backend_from_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(TERMINAL_BACKEND_ENV_VAR, "tmux");
            }
            let result = resolve_terminal_backend(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(TERMINAL_BACKEND_ENV_VAR);
            }
            assert_eq!(result, BackendPreference::Tmux);
        }

        #[test]
        fn test_unknown_backend_falls_back_to_auto() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(TERMINAL_BACKEND_ENV_VAR, "screen");
            }
            let result = resolve_terminal_backend(None);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(TERMINAL_BACKEND_ENV_VAR);
            }
            assert_eq!(result, BackendPreference::Auto);
        }

        #[test]
        fn test_assistant_cli_param_wins() {
            assert_eq!(resolve_assistant_cli(Some("aider".to_string())), "aider");
        }

        #[test]
        fn test_tail_debounce_default_within_window() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(TAIL_DEBOUNCE_ENV_VAR);
            }
            let debounce = resolve_tail_debounce(None);
            assert!(debounce >= Duration::from_millis(100));
            assert!(debounce <= Duration::from_millis(200));
        }
    }

    mod cli {
        use super::*;

        #[test]
        fn test_flags_parse() {
            let args = CliArgs::try_parse_from([
                "session-relay",
                "--port",
                "9000",
                "--terminal-backend",
                "TMUX",
                "--compression",
                "false",
            ])
            .unwrap();
            assert_eq!(args.port, Some(9000));
            assert_eq!(args.terminal_backend, Some(BackendPreference::Tmux));
            assert_eq!(args.compression, Some(false));
            assert_eq!(args.max_retries, None);
        }

        #[test]
        fn test_unknown_backend_flag_rejected() {
            assert!(CliArgs::try_parse_from(["session-relay", "--terminal-backend", "screen"]).is_err());
        }

        #[test]
        fn test_flags_win_over_env() {
            let _guard = ENV_TEST_MUTEX.lock().unwrap();
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                set_env(PORT_ENV_VAR, "7000");
                set_env(MAX_RETRIES_ENV_VAR, "5");
            }
            let args = CliArgs::try_parse_from(["session-relay", "--port", "9000"]).unwrap();
            let config = RelayConfig::from_args(args);
            // SAFETY: Holding ENV_TEST_MUTEX, no concurrent env access
            unsafe {
                remove_env(PORT_ENV_VAR);
                remove_env(MAX_RETRIES_ENV_VAR);
            }
            assert_eq!(config.port, 9000);
            assert_eq!(config.ssh.max_retries, 5);
        }
    }
}
