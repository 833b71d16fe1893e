//! Assistant CLI resolution.
//!
//! The CLI is looked up on `PATH` first, then in the locations its installers
//! commonly use, and finally left as the bare name for the shell to resolve.

use std::env;
use std::path::PathBuf;

use once_cell::sync::Lazy;
use tracing::debug;

static INSTALL_DIRS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    let home = env::var("HOME").ok().map(PathBuf::from);
    let mut dirs = Vec::new();
    if let Some(home) = &home {
        dirs.push(home.join(".claude").join("local"));
        dirs.push(home.join(".local").join("bin"));
    }
    dirs.push(PathBuf::from("/usr/local/bin"));
    dirs.push(PathBuf::from("/opt/homebrew/bin"));
    if let Some(home) = &home {
        dirs.push(home.join(".npm-global").join("bin"));
    }
    dirs
});

/// Resolve the assistant CLI to a path if possible.
pub fn resolve_assistant_cli(name: &str) -> String {
    if let Ok(path) = which::which(name) {
        return path.to_string_lossy().into_owned();
    }

    for dir in INSTALL_DIRS.iter() {
        let candidate = dir.join(name);
        if candidate.is_file() {
            debug!("Resolved {} to {}", name, candidate.display());
            return candidate.to_string_lossy().into_owned();
        }
    }

    debug!("Using PATH fallback for {}", name);
    name.to_string()
}

/// The user's login shell, or `/bin/sh`.
pub fn default_shell() -> String {
    env::var("SHELL")
        .ok()
        .filter(|shell| !shell.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

/// Quote an argument for a POSIX shell command line.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Command line typed into a persistent session to launch the CLI.
pub fn invocation_line(cli: &str, args: &[String]) -> String {
    let mut line = shell_quote(cli);
    for arg in args {
        line.push(' ');
        line.push_str(&shell_quote(arg));
    }
    line.push('\r');
    line
}
