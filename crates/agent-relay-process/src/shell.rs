//! Executable resolution and the non-interactive launch environment.

use std::{
    collections::HashSet,
    env::{join_paths, split_paths},
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
    sync::OnceLock,
};

/// Variables that keep launched tools from assuming an interactive terminal.
pub const NON_INTERACTIVE_ENV: &[(&str, &str)] = &[
    ("TERM", "dumb"),
    ("NO_COLOR", "1"),
    ("FORCE_COLOR", "0"),
    ("CLICOLOR", "0"),
];

/// PATH reported by the user's login shell, fetched at most once.
static LOGIN_SHELL_PATH: OnceLock<Option<OsString>> = OnceLock::new();

/// Resolve an executable by name.
///
/// The search order is:
/// 1. Explicit paths (absolute or containing a separator).
/// 2. The augmented search path (see [`augmented_path`]).
/// 3. The same, after asking the login shell for its PATH.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.components().count() > 1 || path.is_absolute() {
        return path.is_file().then(|| path.to_path_buf());
    }

    if let Some(found) = which_async(executable, augmented_path()).await {
        return Some(found);
    }

    if refresh_login_shell_path().await {
        if let Some(found) = which_async(executable, augmented_path()).await {
            return Some(found);
        }
    }

    None
}

/// The search path handed to launched agents.
///
/// Current `PATH`, then the login shell's PATH once it has been fetched,
/// then the usual per-user install locations.
#[must_use]
pub fn augmented_path() -> OsString {
    let mut merged = std::env::var_os("PATH").unwrap_or_default();
    if let Some(Some(login)) = LOGIN_SHELL_PATH.get() {
        merged = merge_paths(&merged, login);
    }
    let extra: Vec<PathBuf> = well_known_dirs();
    if let Ok(extra) = join_paths(extra) {
        merged = merge_paths(&merged, extra);
    }
    merged
}

/// Merge two PATH strings into a single, de-duplicated PATH.
#[must_use]
pub fn merge_paths(primary: impl AsRef<OsStr>, secondary: impl AsRef<OsStr>) -> OsString {
    let mut seen = HashSet::<PathBuf>::new();
    let mut merged = Vec::<PathBuf>::new();

    for p in split_paths(primary.as_ref()).chain(split_paths(secondary.as_ref())) {
        if !p.as_os_str().is_empty() && seen.insert(p.clone()) {
            merged.push(p);
        }
    }

    join_paths(merged).unwrap_or_default()
}

fn well_known_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Some(home) = dirs::home_dir() {
        dirs.push(home.join(".local/bin"));
        dirs.push(home.join(".cargo/bin"));
        dirs.push(home.join(".npm-global/bin"));
        dirs.push(home.join(".bun/bin"));
    }
    if cfg!(unix) {
        dirs.push(PathBuf::from("/usr/local/bin"));
        dirs.push(PathBuf::from("/opt/homebrew/bin"));
    }
    dirs
}

/// Fetch the login shell's PATH once. Returns true if it added anything.
async fn refresh_login_shell_path() -> bool {
    if LOGIN_SHELL_PATH.get().is_some() {
        return false;
    }
    let fresh = get_fresh_path().await.map(OsString::from);
    let before = augmented_path();
    let _ = LOGIN_SHELL_PATH.set(fresh);
    let after = augmented_path();
    if after == before {
        return false;
    }
    tracing::debug!(?before, ?after, "Refreshed agent search path from login shell");
    true
}

async fn which_async(executable: &str, search_path: OsString) -> Option<PathBuf> {
    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        which::which_in(executable, Some(search_path), cwd)
    })
    .await
    .ok()
    .and_then(Result::ok)
}

/// Unix shell types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnixShell {
    Zsh(PathBuf),
    Bash(PathBuf),
    Sh(PathBuf),
    Other(PathBuf),
}

impl UnixShell {
    /// Get the shell path.
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            Self::Zsh(p) | Self::Bash(p) | Self::Sh(p) | Self::Other(p) => p,
        }
    }

    /// Whether this shell supports login mode.
    #[must_use]
    pub const fn login(&self) -> bool {
        matches!(self, Self::Zsh(_) | Self::Bash(_))
    }

    /// Get the current shell from `$SHELL`.
    #[must_use]
    pub fn current_shell() -> Self {
        std::env::var("SHELL")
            .ok()
            .and_then(|shell| Self::from_path(Path::new(&shell)))
            .unwrap_or_else(|| Self::Sh(PathBuf::from("/bin/sh")))
    }

    /// Create from a path.
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        if !(path.is_absolute() && path.is_file()) {
            return None;
        }
        let path_buf = path.to_path_buf();
        Some(match path.file_name().and_then(OsStr::to_str) {
            Some("zsh") => Self::Zsh(path_buf),
            Some("bash") => Self::Bash(path_buf),
            Some("sh") => Self::Sh(path_buf),
            _ => Self::Other(path_buf),
        })
    }
}

#[cfg(not(windows))]
async fn get_fresh_path() -> Option<String> {
    use std::{process::Stdio, time::Duration};

    use tokio::process::Command;

    const PATH_REFRESH_TIMEOUT: Duration = Duration::from_secs(5);

    let shell = UnixShell::current_shell();
    let mut cmd = Command::new(shell.path());
    if shell.login() {
        cmd.arg("-l");
    }
    cmd.arg("-c")
        .arg("printf '%s' \"$PATH\"")
        .env("TERM", "dumb")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let child = cmd.spawn().ok()?;
    let output = match tokio::time::timeout(PATH_REFRESH_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            tracing::debug!(shell = %shell.path().display(), ?err, "Failed to read PATH from login shell");
            return None;
        }
        Err(_) => {
            tracing::warn!(shell = %shell.path().display(), "Timed out reading PATH from login shell");
            return None;
        }
    };

    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8(output.stdout).ok()?.trim().to_string();
    (!path.is_empty()).then_some(path)
}

#[cfg(windows)]
async fn get_fresh_path() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_paths_dedupes_in_order() {
        let a = join_paths(["/usr/bin", "/bin"]).unwrap();
        let b = join_paths(["/bin", "/opt/bin", ""]).unwrap();
        let merged: Vec<PathBuf> = split_paths(&merge_paths(a, b)).collect();
        assert_eq!(
            merged,
            vec![
                PathBuf::from("/usr/bin"),
                PathBuf::from("/bin"),
                PathBuf::from("/opt/bin")
            ]
        );
    }

    #[test]
    fn test_augmented_path_keeps_current_path_first() {
        let current = std::env::var_os("PATH").unwrap_or_default();
        let first_current = split_paths(&current).find(|p| !p.as_os_str().is_empty());
        let first_augmented = split_paths(&augmented_path()).next();
        if let Some(first) = first_current {
            assert_eq!(first_augmented, Some(first));
        }
    }

    #[tokio::test]
    async fn test_resolve_absolute_and_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("agent");
        std::fs::write(&file, "").unwrap();

        let found = resolve_executable_path(file.to_str().unwrap()).await;
        assert_eq!(found, Some(file.clone()));

        let missing = tmp.path().join("missing");
        assert_eq!(resolve_executable_path(missing.to_str().unwrap()).await, None);
        assert_eq!(resolve_executable_path("   ").await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resolve_on_path() {
        assert!(resolve_executable_path("sh").await.is_some());
    }
}
