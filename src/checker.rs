//! Memory-checker process runner.
//!
//! Owns the checker subprocess exclusively for the duration of a run and
//! releases it on every exit path. The checker writes its report to
//! stderr; stdout belongs to the analyzed program and is discarded.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::AnalysisConfig;
use crate::error::{ConfigError, MortemError, TraceError};

/// Checker flags: full leak search, every leak kind listed, and the
/// analyzed program's own exit code passed through untouched.
const CHECKER_FLAGS: &[&str] = &[
    "--leak-check=full",
    "--show-leak-kinds=all",
    "--error-exitcode=0",
];

/// Verify the analysis target before anything is spawned.
pub fn check_target(executable: &Path) -> Result<(), ConfigError> {
    if !executable.exists() {
        return Err(ConfigError::ExecutableNotFound(executable.to_path_buf()));
    }
    if !executable.is_file() || !is_executable(executable) {
        return Err(ConfigError::NotExecutable(executable.to_path_buf()));
    }
    Ok(())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

/// True when `binary --version` runs and exits cleanly.
pub fn binary_available(binary: &str) -> bool {
    Command::new(binary)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Run the checker on the target and return the report text.
pub fn run_checker(
    cfg: &AnalysisConfig,
    executable: &Path,
    args: &[String],
) -> Result<String, MortemError> {
    check_target(executable)?;
    if !binary_available(&cfg.checker) {
        return Err(ConfigError::CheckerMissing {
            name: cfg.checker.clone(),
        }
        .into());
    }

    let mut child = Command::new(&cfg.checker)
        .args(CHECKER_FLAGS)
        .arg(executable)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| TraceError::CheckerFailed {
            detail: format!("could not spawn '{}': {}", cfg.checker, e),
        })?;

    let mut stderr = child.stderr.take().expect("stderr was piped");
    let reader = thread::spawn(move || {
        let mut buf = String::new();
        let _ = stderr.read_to_string(&mut buf);
        buf
    });

    let deadline = Instant::now() + cfg.checker_timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_status)) => break,
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TraceError::CheckerFailed {
                        detail: format!(
                            "checker exceeded {}s timeout; the program may be stuck",
                            cfg.checker_timeout.as_secs()
                        ),
                    }
                    .into());
                }
                thread::sleep(Duration::from_millis(25));
            }
            Err(e) => {
                let _ = child.kill();
                return Err(TraceError::CheckerFailed {
                    detail: format!("wait failed: {e}"),
                }
                .into());
            }
        }
    }

    let report = reader.join().unwrap_or_default();
    if report.trim().is_empty() {
        return Err(TraceError::CheckerFailed {
            detail: "checker produced no report; the program may have crashed first".to_string(),
        }
        .into());
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_check_target_missing() {
        let err = check_target(Path::new("/no/such/binary")).unwrap_err();
        assert!(matches!(err, ConfigError::ExecutableNotFound(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_check_target_not_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        fs::write(&path, "data").unwrap();
        let err = check_target(&path).unwrap_err();
        assert!(matches!(err, ConfigError::NotExecutable(_)));
    }

    #[test]
    fn test_binary_available_for_nonsense_name() {
        assert!(!binary_available("definitely-not-a-real-binary-name"));
    }
}
