//! Analysis configuration and the credential store.
//!
//! Everything tunable is an explicit value threaded through constructors;
//! environment variables are applied once, in `from_env`, never read again
//! mid-run.

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::ConfigError;

/// Environment override for the stored API key.
pub const ENV_API_KEY: &str = "MORTEM_API_KEY";
/// Environment override for the tracer step cap.
pub const ENV_MAX_TRACE_STEPS: &str = "MORTEM_MAX_TRACE_STEPS";
/// Advises the tracer in cross-arch emulation contexts.
pub const ENV_PLATFORM: &str = "MORTEM_PLATFORM";

const DEFAULT_MAX_TRACE_STEPS: u32 = 50_000;
const DEFAULT_CHECKER_TIMEOUT: Duration = Duration::from_secs(60);

/// Tunables shared by the whole pipeline.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// Memory-checker binary name or path.
    pub checker: String,
    /// Debugger binary name or path.
    pub debugger: String,
    /// Hard cap on debugger steps; detects runaway tracing, not a
    /// semantic bound on loops.
    pub max_trace_steps: u32,
    /// Functions treated as `free` (argument is released, never descended).
    pub free_wrappers: Vec<String>,
    /// Functions treated as allocators.
    pub allocators: Vec<String>,
    /// Target platform hint for emulation contexts.
    pub platform: Option<String>,
    pub checker_timeout: Duration,
    /// Root of the basename search for source files.
    pub search_root: PathBuf,
}

impl Default for AnalysisConfig {
    fn default() -> AnalysisConfig {
        AnalysisConfig {
            checker: "valgrind".to_string(),
            debugger: "gdb".to_string(),
            max_trace_steps: DEFAULT_MAX_TRACE_STEPS,
            free_wrappers: vec!["free".to_string()],
            allocators: crate::syntax::DEFAULT_ALLOCATORS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            platform: None,
            checker_timeout: DEFAULT_CHECKER_TIMEOUT,
            search_root: PathBuf::from("."),
        }
    }
}

impl AnalysisConfig {
    /// Apply environment overrides on top of the current values.
    pub fn from_env(mut self) -> Result<AnalysisConfig, ConfigError> {
        if let Ok(value) = env::var(ENV_MAX_TRACE_STEPS) {
            self.max_trace_steps = value
                .trim()
                .parse()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::BadStepCap { value })?;
        }
        if let Ok(platform) = env::var(ENV_PLATFORM) {
            if !platform.trim().is_empty() {
                self.platform = Some(platform.trim().to_string());
            }
        }
        Ok(self)
    }
}

/// Cooperative cancellation shared between the pipeline and the tracer.
/// Observed at every trace-step boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> CancelFlag {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Credential store
// ---------------------------------------------------------------------------

/// `$HOME/.config/mortem/credentials`, owner read/write only.
pub fn credentials_path() -> Result<PathBuf, ConfigError> {
    let home = env::var_os("HOME").ok_or(ConfigError::MissingKey)?;
    Ok(PathBuf::from(home).join(".config").join("mortem").join("credentials"))
}

/// Persist the API key with mode 0600.
pub fn store_api_key(key: &str) -> Result<PathBuf, ConfigError> {
    let path = credentials_path()?;
    let parent = path.parent().expect("credentials path has a parent");
    fs::create_dir_all(parent).map_err(|source| ConfigError::CredentialStore {
        path: path.clone(),
        source,
    })?;
    fs::write(&path, format!("{}\n", key.trim())).map_err(|source| {
        ConfigError::CredentialStore {
            path: path.clone(),
            source,
        }
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(&path, perms).map_err(|source| ConfigError::CredentialStore {
            path: path.clone(),
            source,
        })?;
    }
    Ok(path)
}

/// The API key, environment override first, stored credentials second.
pub fn load_api_key() -> Option<String> {
    if let Ok(key) = env::var(ENV_API_KEY) {
        let key = key.trim().to_string();
        if !key.is_empty() {
            return Some(key);
        }
    }
    let path = credentials_path().ok()?;
    let content = fs::read_to_string(path).ok()?;
    let key = content.trim().to_string();
    (!key.is_empty()).then_some(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = AnalysisConfig::default();
        assert_eq!(cfg.checker, "valgrind");
        assert_eq!(cfg.debugger, "gdb");
        assert_eq!(cfg.max_trace_steps, DEFAULT_MAX_TRACE_STEPS);
        assert!(cfg.free_wrappers.contains(&"free".to_string()));
        assert!(cfg.allocators.contains(&"malloc".to_string()));
    }

    #[test]
    fn test_cancel_flag_propagates_between_clones() {
        let flag = CancelFlag::new();
        let shared = flag.clone();
        assert!(!shared.is_cancelled());
        flag.cancel();
        assert!(shared.is_cancelled());
    }

    // Environment mutations live in one test so parallel execution never
    // observes a half-applied override.
    #[test]
    fn test_env_overrides_and_credential_store() {
        let dir = tempfile::tempdir().unwrap();
        let old_home = env::var_os("HOME");
        env::set_var("HOME", dir.path());
        env::remove_var(ENV_API_KEY);

        let path = store_api_key("sk-test-123").unwrap();
        assert!(path.ends_with(".config/mortem/credentials"));
        assert_eq!(load_api_key().as_deref(), Some("sk-test-123"));

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        env::set_var(ENV_API_KEY, "sk-env-override");
        assert_eq!(load_api_key().as_deref(), Some("sk-env-override"));
        env::remove_var(ENV_API_KEY);

        env::set_var(ENV_MAX_TRACE_STEPS, "not-a-number");
        let err = AnalysisConfig::default().from_env().unwrap_err();
        assert!(matches!(err, ConfigError::BadStepCap { .. }));

        env::set_var(ENV_MAX_TRACE_STEPS, "120000");
        let cfg = AnalysisConfig::default().from_env().unwrap();
        assert_eq!(cfg.max_trace_steps, 120_000);
        env::remove_var(ENV_MAX_TRACE_STEPS);

        match old_home {
            Some(h) => env::set_var("HOME", h),
            None => env::remove_var("HOME"),
        }
    }
}
