//! LLM collaborator interface.
//!
//! The engine produces structural diagnoses; a narrator turns one into
//! prose a human can act on. The transport is an external command fed the
//! request as JSON on stdin (the API key travels in its environment, never
//! on the command line). No narrator configured means no prose, never a
//! failed analysis.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use mortem::error::NarrateError;
use mortem::models::LeakDiagnosis;

/// Environment variable naming the narrator command.
pub const ENV_NARRATOR_CMD: &str = "MORTEM_NARRATOR_CMD";

const NARRATE_TIMEOUT: Duration = Duration::from_secs(45);

/// What the collaborator is asked to do with the structural diagnosis.
const INSTRUCTIONS: &str = "Explain, in plain prose for a C programmer, why this allocation leaks: \
walk the ownership trail, name the exact line where the leak became \
inevitable, and propose a minimal fix. Do not restate the raw records.";

/// One function body shown to the narrator.
#[derive(Debug, Clone, Serialize)]
pub struct SourceExcerpt {
    pub function: String,
    pub file: String,
    pub code: String,
}

/// The full request: checker excerpt, per-frame source, and the diagnosis.
#[derive(Debug, Serialize)]
pub struct NarrativeRequest {
    pub checker_excerpt: String,
    pub source_excerpts: Vec<SourceExcerpt>,
    pub diagnosis: LeakDiagnosis,
    pub instructions: String,
}

impl NarrativeRequest {
    pub fn new(
        checker_excerpt: String,
        source_excerpts: Vec<SourceExcerpt>,
        diagnosis: LeakDiagnosis,
    ) -> NarrativeRequest {
        NarrativeRequest {
            checker_excerpt,
            source_excerpts,
            diagnosis,
            instructions: INSTRUCTIONS.to_string(),
        }
    }
}

pub trait Narrator {
    fn narrate(&self, request: &NarrativeRequest) -> Result<String, NarrateError>;
}

/// No transport configured; every request reports `Offline`.
pub struct OfflineNarrator;

impl Narrator for OfflineNarrator {
    fn narrate(&self, _request: &NarrativeRequest) -> Result<String, NarrateError> {
        Err(NarrateError::Offline)
    }
}

/// Shells out to a user-configured command, JSON in, prose out.
pub struct CommandNarrator {
    command: String,
    api_key: String,
    timeout: Duration,
}

impl CommandNarrator {
    pub fn new(command: String, api_key: String) -> CommandNarrator {
        CommandNarrator {
            command,
            api_key,
            timeout: NARRATE_TIMEOUT,
        }
    }
}

impl Narrator for CommandNarrator {
    fn narrate(&self, request: &NarrativeRequest) -> Result<String, NarrateError> {
        let payload = serde_json::to_vec(request).map_err(|e| NarrateError::Malformed {
            detail: format!("request serialization failed: {e}"),
        })?;

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env(mortem::config::ENV_API_KEY, &self.api_key)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| NarrateError::Transport {
                detail: format!("could not spawn narrator: {e}"),
            })?;

        let mut stdin = child.stdin.take().expect("stdin was piped");
        let writer = thread::spawn(move || {
            let _ = stdin.write_all(&payload);
            // Dropping stdin closes the pipe so the command sees EOF.
        });
        let mut stdout = child.stdout.take().expect("stdout was piped");
        let reader = thread::spawn(move || {
            let mut buf = String::new();
            let _ = stdout.read_to_string(&mut buf);
            buf
        });

        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let _ = writer.join();
                    let output = reader.join().unwrap_or_default();
                    if !status.success() {
                        return Err(NarrateError::Transport {
                            detail: format!("narrator exited with {status}"),
                        });
                    }
                    let narrative = output.trim().to_string();
                    if narrative.is_empty() {
                        return Err(NarrateError::Malformed {
                            detail: "narrator produced no text".to_string(),
                        });
                    }
                    return Ok(narrative);
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(NarrateError::Timeout {
                            secs: self.timeout.as_secs(),
                        });
                    }
                    thread::sleep(Duration::from_millis(25));
                }
                Err(e) => {
                    let _ = child.kill();
                    return Err(NarrateError::Transport {
                        detail: format!("wait failed: {e}"),
                    });
                }
            }
        }
    }
}

/// The narrator the environment describes: a command plus a key, or
/// offline.
pub fn from_env(api_key: Option<&str>) -> Box<dyn Narrator> {
    match (std::env::var(ENV_NARRATOR_CMD).ok(), api_key) {
        (Some(cmd), Some(key)) if !cmd.trim().is_empty() => {
            Box::new(CommandNarrator::new(cmd, key.to_string()))
        }
        _ => Box::new(OfflineNarrator),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mortem::models::{Confidence, Frame, LeakKind};

    fn diagnosis() -> LeakDiagnosis {
        LeakDiagnosis {
            leak_id: 1,
            bytes: 32,
            blocks: 1,
            kind: LeakKind::MissingFree,
            site: Frame {
                function: "init".to_string(),
                file: "leaky.c".to_string(),
                line: 9,
            },
            witness_line: 9,
            roots_at_leak: vec!["t".to_string()],
            confidence: Confidence::Dynamic,
            trail: vec!["ALLOC: t in init()".to_string()],
            narrative: None,
        }
    }

    #[test]
    fn test_request_serializes_all_sections() {
        let request = NarrativeRequest::new(
            "32 bytes definitely lost".to_string(),
            vec![SourceExcerpt {
                function: "init".to_string(),
                file: "leaky.c".to_string(),
                code: "char *t = malloc(128);".to_string(),
            }],
            diagnosis(),
        );
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("checker_excerpt"));
        assert!(json.contains("source_excerpts"));
        assert!(json.contains("MissingFree"));
        assert!(json.contains("instructions"));
    }

    #[test]
    fn test_offline_narrator_reports_offline() {
        let request = NarrativeRequest::new(String::new(), Vec::new(), diagnosis());
        let err = OfflineNarrator.narrate(&request).unwrap_err();
        assert!(matches!(err, NarrateError::Offline));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_narrator_round_trip() {
        // `cat` echoes the request back; any stdout counts as prose.
        let narrator = CommandNarrator::new("cat".to_string(), "sk-test".to_string());
        let request = NarrativeRequest::new("excerpt".to_string(), Vec::new(), diagnosis());
        let narrative = narrator.narrate(&request).unwrap();
        assert!(narrative.contains("excerpt"));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_narrator_failure_is_transport_error() {
        let narrator = CommandNarrator::new("exit 3".to_string(), "sk-test".to_string());
        let request = NarrativeRequest::new(String::new(), Vec::new(), diagnosis());
        let err = narrator.narrate(&request).unwrap_err();
        assert!(matches!(err, NarrateError::Transport { .. }));
    }
}
