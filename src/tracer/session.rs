//! Line-delimited debugger driver.
//!
//! Speaks GDB's scripted console protocol over pipes: one command in, text
//! until the sentinel prompt out. The session owns the debugger child
//! exclusively and kills it on every exit path, including drop.

use std::io::{Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;

use crate::error::TraceError;

/// Unique prompt so responses can be delimited without guessing.
const SENTINEL: &str = "<<mortem>>";

/// A single command may legitimately take a while (`run` up to the first
/// breakpoint); anything beyond this means the inferior is stuck.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(45);

pub struct DebuggerSession {
    child: Child,
    stdin: ChildStdin,
    rx: mpsc::Receiver<Vec<u8>>,
    buffer: String,
}

impl DebuggerSession {
    /// Spawn the debugger against `executable` with program arguments.
    pub fn spawn(
        debugger: &str,
        executable: &Path,
        args: &[String],
    ) -> Result<DebuggerSession, TraceError> {
        let mut command = Command::new(debugger);
        command
            .arg("--nx")
            .arg("--quiet")
            .args(["-ex", "set pagination off"])
            .args(["-ex", "set confirm off"])
            .args(["-ex", "set width 0"])
            .args(["-ex", "set height 0"])
            .args(["-ex", "set print pretty off"])
            .args(["-ex", &format!("set prompt {SENTINEL}")])
            .arg("--args")
            .arg(executable)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = command.spawn().map_err(TraceError::DebuggerUnavailable)?;
        let stdin = child.stdin.take().expect("stdin was piped");
        let mut stdout = child.stdout.take().expect("stdout was piped");

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut session = DebuggerSession {
            child,
            stdin,
            rx,
            buffer: String::new(),
        };
        // Swallow the banner up to the first prompt.
        session.read_to_prompt()?;
        Ok(session)
    }

    /// Send one command and return everything printed before the next
    /// prompt.
    pub fn command(&mut self, cmd: &str) -> Result<String, TraceError> {
        writeln!(self.stdin, "{cmd}").map_err(|e| TraceError::SessionClosed {
            detail: format!("write failed: {e}"),
        })?;
        self.stdin.flush().map_err(|e| TraceError::SessionClosed {
            detail: format!("flush failed: {e}"),
        })?;
        self.read_to_prompt()
    }

    fn read_to_prompt(&mut self) -> Result<String, TraceError> {
        let deadline = Instant::now() + COMMAND_TIMEOUT;
        loop {
            if let Some(pos) = self.buffer.find(SENTINEL) {
                let response = self.buffer[..pos].to_string();
                self.buffer.drain(..pos + SENTINEL.len());
                return Ok(response);
            }
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| TraceError::SessionClosed {
                    detail: "debugger did not return to its prompt".to_string(),
                })?;
            match self.rx.recv_timeout(remaining) {
                Ok(chunk) => self.buffer.push_str(&String::from_utf8_lossy(&chunk)),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    return Err(TraceError::SessionClosed {
                        detail: "debugger did not return to its prompt".to_string(),
                    })
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(TraceError::SessionClosed {
                        detail: "debugger closed its output".to_string(),
                    })
                }
            }
        }
    }

    pub fn close(&mut self) {
        let _ = writeln!(self.stdin, "quit");
        let _ = self.stdin.flush();
        // Drop kills whatever is left.
    }
}

impl Drop for DebuggerSession {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Where execution stopped after `run`/`step`/`next`/`finish`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopInfo {
    pub function: Option<String>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub exited: bool,
}

/// One frame of a `backtrace` response, outermost last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub index: u32,
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

pub fn parse_stop(output: &str) -> StopInfo {
    let location =
        Regex::new(r"(?m)^(?:Breakpoint \d+, )?(?:0x[0-9a-fA-F]+ in )?([A-Za-z_]\w*) \(.*\) at (\S+):(\d+)\s*$")
            .expect("Invalid stop pattern");
    let line_echo = Regex::new(r"(?m)^(\d+)\t").expect("Invalid echo pattern");
    let exited = Regex::new(r"exited (?:normally|with code)").expect("Invalid exit pattern");

    let mut info = StopInfo::default();
    if exited.is_match(output) {
        info.exited = true;
        return info;
    }
    // The location header appears on function transitions; take the last
    // one printed so `finish` responses resolve to the frame landed in.
    if let Some(cap) = location.captures_iter(output).last() {
        info.function = Some(cap[1].to_string());
        info.file = Some(cap[2].to_string());
        info.line = cap[3].parse().ok();
    }
    // The source echo is printed last and is authoritative for the line.
    if let Some(cap) = line_echo.captures_iter(output).last() {
        if let Ok(n) = cap[1].parse() {
            info.line = Some(n);
        }
    }
    info
}

pub fn parse_backtrace(output: &str) -> Vec<StackFrame> {
    let frame =
        Regex::new(r"(?m)^#(\d+)\s+(?:0x[0-9a-fA-F]+ in )?([A-Za-z_?][\w?]*) \(.*\)(?: at (\S+):(\d+))?")
            .expect("Invalid frame pattern");
    frame
        .captures_iter(output)
        .map(|cap| StackFrame {
            index: cap[1].parse().unwrap_or(0),
            function: cap[2].to_string(),
            file: cap.get(3).map(|m| m.as_str().to_string()),
            line: cap.get(4).and_then(|m| m.as_str().parse().ok()),
        })
        .collect()
}

/// Names bound in the current frame, from `info locals`.
pub fn parse_locals(output: &str) -> Vec<String> {
    let binding = Regex::new(r"(?m)^([A-Za-z_]\w*) = ").expect("Invalid locals pattern");
    binding
        .captures_iter(output)
        .map(|cap| cap[1].to_string())
        .collect()
}

/// Numeric value from a `print` response, e.g. `$3 = (char *) 0x5596a0 "x"`.
pub fn parse_print_value(output: &str) -> Option<i64> {
    let value = Regex::new(r"\$\d+ = (?:\([^)]*\) )?(-?\d+|0x[0-9a-fA-F]+)")
        .expect("Invalid print pattern");
    let cap = value.captures(output)?;
    let text = &cap[1];
    if let Some(hex) = text.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok().map(|v| v as i64)
    } else {
        text.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stop_at_breakpoint() {
        let out = "Breakpoint 1, main () at leaky.c:12\n12\t    char *p = malloc(32);\n";
        let stop = parse_stop(out);
        assert_eq!(stop.function.as_deref(), Some("main"));
        assert_eq!(stop.file.as_deref(), Some("leaky.c"));
        assert_eq!(stop.line, Some(12));
        assert!(!stop.exited);
    }

    #[test]
    fn test_parse_stop_same_function_step() {
        let out = "13\t    strcpy(p, \"a\");\n";
        let stop = parse_stop(out);
        assert_eq!(stop.line, Some(13));
        assert!(stop.function.is_none());
    }

    #[test]
    fn test_parse_stop_function_entry_with_string_args() {
        let out = "mk (a=0x402010 \"n(\", b=0x402012 \"a\") at leaky.c:7\n7\t    Pair *p = malloc(sizeof *p);\n";
        let stop = parse_stop(out);
        assert_eq!(stop.function.as_deref(), Some("mk"));
        assert_eq!(stop.line, Some(7));
    }

    #[test]
    fn test_parse_stop_after_finish() {
        let out = "Run till exit from #0  mk (a=..., b=...) at leaky.c:7\n\
0x000055555555527a in main () at leaky.c:15\n\
15\t    Pair *q = mk(\"n\", \"a\");\n\
Value returned is $1 = (Pair *) 0x5555555592a0\n";
        let stop = parse_stop(out);
        assert_eq!(stop.function.as_deref(), Some("main"));
        assert_eq!(stop.line, Some(15));
    }

    #[test]
    fn test_parse_stop_program_exit() {
        let stop = parse_stop("[Inferior 1 (process 4242) exited normally]\n");
        assert!(stop.exited);
        let stop = parse_stop("[Inferior 1 (process 4242) exited with code 01]\n");
        assert!(stop.exited);
    }

    #[test]
    fn test_parse_backtrace() {
        let out = "#0  mk (a=0x402010 \"n\", b=0x402012 \"a\") at leaky.c:7\n\
#1  0x00005555555552a0 in main () at leaky.c:15\n";
        let frames = parse_backtrace(out);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].function, "mk");
        assert_eq!(frames[0].line, Some(7));
        assert_eq!(frames[1].function, "main");
        assert_eq!(frames[1].file.as_deref(), Some("leaky.c"));
    }

    #[test]
    fn test_parse_backtrace_frame_without_source() {
        let out = "#0  __libc_start_call_main (main=0x555555555220) \n";
        let frames = parse_backtrace(out);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].file.is_none());
    }

    #[test]
    fn test_parse_locals() {
        let out = "p = 0x5555555592a0\nn = 5\n";
        assert_eq!(parse_locals(out), vec!["p".to_string(), "n".to_string()]);
        assert!(parse_locals("No locals.\n").is_empty());
    }

    #[test]
    fn test_parse_print_values() {
        assert_eq!(
            parse_print_value("$1 = (char *) 0x10 \"x\""),
            Some(0x10)
        );
        assert_eq!(parse_print_value("$2 = 93824992236080"), Some(93824992236080));
        assert_eq!(parse_print_value("$3 = -1"), Some(-1));
        assert_eq!(parse_print_value("No symbol \"q\" in current context."), None);
    }
}
