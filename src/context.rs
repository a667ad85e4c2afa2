//! Source-context extraction.
//!
//! Partitions a C file into top-level function definitions by
//! brace-balanced scanning, tolerant of braces inside string and character
//! literals and inside comments. No type parsing happens here: a
//! definition is anything shaped `ident(...) { ... }` at the top level.
//!
//! Loaded files are shared immutably across concurrent analyses via the
//! `SourceCache`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::ContextError;
use crate::models::{basename, FunctionView};
use crate::syntax;

/// Directory levels searched when the checker's recorded path does not
/// exist under the working tree.
const MAX_SEARCH_DEPTH: u32 = 5;

/// One loaded source file. `lines` are verbatim, without trailing newlines.
#[derive(Debug)]
pub struct SourceFile {
    pub path: PathBuf,
    pub lines: Vec<String>,
    /// True when invalid UTF-8 appeared outside string/char literals;
    /// such files cannot be partitioned into functions.
    tainted: bool,
}

/// Immutable, shared per-file buffers. Load once, read from any analysis.
pub struct SourceCache {
    search_root: PathBuf,
    files: Mutex<HashMap<String, Option<Arc<SourceFile>>>>,
}

impl SourceCache {
    pub fn new(search_root: PathBuf) -> SourceCache {
        SourceCache {
            search_root,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Load (or fetch from cache) the file the checker named. Falls back to
    /// a bounded basename search when the recorded path does not exist.
    pub fn load(&self, file: &str) -> Result<Arc<SourceFile>, ContextError> {
        let mut files = self.files.lock().expect("source cache poisoned");
        if let Some(entry) = files.get(file) {
            return entry.clone().ok_or_else(|| ContextError::FileNotFound {
                file: file.to_string(),
            });
        }

        let resolved = self.resolve_path(file);
        let loaded = resolved.and_then(|path| read_source(path).ok().map(Arc::new));
        files.insert(file.to_string(), loaded.clone());
        loaded.ok_or_else(|| ContextError::FileNotFound {
            file: file.to_string(),
        })
    }

    /// Verbatim text of one line (1-indexed), or `None`.
    pub fn line_text(&self, file: &str, line: u32) -> Option<String> {
        if line == 0 {
            return None;
        }
        let src = self.load(file).ok()?;
        src.lines.get(line as usize - 1).cloned()
    }

    /// The function whose definition contains `line`.
    pub fn function_at(&self, file: &str, line: u32) -> Result<FunctionView, ContextError> {
        let src = self.load(file)?;
        function_containing(&src, line)
    }

    fn resolve_path(&self, file: &str) -> Option<PathBuf> {
        let direct = Path::new(file);
        if direct.is_file() {
            return Some(direct.to_path_buf());
        }
        let under_root = self.search_root.join(file);
        if under_root.is_file() {
            return Some(under_root);
        }
        find_by_name(&self.search_root, basename(file), 0)
    }
}

fn find_by_name(dir: &Path, name: &str, depth: u32) -> Option<PathBuf> {
    if depth > MAX_SEARCH_DEPTH {
        return None;
    }
    let entries = fs::read_dir(dir).ok()?;
    let mut subdirs = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_file() && path.file_name().is_some_and(|f| f == name) {
            return Some(path);
        }
        if path.is_dir() {
            subdirs.push(path);
        }
    }
    for sub in subdirs {
        if let Some(found) = find_by_name(&sub, name, depth + 1) {
            return Some(found);
        }
    }
    None
}

fn read_source(path: PathBuf) -> Result<SourceFile, ContextError> {
    let bytes = fs::read(&path).map_err(|_| ContextError::FileNotFound {
        file: path.display().to_string(),
    })?;
    let text = String::from_utf8_lossy(&bytes);
    let had_invalid = matches!(text, std::borrow::Cow::Owned(_));
    let lines: Vec<String> = text.lines().map(str::to_string).collect();
    let tainted = had_invalid && invalid_outside_literals(&lines);
    Ok(SourceFile {
        path,
        lines,
        tainted,
    })
}

// ---------------------------------------------------------------------------
// Brace-balanced partitioning
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Lex {
    Code,
    LineComment,
    BlockComment,
    Str,
    Char,
}

struct Span {
    start_line: u32,
    end_line: u32,
    header: String,
}

/// Extract the function definition containing `line` (1-indexed).
pub fn function_containing(src: &SourceFile, line: u32) -> Result<FunctionView, ContextError> {
    let file = src.path.display().to_string();
    if src.tainted {
        return Err(ContextError::NotUtf8 { file });
    }

    let span = scan_spans(&src.lines)
        .into_iter()
        .find(|s| line >= s.start_line && line <= s.end_line)
        .ok_or(ContextError::Unresolved {
            file: file.clone(),
            line,
        })?;

    let body_lines: Vec<(u32, String)> = (span.start_line..=span.end_line)
        .map(|n| (n, src.lines[n as usize - 1].clone()))
        .collect();
    let full_text: String = body_lines
        .iter()
        .map(|(_, t)| t.as_str())
        .collect::<Vec<_>>()
        .join("\n");

    let (name, params, signature) = match syntax::parse_signature(&full_text) {
        Some(sig) => (sig.name, sig.params, sig.raw),
        None => {
            // Fallback: last identifier before the opening paren of the
            // header, parameters split textually.
            let (name, params) = textual_signature(&span.header).ok_or(
                ContextError::Unresolved {
                    file: file.clone(),
                    line,
                },
            )?;
            let raw = format!("{}({})", name, params.join(", "));
            (name, params, raw)
        }
    };

    Ok(FunctionView {
        name,
        signature,
        params,
        file,
        start_line: span.start_line,
        end_line: span.end_line,
        body_lines,
    })
}

/// Top-level `ident(...) { ... }` spans, in file order.
fn scan_spans(lines: &[String]) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut state = Lex::Code;
    let mut depth: i32 = 0;
    let mut header = String::new();
    let mut header_start: Option<u32> = None;
    let mut open: Option<(u32, String)> = None;

    for (idx, raw) in lines.iter().enumerate() {
        let line_no = idx as u32 + 1;
        if state == Lex::LineComment {
            state = Lex::Code;
        }
        if state == Lex::Code && depth == 0 && raw.trim_start().starts_with('#') {
            // Preprocessor lines never contribute to a signature.
            header.clear();
            header_start = None;
            continue;
        }

        let chars: Vec<char> = raw.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();
            match state {
                Lex::LineComment => break,
                Lex::BlockComment => {
                    if c == '*' && next == Some('/') {
                        state = Lex::Code;
                        i += 1;
                    }
                }
                Lex::Str => match c {
                    '\\' => i += 1,
                    '"' => state = Lex::Code,
                    _ => {}
                },
                Lex::Char => match c {
                    '\\' => i += 1,
                    '\'' => state = Lex::Code,
                    _ => {}
                },
                Lex::Code => match c {
                    '/' if next == Some('/') => {
                        state = Lex::LineComment;
                    }
                    '/' if next == Some('*') => {
                        state = Lex::BlockComment;
                        i += 1;
                    }
                    '"' => state = Lex::Str,
                    '\'' => state = Lex::Char,
                    '{' => {
                        depth += 1;
                        if depth == 1 {
                            let h = header.trim().to_string();
                            if looks_like_function_header(&h) {
                                open = Some((header_start.unwrap_or(line_no), h));
                            } else {
                                open = None;
                            }
                            header.clear();
                            header_start = None;
                        }
                    }
                    '}' => {
                        depth -= 1;
                        if depth <= 0 {
                            depth = 0;
                            if let Some((start, h)) = open.take() {
                                spans.push(Span {
                                    start_line: start,
                                    end_line: line_no,
                                    header: h,
                                });
                            }
                            header.clear();
                            header_start = None;
                        }
                    }
                    ';' if depth == 0 => {
                        // Prototype or file-scope declaration; discard.
                        header.clear();
                        header_start = None;
                    }
                    _ => {
                        if depth == 0 {
                            if header_start.is_none() && !c.is_whitespace() {
                                header_start = Some(line_no);
                            }
                            header.push(c);
                        }
                    }
                },
            }
            i += 1;
        }
        if depth == 0 && state == Lex::Code && !header.is_empty() {
            header.push(' ');
        }
    }

    spans
}

/// A top-level header introduces a function when it carries `ident(` and is
/// not a type or initializer construct.
fn looks_like_function_header(header: &str) -> bool {
    if header.is_empty() || header.ends_with('=') {
        return false;
    }
    let first = header.split_whitespace().next().unwrap_or("");
    if matches!(first, "typedef" | "struct" | "union" | "enum") {
        return false;
    }
    let Some(paren) = header.find('(') else {
        return false;
    };
    let before = header[..paren].trim_end();
    before
        .rsplit(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .next()
        .is_some_and(|ident| {
            !ident.is_empty() && !ident.chars().next().unwrap().is_ascii_digit()
        })
}

fn textual_signature(header: &str) -> Option<(String, Vec<String>)> {
    let paren = header.find('(')?;
    let name = header[..paren]
        .trim_end()
        .rsplit(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .next()?
        .to_string();
    if name.is_empty() {
        return None;
    }
    let close = header.rfind(')')?;
    let inner = header[paren + 1..close].trim();
    let params = if inner.is_empty() || inner == "void" {
        Vec::new()
    } else {
        inner
            .split(',')
            .filter_map(|p| {
                p.trim_end_matches(|c: char| c == '[' || c == ']' || c.is_ascii_digit())
                    .rsplit(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .find(|s| !s.is_empty())
                    .map(str::to_string)
            })
            .collect()
    };
    Some((name, params))
}

/// True when a replacement character from lossy decoding sits outside
/// string/char literals, which makes the file unusable for partitioning.
fn invalid_outside_literals(lines: &[String]) -> bool {
    let mut state = Lex::Code;
    for raw in lines {
        if state == Lex::LineComment {
            state = Lex::Code;
        }
        let chars: Vec<char> = raw.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();
            match state {
                Lex::LineComment => break,
                Lex::BlockComment => {
                    if c == '\u{FFFD}' {
                        return true;
                    }
                    if c == '*' && next == Some('/') {
                        state = Lex::Code;
                        i += 1;
                    }
                }
                Lex::Str => match c {
                    '\\' => i += 1,
                    '"' => state = Lex::Code,
                    _ => {}
                },
                Lex::Char => match c {
                    '\\' => i += 1,
                    '\'' => state = Lex::Code,
                    _ => {}
                },
                Lex::Code => match c {
                    '\u{FFFD}' => return true,
                    '/' if next == Some('/') => state = Lex::LineComment,
                    '/' if next == Some('*') => {
                        state = Lex::BlockComment;
                        i += 1;
                    }
                    '"' => state = Lex::Str,
                    '\'' => state = Lex::Char,
                    _ => {}
                },
            }
            i += 1;
        }
    }
    false
}
