//! Core data model: checker records, source views, execution traces,
//! roots, and diagnoses.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One entry of a checker call stack, innermost first in `LeakRecord`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub function: String,
    /// `"?"` when the frame has no source coordinates (no debug info).
    pub file: String,
    pub line: u32,
}

impl Frame {
    pub fn has_source(&self) -> bool {
        self.file != "?" && self.line > 0
    }
}

/// Checker classification of a loss record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeakCategory {
    Definitely,
    Indirectly,
    Possibly,
    StillReachable,
}

impl fmt::Display for LeakCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeakCategory::Definitely => "definitely lost",
            LeakCategory::Indirectly => "indirectly lost",
            LeakCategory::Possibly => "possibly lost",
            LeakCategory::StillReachable => "still reachable",
        };
        f.write_str(s)
    }
}

/// One loss record from the checker report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakRecord {
    pub bytes_direct: u64,
    pub bytes_indirect: u64,
    pub blocks: u32,
    pub loss_record_index: u32,
    pub loss_record_total: u32,
    /// Innermost first, allocator frames included.
    pub alloc_stack: Vec<Frame>,
    pub category_hint: LeakCategory,
}

impl LeakRecord {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_direct + self.bytes_indirect
    }

    /// Innermost frame that belongs to user source: skips allocator
    /// frames and frames without coordinates.
    pub fn innermost_user_frame(&self, allocators: &[String]) -> Option<&Frame> {
        self.alloc_stack
            .iter()
            .find(|f| f.has_source() && !allocators.iter().any(|a| a == &f.function))
    }
}

/// Byte totals from the checker's LEAK SUMMARY block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub definitely_lost: u64,
    pub indirectly_lost: u64,
    pub possibly_lost: u64,
    pub still_reachable: u64,
    pub total_records: u32,
}

impl ReportSummary {
    pub fn total_leaked(&self) -> u64 {
        self.definitely_lost + self.indirectly_lost
    }
}

/// Full parse result for one checker report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedReport {
    pub summary: ReportSummary,
    pub records: Vec<LeakRecord>,
    /// Blocks whose structure could not be recovered and were skipped.
    pub skipped_malformed: u32,
}

impl ParsedReport {
    pub fn definitely_lost_records(&self) -> impl Iterator<Item = &LeakRecord> {
        self.records
            .iter()
            .filter(|r| r.category_hint == LeakCategory::Definitely)
    }

    pub fn has_leaks(&self) -> bool {
        self.summary.total_leaked() > 0
            || self
                .records
                .iter()
                .any(|r| r.category_hint == LeakCategory::Definitely)
    }
}

/// One top-level function definition, verbatim from source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionView {
    pub name: String,
    /// Name plus parameter list, as written.
    pub signature: String,
    pub params: Vec<String>,
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
    /// `(line_no, text)` pairs covering exactly this definition.
    pub body_lines: Vec<(u32, String)>,
}

impl FunctionView {
    pub fn contains_line(&self, line: u32) -> bool {
        line >= self.start_line && line <= self.end_line
    }

    pub fn line_text(&self, line: u32) -> Option<&str> {
        self.body_lines
            .iter()
            .find(|(n, _)| *n == line)
            .map(|(_, t)| t.as_str())
    }
}

// ---------------------------------------------------------------------------
// Access paths
// ---------------------------------------------------------------------------

/// One segment of an access path after the head variable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathSeg {
    /// `.name` or `->name`; `(*x).f` normalizes to the arrow form.
    Field { name: String, arrow: bool },
    /// `[index]`, index text kept verbatim (the tracer resolves symbolic
    /// indices to concrete values before events reach the tracker).
    Index(String),
}

/// A syntactic lvalue rooted at a local or parameter: head variable plus
/// field-access and subscript segments. Equality is structural on the
/// normalized segment sequence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AccessPath {
    pub head: String,
    pub segs: Vec<PathSeg>,
}

impl AccessPath {
    pub fn var(head: &str) -> AccessPath {
        AccessPath {
            head: head.to_string(),
            segs: Vec::new(),
        }
    }

    /// Parse an expression as an access path. Returns `None` for anything
    /// that is not a plain variable/field/subscript chain.
    pub fn parse(expr: &str) -> Option<AccessPath> {
        let s = expr.trim();
        // Unwrap one level of grouping parens: `(p)` -> `p`.
        let s = strip_outer_parens(s);

        // `(*x).f` is the parenthesized spelling of `x->f`.
        if let Some(rest) = s.strip_prefix("(*") {
            let close = rest.find(')')?;
            let inner = AccessPath::parse(&rest[..close])?;
            let mut tail = rest[close + 1..].trim_start();
            if !tail.starts_with('.') {
                return None;
            }
            tail = &tail[1..];
            let mut path = inner;
            let (name, leftover) = take_ident(tail)?;
            path.segs.push(PathSeg::Field {
                name,
                arrow: true,
            });
            return parse_segments(leftover, path);
        }

        let (head, rest) = take_ident(s)?;
        parse_segments(
            rest,
            AccessPath {
                head,
                segs: Vec::new(),
            },
        )
    }

    /// `other` extends `self`: the extra segments, if any.
    pub fn suffix_after(&self, prefix: &AccessPath) -> Option<&[PathSeg]> {
        if self.head != prefix.head || self.segs.len() < prefix.segs.len() {
            return None;
        }
        if self.segs[..prefix.segs.len()] != prefix.segs[..] {
            return None;
        }
        Some(&self.segs[prefix.segs.len()..])
    }

    /// True when `self` is a proper prefix of `other` (`c` vs `c->f`).
    pub fn is_strict_prefix_of(&self, other: &AccessPath) -> bool {
        other.suffix_after(self).is_some_and(|s| !s.is_empty())
    }

    pub fn appended(&self, extra: &[PathSeg]) -> AccessPath {
        let mut segs = self.segs.clone();
        segs.extend_from_slice(extra);
        AccessPath {
            head: self.head.clone(),
            segs,
        }
    }
}

impl fmt::Display for AccessPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.head)?;
        for seg in &self.segs {
            match seg {
                PathSeg::Field { name, arrow: true } => write!(f, "->{name}")?,
                PathSeg::Field { name, arrow: false } => write!(f, ".{name}")?,
                PathSeg::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

fn strip_outer_parens(s: &str) -> &str {
    let mut s = s.trim();
    while s.starts_with('(') && s.ends_with(')') && !s.starts_with("(*") {
        // Only strip when the parens actually wrap the whole expression.
        let inner = &s[1..s.len() - 1];
        let mut depth = 0i32;
        let mut wraps = true;
        for c in inner.chars() {
            match c {
                '(' | '[' => depth += 1,
                ')' | ']' => {
                    depth -= 1;
                    if depth < 0 {
                        wraps = false;
                        break;
                    }
                }
                _ => {}
            }
        }
        if wraps && depth == 0 {
            s = inner.trim();
        } else {
            break;
        }
    }
    s
}

fn take_ident(s: &str) -> Option<(String, &str)> {
    let s = s.trim_start();
    let end = s
        .char_indices()
        .take_while(|(_, c)| c.is_ascii_alphanumeric() || *c == '_')
        .map(|(i, c)| i + c.len_utf8())
        .last()?;
    let ident = &s[..end];
    if ident.is_empty() || ident.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((ident.to_string(), &s[end..]))
}

fn parse_segments(mut rest: &str, mut path: AccessPath) -> Option<AccessPath> {
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            return Some(path);
        }
        if let Some(r) = rest.strip_prefix("->") {
            let (name, r) = take_ident(r)?;
            path.segs.push(PathSeg::Field { name, arrow: true });
            rest = r;
        } else if let Some(r) = rest.strip_prefix('.') {
            let (name, r) = take_ident(r)?;
            path.segs.push(PathSeg::Field { name, arrow: false });
            rest = r;
        } else if let Some(r) = rest.strip_prefix('[') {
            let mut depth = 1;
            let mut end = None;
            for (i, c) in r.char_indices() {
                match c {
                    '[' => depth += 1,
                    ']' => {
                        depth -= 1;
                        if depth == 0 {
                            end = Some(i);
                            break;
                        }
                    }
                    _ => {}
                }
            }
            let end = end?;
            path.segs.push(PathSeg::Index(r[..end].trim().to_string()));
            rest = &r[end + 1..];
        } else {
            return None;
        }
    }
}

// ---------------------------------------------------------------------------
// Execution traces
// ---------------------------------------------------------------------------

/// Identity of one heap allocation instance observed during a run.
/// Two executions of the same allocator line are distinct instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllocId(pub u32);

/// Where and how an allocation instance was observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationSite {
    pub id: AllocId,
    pub file: String,
    pub line: u32,
    /// Runtime address, when the debugger could capture it.
    pub address: Option<u64>,
    /// Nth execution of this textual call site, starting at 0.
    pub seq_at_site: u32,
}

/// One observed step of program execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub file: String,
    pub line: u32,
    pub function: String,
    pub kind: TraceEventKind,
}

/// Closed set of trace event shapes. The ownership tracker matches this
/// exhaustively; adding a variant is a compile error everywhere it matters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TraceEventKind {
    /// A function call was entered. `transparent` is false for frames whose
    /// body could not be extracted; such frames still carry parameter and
    /// return bindings but contribute no body events.
    Enter {
        function: String,
        transparent: bool,
        /// `(parameter, caller-side argument expression)` pairs.
        arg_bindings: Vec<(String, String)>,
    },
    /// A function returned. `return_holder` is the caller-side LHS receiving
    /// the value, when the call site assigns it. The event's file/line point
    /// at the call site in the caller. `alloc` is set when the returned
    /// value is a fresh allocation (`return malloc(n);`).
    Return {
        function: String,
        return_expr: Option<String>,
        return_holder: Option<String>,
        alloc: Option<AllocId>,
    },
    /// `lhs = rhs;`. `alloc` is set when `rhs` is an allocator call,
    /// carrying the instance observed at this step.
    Assign {
        lhs: String,
        rhs: String,
        is_declaration: bool,
        alloc: Option<AllocId>,
    },
    /// Assignment whose RHS is a pure variable or field access.
    Alias { lhs: String, rhs: String },
    /// `free(arg)` or a configured free-wrapper call.
    Free { arg: String },
    /// A conditional was evaluated; `taken` is the observed outcome.
    Cond { taken: bool, text: String },
    /// One observed iteration of a loop body.
    LoopIter {
        iteration: u32,
        body: Vec<TraceEvent>,
    },
    /// A block closed; the named bindings went out of scope.
    ScopeExit { dying: Vec<String> },
}

/// Linear trace of one program run, rooted at `main`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecTrace {
    pub events: Vec<TraceEvent>,
    pub allocations: Vec<AllocationSite>,
}

impl ExecTrace {
    /// Allocation instances observed at the given source coordinates.
    /// Matching is on file basename so checker paths and debugger paths
    /// agree.
    pub fn allocations_at(&self, file: &str, line: u32) -> Vec<AllocId> {
        let want = basename(file);
        self.allocations
            .iter()
            .filter(|a| a.line == line && basename(&a.file) == want)
            .map(|a| a.id)
            .collect()
    }
}

pub(crate) fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

// ---------------------------------------------------------------------------
// Tracker output
// ---------------------------------------------------------------------------

/// The closed set of leak kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeakKind {
    /// No free was ever issued while a root existed; the roots died by
    /// scope exit or the program ended.
    MissingFree,
    /// The last surviving root was destroyed by an assignment or by a
    /// return that did not re-bind it.
    PathLossByReassignment,
    /// The container holding the only path was freed before the embedded
    /// allocation.
    ContainerFreedFirst,
}

impl fmt::Display for LeakKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LeakKind::MissingFree => "never freed",
            LeakKind::PathLossByReassignment => "pointer path lost",
            LeakKind::ContainerFreedFirst => "container freed first",
        };
        f.write_str(s)
    }
}

/// Which event shape destroyed the last root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Witness {
    Assign,
    Return,
    Free,
    ScopeExit,
    EndOfTrace,
}

/// The tracker's verdict for one allocation instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootCause {
    pub kind: LeakKind,
    pub file: String,
    pub function: String,
    pub line: u32,
    /// Roots that existed immediately before the witness event.
    pub roots_at_leak: Vec<String>,
    pub witness: Witness,
    /// Final value of the tracker's freed flag (classifier input).
    pub freed: bool,
    /// Human-readable rule applications, in order.
    pub trail: Vec<String>,
}

/// How the diagnosis was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    /// Backed by a real execution trace.
    Dynamic,
    /// Source-order fallback walk; branches and loops were not observed.
    Static,
}

/// Structured record handed to the renderer and the narrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakDiagnosis {
    pub leak_id: u32,
    pub bytes: u64,
    pub blocks: u32,
    pub kind: LeakKind,
    pub site: Frame,
    pub witness_line: u32,
    pub roots_at_leak: Vec<String>,
    pub confidence: Confidence,
    pub trail: Vec<String>,
    /// Prose from the LLM collaborator; omitted when it is offline.
    pub narrative: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_variable() {
        let p = AccessPath::parse("ptr").unwrap();
        assert_eq!(p.head, "ptr");
        assert!(p.segs.is_empty());
    }

    #[test]
    fn test_parse_field_chain() {
        let p = AccessPath::parse("head->next->data").unwrap();
        assert_eq!(p.to_string(), "head->next->data");
        assert_eq!(p.segs.len(), 2);
    }

    #[test]
    fn test_parse_subscript() {
        let p = AccessPath::parse("arr[4]").unwrap();
        assert_eq!(p.segs, vec![PathSeg::Index("4".to_string())]);
    }

    #[test]
    fn test_parse_mixed() {
        let p = AccessPath::parse("table[i]->value.len").unwrap();
        assert_eq!(p.to_string(), "table[i]->value.len");
    }

    #[test]
    fn test_deref_paren_normalizes_to_arrow() {
        let a = AccessPath::parse("(*node).data").unwrap();
        let b = AccessPath::parse("node->data").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_non_paths() {
        assert!(AccessPath::parse("malloc(32)").is_none());
        assert!(AccessPath::parse("a + b").is_none());
        assert!(AccessPath::parse("NULL").is_some()); // an identifier; callers filter literals
        assert!(AccessPath::parse("42").is_none());
        assert!(AccessPath::parse("").is_none());
    }

    #[test]
    fn test_prefix_and_suffix() {
        let c = AccessPath::parse("c").unwrap();
        let cf = AccessPath::parse("c->f").unwrap();
        assert!(c.is_strict_prefix_of(&cf));
        assert!(!cf.is_strict_prefix_of(&c));
        let suffix = cf.suffix_after(&c).unwrap().to_vec();
        assert_eq!(c.appended(&suffix), cf);
    }

    #[test]
    fn test_outer_parens_stripped() {
        assert_eq!(
            AccessPath::parse("(n)").unwrap(),
            AccessPath::parse("n").unwrap()
        );
    }

    #[test]
    fn test_allocations_at_matches_basename() {
        let trace = ExecTrace {
            events: Vec::new(),
            allocations: vec![AllocationSite {
                id: AllocId(0),
                file: "/work/src/leaky.c".to_string(),
                line: 7,
                address: Some(0x5555_0000),
                seq_at_site: 0,
            }],
        };
        assert_eq!(trace.allocations_at("leaky.c", 7), vec![AllocId(0)]);
        assert!(trace.allocations_at("other.c", 7).is_empty());
    }
}
