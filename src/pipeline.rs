//! Per-record analysis orchestration.
//!
//! One `Analyzer` owns the configuration and the shared source cache. The
//! checker and the debugger each run once per executable; every
//! definitely-lost record is then analyzed independently against the shared
//! trace. A record failing never aborts the others.

use std::path::Path;
use std::sync::Arc;

use crate::checker;
use crate::classify;
use crate::config::{AnalysisConfig, CancelFlag};
use crate::context::SourceCache;
use crate::error::{Inconclusive, MortemError};
use crate::models::{
    AllocId, AllocationSite, Confidence, ExecTrace, Frame, FunctionView, LeakDiagnosis,
    LeakRecord, ParsedReport, ReportSummary, TraceEvent, TraceEventKind,
};
use crate::report;
use crate::syntax::{self, Action};
use crate::tracer::Tracer;
use crate::tracker;

/// Why one record produced no diagnosis.
#[derive(Debug, Clone)]
pub struct RecordFailure {
    pub loss_record_index: u32,
    pub reason: String,
}

/// Everything one run produced.
#[derive(Debug, Clone, Default)]
pub struct AnalysisOutcome {
    pub summary: ReportSummary,
    pub diagnoses: Vec<LeakDiagnosis>,
    pub failures: Vec<RecordFailure>,
    pub skipped_malformed: u32,
    /// Records acknowledged but not deep-analyzed (not definitely lost).
    pub shallow_records: u32,
}

impl AnalysisOutcome {
    pub fn has_leaks(&self) -> bool {
        !self.diagnoses.is_empty() || self.summary.total_leaked() > 0
    }
}

pub struct Analyzer {
    cfg: AnalysisConfig,
    sources: SourceCache,
}

impl Analyzer {
    pub fn new(cfg: AnalysisConfig) -> Analyzer {
        let sources = SourceCache::new(cfg.search_root.clone());
        Analyzer { cfg, sources }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.cfg
    }

    /// Run the checker, then analyze every definitely-lost record.
    pub fn analyze(
        &self,
        executable: &Path,
        args: &[String],
        cancel: &CancelFlag,
    ) -> Result<AnalysisOutcome, MortemError> {
        let report_text = checker::run_checker(&self.cfg, executable, args)?;
        self.analyze_report(&report_text, executable, args, cancel)
    }

    /// Analyze an already-captured checker report against the executable.
    pub fn analyze_report(
        &self,
        report_text: &str,
        executable: &Path,
        args: &[String],
        cancel: &CancelFlag,
    ) -> Result<AnalysisOutcome, MortemError> {
        let parsed = report::parse_report(report_text).map_err(MortemError::Parse)?;
        let mut outcome = AnalysisOutcome {
            summary: parsed.summary.clone(),
            skipped_malformed: parsed.skipped_malformed,
            ..AnalysisOutcome::default()
        };
        outcome.shallow_records = shallow_count(&parsed);

        let definite: Vec<&LeakRecord> = parsed.definitely_lost_records().collect();
        if definite.is_empty() {
            return Ok(outcome);
        }

        // One program run feeds every record's analysis.
        let trace = self.run_tracer(executable, args, cancel);

        for record in definite {
            if cancel.is_cancelled() {
                break;
            }
            self.analyze_record(record, trace.as_deref(), &mut outcome);
        }
        Ok(outcome)
    }

    fn run_tracer(
        &self,
        executable: &Path,
        args: &[String],
        cancel: &CancelFlag,
    ) -> Option<Arc<ExecTrace>> {
        if !checker::binary_available(&self.cfg.debugger) {
            return None;
        }
        Tracer::new(&self.cfg, &self.sources, cancel.clone())
            .trace(executable, args)
            .ok()
            .map(Arc::new)
    }

    fn analyze_record(
        &self,
        record: &LeakRecord,
        trace: Option<&ExecTrace>,
        outcome: &mut AnalysisOutcome,
    ) {
        let Some(site_frame) = record.innermost_user_frame(&self.cfg.allocators) else {
            outcome.failures.push(RecordFailure {
                loss_record_index: record.loss_record_index,
                reason: Inconclusive::NoDebugInfo.to_string(),
            });
            return;
        };

        if self
            .sources
            .function_at(&site_frame.file, site_frame.line)
            .is_err()
        {
            // The frame owning the allocation is a black box; nothing can
            // seed the root set.
            outcome.failures.push(RecordFailure {
                loss_record_index: record.loss_record_index,
                reason: Inconclusive::OpaqueCritical {
                    function: site_frame.function.clone(),
                }
                .to_string(),
            });
            return;
        }

        if let Some(trace) = trace {
            let instances = trace.allocations_at(&site_frame.file, site_frame.line);
            if !instances.is_empty() {
                self.analyze_instances(record, trace, &instances, outcome);
                return;
            }
        }

        // Static fallback: synthesize a straight-line trace from the
        // checker stack's function bodies.
        match self.synthesize_static_trace(record, site_frame) {
            Ok((synthetic, target)) => {
                self.diagnose(record, &synthetic, target, Confidence::Static, outcome)
            }
            Err(reason) => outcome.failures.push(RecordFailure {
                loss_record_index: record.loss_record_index,
                reason,
            }),
        }
    }

    fn analyze_instances(
        &self,
        record: &LeakRecord,
        trace: &ExecTrace,
        instances: &[AllocId],
        outcome: &mut AnalysisOutcome,
    ) {
        let mut diagnosed = 0u32;
        let mut last_reason = None;
        for &instance in instances {
            if record.blocks > 0 && diagnosed >= record.blocks {
                break;
            }
            let before = outcome.diagnoses.len();
            self.diagnose_keeping_reason(record, trace, instance, Confidence::Dynamic, outcome, &mut last_reason);
            if outcome.diagnoses.len() > before {
                diagnosed += 1;
            }
        }
        if diagnosed == 0 {
            outcome.failures.push(RecordFailure {
                loss_record_index: record.loss_record_index,
                reason: last_reason
                    .unwrap_or_else(|| "no allocation instance could be diagnosed".to_string()),
            });
        }
    }

    fn diagnose_keeping_reason(
        &self,
        record: &LeakRecord,
        trace: &ExecTrace,
        target: AllocId,
        confidence: Confidence,
        outcome: &mut AnalysisOutcome,
        last_reason: &mut Option<String>,
    ) {
        match tracker::track(trace, target) {
            Ok(cause) => match classify::confirm(&cause) {
                Ok(()) => outcome.diagnoses.push(build_diagnosis(record, &cause, confidence)),
                Err(mismatch) => *last_reason = Some(mismatch.to_string()),
            },
            Err(inconclusive) => *last_reason = Some(inconclusive.to_string()),
        }
    }

    fn diagnose(
        &self,
        record: &LeakRecord,
        trace: &ExecTrace,
        target: AllocId,
        confidence: Confidence,
        outcome: &mut AnalysisOutcome,
    ) {
        let mut reason = None;
        self.diagnose_keeping_reason(record, trace, target, confidence, outcome, &mut reason);
        if let Some(reason) = reason {
            outcome.failures.push(RecordFailure {
                loss_record_index: record.loss_record_index,
                reason,
            });
        }
    }

    /// Build a straight-line pseudo-trace from the checker-stack function
    /// bodies, innermost frame first. Branches and loops are not observed;
    /// calls outside the stack chain contribute nothing.
    fn synthesize_static_trace(
        &self,
        record: &LeakRecord,
        site_frame: &Frame,
    ) -> Result<(ExecTrace, AllocId), String> {
        // The chain from the allocation function out to main.
        let mut chain: Vec<(Frame, FunctionView)> = Vec::new();
        let mut seen_site = false;
        for frame in &record.alloc_stack {
            if !frame.has_source() {
                continue;
            }
            if frame.file == site_frame.file && frame.line == site_frame.line {
                seen_site = true;
            }
            if !seen_site {
                continue;
            }
            match self.sources.function_at(&frame.file, frame.line) {
                Ok(view) => chain.push((frame.clone(), view)),
                Err(e) => return Err(e.to_string()),
            }
        }
        if chain.is_empty() {
            return Err("no extractable frames in the checker stack".to_string());
        }

        let mut builder = StaticTraceBuilder {
            cfg: &self.cfg,
            events: Vec::new(),
            allocations: Vec::new(),
            target: None,
            target_site: (site_frame.file.clone(), site_frame.line),
        };

        // Open the frames outermost-first so scopes nest correctly.
        for (frame, view) in chain.iter().rev() {
            builder.events.push(TraceEvent {
                file: frame.file.clone(),
                line: view.start_line,
                function: view.name.clone(),
                kind: TraceEventKind::Enter {
                    function: view.name.clone(),
                    transparent: true,
                    arg_bindings: Vec::new(),
                },
            });
        }

        // Walk the bodies innermost-out, starting at the allocation line.
        // A caller resumes after its call line: the binding it performs is
        // already modeled by the callee's Return rebind.
        for (depth, (frame, view)) in chain.iter().enumerate() {
            let start = if depth == 0 { frame.line } else { frame.line + 1 };
            let holder = chain
                .get(depth + 1)
                .and_then(|(caller_frame, _)| {
                    self.static_holder(caller_frame, &view.name)
                });
            builder.walk_body(view, start, holder);
        }

        let target = builder
            .target
            .ok_or_else(|| "allocation line not recognized in the extracted body".to_string())?;
        Ok((
            ExecTrace {
                events: builder.events,
                allocations: builder.allocations,
            },
            target,
        ))
    }

    fn static_holder(&self, caller_frame: &Frame, callee: &str) -> Option<String> {
        let text = self
            .sources
            .line_text(&caller_frame.file, caller_frame.line)?;
        for action in syntax::classify_line(&text).actions {
            if let Action::Assign { lhs, rhs, .. } = action {
                if let Some((name, _)) = syntax::leading_call(&rhs) {
                    if name == callee {
                        return Some(lhs);
                    }
                }
            }
        }
        None
    }
}

struct StaticTraceBuilder<'a> {
    cfg: &'a AnalysisConfig,
    events: Vec<TraceEvent>,
    allocations: Vec<AllocationSite>,
    target: Option<AllocId>,
    target_site: (String, u32),
}

impl StaticTraceBuilder<'_> {
    /// Emit events for one function body from `start` to its end, then the
    /// frame's ScopeExit/Return pair.
    fn walk_body(&mut self, view: &FunctionView, start: u32, holder: Option<String>) {
        let full_text: String = view
            .body_lines
            .iter()
            .map(|(_, t)| t.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let mut declared: Vec<String> = view.params.clone();
        declared.extend(syntax::declared_locals(&full_text));
        let mut pending_return: Option<String> = None;

        for (line_no, text) in &view.body_lines {
            if *line_no < start {
                continue;
            }
            let analysis = syntax::classify_line(text);
            for action in analysis.actions {
                match action {
                    Action::Return { expr } => {
                        pending_return = expr;
                    }
                    Action::Assign {
                        lhs,
                        rhs,
                        is_declaration,
                    } => {
                        let alloc = syntax::leading_call(&rhs)
                            .filter(|(callee, _)| {
                                self.cfg.allocators.iter().any(|a| a == callee)
                            })
                            .map(|_| self.new_alloc(&view.file, *line_no));
                        let kind = if alloc.is_none()
                            && crate::models::AccessPath::parse(&rhs).is_some()
                            && rhs.trim() != "NULL"
                        {
                            TraceEventKind::Alias {
                                lhs: lhs.clone(),
                                rhs: rhs.clone(),
                            }
                        } else {
                            TraceEventKind::Assign {
                                lhs,
                                rhs,
                                is_declaration,
                                alloc,
                            }
                        };
                        self.events.push(TraceEvent {
                            file: view.file.clone(),
                            line: *line_no,
                            function: view.name.clone(),
                            kind,
                        });
                    }
                    Action::Call { callee, args } => {
                        if self.cfg.free_wrappers.iter().any(|f| f == &callee) {
                            self.events.push(TraceEvent {
                                file: view.file.clone(),
                                line: *line_no,
                                function: view.name.clone(),
                                kind: TraceEventKind::Free {
                                    arg: args.first().cloned().unwrap_or_default(),
                                },
                            });
                        }
                    }
                }
            }
            if pending_return.is_some() {
                break;
            }
        }

        let returned_head = pending_return
            .as_deref()
            .and_then(crate::models::AccessPath::parse)
            .map(|p| p.head);
        let dying: Vec<String> = declared
            .into_iter()
            .filter(|n| Some(n.as_str()) != returned_head.as_deref())
            .collect();
        if !dying.is_empty() {
            self.events.push(TraceEvent {
                file: view.file.clone(),
                line: view.end_line,
                function: view.name.clone(),
                kind: TraceEventKind::ScopeExit { dying },
            });
        }
        self.events.push(TraceEvent {
            file: view.file.clone(),
            line: view.end_line,
            function: view.name.clone(),
            kind: TraceEventKind::Return {
                function: view.name.clone(),
                return_expr: pending_return,
                return_holder: holder,
                alloc: None,
            },
        });
    }

    fn new_alloc(&mut self, file: &str, line: u32) -> AllocId {
        let id = AllocId(self.allocations.len() as u32);
        self.allocations.push(AllocationSite {
            id,
            file: file.to_string(),
            line,
            address: None,
            seq_at_site: 0,
        });
        let (ref tf, tl) = self.target_site;
        if self.target.is_none()
            && tl == line
            && crate::models::basename(tf) == crate::models::basename(file)
        {
            self.target = Some(id);
        }
        id
    }
}

fn build_diagnosis(
    record: &LeakRecord,
    cause: &crate::models::RootCause,
    confidence: Confidence,
) -> LeakDiagnosis {
    LeakDiagnosis {
        leak_id: record.loss_record_index,
        bytes: record.total_bytes(),
        blocks: record.blocks,
        kind: cause.kind,
        site: Frame {
            function: cause.function.clone(),
            file: cause.file.clone(),
            line: cause.line,
        },
        witness_line: cause.line,
        roots_at_leak: cause.roots_at_leak.clone(),
        confidence,
        trail: cause.trail.clone(),
        narrative: None,
    }
}

fn shallow_count(parsed: &ParsedReport) -> u32 {
    parsed
        .records
        .iter()
        .filter(|r| r.category_hint != crate::models::LeakCategory::Definitely)
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LeakCategory, LeakKind};
    use std::fs;

    fn record(stack: Vec<Frame>) -> LeakRecord {
        LeakRecord {
            bytes_direct: 32,
            bytes_indirect: 0,
            blocks: 1,
            loss_record_index: 1,
            loss_record_total: 1,
            alloc_stack: stack,
            category_hint: LeakCategory::Definitely,
        }
    }

    fn frame(function: &str, file: &str, line: u32) -> Frame {
        Frame {
            function: function.to_string(),
            file: file.to_string(),
            line,
        }
    }

    #[test]
    fn test_static_fallback_pointer_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let src = "\
#include <stdlib.h>
#include <string.h>

int main(void)
{
	char	*ptr;

	ptr = malloc(32);
	strcpy(ptr, \"first\");
	ptr = malloc(64);
	strcpy(ptr, \"second\");
	free(ptr);
	return (0);
}
";
        fs::write(dir.path().join("leaky.c"), src).unwrap();

        let cfg = AnalysisConfig {
            search_root: dir.path().to_path_buf(),
            ..AnalysisConfig::default()
        };
        let analyzer = Analyzer::new(cfg);
        let rec = record(vec![
            frame("malloc", "?", 0),
            frame("main", "leaky.c", 8),
        ]);
        let site = rec
            .innermost_user_frame(&analyzer.cfg.allocators)
            .unwrap()
            .clone();
        let (trace, target) = analyzer.synthesize_static_trace(&rec, &site).unwrap();

        let cause = tracker::track(&trace, target).unwrap();
        assert_eq!(cause.kind, LeakKind::PathLossByReassignment);
        assert_eq!(cause.line, 10);
        assert_eq!(cause.roots_at_leak, vec!["ptr".to_string()]);
    }

    #[test]
    fn test_static_fallback_scope_leak_through_caller() {
        let dir = tempfile::tempdir().unwrap();
        let src = "\
#include <stdlib.h>
#include <string.h>

void	init(void)
{
	char	*t;

	t = malloc(128);
	strcpy(t, \"x\");
}

int	main(void)
{
	init();
	return (0);
}
";
        fs::write(dir.path().join("scope.c"), src).unwrap();

        let cfg = AnalysisConfig {
            search_root: dir.path().to_path_buf(),
            ..AnalysisConfig::default()
        };
        let analyzer = Analyzer::new(cfg);
        let rec = record(vec![
            frame("malloc", "?", 0),
            frame("init", "scope.c", 8),
            frame("main", "scope.c", 14),
        ]);
        let site = rec
            .innermost_user_frame(&analyzer.cfg.allocators)
            .unwrap()
            .clone();
        let (trace, target) = analyzer.synthesize_static_trace(&rec, &site).unwrap();

        let cause = tracker::track(&trace, target).unwrap();
        assert_eq!(cause.kind, LeakKind::MissingFree);
        assert_eq!(cause.function, "init");
        assert_eq!(cause.roots_at_leak, vec!["t".to_string()]);
    }

    #[test]
    fn test_record_without_debug_info_fails_cleanly() {
        let cfg = AnalysisConfig::default();
        let analyzer = Analyzer::new(cfg);
        let rec = record(vec![frame("malloc", "?", 0), frame("main", "?", 0)]);
        let mut outcome = AnalysisOutcome::default();
        analyzer.analyze_record(&rec, None, &mut outcome);
        assert!(outcome.diagnoses.is_empty());
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].reason.contains("debug info"));
    }
}
