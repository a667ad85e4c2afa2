//! Ownership tracker: the deterministic heart of the engine.
//!
//! Consumes one execution trace in order while following a single
//! allocation instance, maintaining the set of roots (live access paths
//! that reach the allocation) and detecting the exact event that makes the
//! allocation unreachable. Pure: no I/O, no suspension, and identical
//! input always yields the identical verdict.

use crate::error::Inconclusive;
use crate::models::{
    AccessPath, AllocId, ExecTrace, LeakKind, PathSeg, RootCause, TraceEvent, TraceEventKind,
    Witness,
};

/// How a root came to exist.
#[derive(Debug, Clone, PartialEq)]
enum RootOrigin {
    /// Born at the allocation's binding event.
    Allocation,
    /// Copied or rebased from another root's path. Structural reference,
    /// never a pointer: cycles compare as paths.
    Alias(AccessPath),
}

/// A live access path that reaches the tracked allocation.
#[derive(Debug, Clone)]
struct Root {
    path: AccessPath,
    origin: RootOrigin,
    /// Frame that owns the head variable; the root dies when it unwinds.
    scope: u32,
}

struct FrameCtx {
    id: u32,
    function: String,
}

/// Track one allocation instance through the trace.
pub fn track(trace: &ExecTrace, target: AllocId) -> Result<RootCause, Inconclusive> {
    Tracker::new(trace, target).run()
}

struct Tracker<'t> {
    trace: &'t ExecTrace,
    target: AllocId,
    roots: Vec<Root>,
    freed: bool,
    frames: Vec<FrameCtx>,
    next_frame_id: u32,
    seeded: bool,
    trail: Vec<String>,
    outcome: Option<Result<RootCause, Inconclusive>>,
}

impl<'t> Tracker<'t> {
    fn new(trace: &'t ExecTrace, target: AllocId) -> Tracker<'t> {
        Tracker {
            trace,
            target,
            roots: Vec::new(),
            freed: false,
            frames: Vec::new(),
            next_frame_id: 0,
            seeded: false,
            trail: Vec::new(),
            outcome: None,
        }
    }

    fn run(mut self) -> Result<RootCause, Inconclusive> {
        let trace = self.trace;
        for event in &trace.events {
            self.handle(event);
            if self.outcome.is_some() {
                break;
            }
        }
        match self.outcome {
            Some(result) => result,
            None => self.end_of_trace(),
        }
    }

    fn end_of_trace(self) -> Result<RootCause, Inconclusive> {
        if !self.seeded {
            return Err(Inconclusive::TraceTruncated {
                detail: "the allocation's binding event never appeared".to_string(),
            });
        }
        if self.freed {
            return Err(Inconclusive::ReasonMismatch);
        }
        if !self.roots.is_empty() {
            let last = self.trace.events.last();
            let mut trail = self.trail;
            trail.push("END: program finished with the allocation still reachable".to_string());
            return Ok(RootCause {
                kind: LeakKind::MissingFree,
                file: last.map(|e| e.file.clone()).unwrap_or_default(),
                function: last.map(|e| e.function.clone()).unwrap_or_default(),
                line: last.map(|e| e.line).unwrap_or(0),
                roots_at_leak: self.roots.iter().map(|r| r.path.to_string()).collect(),
                witness: Witness::EndOfTrace,
                freed: false,
                trail,
            });
        }
        Err(Inconclusive::TraceTruncated {
            detail: "roots emptied without a witnessing event".to_string(),
        })
    }

    fn current_frame(&self) -> u32 {
        self.frames.last().map(|f| f.id).unwrap_or(0)
    }

    fn snapshot(&self) -> Vec<String> {
        self.roots.iter().map(|r| r.path.to_string()).collect()
    }

    fn emit(&mut self, kind: LeakKind, witness: Witness, event: &TraceEvent, roots: Vec<String>) {
        let cause = RootCause {
            kind,
            file: event.file.clone(),
            function: event.function.clone(),
            line: event.line,
            roots_at_leak: roots,
            witness,
            freed: self.freed,
            trail: self.trail.clone(),
        };
        self.outcome = Some(Ok(cause));
    }

    fn handle(&mut self, event: &TraceEvent) {
        match &event.kind {
            TraceEventKind::Enter {
                function,
                arg_bindings,
                ..
            } => self.on_enter(function, arg_bindings),
            TraceEventKind::Return {
                return_expr,
                return_holder,
                alloc,
                ..
            } => self.on_return(event, return_expr.as_deref(), return_holder.as_deref(), *alloc),
            TraceEventKind::Assign {
                lhs, rhs, alloc, ..
            } => self.on_assign(event, lhs, rhs, *alloc),
            TraceEventKind::Alias { lhs, rhs } => self.on_assign(event, lhs, rhs, None),
            TraceEventKind::Free { arg } => self.on_free(event, arg),
            TraceEventKind::Cond { .. } => {}
            TraceEventKind::LoopIter { body, .. } => {
                for inner in body {
                    self.handle(inner);
                    if self.outcome.is_some() {
                        return;
                    }
                }
            }
            TraceEventKind::ScopeExit { dying } => self.on_scope_exit(event, dying),
        }
    }

    fn on_enter(&mut self, function: &str, arg_bindings: &[(String, String)]) {
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        self.frames.push(FrameCtx {
            id,
            function: function.to_string(),
        });

        if !self.seeded {
            return;
        }
        // Parameters carrying a root (or a container of one) are born as
        // aliases scoped to the new frame. The source roots are untouched.
        let mut additions = Vec::new();
        for (param, arg_expr) in arg_bindings {
            let Some(arg_path) = AccessPath::parse(arg_expr) else {
                continue;
            };
            let Some(param_path) = AccessPath::parse(param) else {
                continue;
            };
            for root in &self.roots {
                if let Some(suffix) = root.path.suffix_after(&arg_path) {
                    let suffix = suffix.to_vec();
                    let new_path = param_path.appended(&suffix);
                    additions.push((new_path, root.path.clone()));
                }
            }
        }
        for (path, source) in additions {
            if self.roots.iter().any(|r| r.path == path) {
                continue;
            }
            self.trail
                .push(format!("BIND: {} enters {}() as {}", source, function, path));
            self.roots.push(Root {
                path,
                origin: RootOrigin::Alias(source),
                scope: id,
            });
        }
    }

    fn on_return(
        &mut self,
        event: &TraceEvent,
        return_expr: Option<&str>,
        return_holder: Option<&str>,
        alloc: Option<AllocId>,
    ) {
        // Binding event: the tracked allocation surfaces as a returned
        // value at its call site.
        if alloc == Some(self.target) && !self.seeded {
            self.frames.pop();
            match return_holder.and_then(AccessPath::parse) {
                Some(holder) => {
                    self.seeded = true;
                    self.trail.push(format!(
                        "ALLOC: returned allocation stored in {} in {}()",
                        holder, event.function
                    ));
                    let scope = self.current_frame();
                    self.roots.push(Root {
                        path: holder,
                        origin: RootOrigin::Allocation,
                        scope,
                    });
                }
                None => {
                    // The result was discarded: the leak is sealed at the
                    // allocation site itself.
                    self.seeded = true;
                    let trace = self.trace;
                    let site = trace.allocations.iter().find(|a| a.id == self.target);
                    self.trail
                        .push("ALLOC: result never stored in any variable".to_string());
                    let cause = RootCause {
                        kind: LeakKind::MissingFree,
                        file: site.map(|s| s.file.clone()).unwrap_or_else(|| event.file.clone()),
                        function: event.function.clone(),
                        line: site.map(|s| s.line).unwrap_or(event.line),
                        roots_at_leak: Vec::new(),
                        witness: Witness::Return,
                        freed: false,
                        trail: self.trail.clone(),
                    };
                    self.outcome = Some(Ok(cause));
                }
            }
            return;
        }

        let popping = self.frames.pop().map(|f| f.id);
        if !self.seeded {
            return;
        }
        let Some(popping) = popping else {
            return;
        };

        let before = self.snapshot();

        // Rebind through the returned expression, inheriting segments:
        // returning `n` while `n->data` is a root moves it to
        // `<holder>->data` in the caller.
        let mut rebinds = Vec::new();
        if let Some(expr_path) = return_expr.and_then(AccessPath::parse) {
            if let Some(holder_path) = return_holder.and_then(AccessPath::parse) {
                for root in &self.roots {
                    if let Some(suffix) = root.path.suffix_after(&expr_path) {
                        let suffix = suffix.to_vec();
                        rebinds.push((holder_path.appended(&suffix), root.path.clone()));
                    }
                }
            }
        }

        let had_roots = !self.roots.is_empty();
        self.roots.retain(|r| r.scope != popping);

        let caller_scope = self.current_frame();
        for (path, source) in rebinds {
            if self.roots.iter().any(|r| r.path == path) {
                continue;
            }
            self.trail.push(format!(
                "RETURN: {}() hands {} back as {}",
                event.function, source, path
            ));
            self.roots.push(Root {
                path,
                origin: RootOrigin::Alias(source),
                scope: caller_scope,
            });
        }

        if had_roots && self.roots.is_empty() && !self.freed {
            self.trail.push(format!(
                "RETURN: {}() exits without handing the allocation back",
                event.function
            ));
            self.emit(LeakKind::PathLossByReassignment, Witness::Return, event, before);
        }
    }

    fn on_assign(&mut self, event: &TraceEvent, lhs: &str, rhs: &str, alloc: Option<AllocId>) {
        // Binding event: seed the first root from the receiving LHS.
        if alloc == Some(self.target) {
            if !self.seeded {
                match AccessPath::parse(lhs) {
                    Some(path) => {
                        self.seeded = true;
                        self.trail
                            .push(format!("ALLOC: {} in {}()", path, event.function));
                        let scope = self.current_frame();
                        self.roots.push(Root {
                            path,
                            origin: RootOrigin::Allocation,
                            scope,
                        });
                    }
                    None => {
                        self.outcome = Some(Err(Inconclusive::TraceTruncated {
                            detail: format!("allocation receiver '{lhs}' is not an lvalue path"),
                        }));
                    }
                }
            }
            return;
        }
        if !self.seeded {
            return;
        }

        let Some(lhs_path) = AccessPath::parse(lhs) else {
            return;
        };

        // Everything the RHS reaches, before any mutation (alias sources
        // must survive unchanged).
        let rhs_reaches: Vec<(Vec<PathSeg>, AccessPath)> = if is_null_literal(rhs) {
            Vec::new()
        } else {
            match AccessPath::parse(rhs) {
                Some(rhs_path) => self
                    .roots
                    .iter()
                    .filter_map(|r| {
                        r.path
                            .suffix_after(&rhs_path)
                            .map(|s| (s.to_vec(), r.path.clone()))
                    })
                    .collect(),
                None => Vec::new(),
            }
        };

        let overlapping: Vec<usize> = self
            .roots
            .iter()
            .enumerate()
            .filter(|(_, r)| lhs_path == r.path || lhs_path.is_strict_prefix_of(&r.path))
            .map(|(i, _)| i)
            .collect();

        if overlapping.is_empty() && rhs_reaches.is_empty() {
            return;
        }

        let before = self.snapshot();
        let had_roots = !self.roots.is_empty();

        if !overlapping.is_empty() {
            let names: Vec<String> = overlapping
                .iter()
                .map(|&i| self.roots[i].path.to_string())
                .collect();
            if rhs_reaches.is_empty() {
                self.trail.push(format!(
                    "REASSIGN: {} overwritten in {}()",
                    names.join(", "),
                    event.function
                ));
            }
            let mut idx = 0usize;
            self.roots.retain(|_| {
                let remove = overlapping.contains(&idx);
                idx += 1;
                !remove
            });
        }

        let scope = self.current_frame();
        for (suffix, source) in rhs_reaches {
            let path = lhs_path.appended(&suffix);
            if self.roots.iter().any(|r| r.path == path) {
                continue;
            }
            self.trail.push(format!(
                "ALIAS: {} = {} in {}()",
                path, source, event.function
            ));
            self.roots.push(Root {
                path,
                origin: RootOrigin::Alias(source),
                scope,
            });
        }

        if had_roots && self.roots.is_empty() && !self.freed {
            self.emit(
                LeakKind::PathLossByReassignment,
                Witness::Assign,
                event,
                before,
            );
        }
    }

    fn on_free(&mut self, event: &TraceEvent, arg: &str) {
        if !self.seeded {
            return;
        }
        let Some(arg_path) = AccessPath::parse(arg) else {
            return;
        };

        // Direct free: the access path identifies the allocation itself.
        if self.roots.iter().any(|r| r.path == arg_path) {
            self.freed = true;
            self.trail
                .push(format!("FREE: {} released in {}()", arg_path, event.function));
            // The checker said definitely-lost; the trace disagrees. No
            // guess: surface the contradiction.
            self.outcome = Some(Err(Inconclusive::ReasonMismatch));
            return;
        }

        // Container free: the argument is a proper prefix of live roots.
        let primary: Vec<usize> = self
            .roots
            .iter()
            .enumerate()
            .filter(|(_, r)| arg_path.is_strict_prefix_of(&r.path))
            .map(|(i, _)| i)
            .collect();
        if primary.is_empty() {
            return;
        }

        let before = self.snapshot();

        // Roots denoting the same storage cell through another name die
        // with the container: a parameter rebased from a caller array
        // shares its cells with the caller's root. Leaf copies (plain
        // pointer aliases) survive, they hold the value, not the cell.
        let mut doomed: Vec<bool> = vec![false; self.roots.len()];
        for &i in &primary {
            doomed[i] = true;
        }
        loop {
            let mut changed = false;
            for i in 0..self.roots.len() {
                if doomed[i] {
                    continue;
                }
                for j in 0..self.roots.len() {
                    if doomed[j] && cell_identical(&self.roots[i], &self.roots[j]) {
                        doomed[i] = true;
                        changed = true;
                        break;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        let removed: Vec<String> = self
            .roots
            .iter()
            .zip(doomed.iter())
            .filter(|(_, &d)| d)
            .map(|(r, _)| r.path.to_string())
            .collect();
        self.trail.push(format!(
            "FREE: container {} released in {}() while {} still reached the allocation",
            arg_path,
            event.function,
            removed.join(", ")
        ));
        let mut idx = 0usize;
        self.roots.retain(|_| {
            let keep = !doomed[idx];
            idx += 1;
            keep
        });

        if self.roots.is_empty() && !self.freed {
            self.emit(LeakKind::ContainerFreedFirst, Witness::Free, event, before);
        }
    }

    fn on_scope_exit(&mut self, event: &TraceEvent, dying: &[String]) {
        if !self.seeded {
            return;
        }
        let scope = self.current_frame();
        let before = self.snapshot();
        let had_roots = !self.roots.is_empty();
        let mut removed = Vec::new();
        self.roots.retain(|r| {
            let dies = r.scope == scope && dying.iter().any(|n| n == &r.path.head);
            if dies {
                removed.push(r.path.to_string());
            }
            !dies
        });
        if removed.is_empty() {
            return;
        }
        self.trail.push(format!(
            "SCOPE-EXIT: {} lost at the end of {}()",
            removed.join(", "),
            event.function
        ));
        if had_roots && self.roots.is_empty() && !self.freed {
            self.emit(LeakKind::MissingFree, Witness::ScopeExit, event, before);
        }
    }
}

fn is_null_literal(expr: &str) -> bool {
    matches!(expr.trim(), "NULL" | "nullptr" | "0")
}

/// Two roots denote the same storage cell when one was rebased from the
/// other at a container prefix (both keep trailing segments).
fn cell_identical(a: &Root, b: &Root) -> bool {
    if a.path.segs.is_empty() || b.path.segs.is_empty() {
        return false;
    }
    matches!(&a.origin, RootOrigin::Alias(p) if *p == b.path)
        || matches!(&b.origin, RootOrigin::Alias(p) if *p == a.path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AllocationSite;

    fn ev(function: &str, line: u32, kind: TraceEventKind) -> TraceEvent {
        TraceEvent {
            file: "leaky.c".to_string(),
            line,
            function: function.to_string(),
            kind,
        }
    }

    fn enter(function: &str, line: u32, bindings: &[(&str, &str)]) -> TraceEvent {
        ev(
            function,
            line,
            TraceEventKind::Enter {
                function: function.to_string(),
                transparent: true,
                arg_bindings: bindings
                    .iter()
                    .map(|(p, a)| (p.to_string(), a.to_string()))
                    .collect(),
            },
        )
    }

    fn ret(function: &str, line: u32, expr: Option<&str>, holder: Option<&str>) -> TraceEvent {
        ev(
            function,
            line,
            TraceEventKind::Return {
                function: function.to_string(),
                return_expr: expr.map(str::to_string),
                return_holder: holder.map(str::to_string),
                alloc: None,
            },
        )
    }

    fn assign(function: &str, line: u32, lhs: &str, rhs: &str, alloc: Option<u32>) -> TraceEvent {
        ev(
            function,
            line,
            TraceEventKind::Assign {
                lhs: lhs.to_string(),
                rhs: rhs.to_string(),
                is_declaration: false,
                alloc: alloc.map(AllocId),
            },
        )
    }

    fn alias(function: &str, line: u32, lhs: &str, rhs: &str) -> TraceEvent {
        ev(
            function,
            line,
            TraceEventKind::Alias {
                lhs: lhs.to_string(),
                rhs: rhs.to_string(),
            },
        )
    }

    fn free(function: &str, line: u32, arg: &str) -> TraceEvent {
        ev(
            function,
            line,
            TraceEventKind::Free {
                arg: arg.to_string(),
            },
        )
    }

    fn scope_exit(function: &str, line: u32, dying: &[&str]) -> TraceEvent {
        ev(
            function,
            line,
            TraceEventKind::ScopeExit {
                dying: dying.iter().map(|s| s.to_string()).collect(),
            },
        )
    }

    fn site(id: u32, line: u32) -> AllocationSite {
        AllocationSite {
            id: AllocId(id),
            file: "leaky.c".to_string(),
            line,
            address: Some(0x1000 + id as u64),
            seq_at_site: 0,
        }
    }

    fn trace(events: Vec<TraceEvent>, allocations: Vec<AllocationSite>) -> ExecTrace {
        ExecTrace {
            events,
            allocations,
        }
    }

    /// void init(void){ char *t = malloc(128); strcpy(t,"x"); }
    /// int main(void){ init(); return 0; }
    fn scope_leak_trace() -> ExecTrace {
        trace(
            vec![
                enter("main", 2, &[]),
                enter("init", 1, &[]),
                assign("init", 1, "t", "malloc(128)", Some(0)),
                scope_exit("init", 1, &["t"]),
                ret("init", 2, None, None),
                scope_exit("main", 2, &[]),
                ret("main", 2, None, None),
            ],
            vec![site(0, 1)],
        )
    }

    #[test]
    fn test_scope_leak_is_missing_free_at_closing_brace() {
        let cause = track(&scope_leak_trace(), AllocId(0)).unwrap();
        assert_eq!(cause.kind, LeakKind::MissingFree);
        assert_eq!(cause.witness, Witness::ScopeExit);
        assert_eq!(cause.function, "init");
        assert_eq!(cause.roots_at_leak, vec!["t".to_string()]);
        assert!(!cause.freed);
    }

    /// int main(void){ char *p = malloc(32); p = malloc(64); free(p); }
    fn pointer_reuse_trace() -> ExecTrace {
        trace(
            vec![
                enter("main", 1, &[]),
                assign("main", 1, "p", "malloc(32)", Some(0)),
                assign("main", 2, "p", "malloc(64)", Some(1)),
                free("main", 2, "p"),
                scope_exit("main", 3, &["p"]),
                ret("main", 3, None, None),
            ],
            vec![site(0, 1), site(1, 2)],
        )
    }

    #[test]
    fn test_pointer_reuse_is_path_loss_at_reassignment() {
        let cause = track(&pointer_reuse_trace(), AllocId(0)).unwrap();
        assert_eq!(cause.kind, LeakKind::PathLossByReassignment);
        assert_eq!(cause.witness, Witness::Assign);
        assert_eq!(cause.line, 2);
        assert_eq!(cause.roots_at_leak, vec!["p".to_string()]);
    }

    #[test]
    fn test_pointer_reuse_second_instance_reaches_the_free() {
        // Tracking the second allocation: `free(p)` resolves it directly,
        // which contradicts a definitely-lost report for it.
        let err = track(&pointer_reuse_trace(), AllocId(1)).unwrap_err();
        assert_eq!(err, Inconclusive::ReasonMismatch);
    }

    /// Pair *mk(a,b){ Pair *p = malloc(..); p->k = malloc(..);
    ///   p->v = malloc(..); return p; }
    /// int main(void){ Pair *q = mk("n","a"); free(q->k); free(q); }
    fn container_trace() -> ExecTrace {
        trace(
            vec![
                enter("main", 10, &[]),
                enter("mk", 2, &[("a", "\"n\""), ("b", "\"a\"")]),
                assign("mk", 2, "p", "malloc(sizeof *p)", Some(0)),
                assign("mk", 3, "p->k", "malloc(strlen(a) + 1)", Some(1)),
                assign("mk", 4, "p->v", "malloc(strlen(b) + 1)", Some(2)),
                scope_exit("mk", 5, &[]),
                ret("mk", 10, Some("p"), Some("q")),
                free("main", 11, "q->k"),
                free("main", 12, "q"),
                scope_exit("main", 13, &["q"]),
                ret("main", 13, None, None),
            ],
            vec![site(0, 2), site(1, 3), site(2, 4)],
        )
    }

    #[test]
    fn test_container_freed_first() {
        let cause = track(&container_trace(), AllocId(2)).unwrap();
        assert_eq!(cause.kind, LeakKind::ContainerFreedFirst);
        assert_eq!(cause.witness, Witness::Free);
        assert_eq!(cause.line, 12);
        assert_eq!(cause.roots_at_leak, vec!["q->v".to_string()]);
    }

    #[test]
    fn test_sibling_field_free_does_not_touch_other_roots() {
        // Tracking q->k: its own free resolves it directly.
        let err = track(&container_trace(), AllocId(1)).unwrap_err();
        assert_eq!(err, Inconclusive::ReasonMismatch);
    }

    /// void cleanup(void){ char *arr[5]; for(..) arr[i]=malloc(16);
    ///   for(i<4) free(arr[i]); }
    fn array_off_by_one_trace() -> ExecTrace {
        let mut events = vec![enter("main", 20, &[]), enter("cleanup", 2, &[])];
        for i in 0..5u32 {
            events.push(ev(
                "cleanup",
                3,
                TraceEventKind::LoopIter {
                    iteration: i,
                    body: vec![assign(
                        "cleanup",
                        3,
                        &format!("arr[{i}]"),
                        "malloc(16)",
                        Some(i),
                    )],
                },
            ));
        }
        for i in 0..4u32 {
            events.push(ev(
                "cleanup",
                5,
                TraceEventKind::LoopIter {
                    iteration: i,
                    body: vec![free("cleanup", 5, &format!("arr[{i}]"))],
                },
            ));
        }
        events.push(scope_exit("cleanup", 7, &["arr", "i"]));
        events.push(ret("cleanup", 20, None, None));
        events.push(scope_exit("main", 21, &[]));
        events.push(ret("main", 21, None, None));
        trace(
            events,
            (0..5).map(|i| site(i, 3)).collect(),
        )
    }

    #[test]
    fn test_array_partial_cleanup_misses_last_element() {
        let cause = track(&array_off_by_one_trace(), AllocId(4)).unwrap();
        assert_eq!(cause.kind, LeakKind::MissingFree);
        assert_eq!(cause.witness, Witness::ScopeExit);
        assert_eq!(cause.function, "cleanup");
        assert_eq!(cause.line, 7);
        assert_eq!(cause.roots_at_leak, vec!["arr[4]".to_string()]);
    }

    #[test]
    fn test_array_freed_elements_resolve_directly() {
        let err = track(&array_off_by_one_trace(), AllocId(2)).unwrap_err();
        assert_eq!(err, Inconclusive::ReasonMismatch);
    }

    /// char *create_buffer(size){ char *buf = malloc(size); return buf; }
    /// void process(should_free){ char *data = create_buffer(64);
    ///   if (should_free) free(data); }
    /// called with should_free = 0.
    fn conditional_not_taken_trace() -> ExecTrace {
        trace(
            vec![
                enter("main", 30, &[]),
                enter("process", 20, &[("should_free", "0")]),
                enter("create_buffer", 12, &[("size", "64")]),
                assign("create_buffer", 12, "buf", "malloc(size)", Some(0)),
                scope_exit("create_buffer", 14, &["size"]),
                ret("create_buffer", 21, Some("buf"), Some("data")),
                ev(
                    "process",
                    22,
                    TraceEventKind::Cond {
                        taken: false,
                        text: "should_free".to_string(),
                    },
                ),
                scope_exit("process", 24, &["should_free", "data"]),
                ret("process", 30, None, None),
                scope_exit("main", 31, &[]),
                ret("main", 31, None, None),
            ],
            vec![site(0, 12)],
        )
    }

    #[test]
    fn test_conditional_free_not_taken() {
        let cause = track(&conditional_not_taken_trace(), AllocId(0)).unwrap();
        assert_eq!(cause.kind, LeakKind::MissingFree);
        assert_eq!(cause.witness, Witness::ScopeExit);
        assert_eq!(cause.function, "process");
        assert_eq!(cause.roots_at_leak, vec!["data".to_string()]);
    }

    /// Allocation in level_5 returned through level_4..level_2, stored into
    /// node->data inside level_3, node freed in level_1.
    fn chained_returns_trace() -> ExecTrace {
        trace(
            vec![
                enter("main", 60, &[]),
                enter("level_1", 50, &[]),
                enter("level_2", 40, &[]),
                enter("level_3", 30, &[]),
                enter("level_4", 20, &[]),
                enter("level_5", 10, &[]),
                assign("level_5", 10, "buf", "malloc(64)", Some(0)),
                scope_exit("level_5", 12, &[]),
                ret("level_5", 21, Some("buf"), Some("chunk")),
                scope_exit("level_4", 22, &[]),
                ret("level_4", 31, Some("chunk"), Some("payload")),
                assign("level_3", 32, "node", "malloc(sizeof *node)", Some(1)),
                alias("level_3", 33, "node->data", "payload"),
                scope_exit("level_3", 35, &["payload"]),
                ret("level_3", 41, Some("node"), Some("n")),
                scope_exit("level_2", 42, &[]),
                ret("level_2", 51, Some("n"), Some("node")),
                free("level_1", 52, "node"),
                scope_exit("level_1", 53, &["node"]),
                ret("level_1", 60, None, None),
                scope_exit("main", 61, &[]),
                ret("main", 61, None, None),
            ],
            vec![site(0, 10), site(1, 32)],
        )
    }

    #[test]
    fn test_chained_returns_container_freed_first() {
        let cause = track(&chained_returns_trace(), AllocId(0)).unwrap();
        assert_eq!(cause.kind, LeakKind::ContainerFreedFirst);
        assert_eq!(cause.witness, Witness::Free);
        assert_eq!(cause.function, "level_1");
        assert_eq!(cause.line, 52);
        assert_eq!(cause.roots_at_leak, vec!["node->data".to_string()]);
    }

    #[test]
    fn test_discarded_allocation_is_missing_free_at_alloc_site() {
        let t = trace(
            vec![
                enter("main", 1, &[]),
                ev(
                    "main",
                    2,
                    TraceEventKind::Enter {
                        function: "malloc".to_string(),
                        transparent: false,
                        arg_bindings: Vec::new(),
                    },
                ),
                ev(
                    "main",
                    2,
                    TraceEventKind::Return {
                        function: "malloc".to_string(),
                        return_expr: Some("malloc(128)".to_string()),
                        return_holder: None,
                        alloc: Some(AllocId(0)),
                    },
                ),
                scope_exit("main", 4, &[]),
                ret("main", 4, None, None),
            ],
            vec![site(0, 2)],
        );
        let cause = track(&t, AllocId(0)).unwrap();
        assert_eq!(cause.kind, LeakKind::MissingFree);
        assert_eq!(cause.witness, Witness::Return);
        assert_eq!(cause.line, 2);
        assert!(cause.roots_at_leak.is_empty());
    }

    #[test]
    fn test_null_assignment_destroys_path() {
        let t = trace(
            vec![
                enter("main", 1, &[]),
                assign("main", 1, "p", "malloc(32)", Some(0)),
                assign("main", 2, "p", "NULL", None),
                scope_exit("main", 3, &["p"]),
                ret("main", 3, None, None),
            ],
            vec![site(0, 1)],
        );
        let cause = track(&t, AllocId(0)).unwrap();
        assert_eq!(cause.kind, LeakKind::PathLossByReassignment);
        assert_eq!(cause.line, 2);
    }

    #[test]
    fn test_alias_keeps_source_root_alive() {
        // I5: aliasing never removes the source; overwriting the alias
        // afterwards leaves the source reaching the allocation.
        let t = trace(
            vec![
                enter("main", 1, &[]),
                assign("main", 1, "p", "malloc(32)", Some(0)),
                alias("main", 2, "q", "p"),
                assign("main", 3, "q", "NULL", None),
                free("main", 4, "p"),
            ],
            vec![site(0, 1)],
        );
        // p survives the q overwrite, so the free resolves directly.
        let err = track(&t, AllocId(0)).unwrap_err();
        assert_eq!(err, Inconclusive::ReasonMismatch);
    }

    #[test]
    fn test_opaque_frame_does_not_consume_roots() {
        let t = trace(
            vec![
                enter("main", 1, &[]),
                assign("main", 1, "p", "malloc(32)", Some(0)),
                ev(
                    "helper",
                    5,
                    TraceEventKind::Enter {
                        function: "helper".to_string(),
                        transparent: false,
                        arg_bindings: Vec::new(),
                    },
                ),
                ret("helper", 2, None, None),
                scope_exit("main", 3, &["p"]),
                ret("main", 3, None, None),
            ],
            vec![site(0, 1)],
        );
        let cause = track(&t, AllocId(0)).unwrap();
        // The opaque call changed nothing; the scope exit is the witness.
        assert_eq!(cause.kind, LeakKind::MissingFree);
        assert_eq!(cause.witness, Witness::ScopeExit);
    }

    #[test]
    fn test_verdict_is_deterministic() {
        let t = container_trace();
        let a = track(&t, AllocId(2)).unwrap();
        let b = track(&t, AllocId(2)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_freed_flag_only_changes_on_free_events() {
        // I1: walk a trace with no direct free of the tracked allocation;
        // the verdict must report freed == false.
        let cause = track(&scope_leak_trace(), AllocId(0)).unwrap();
        assert!(!cause.freed);
        let cause = track(&pointer_reuse_trace(), AllocId(0)).unwrap();
        assert!(!cause.freed);
    }

    #[test]
    fn test_trace_without_binding_event_is_truncated() {
        let t = trace(
            vec![enter("main", 1, &[]), ret("main", 2, None, None)],
            vec![],
        );
        let err = track(&t, AllocId(0)).unwrap_err();
        assert!(matches!(err, Inconclusive::TraceTruncated { .. }));
    }

    #[test]
    fn test_end_of_trace_with_live_roots_is_missing_free() {
        // Trace cut off before main unwinds (no ScopeExit for main).
        let t = trace(
            vec![
                enter("main", 1, &[]),
                assign("main", 1, "p", "malloc(32)", Some(0)),
                assign("main", 2, "n", "5", None),
            ],
            vec![site(0, 1)],
        );
        let cause = track(&t, AllocId(0)).unwrap();
        assert_eq!(cause.kind, LeakKind::MissingFree);
        assert_eq!(cause.witness, Witness::EndOfTrace);
        assert_eq!(cause.roots_at_leak, vec!["p".to_string()]);
    }
}
