//! Dynamic execution tracer.
//!
//! Drives the debugger through the analyzed program at source-line
//! granularity, following the path actually taken across branches, loops,
//! and calls, and emits the linear `ExecTrace` the ownership tracker
//! consumes. Runtime values are read only to decide branch direction and
//! allocation identity; everything else stays symbolic source text.

pub mod session;

use std::collections::HashMap;
use std::path::Path;

use crate::config::{AnalysisConfig, CancelFlag};
use crate::context::SourceCache;
use crate::error::TraceError;
use crate::models::{
    AccessPath, AllocId, AllocationSite, ExecTrace, TraceEvent, TraceEventKind,
};
use crate::syntax::{self, Action};

use session::{DebuggerSession, StackFrame};

/// One open function frame as the tracer sees it.
struct OpenFrame {
    function: String,
    file: Option<String>,
    /// Body text could be extracted; opaque frames are finished, not
    /// stepped.
    transparent: bool,
    /// Closing-brace line, for ScopeExit placement.
    end_line: Option<u32>,
    params: Vec<String>,
    /// Locals the debugger reported at the most recent stop inside this
    /// frame; these are the bindings that die at the closing brace.
    live_locals: Vec<String>,
    /// Expression of the `return` statement seen last in this frame.
    pending_return: Option<String>,
    /// Set when the returned expression is itself an allocator call; the
    /// frame's Return event then carries a fresh allocation.
    return_alloc_site: Option<(String, u32)>,
    /// Caller-side context: file, line, and assignment LHS of the call.
    call_site: Option<(String, u32, Option<String>)>,
}

/// Assignment whose RHS is a call; resolved once we know whether the
/// callee was actually descended into.
struct DeferredAssign {
    lhs: String,
    rhs: String,
    is_declaration: bool,
    file: String,
    line: u32,
    function: String,
}

pub struct Tracer<'a> {
    cfg: &'a AnalysisConfig,
    sources: &'a SourceCache,
    cancel: CancelFlag,
}

impl<'a> Tracer<'a> {
    pub fn new(cfg: &'a AnalysisConfig, sources: &'a SourceCache, cancel: CancelFlag) -> Tracer<'a> {
        Tracer {
            cfg,
            sources,
            cancel,
        }
    }

    /// Run the program once under the debugger and capture the full trace,
    /// rooted at `main`.
    pub fn trace(&self, executable: &Path, args: &[String]) -> Result<ExecTrace, TraceError> {
        let mut session = DebuggerSession::spawn(&self.cfg.debugger, executable, args)?;
        if let Some(platform) = &self.cfg.platform {
            session.command(&format!("set architecture {platform}"))?;
        }

        let break_out = session.command("break main")?;
        if break_out.contains("not defined") {
            return Err(TraceError::SymbolsMissing {
                executable: executable.display().to_string(),
            });
        }
        let run_out = session.command("run")?;
        let stop = session::parse_stop(&run_out);
        let (Some(file), Some(line)) = (stop.file.clone(), stop.line) else {
            return Err(TraceError::SymbolsMissing {
                executable: executable.display().to_string(),
            });
        };

        let mut run = TraceRun {
            cfg: self.cfg,
            sources: self.sources,
            cancel: self.cancel.clone(),
            session,
            events: Vec::new(),
            allocations: Vec::new(),
            site_seq: HashMap::new(),
            frames: Vec::new(),
            deferred: None,
            steps: 0,
            exited: false,
        };

        run.open_frame("main".to_string(), Some(file), line, None);
        let outcome = run.step_loop();
        if let Err(TraceError::Cancelled) = outcome {
            // Close open frames in reverse so the trace stays well formed,
            // then let the caller discard the partial result.
            run.close_all_frames();
        }
        run.session.close();
        outcome?;
        Ok(ExecTrace {
            events: group_loops(run.events),
            allocations: run.allocations,
        })
    }
}

struct TraceRun<'a> {
    cfg: &'a AnalysisConfig,
    sources: &'a SourceCache,
    cancel: CancelFlag,
    session: DebuggerSession,
    events: Vec<TraceEvent>,
    allocations: Vec<AllocationSite>,
    site_seq: HashMap<(String, u32), u32>,
    frames: Vec<OpenFrame>,
    deferred: Option<DeferredAssign>,
    steps: u32,
    /// Set as soon as any debugger response reports program exit.
    exited: bool,
}

impl TraceRun<'_> {
    fn step_loop(&mut self) -> Result<(), TraceError> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(TraceError::Cancelled);
            }
            self.steps += 1;
            if self.steps > self.cfg.max_trace_steps {
                return Err(TraceError::StepLimitExceeded {
                    cap: self.cfg.max_trace_steps,
                });
            }

            let bt_out = self.session.command("backtrace")?;
            let stack = user_stack(&session::parse_backtrace(&bt_out));
            if stack.is_empty() {
                // Below main (startup code) or inside a library frame with
                // no user ancestry; run until something user-visible.
                self.advance("finish")?;
                if self.exited {
                    self.close_all_frames();
                    return Ok(());
                }
                continue;
            }

            self.sync_frames(&stack)?;

            let top = &stack[0];
            let (Some(file), Some(line)) = (top.file.clone(), top.line) else {
                // Symbol-less frame: treat as opaque and pop back out.
                self.advance("finish")?;
                if self.exited {
                    self.close_all_frames();
                    return Ok(());
                }
                continue;
            };

            let frame_transparent = self.frames.last().map(|f| f.transparent).unwrap_or(false);
            if !frame_transparent {
                self.advance("finish")?;
                if self.exited {
                    self.close_all_frames();
                    return Ok(());
                }
                continue;
            }

            // Refresh the frame's scope snapshot before executing the
            // line: what `info locals` reports at the last stop inside a
            // frame is exactly what dies at its closing brace.
            let locals_out = self.session.command("info locals")?;
            let locals = session::parse_locals(&locals_out);
            if let Some(frame) = self.frames.last_mut() {
                frame.live_locals = locals;
            }

            let text = self.sources.line_text(&file, line).unwrap_or_default();
            self.handle_line(&file, line, &top.function, &text)?;
            if self.exited {
                self.close_all_frames();
                return Ok(());
            }
        }
    }

    /// Issue one debugger command, folding program exit into `self.exited`.
    fn advance(&mut self, cmd: &str) -> Result<String, TraceError> {
        let out = self.session.command(cmd)?;
        if session::parse_stop(&out).exited {
            self.exited = true;
        }
        Ok(out)
    }

    /// Reconcile our open-frame stack with the debugger's. Deeper means a
    /// call was entered; shallower means frames returned.
    fn sync_frames(&mut self, stack: &[StackFrame]) -> Result<(), TraceError> {
        // Unwind frames the debugger no longer has.
        while self.frames.len() > stack.len() {
            self.emit_frame_close();
        }
        if self.frames.len() == stack.len() {
            let changed = self
                .frames
                .last()
                .is_some_and(|f| stack[0].function != f.function);
            if changed {
                // Same depth, different function: a return followed by a
                // call landed between two snapshots.
                self.emit_frame_close();
            } else {
                self.deferred_to_assign();
                return Ok(());
            }
        }
        while self.frames.len() < stack.len() {
            let depth_from_top = stack.len() - self.frames.len() - 1;
            let frame = &stack[depth_from_top];
            let caller = stack.get(depth_from_top + 1);
            let call_site = caller.and_then(|c| {
                let file = c.file.clone()?;
                let line = c.line?;
                let holder = self.call_holder(&file, line, &frame.function);
                Some((file, line, holder))
            });
            self.deferred = None; // consumed by the call we just entered
            self.open_frame(
                frame.function.clone(),
                frame.file.clone(),
                frame.line.unwrap_or(0),
                call_site,
            );
        }
        self.deferred_to_assign();
        Ok(())
    }

    /// A deferred call-assignment whose callee was never entered is a real
    /// assignment of an unreadable value: emit it so overwrites are seen.
    fn deferred_to_assign(&mut self) {
        if let Some(d) = self.deferred.take() {
            self.events.push(TraceEvent {
                file: d.file,
                line: d.line,
                function: d.function,
                kind: TraceEventKind::Assign {
                    lhs: d.lhs,
                    rhs: d.rhs,
                    is_declaration: d.is_declaration,
                    alloc: None,
                },
            });
        }
    }

    /// LHS of the call assignment at the caller's current line, when the
    /// call to `callee` is the whole RHS.
    fn call_holder(&self, file: &str, line: u32, callee: &str) -> Option<String> {
        let text = self.sources.line_text(file, line)?;
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

    fn open_frame(
        &mut self,
        function: String,
        file: Option<String>,
        line: u32,
        call_site: Option<(String, u32, Option<String>)>,
    ) {
        let view = file
            .as_deref()
            .and_then(|f| self.sources.function_at(f, line).ok());
        let transparent = view.is_some();
        let params = view.as_ref().map(|v| v.params.clone()).unwrap_or_default();
        let end_line = view.as_ref().map(|v| v.end_line);

        let arg_bindings = call_site
            .as_ref()
            .map(|(cfile, cline, _)| self.arg_bindings(cfile, *cline, &function, &params))
            .unwrap_or_default();

        let (event_file, event_line) = (file.clone().unwrap_or_else(|| "?".to_string()), line);
        self.events.push(TraceEvent {
            file: event_file,
            line: event_line,
            function: function.clone(),
            kind: TraceEventKind::Enter {
                function: function.clone(),
                transparent,
                arg_bindings,
            },
        });

        self.frames.push(OpenFrame {
            function,
            file,
            transparent,
            end_line,
            params,
            live_locals: Vec::new(),
            pending_return: None,
            return_alloc_site: None,
            call_site,
        });
    }

    /// Pair callee parameters with the argument expressions written at the
    /// call site.
    fn arg_bindings(
        &self,
        caller_file: &str,
        caller_line: u32,
        callee: &str,
        params: &[String],
    ) -> Vec<(String, String)> {
        let Some(text) = self.sources.line_text(caller_file, caller_line) else {
            return Vec::new();
        };
        let mut args: Option<Vec<String>> = None;
        for action in syntax::classify_line(&text).actions {
            match action {
                Action::Call {
                    callee: name,
                    args: a,
                } if name == callee => {
                    args = Some(a);
                    break;
                }
                Action::Assign { rhs, .. } => {
                    if let Some((name, a)) = syntax::leading_call(&rhs) {
                        if name == callee {
                            args = Some(a);
                            break;
                        }
                    }
                }
                _ => {}
            }
        }
        match args {
            Some(args) => params
                .iter()
                .cloned()
                .zip(args.into_iter())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Emit ScopeExit + Return for the innermost open frame.
    fn emit_frame_close(&mut self) {
        let Some(frame) = self.frames.pop() else {
            return;
        };
        let returned_head = frame
            .pending_return
            .as_deref()
            .and_then(AccessPath::parse)
            .map(|p| p.head);

        let mut dying: Vec<String> = Vec::new();
        for name in frame.params.iter().chain(frame.live_locals.iter()) {
            if Some(name.as_str()) != returned_head.as_deref() && !dying.contains(name) {
                dying.push(name.clone());
            }
        }

        let brace_line = frame.end_line.unwrap_or(0);
        let frame_file = frame.file.clone().unwrap_or_else(|| "?".to_string());
        if !dying.is_empty() {
            self.events.push(TraceEvent {
                file: frame_file.clone(),
                line: brace_line,
                function: frame.function.clone(),
                kind: TraceEventKind::ScopeExit { dying },
            });
        }

        let alloc = frame
            .return_alloc_site
            .map(|(f, l)| self.new_alloc(&f, l, None));
        let (ret_file, ret_line, holder) = match frame.call_site {
            Some((f, l, h)) => (f, l, h),
            None => (frame_file, brace_line, None),
        };
        self.events.push(TraceEvent {
            file: ret_file,
            line: ret_line,
            function: frame.function.clone(),
            kind: TraceEventKind::Return {
                function: frame.function,
                return_expr: frame.pending_return,
                return_holder: holder,
                alloc,
            },
        });
    }

    fn close_all_frames(&mut self) {
        while !self.frames.is_empty() {
            self.emit_frame_close();
        }
    }

    /// Process the current source line: emit events and advance the
    /// debugger past it.
    fn handle_line(
        &mut self,
        file: &str,
        line: u32,
        function: &str,
        text: &str,
    ) -> Result<(), TraceError> {
        let analysis = syntax::classify_line(text);

        let mut taken = true;
        if let Some(cond) = &analysis.cond {
            taken = self.observe_branch(file, line, function, cond)?;
        }

        let mut advanced = false;
        if taken {
            for action in &analysis.actions {
                advanced |= self.handle_action(file, line, function, action)?;
                if self.exited {
                    return Ok(());
                }
            }
        }

        if !advanced {
            self.advance("step")?;
        }
        Ok(())
    }

    /// Record the branch outcome. Conditions without side effects are read
    /// directly; anything containing a call is judged by where execution
    /// lands instead.
    fn observe_branch(
        &mut self,
        file: &str,
        line: u32,
        function: &str,
        cond: &str,
    ) -> Result<bool, TraceError> {
        let taken = if cond.is_empty() {
            true
        } else if has_call(cond) {
            // Evaluated after the step below by the next stop line; assume
            // taken so inline actions are not silently dropped.
            true
        } else {
            let out = self.session.command(&format!("print (int)({cond})"))?;
            session::parse_print_value(&out).map(|v| v != 0).unwrap_or(true)
        };
        self.events.push(TraceEvent {
            file: file.to_string(),
            line,
            function: function.to_string(),
            kind: TraceEventKind::Cond {
                taken,
                text: cond.to_string(),
            },
        });
        Ok(taken)
    }

    /// Apply one action from the current line. Returns true when the
    /// debugger was already advanced past the line.
    fn handle_action(
        &mut self,
        file: &str,
        line: u32,
        function: &str,
        action: &Action,
    ) -> Result<bool, TraceError> {
        match action {
            Action::Return { expr } => {
                let returns_fresh_alloc = expr
                    .as_deref()
                    .and_then(syntax::leading_call)
                    .is_some_and(|(callee, _)| self.cfg.allocators.iter().any(|a| a == &callee));
                if let Some(frame) = self.frames.last_mut() {
                    frame.pending_return = expr.clone();
                    if returns_fresh_alloc {
                        frame.return_alloc_site = Some((file.to_string(), line));
                    }
                }
                Ok(false)
            }
            Action::Assign {
                lhs,
                rhs,
                is_declaration,
            } => {
                if let Some((callee, args)) = syntax::leading_call(rhs) {
                    if self.cfg.allocators.iter().any(|a| a == &callee) {
                        self.record_allocation(file, line, function, lhs, rhs, &callee, &args, *is_declaration)?;
                        return Ok(true);
                    }
                    // Call into something else: binding is carried by the
                    // callee's Return when it is entered, or replayed as a
                    // plain assignment when it is not.
                    self.deferred = Some(DeferredAssign {
                        lhs: lhs.clone(),
                        rhs: rhs.clone(),
                        is_declaration: *is_declaration,
                        file: file.to_string(),
                        line,
                        function: function.to_string(),
                    });
                    return Ok(false);
                }
                let lhs_resolved = self.resolve_indices(lhs)?;
                let rhs_trim = rhs.trim();
                let is_null = rhs_trim == "NULL" || rhs_trim == "nullptr" || rhs_trim == "0";
                let kind = match AccessPath::parse(rhs) {
                    Some(_) if !is_null => TraceEventKind::Alias {
                        lhs: lhs_resolved,
                        rhs: rhs_trim.to_string(),
                    },
                    _ => TraceEventKind::Assign {
                        lhs: lhs_resolved,
                        rhs: rhs_trim.to_string(),
                        is_declaration: *is_declaration,
                        alloc: None,
                    },
                };
                self.events.push(TraceEvent {
                    file: file.to_string(),
                    line,
                    function: function.to_string(),
                    kind,
                });
                Ok(false)
            }
            Action::Call { callee, args } => {
                if self.cfg.free_wrappers.iter().any(|f| f == callee) {
                    let arg = args.first().cloned().unwrap_or_default();
                    let arg = self.resolve_indices(&arg)?;
                    self.events.push(TraceEvent {
                        file: file.to_string(),
                        line,
                        function: function.to_string(),
                        kind: TraceEventKind::Free { arg },
                    });
                    self.advance("next")?;
                    return Ok(true);
                }
                if self.cfg.allocators.iter().any(|a| a == callee) {
                    // Allocation whose result is discarded: a synthesized
                    // enter/return pair with no receiver.
                    let id = self.new_alloc(file, line, None);
                    self.events.push(TraceEvent {
                        file: file.to_string(),
                        line,
                        function: function.to_string(),
                        kind: TraceEventKind::Enter {
                            function: callee.clone(),
                            transparent: false,
                            arg_bindings: Vec::new(),
                        },
                    });
                    self.events.push(TraceEvent {
                        file: file.to_string(),
                        line,
                        function: function.to_string(),
                        kind: TraceEventKind::Return {
                            function: callee.clone(),
                            return_expr: Some(format!("{}({})", callee, args.join(", "))),
                            return_holder: None,
                            alloc: Some(id),
                        },
                    });
                    self.advance("next")?;
                    return Ok(true);
                }
                // Other calls are descended into (or skipped) by `step`.
                Ok(false)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_allocation(
        &mut self,
        file: &str,
        line: u32,
        function: &str,
        lhs: &str,
        rhs: &str,
        callee: &str,
        args: &[String],
        is_declaration: bool,
    ) -> Result<(), TraceError> {
        // realloc releases its pointer argument before the new block is
        // bound; surface that as an explicit free.
        if callee == "realloc" {
            if let Some(old) = args.first() {
                if old.trim() != "NULL" && AccessPath::parse(old).is_some() {
                    self.events.push(TraceEvent {
                        file: file.to_string(),
                        line,
                        function: function.to_string(),
                        kind: TraceEventKind::Free {
                            arg: old.trim().to_string(),
                        },
                    });
                }
            }
        }

        let lhs_resolved = self.resolve_indices(lhs)?;
        self.advance("next")?;

        let address = if self.exited {
            None
        } else {
            let out = self
                .session
                .command(&format!("print (long)({lhs_resolved})"))?;
            session::parse_print_value(&out).map(|v| v as u64)
        };

        let id = self.new_alloc(file, line, address);
        self.events.push(TraceEvent {
            file: file.to_string(),
            line,
            function: function.to_string(),
            kind: TraceEventKind::Assign {
                lhs: lhs_resolved,
                rhs: rhs.to_string(),
                is_declaration,
                alloc: Some(id),
            },
        });
        Ok(())
    }

    fn new_alloc(&mut self, file: &str, line: u32, address: Option<u64>) -> AllocId {
        let id = AllocId(self.allocations.len() as u32);
        let seq = self
            .site_seq
            .entry((file.to_string(), line))
            .and_modify(|s| *s += 1)
            .or_insert(0);
        self.allocations.push(AllocationSite {
            id,
            file: file.to_string(),
            line,
            address,
            seq_at_site: *seq,
        });
        id
    }

    /// Replace symbolic subscripts with their runtime values:
    /// `arr[i]` with `i == 3` becomes `arr[3]`.
    fn resolve_indices(&mut self, expr: &str) -> Result<String, TraceError> {
        let Some(path) = AccessPath::parse(expr) else {
            return Ok(expr.trim().to_string());
        };
        let mut resolved = path;
        for seg in resolved.segs.iter_mut() {
            if let crate::models::PathSeg::Index(idx) = seg {
                if idx.parse::<i64>().is_err() && !has_call(idx) {
                    let out = self.session.command(&format!("print (long)({idx})"))?;
                    if let Some(v) = session::parse_print_value(&out) {
                        *idx = v.to_string();
                    }
                }
            }
        }
        Ok(resolved.to_string())
    }
}

/// Frames from the innermost up to and including `main`; anything below
/// `main` (runtime startup) is cut off.
fn user_stack(frames: &[StackFrame]) -> Vec<StackFrame> {
    let Some(main_idx) = frames.iter().position(|f| f.function == "main") else {
        return Vec::new();
    };
    frames[..=main_idx].to_vec()
}

/// True when the expression contains something shaped like a call.
fn has_call(expr: &str) -> bool {
    let mut prev_ident = false;
    for c in expr.chars() {
        if c == '(' && prev_ident {
            return true;
        }
        prev_ident = c.is_ascii_alphanumeric() || c == '_';
    }
    false
}

// ---------------------------------------------------------------------------
// Loop grouping
// ---------------------------------------------------------------------------

/// Group repeated visits to the same source line within one frame into
/// `LoopIter` events. Purely structural: the tracker replays iteration
/// bodies in order, so grouping never changes tracking semantics.
pub fn group_loops(events: Vec<TraceEvent>) -> Vec<TraceEvent> {
    // Split into top-level items: single events, or Enter..Return blocks
    // kept atomic so an iteration boundary can never split a call.
    let items = into_items(events);
    let grouped = group_items(items);
    grouped.into_iter().flat_map(Item::into_events).collect()
}

enum Item {
    One(TraceEvent),
    Block(Vec<TraceEvent>),
    Loop(Vec<TraceEvent>),
}

impl Item {
    fn line(&self) -> Option<(String, u32)> {
        match self {
            Item::One(e) => Some((e.file.clone(), e.line)),
            Item::Block(es) => es.first().map(|e| (e.file.clone(), e.line)),
            Item::Loop(_) => None,
        }
    }

    fn into_events(self) -> Vec<TraceEvent> {
        match self {
            Item::One(e) => vec![e],
            Item::Block(es) => es,
            Item::Loop(es) => es,
        }
    }
}

fn into_items(events: Vec<TraceEvent>) -> Vec<Item> {
    let mut items = Vec::new();
    let mut iter = events.into_iter().peekable();
    while let Some(event) = iter.next() {
        if matches!(event.kind, TraceEventKind::Enter { .. }) {
            let mut block = vec![event];
            let mut depth = 1u32;
            for inner in iter.by_ref() {
                match inner.kind {
                    TraceEventKind::Enter { .. } => depth += 1,
                    TraceEventKind::Return { .. } => depth -= 1,
                    _ => {}
                }
                block.push(inner);
                if depth == 0 {
                    break;
                }
            }
            // The frame body groups its own loops; the block stays atomic
            // only from the outside.
            if depth == 0 && block.len() > 2 {
                let ret = block.pop().expect("return just pushed");
                let enter = block.remove(0);
                let mut rebuilt = vec![enter];
                rebuilt.extend(group_loops(block));
                rebuilt.push(ret);
                block = rebuilt;
            }
            items.push(Item::Block(block));
        } else {
            items.push(Item::One(event));
        }
    }
    items
}

fn group_items(items: Vec<Item>) -> Vec<Item> {
    // Find the first line visited more than once; that is the head of the
    // outermost loop in this span.
    let mut first_seen: HashMap<(String, u32), usize> = HashMap::new();
    let mut head: Option<((String, u32), usize)> = None;
    for (i, item) in items.iter().enumerate() {
        let Some(key) = item.line() else { continue };
        match first_seen.get(&key) {
            Some(&first) => {
                head = Some((key, first));
                break;
            }
            None => {
                first_seen.insert(key, i);
            }
        }
    }
    let Some((head_key, head_idx)) = head else {
        return items;
    };

    let mut out: Vec<Item> = Vec::new();
    let mut iter = items.into_iter();
    for _ in 0..head_idx {
        out.push(iter.next().expect("prefix within bounds"));
    }

    // Partition the rest into iterations delimited by the head line.
    let mut iterations: Vec<Vec<Item>> = Vec::new();
    let mut tail: Vec<Item> = Vec::new();
    let mut current: Vec<Item> = Vec::new();
    for item in iter {
        let key = item.line();
        if key.as_ref() == Some(&head_key) && !current.is_empty() {
            iterations.push(std::mem::take(&mut current));
        }
        if let Some((ref f, l)) = key {
            // A line before the head in the same file ends the loop region.
            if *f == head_key.0 && l < head_key.1 {
                if !current.is_empty() {
                    iterations.push(std::mem::take(&mut current));
                }
                tail.push(item);
                continue;
            }
        }
        if !tail.is_empty() {
            tail.push(item);
        } else {
            current.push(item);
        }
    }
    if !current.is_empty() {
        iterations.push(current);
    }

    for (index, iteration) in iterations.into_iter().enumerate() {
        // Inner loops group recursively.
        let body_items = group_items(iteration);
        let body: Vec<TraceEvent> = body_items.into_iter().flat_map(Item::into_events).collect();
        let (file, line, function) = body
            .first()
            .map(|e| (e.file.clone(), e.line, e.function.clone()))
            .unwrap_or_else(|| (head_key.0.clone(), head_key.1, String::new()));
        out.push(Item::Loop(vec![TraceEvent {
            file,
            line,
            function,
            kind: TraceEventKind::LoopIter {
                iteration: index as u32,
                body,
            },
        }]));
    }
    out.extend(group_items(tail));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(line: u32, kind: TraceEventKind) -> TraceEvent {
        TraceEvent {
            file: "a.c".to_string(),
            line,
            function: "f".to_string(),
            kind,
        }
    }

    fn assign(line: u32, lhs: &str) -> TraceEvent {
        ev(
            line,
            TraceEventKind::Assign {
                lhs: lhs.to_string(),
                rhs: "x".to_string(),
                is_declaration: false,
                alloc: None,
            },
        )
    }

    fn cond(line: u32) -> TraceEvent {
        ev(
            line,
            TraceEventKind::Cond {
                taken: true,
                text: "i < 3".to_string(),
            },
        )
    }

    #[test]
    fn test_group_loops_wraps_repeated_lines() {
        // Lines: 4 (alias), then loop head 5 visited 3 times with a body
        // line 6, then exit line 8.
        let events = vec![
            assign(4, "a"),
            cond(5),
            assign(6, "b"),
            cond(5),
            assign(6, "b"),
            cond(5),
            assign(6, "b"),
            assign(8, "c"),
        ];
        let grouped = group_loops(events);
        let iter_count = grouped
            .iter()
            .filter(|e| matches!(e.kind, TraceEventKind::LoopIter { .. }))
            .count();
        assert_eq!(iter_count, 3);
        // Events before the loop stay flat.
        assert!(matches!(grouped[0].kind, TraceEventKind::Assign { .. }));
        // Each iteration holds its body.
        if let TraceEventKind::LoopIter { iteration, body } = &grouped[1].kind {
            assert_eq!(*iteration, 0);
            assert_eq!(body.len(), 2);
        } else {
            panic!("expected a LoopIter");
        }
    }

    #[test]
    fn test_group_loops_keeps_straight_line_untouched() {
        let events = vec![assign(4, "a"), assign(5, "b"), assign(6, "c")];
        let grouped = group_loops(events.clone());
        assert_eq!(grouped.len(), events.len());
        assert!(grouped
            .iter()
            .all(|e| !matches!(e.kind, TraceEventKind::LoopIter { .. })));
    }

    #[test]
    fn test_group_loops_keeps_call_blocks_atomic() {
        let enter = ev(
            10,
            TraceEventKind::Enter {
                function: "g".to_string(),
                transparent: true,
                arg_bindings: Vec::new(),
            },
        );
        let ret = ev(
            5,
            TraceEventKind::Return {
                function: "g".to_string(),
                return_expr: None,
                return_holder: None,
                alloc: None,
            },
        );
        let events = vec![
            cond(5),
            enter.clone(),
            assign(11, "x"),
            ret.clone(),
            cond(5),
            enter,
            assign(11, "x"),
            ret,
        ];
        let grouped = group_loops(events);
        // Two iterations, each containing the whole call block.
        let iters: Vec<_> = grouped
            .iter()
            .filter_map(|e| match &e.kind {
                TraceEventKind::LoopIter { body, .. } => Some(body.len()),
                _ => None,
            })
            .collect();
        assert_eq!(iters, vec![4, 4]);
    }

    #[test]
    fn test_group_loops_reaches_inside_frames() {
        let enter = ev(
            1,
            TraceEventKind::Enter {
                function: "main".to_string(),
                transparent: true,
                arg_bindings: Vec::new(),
            },
        );
        let ret = ev(
            9,
            TraceEventKind::Return {
                function: "main".to_string(),
                return_expr: None,
                return_holder: None,
                alloc: None,
            },
        );
        let events = vec![
            enter,
            cond(5),
            assign(6, "b"),
            cond(5),
            assign(6, "b"),
            ret,
        ];
        let grouped = group_loops(events);
        // Outer shape intact: Enter, ..., Return.
        assert!(matches!(grouped[0].kind, TraceEventKind::Enter { .. }));
        assert!(matches!(
            grouped.last().unwrap().kind,
            TraceEventKind::Return { .. }
        ));
        let iters = grouped
            .iter()
            .filter(|e| matches!(e.kind, TraceEventKind::LoopIter { .. }))
            .count();
        assert_eq!(iters, 2);
    }

    #[test]
    fn test_user_stack_cuts_below_main() {
        let frames = vec![
            StackFrame {
                index: 0,
                function: "mk".to_string(),
                file: Some("leaky.c".to_string()),
                line: Some(7),
            },
            StackFrame {
                index: 1,
                function: "main".to_string(),
                file: Some("leaky.c".to_string()),
                line: Some(15),
            },
            StackFrame {
                index: 2,
                function: "__libc_start_call_main".to_string(),
                file: None,
                line: None,
            },
        ];
        let user = user_stack(&frames);
        assert_eq!(user.len(), 2);
        assert_eq!(user.last().unwrap().function, "main");
    }

    #[test]
    fn test_has_call() {
        assert!(has_call("check(p)"));
        assert!(has_call("a + f(b)"));
        assert!(!has_call("i < 5"));
        assert!(!has_call("(a + b) * 2"));
    }
}
