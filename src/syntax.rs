//! C statement and signature analysis built on the tree-sitter C grammar.
//!
//! The dynamic tracer captures raw source lines from the debugged program;
//! this module turns one line at a time into structured actions (assignment,
//! call, return, branch header) without ever evaluating anything. A line is
//! parsed inside a synthetic function wrapper so statement fragments form a
//! valid translation unit.

use streaming_iterator::StreamingIterator;
use tree_sitter::{Node, Parser as TSParser, Query, QueryCursor};

/// Allocators recognized out of the box. Free wrappers live in
/// `AnalysisConfig`; this list is the allocation-side counterpart.
pub const DEFAULT_ALLOCATORS: &[&str] = &["malloc", "calloc", "realloc", "strdup"];

/// One executable action found on a source line, in source order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Assign {
        lhs: String,
        rhs: String,
        is_declaration: bool,
    },
    Call {
        callee: String,
        args: Vec<String>,
    },
    Return {
        expr: Option<String>,
    },
}

/// Structure of a single source line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineAnalysis {
    /// Condition text when the line opens an `if`/`while`/`for`/`do-while`.
    pub cond: Option<String>,
    /// True when the condition belongs to a loop rather than an `if`.
    pub loop_header: bool,
    pub actions: Vec<Action>,
    /// Names introduced by declarations on this line, initialized or not.
    pub declares: Vec<String>,
}

impl LineAnalysis {
    pub fn is_empty(&self) -> bool {
        self.cond.is_none() && self.actions.is_empty() && self.declares.is_empty()
    }
}

/// Parsed function signature: name and parameter names in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: String,
    pub params: Vec<String>,
    pub raw: String,
}

fn parse_c(source: &str) -> Option<tree_sitter::Tree> {
    let mut parser = TSParser::new();
    let language = tree_sitter_c::LANGUAGE;
    parser
        .set_language(&language.into())
        .expect("Error loading C grammar");
    parser.parse(source, None)
}

/// Classify one source line. Tolerant of fragments: an `if (x)` header with
/// its body on the next line still yields a condition, and a bare `}` or an
/// unparseable line yields an empty analysis.
pub fn classify_line(line: &str) -> LineAnalysis {
    let mut out = LineAnalysis::default();
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed == "{" || trimmed == "}" {
        return out;
    }

    let wrapped = format!("void __m(void)\n{{\n{trimmed}\n}}\n");
    let Some(tree) = parse_c(&wrapped) else {
        return fallback_classify(trimmed);
    };
    let src = wrapped.as_bytes();

    let Some(body) = function_body(tree.root_node()) else {
        return fallback_classify(trimmed);
    };

    let mut cursor = body.walk();
    for child in body.named_children(&mut cursor) {
        collect_statement(child, src, &mut out);
    }

    if out.is_empty() {
        return fallback_classify(trimmed);
    }
    out
}

fn function_body(root: Node) -> Option<Node> {
    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        if child.kind() == "function_definition" {
            return child.child_by_field_name("body");
        }
    }
    None
}

fn collect_statement(node: Node, src: &[u8], out: &mut LineAnalysis) {
    match node.kind() {
        "declaration" => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                if child.kind() == "init_declarator" {
                    let lhs = child
                        .child_by_field_name("declarator")
                        .and_then(|d| deepest_identifier(d, src));
                    let rhs = child
                        .child_by_field_name("value")
                        .map(|v| node_text(v, src));
                    if let (Some(lhs), Some(rhs)) = (lhs, rhs) {
                        out.declares.push(lhs.clone());
                        out.actions.push(Action::Assign {
                            lhs,
                            rhs,
                            is_declaration: true,
                        });
                    }
                } else if child.kind().ends_with("_declarator") || child.kind() == "identifier" {
                    // Plain declaration with no initializer: `char *t;`
                    if let Some(name) = deepest_identifier(child, src) {
                        out.declares.push(name);
                    }
                }
            }
        }
        "expression_statement" => {
            if let Some(expr) = node.named_child(0) {
                collect_expression(expr, src, out);
            }
        }
        "return_statement" => {
            let expr = node.named_child(0).map(|e| {
                let t = node_text(e, src);
                strip_grouping(&t)
            });
            out.actions.push(Action::Return { expr });
        }
        "if_statement" => {
            if out.cond.is_none() {
                out.cond = node
                    .child_by_field_name("condition")
                    .map(|c| strip_grouping(&node_text(c, src)));
            }
            if let Some(cons) = node.child_by_field_name("consequence") {
                collect_statement_or_block(cons, src, out);
            }
        }
        "while_statement" => {
            if out.cond.is_none() {
                out.cond = node
                    .child_by_field_name("condition")
                    .map(|c| strip_grouping(&node_text(c, src)));
                out.loop_header = true;
            }
            if let Some(body) = node.child_by_field_name("body") {
                collect_statement_or_block(body, src, out);
            }
        }
        "for_statement" => {
            if out.cond.is_none() {
                out.cond = Some(
                    node.child_by_field_name("condition")
                        .map(|c| strip_grouping(&node_text(c, src)))
                        .unwrap_or_default(),
                );
                out.loop_header = true;
            }
            if let Some(init) = node.child_by_field_name("initializer") {
                collect_expression(init, src, out);
            }
            if let Some(body) = node.child_by_field_name("body") {
                collect_statement_or_block(body, src, out);
            }
        }
        "do_statement" => {
            out.loop_header = true;
            if let Some(body) = node.child_by_field_name("body") {
                collect_statement_or_block(body, src, out);
            }
        }
        "compound_statement" => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                collect_statement(child, src, out);
            }
        }
        _ => {}
    }
}

fn collect_statement_or_block(node: Node, src: &[u8], out: &mut LineAnalysis) {
    if node.kind() == "compound_statement" {
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            collect_statement(child, src, out);
        }
    } else {
        collect_statement(node, src, out);
    }
}

fn collect_expression(node: Node, src: &[u8], out: &mut LineAnalysis) {
    match node.kind() {
        "assignment_expression" => {
            let lhs = node.child_by_field_name("left").map(|n| node_text(n, src));
            let rhs = node.child_by_field_name("right").map(|n| node_text(n, src));
            if let (Some(lhs), Some(rhs)) = (lhs, rhs) {
                out.actions.push(Action::Assign {
                    lhs,
                    rhs,
                    is_declaration: false,
                });
            }
        }
        "call_expression" => {
            if let Some(call) = call_parts(node, src) {
                out.actions.push(Action::Call {
                    callee: call.0,
                    args: call.1,
                });
            }
        }
        "comma_expression" => {
            let mut cursor = node.walk();
            for child in node.named_children(&mut cursor) {
                collect_expression(child, src, out);
            }
        }
        _ => {}
    }
}

fn call_parts(node: Node, src: &[u8]) -> Option<(String, Vec<String>)> {
    let callee = node.child_by_field_name("function")?;
    if callee.kind() != "identifier" {
        return None;
    }
    let name = node_text(callee, src);
    let mut args = Vec::new();
    if let Some(arg_list) = node.child_by_field_name("arguments") {
        let mut cursor = arg_list.walk();
        for arg in arg_list.named_children(&mut cursor) {
            if arg.kind() != "comment" {
                args.push(node_text(arg, src));
            }
        }
    }
    Some((name, args))
}

fn node_text(node: Node, src: &[u8]) -> String {
    node.utf8_text(src).unwrap_or_default().trim().to_string()
}

fn deepest_identifier(node: Node, src: &[u8]) -> Option<String> {
    if node.kind() == "identifier" {
        return Some(node_text(node, src));
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if let Some(found) = deepest_identifier(child, src) {
            return Some(found);
        }
    }
    None
}

fn strip_grouping(text: &str) -> String {
    let t = text.trim();
    if t.starts_with('(') && t.ends_with(')') && t.len() >= 2 {
        let inner = &t[1..t.len() - 1];
        // Only a grouping paren if it balances across the whole span.
        let mut depth = 0i32;
        for c in inner.chars() {
            match c {
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth < 0 {
                        return t.to_string();
                    }
                }
                _ => {}
            }
        }
        if depth == 0 {
            return inner.trim().to_string();
        }
    }
    t.to_string()
}

/// Last-resort textual classification for lines tree-sitter cannot parse in
/// isolation (dangling `else`, macro-heavy lines).
fn fallback_classify(trimmed: &str) -> LineAnalysis {
    let mut out = LineAnalysis::default();
    let head = trimmed.trim_start_matches("} ").trim_start_matches("else ");
    for (kw, looping) in [("if", false), ("while", true), ("for", true)] {
        let Some(rest) = head.strip_prefix(kw) else {
            continue;
        };
        let rest = rest.trim_start();
        if rest.starts_with('(') {
            if let Some(close) = matching_paren(rest) {
                out.cond = Some(rest[1..close].trim().to_string());
                out.loop_header = looping;
            }
            break;
        }
    }
    out
}

fn matching_paren(s: &str) -> Option<usize> {
    let mut depth = 0i32;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// The callee and arguments when `expr` is (up to casts and grouping) a
/// single direct call, e.g. `malloc(n + 1)` or `(char *)malloc(n)`.
pub fn leading_call(expr: &str) -> Option<(String, Vec<String>)> {
    let wrapped = format!("void __m(void)\n{{\nx = {};\n}}\n", expr.trim().trim_end_matches(';'));
    let tree = parse_c(&wrapped)?;
    let src = wrapped.as_bytes();
    let body = function_body(tree.root_node())?;
    let node = find_kind(body, "call_expression")?;
    // Reject calls nested under arithmetic: `f(x) + 1` is not a direct call.
    let mut parent = node.parent()?;
    loop {
        match parent.kind() {
            "assignment_expression" | "expression_statement" => break,
            "cast_expression" | "parenthesized_expression" => {
                parent = parent.parent()?;
            }
            _ => return None,
        }
    }
    call_parts(node, src)
}

fn find_kind<'a>(node: Node<'a>, kind: &str) -> Option<Node<'a>> {
    if node.kind() == kind {
        return Some(node);
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        if let Some(found) = find_kind(child, kind) {
            return Some(found);
        }
    }
    None
}

/// True when `expr` is a direct call to one of `names`.
pub fn is_call_to(expr: &str, names: &[String]) -> Option<(String, Vec<String>)> {
    let (callee, args) = leading_call(expr)?;
    names.iter().any(|n| n == &callee).then_some((callee, args))
}

/// Every local declared anywhere inside a complete function definition,
/// whether or not the declaration line ever executes any code. Parameters
/// are not included.
pub fn declared_locals(function_text: &str) -> Vec<String> {
    let Some(tree) = parse_c(function_text) else {
        return Vec::new();
    };
    let src = function_text.as_bytes();
    let Some(body) = function_body(tree.root_node()) else {
        return Vec::new();
    };
    let mut names = Vec::new();
    collect_declarations(body, src, &mut names);
    names
}

fn collect_declarations(node: Node, src: &[u8], names: &mut Vec<String>) {
    if node.kind() == "declaration" {
        let mut cursor = node.walk();
        for child in node.named_children(&mut cursor) {
            let name = match child.kind() {
                "init_declarator" => child
                    .child_by_field_name("declarator")
                    .and_then(|d| deepest_identifier(d, src)),
                k if k.ends_with("_declarator") || k == "identifier" => {
                    deepest_identifier(child, src)
                }
                _ => None,
            };
            if let Some(name) = name {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        return;
    }
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        collect_declarations(child, src, names);
    }
}

/// Parse the signature of a complete function definition: name and the
/// parameter names in declaration order. `void` parameter lists and
/// unnamed parameters produce an empty entry-free list.
pub fn parse_signature(function_text: &str) -> Option<Signature> {
    let tree = parse_c(function_text)?;
    let src = function_text.as_bytes();
    let language = tree_sitter_c::LANGUAGE;

    let query_str = r#"
        (function_definition
            declarator: (_) @decl
        )
    "#;
    let query = Query::new(&language.into(), query_str).expect("Invalid signature query");
    let mut cursor = QueryCursor::new();
    let mut matches = cursor.matches(&query, tree.root_node(), src);

    while let Some(m) = matches.next() {
        let decl = m.captures[0].node;
        let Some(func_decl) = find_kind(decl, "function_declarator") else {
            continue;
        };
        let name = func_decl
            .child_by_field_name("declarator")
            .and_then(|d| deepest_identifier(d, src))?;
        let mut params = Vec::new();
        if let Some(list) = func_decl.child_by_field_name("parameters") {
            let mut pc = list.walk();
            for param in list.named_children(&mut pc) {
                if param.kind() != "parameter_declaration" {
                    continue;
                }
                if let Some(d) = param.child_by_field_name("declarator") {
                    if let Some(pname) = deepest_identifier(d, src) {
                        params.push(pname);
                    }
                }
            }
        }
        let raw = format!("{}({})", name, params.join(", "));
        return Some(Signature { name, params, raw });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_declaration_with_alloc() {
        let a = classify_line("char *p = malloc(32);");
        assert_eq!(
            a.actions,
            vec![Action::Assign {
                lhs: "p".to_string(),
                rhs: "malloc(32)".to_string(),
                is_declaration: true,
            }]
        );
    }

    #[test]
    fn test_classify_plain_assignment() {
        let a = classify_line("p = malloc(64);");
        assert_eq!(
            a.actions,
            vec![Action::Assign {
                lhs: "p".to_string(),
                rhs: "malloc(64)".to_string(),
                is_declaration: false,
            }]
        );
    }

    #[test]
    fn test_classify_field_assignment() {
        let a = classify_line("p->k = malloc(strlen(a) + 1);");
        assert_eq!(
            a.actions,
            vec![Action::Assign {
                lhs: "p->k".to_string(),
                rhs: "malloc(strlen(a) + 1)".to_string(),
                is_declaration: false,
            }]
        );
    }

    #[test]
    fn test_classify_free_call() {
        let a = classify_line("free(q->k);");
        assert_eq!(
            a.actions,
            vec![Action::Call {
                callee: "free".to_string(),
                args: vec!["q->k".to_string()],
            }]
        );
    }

    #[test]
    fn test_classify_return() {
        let a = classify_line("return (p);");
        assert_eq!(
            a.actions,
            vec![Action::Return {
                expr: Some("p".to_string())
            }]
        );
    }

    #[test]
    fn test_classify_two_statements_on_one_line() {
        let a = classify_line("char *p = malloc(32); strcpy(p, \"a\");");
        assert_eq!(a.actions.len(), 2);
        assert!(matches!(&a.actions[0], Action::Assign { lhs, .. } if lhs == "p"));
        assert!(matches!(&a.actions[1], Action::Call { callee, .. } if callee == "strcpy"));
    }

    #[test]
    fn test_classify_inline_conditional_free() {
        let a = classify_line("if (should_free) free(buf);");
        assert_eq!(a.cond.as_deref(), Some("should_free"));
        assert!(!a.loop_header);
        assert_eq!(
            a.actions,
            vec![Action::Call {
                callee: "free".to_string(),
                args: vec!["buf".to_string()],
            }]
        );
    }

    #[test]
    fn test_classify_loop_headers() {
        let w = classify_line("while (node != NULL)");
        assert!(w.loop_header);
        assert_eq!(w.cond.as_deref(), Some("node != NULL"));

        let f = classify_line("for (i = 0; i < 5; i++) {");
        assert!(f.loop_header);
        assert_eq!(f.cond.as_deref(), Some("i < 5"));
        assert!(f.actions.iter().any(|x| matches!(x, Action::Assign { lhs, .. } if lhs == "i")));
    }

    #[test]
    fn test_classify_braces_and_blank() {
        assert!(classify_line("}").is_empty());
        assert!(classify_line("{").is_empty());
        assert!(classify_line("   ").is_empty());
    }

    #[test]
    fn test_leading_call_through_cast() {
        let (callee, args) = leading_call("(char *)malloc(n)").unwrap();
        assert_eq!(callee, "malloc");
        assert_eq!(args, vec!["n".to_string()]);
    }

    #[test]
    fn test_leading_call_rejects_arithmetic() {
        assert!(leading_call("strlen(a) + 1").is_none());
    }

    #[test]
    fn test_classify_plain_declaration_registers_name() {
        let a = classify_line("char\t*t;");
        assert!(a.actions.is_empty());
        assert_eq!(a.declares, vec!["t".to_string()]);

        let b = classify_line("char *p = malloc(32);");
        assert_eq!(b.declares, vec!["p".to_string()]);
    }

    #[test]
    fn test_declared_locals_sees_unexecuted_declarations() {
        let text = "\
void init(void)
{
\tchar\t*t;
\tint\ti;

\tt = malloc(128);
\tfor (int k = 0; k < 3; k++)
\t\tt[k] = 'x';
}
";
        let locals = declared_locals(text);
        assert_eq!(
            locals,
            vec!["t".to_string(), "i".to_string(), "k".to_string()]
        );
    }

    #[test]
    fn test_parse_signature() {
        let sig = parse_signature(
            "Pair *mk(const char *a, const char *b)\n{\n\treturn NULL;\n}\n",
        )
        .unwrap();
        assert_eq!(sig.name, "mk");
        assert_eq!(sig.params, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_parse_signature_void_params() {
        let sig = parse_signature("void init(void)\n{\n}\n").unwrap();
        assert_eq!(sig.name, "init");
        assert!(sig.params.is_empty());
    }
}
