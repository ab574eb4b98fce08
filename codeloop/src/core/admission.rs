//! Static admission gate for generated Python source.
//!
//! Admission is pure policy evaluation over a `tree-sitter` syntax tree: no
//! I/O, no side effects, and the same `(source, policy)` pair always yields
//! the same verdict. Nothing reaches the sandbox without passing here.

use std::collections::HashMap;
use std::fmt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tree_sitter::{Language, Node, Parser};

use crate::core::policy::AdmissionPolicy;
use crate::core::types::FailureKind;

/// 1-based position in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl Location {
    fn of(node: Node<'_>) -> Self {
        let point = node.start_position();
        Self {
            line: point.row + 1,
            column: point.column + 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    SyntaxInvalid,
    PolicyViolation,
}

/// Why a source text was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub location: Option<Location>,
    pub reason: String,
}

impl Rejection {
    fn syntax(location: Option<Location>, reason: impl Into<String>) -> Self {
        Self {
            kind: RejectionKind::SyntaxInvalid,
            location,
            reason: reason.into(),
        }
    }

    fn policy(location: Option<Location>, reason: impl Into<String>) -> Self {
        Self {
            kind: RejectionKind::PolicyViolation,
            location,
            reason: reason.into(),
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self.kind {
            RejectionKind::SyntaxInvalid => FailureKind::SyntaxInvalid,
            RejectionKind::PolicyViolation => FailureKind::PolicyViolation,
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            RejectionKind::SyntaxInvalid => "syntax error",
            RejectionKind::PolicyViolation => "policy violation",
        };
        match self.location {
            Some(loc) => write!(
                f,
                "{label} at line {}, column {}: {}",
                loc.line, loc.column, self.reason
            ),
            None => write!(f, "{label}: {}", self.reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionVerdict {
    Admitted,
    Rejected(Rejection),
}

impl AdmissionVerdict {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionVerdict::Admitted)
    }
}

/// Modules whose members are reachable as bare names.
const BUILTIN_MODULES: [&str; 2] = ["builtins", "__builtins__"];

/// Parses candidate source and evaluates it against an [`AdmissionPolicy`].
pub struct AdmissionGate {
    policy: AdmissionPolicy,
    language: Language,
}

impl AdmissionGate {
    pub fn new(policy: AdmissionPolicy) -> Result<Self> {
        policy.validate()?;
        let language: Language = tree_sitter_python::LANGUAGE.into();
        Parser::new()
            .set_language(&language)
            .context("load python grammar")?;
        Ok(Self { policy, language })
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    pub fn admit(&self, source: &str) -> AdmissionVerdict {
        match self.evaluate(source) {
            Some(rejection) => AdmissionVerdict::Rejected(rejection),
            None => AdmissionVerdict::Admitted,
        }
    }

    fn evaluate(&self, source: &str) -> Option<Rejection> {
        if source.len() > self.policy.max_source_bytes {
            return Some(Rejection::policy(
                None,
                format!(
                    "source is {} bytes, exceeding the {} byte limit",
                    source.len(),
                    self.policy.max_source_bytes
                ),
            ));
        }
        if source.trim().is_empty() {
            return Some(Rejection::policy(None, "source is empty"));
        }

        let mut parser = Parser::new();
        if parser.set_language(&self.language).is_err() {
            // Checked in `new`; fail closed regardless.
            return Some(Rejection::policy(None, "python grammar unavailable"));
        }
        let Some(tree) = parser.parse(source, None) else {
            return Some(Rejection::syntax(None, "parser produced no syntax tree"));
        };
        let root = tree.root_node();
        if root.has_error() {
            return Some(first_syntax_error(root, source));
        }

        let aliases = collect_aliases(root, source);
        PolicyWalk {
            policy: &self.policy,
            source,
            aliases: &aliases,
        }
        .first_violation(root)
    }
}

/// Locate the first ERROR or MISSING node in document order.
fn first_syntax_error(root: Node<'_>, source: &str) -> Rejection {
    for node in preorder(root) {
        if node.is_missing() {
            return Rejection::syntax(
                Some(Location::of(node)),
                format!("missing `{}`", node.kind()),
            );
        }
        if node.is_error() {
            let snippet = text(node, source)
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or("")
                .chars()
                .take(40)
                .collect::<String>();
            let reason = if snippet.is_empty() {
                "invalid syntax".to_string()
            } else {
                format!("unexpected `{snippet}`")
            };
            return Rejection::syntax(Some(Location::of(node)), reason);
        }
    }
    Rejection::syntax(Some(Location::of(root)), "invalid syntax")
}

/// Pre-order traversal with an explicit stack, so deeply nested input cannot
/// exhaust the call stack.
fn preorder(root: Node<'_>) -> impl Iterator<Item = Node<'_>> {
    let mut stack = vec![root];
    std::iter::from_fn(move || {
        let node = stack.pop()?;
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        stack.extend(children.into_iter().rev());
        Some(node)
    })
}

fn text<'s>(node: Node<'_>, source: &'s str) -> &'s str {
    node.utf8_text(source.as_bytes()).unwrap_or("")
}

/// Local name -> fully qualified dotted name, from every import in the file.
fn collect_aliases(root: Node<'_>, source: &str) -> HashMap<String, String> {
    let mut aliases = HashMap::new();
    for node in preorder(root) {
        match node.kind() {
            "import_statement" => {
                for (module, alias) in imported_names(node, source) {
                    match alias {
                        Some(alias) => {
                            aliases.insert(alias, module);
                        }
                        None => {
                            // `import os.path` binds `os`.
                            let head = module.split('.').next().unwrap_or(&module).to_string();
                            aliases.insert(head.clone(), head);
                        }
                    }
                }
            }
            "import_from_statement" => {
                let Some(module) = from_module(node, source) else {
                    continue;
                };
                for (name, alias) in imported_names(node, source) {
                    let local = alias.unwrap_or_else(|| name.clone());
                    aliases.insert(local, format!("{module}.{name}"));
                }
            }
            _ => {}
        }
    }
    aliases
}

/// `(name, alias)` pairs from the `name` fields of an import statement.
fn imported_names(node: Node<'_>, source: &str) -> Vec<(String, Option<String>)> {
    let mut cursor = node.walk();
    node.children_by_field_name("name", &mut cursor)
        .filter_map(|child| match child.kind() {
            "dotted_name" => Some((compact(text(child, source)), None)),
            "aliased_import" => {
                let name = child.child_by_field_name("name")?;
                let alias = child.child_by_field_name("alias")?;
                Some((
                    compact(text(name, source)),
                    Some(text(alias, source).to_string()),
                ))
            }
            _ => None,
        })
        .collect()
}

/// Absolute module of a `from x import y`; relative imports yield `None`.
fn from_module(node: Node<'_>, source: &str) -> Option<String> {
    let module = node.child_by_field_name("module_name")?;
    (module.kind() == "dotted_name").then(|| compact(text(module, source)))
}

fn compact(dotted: &str) -> String {
    dotted.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Dotted name for an identifier/attribute chain, `None` for anything else.
fn dotted_name(node: Node<'_>, source: &str) -> Option<String> {
    match node.kind() {
        "identifier" => Some(text(node, source).to_string()),
        "attribute" => {
            let object = dotted_name(node.child_by_field_name("object")?, source)?;
            let attr = node.child_by_field_name("attribute")?;
            Some(format!("{object}.{}", text(attr, source)))
        }
        _ => None,
    }
}

/// String literal value without prefix or quotes; `None` for f-strings.
fn string_literal(node: Node<'_>, source: &str) -> Option<String> {
    if node.kind() != "string" {
        return None;
    }
    let mut cursor = node.walk();
    let mut value = String::new();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "string_content" => value.push_str(text(child, source)),
            "interpolation" => return None,
            _ => {}
        }
    }
    Some(value)
}

fn is_field(parent: Node<'_>, field: &str, node: Node<'_>) -> bool {
    parent.child_by_field_name(field) == Some(node)
}

struct PolicyWalk<'a> {
    policy: &'a AdmissionPolicy,
    source: &'a str,
    aliases: &'a HashMap<String, String>,
}

impl PolicyWalk<'_> {
    fn first_violation(&self, root: Node<'_>) -> Option<Rejection> {
        preorder(root).find_map(|node| match node.kind() {
            "import_statement" => self.check_import(node),
            "import_from_statement" => self.check_from_import(node),
            "call" => self.check_call(node),
            "identifier" | "attribute" => self.check_reference(node),
            _ => None,
        })
    }

    /// Expand import aliases; `builtins.eval` and `__builtins__.eval` are `eval`.
    fn resolve(&self, dotted: &str) -> String {
        let (head, rest) = match dotted.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (dotted, None),
        };
        let resolved = match (self.aliases.get(head), rest) {
            (Some(qualified), Some(rest)) => format!("{qualified}.{rest}"),
            (Some(qualified), None) => qualified.clone(),
            (None, _) => dotted.to_string(),
        };
        BUILTIN_MODULES
            .iter()
            .find_map(|module| {
                resolved
                    .strip_prefix(module)
                    .and_then(|rest| rest.strip_prefix('.'))
            })
            .map_or_else(|| resolved.clone(), str::to_string)
    }

    fn check_import(&self, node: Node<'_>) -> Option<Rejection> {
        imported_names(node, self.source)
            .into_iter()
            .find_map(|(module, _)| self.policy.check_module(&module))
            .map(|reason| Rejection::policy(Some(Location::of(node)), reason))
    }

    fn check_from_import(&self, node: Node<'_>) -> Option<Rejection> {
        let module = from_module(node, self.source)?;
        if let Some(reason) = self.policy.check_module(&module) {
            return Some(Rejection::policy(Some(Location::of(node)), reason));
        }
        let mut cursor = node.walk();
        let wildcard = node
            .children(&mut cursor)
            .any(|child| child.kind() == "wildcard_import");
        if wildcard && let Some(pattern) = self.policy.denied_member_of(&module) {
            return Some(Rejection::policy(
                Some(Location::of(node)),
                format!("`from {module} import *` exposes denied `{pattern}`"),
            ));
        }
        imported_names(node, self.source)
            .into_iter()
            .find_map(|(name, _)| {
                let qualified = format!("{module}.{name}");
                self.policy
                    .denied_call(&qualified)
                    .map(|pattern| format!("import of `{qualified}` is denied (matches `{pattern}`)"))
            })
            .map(|reason| Rejection::policy(Some(Location::of(node)), reason))
    }

    fn check_call(&self, node: Node<'_>) -> Option<Rejection> {
        let location = Some(Location::of(node));
        let callee = node
            .child_by_field_name("function")
            .and_then(|function| dotted_name(function, self.source))
            .map(|name| self.resolve(&name));

        if let Some(name) = &callee
            && let Some(pattern) = self.policy.denied_call(name)
        {
            return Some(Rejection::policy(
                location,
                format!("call to `{name}` is denied (matches `{pattern}`)"),
            ));
        }

        let arguments = node.child_by_field_name("arguments")?;
        let mut cursor = arguments.walk();
        let args: Vec<Node<'_>> = arguments.named_children(&mut cursor).collect();
        let positional: Vec<Node<'_>> = args
            .iter()
            .copied()
            .filter(|arg| {
                !matches!(
                    arg.kind(),
                    "keyword_argument" | "list_splat" | "dictionary_splat"
                )
            })
            .collect();

        if let Some(name) = &callee {
            let rejection = self
                .check_getattr(name, &positional)
                .or_else(|| self.check_dynamic_import(name, &positional))
                .or_else(|| self.check_shell_program(name, &positional));
            if let Some(reason) = rejection {
                return Some(Rejection::policy(location, reason));
            }
        }

        if self.policy.deny_shell_true {
            let shell_true = args.iter().any(|arg| {
                arg.kind() == "keyword_argument"
                    && arg
                        .child_by_field_name("name")
                        .is_some_and(|name| text(name, self.source) == "shell")
                    && arg
                        .child_by_field_name("value")
                        .is_some_and(|value| value.kind() == "true")
            });
            if shell_true {
                let name = callee.as_deref().unwrap_or("call");
                return Some(Rejection::policy(
                    location,
                    format!("`{name}` with shell=True is denied"),
                ));
            }
        }

        if let Some(name) = &callee
            && self.policy.is_path_call(name)
            && let Some(first) = positional.first()
            && let Some(path) = string_literal(*first, self.source)
            && !self.policy.path_permitted(&path)
        {
            return Some(Rejection::policy(
                Some(Location::of(*first)),
                format!("`{name}` on `{path}` is outside the approved filesystem roots"),
            ));
        }
        None
    }

    /// `getattr(os, "system")` is `os.system`.
    fn check_getattr(&self, callee: &str, positional: &[Node<'_>]) -> Option<String> {
        if callee != "getattr" {
            return None;
        }
        let [object, attr, ..] = positional else {
            return None;
        };
        let object = dotted_name(*object, self.source)?;
        let attr = string_literal(*attr, self.source)?;
        let target = self.resolve(&format!("{object}.{attr}"));
        let pattern = self.policy.denied_call(&target)?;
        Some(format!(
            "`getattr` resolves to `{target}`, which is denied (matches `{pattern}`)"
        ))
    }

    /// `importlib.import_module("ctypes")` is checked like `import ctypes`.
    fn check_dynamic_import(&self, callee: &str, positional: &[Node<'_>]) -> Option<String> {
        if !self.policy.is_import_call(callee) {
            return None;
        }
        let restricted =
            !self.policy.denied_modules.is_empty() || !self.policy.allowed_modules.is_empty();
        match positional.first().and_then(|arg| string_literal(*arg, self.source)) {
            Some(module) => self.policy.check_module(&module),
            None if restricted => Some(format!(
                "`{callee}` without a literal module name cannot be checked"
            )),
            None => None,
        }
    }

    /// Argv-style launches of a shell (`subprocess.run(["sh", "-c", ...])`).
    fn check_shell_program(&self, callee: &str, positional: &[Node<'_>]) -> Option<String> {
        if !self.policy.is_process_call(callee) {
            return None;
        }
        let arg = *positional.first()?;
        let program = match arg.kind() {
            "string" => string_literal(arg, self.source)?
                .split_whitespace()
                .next()
                .map(str::to_string),
            "list" | "tuple" => {
                let mut cursor = arg.walk();
                let first = arg.named_children(&mut cursor).next()?;
                string_literal(first, self.source)
            }
            _ => None,
        }?;
        let entry = self.policy.shell_program(&program)?;
        Some(format!(
            "`{callee}` launches shell `{program}` (matches `{entry}`)"
        ))
    }

    /// Denied names referenced without being called (`f = eval`).
    fn check_reference(&self, node: Node<'_>) -> Option<Rejection> {
        let parent = node.parent()?;
        let skip = match parent.kind() {
            "call" => is_field(parent, "function", node),
            "attribute" => true,
            "keyword_argument" => is_field(parent, "name", node),
            "function_definition" | "class_definition" => is_field(parent, "name", node),
            "dotted_name" | "aliased_import" | "parameters" | "lambda_parameters"
            | "default_parameter" | "typed_parameter" | "typed_default_parameter" => true,
            _ => false,
        };
        if skip {
            return None;
        }
        let name = self.resolve(&dotted_name(node, self.source)?);
        let pattern = self.policy.denied_call(&name)?;
        Some(Rejection::policy(
            Some(Location::of(node)),
            format!("reference to `{name}` is denied (matches `{pattern}`)"),
        ))
    }
}
