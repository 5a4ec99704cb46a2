//! Per-method compilation directives
//!
//! A stack of directive sets, each matching methods by pattern. Lookup walks
//! the stack from the top and the first matching set wins; the default set
//! at the bottom matches everything and is never popped.
//!
//! Directive files are JSON, either one object or an array of them:
//!
//! ```json
//! [
//!   { "match": ["Foo::bar", "*Cache::get*"], "Exclude": true },
//!   { "match": "Hot::*", "BackgroundCompilation": false,
//!     "c2": { "Log": true, "RepeatCompilation": 2 } }
//! ]
//! ```

use crate::backend::CompilerKind;
use crate::method::Method;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Default maximum stack depth, including the default set
pub const DEFAULT_STACK_LIMIT: usize = 50;

/// Errors from parsing or pushing directives
#[derive(Debug, Error)]
pub enum DirectiveError {
    /// Malformed JSON or wrong value types
    #[error("Failed to parse directives: {0}")]
    Json(#[from] serde_json::Error),

    /// A match pattern could not be parsed
    #[error("Invalid method pattern '{0}'")]
    InvalidPattern(String),

    /// A directive has no match patterns
    #[error("Directive has no match patterns")]
    NoPatterns,

    /// Pushing would exceed the stack limit
    #[error("Directives stack is full (limit {limit})")]
    StackFull {
        /// Configured limit
        limit: usize,
    },
}

// ============================================================================
// Directive
// ============================================================================

/// Effective policy for one method and compiler
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Directive {
    /// Compile at all
    pub enable: bool,
    /// Never compile; the method is marked not compilable
    pub exclude: bool,
    /// Stop in the debugger when the compile starts
    pub break_at_compile: bool,
    /// Log the compile to the worker's compile log
    pub log: bool,
    /// `Some(false)` forces blocking requests
    pub background_compilation: Option<bool>,
    /// Extra compiles run (and discarded) before the real one
    pub repeat_compilation: u32,
    /// Option overrides passed through to the back-end
    pub options: BTreeMap<String, serde_json::Value>,
}

impl Default for Directive {
    fn default() -> Self {
        Directive {
            enable: true,
            exclude: false,
            break_at_compile: false,
            log: false,
            background_compilation: None,
            repeat_compilation: 0,
            options: BTreeMap::new(),
        }
    }
}

/// Options as they appear in a directive file; unset keys inherit
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawOptions {
    enable: Option<bool>,
    exclude: Option<bool>,
    break_at_compile: Option<bool>,
    log: Option<bool>,
    background_compilation: Option<bool>,
    repeat_compilation: Option<u32>,
    #[serde(flatten)]
    other: BTreeMap<String, serde_json::Value>,
}

impl RawOptions {
    fn apply(&self, directive: &mut Directive) {
        if let Some(v) = self.enable {
            directive.enable = v;
        }
        if let Some(v) = self.exclude {
            directive.exclude = v;
        }
        if let Some(v) = self.break_at_compile {
            directive.break_at_compile = v;
        }
        if let Some(v) = self.log {
            directive.log = v;
        }
        if self.background_compilation.is_some() {
            directive.background_compilation = self.background_compilation;
        }
        if let Some(v) = self.repeat_compilation {
            directive.repeat_compilation = v;
        }
        for (key, value) in &self.other {
            directive.options.insert(key.clone(), value.clone());
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct RawDirective {
    #[serde(rename = "match")]
    patterns: OneOrMany,
    #[serde(default)]
    c1: Option<RawOptions>,
    #[serde(default)]
    c2: Option<RawOptions>,
    #[serde(flatten)]
    common: RawOptions,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawFile {
    One(RawDirective),
    Many(Vec<RawDirective>),
}

// ============================================================================
// Method patterns
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Any,
    Exact(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
}

impl Pattern {
    fn parse(text: &str) -> Option<Self> {
        if text.is_empty() {
            return None;
        }
        let leading = text.starts_with('*');
        let trailing = text.len() > 1 && text.ends_with('*');
        let core = text.trim_matches('*');
        if core.contains('*') {
            return None;
        }
        Some(match (leading, trailing) {
            _ if core.is_empty() => Pattern::Any,
            (true, true) => Pattern::Contains(core.to_string()),
            (true, false) => Pattern::Suffix(core.to_string()),
            (false, true) => Pattern::Prefix(core.to_string()),
            (false, false) => Pattern::Exact(core.to_string()),
        })
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Exact(s) => name == s,
            Pattern::Prefix(s) => name.starts_with(s.as_str()),
            Pattern::Suffix(s) => name.ends_with(s.as_str()),
            Pattern::Contains(s) => name.contains(s.as_str()),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Pattern::Any => write!(f, "*"),
            Pattern::Exact(s) => write!(f, "{}", s),
            Pattern::Prefix(s) => write!(f, "{}*", s),
            Pattern::Suffix(s) => write!(f, "*{}", s),
            Pattern::Contains(s) => write!(f, "*{}*", s),
        }
    }
}

/// `Class::method` (or `Class.method`) pattern with `*` wildcards at either end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodPattern {
    class: Pattern,
    method: Pattern,
}

impl MethodPattern {
    /// Parse a pattern
    pub fn parse(text: &str) -> Result<Self, DirectiveError> {
        let invalid = || DirectiveError::InvalidPattern(text.to_string());
        let (class, method) = match text.split_once("::") {
            Some(parts) => parts,
            None => text.rsplit_once('.').ok_or_else(invalid)?,
        };
        Ok(MethodPattern {
            class: Pattern::parse(class).ok_or_else(invalid)?,
            method: Pattern::parse(method).ok_or_else(invalid)?,
        })
    }

    /// Pattern matching every method
    pub fn any() -> Self {
        MethodPattern {
            class: Pattern::Any,
            method: Pattern::Any,
        }
    }

    /// Whether `method` matches
    pub fn matches(&self, method: &Method) -> bool {
        self.class.matches(method.holder().name()) && self.method.matches(method.name())
    }
}

impl fmt::Display for MethodPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.class, self.method)
    }
}

// ============================================================================
// Directive sets and the stack
// ============================================================================

/// Patterns plus the resolved directive for each compiler family
#[derive(Debug)]
pub struct DirectiveSet {
    patterns: Vec<MethodPattern>,
    c1: Arc<Directive>,
    c2: Arc<Directive>,
}

impl DirectiveSet {
    /// Set applying `directive` to both compiler families
    pub fn new(patterns: Vec<MethodPattern>, directive: Directive) -> Self {
        let shared = Arc::new(directive);
        DirectiveSet {
            patterns,
            c1: shared.clone(),
            c2: shared,
        }
    }

    /// The bottom-of-stack set
    pub fn default_set() -> Self {
        Self::new(vec![MethodPattern::any()], Directive::default())
    }

    fn from_raw(raw: RawDirective) -> Result<Self, DirectiveError> {
        let texts = match raw.patterns {
            OneOrMany::One(text) => vec![text],
            OneOrMany::Many(texts) => texts,
        };
        if texts.is_empty() {
            return Err(DirectiveError::NoPatterns);
        }
        let patterns = texts
            .iter()
            .map(|t| MethodPattern::parse(t))
            .collect::<Result<Vec<_>, _>>()?;

        let mut common = Directive::default();
        raw.common.apply(&mut common);
        let resolve = |overrides: &Option<RawOptions>| {
            let mut directive = common.clone();
            if let Some(overrides) = overrides {
                overrides.apply(&mut directive);
            }
            Arc::new(directive)
        };
        Ok(DirectiveSet {
            patterns,
            c1: resolve(&raw.c1),
            c2: resolve(&raw.c2),
        })
    }

    /// Whether any pattern matches `method`
    pub fn matches(&self, method: &Method) -> bool {
        self.patterns.iter().any(|p| p.matches(method))
    }

    /// Directive for a compiler family. The external compiler uses the c2 section.
    pub fn for_kind(&self, kind: CompilerKind) -> &Arc<Directive> {
        match kind {
            CompilerKind::C1 => &self.c1,
            CompilerKind::C2 | CompilerKind::External => &self.c2,
        }
    }

    /// Parse a directive file
    pub fn parse_json(text: &str) -> Result<Vec<DirectiveSet>, DirectiveError> {
        let raw: RawFile = serde_json::from_str(text)?;
        let raws = match raw {
            RawFile::One(one) => vec![one],
            RawFile::Many(many) => many,
        };
        raws.into_iter().map(Self::from_raw).collect()
    }
}

impl fmt::Display for DirectiveSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let patterns: Vec<String> = self.patterns.iter().map(|p| p.to_string()).collect();
        writeln!(f, "Directive: match [{}]", patterns.join(", "))?;
        writeln!(f, "  c1: {:?}", self.c1)?;
        write!(f, "  c2: {:?}", self.c2)
    }
}

/// Stack of directive sets
pub struct DirectivesStack {
    stack: Mutex<Vec<Arc<DirectiveSet>>>,
    limit: usize,
}

impl DirectivesStack {
    /// Stack holding only the default set
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_STACK_LIMIT)
    }

    /// Stack with a custom depth limit (at least 1)
    pub fn with_limit(limit: usize) -> Self {
        DirectivesStack {
            stack: Mutex::new(vec![Arc::new(DirectiveSet::default_set())]),
            limit: limit.max(1),
        }
    }

    /// Effective directive for `method` under compiler family `kind`
    ///
    /// The returned reference stays valid after the set is popped.
    pub fn lookup(&self, method: &Method, kind: CompilerKind) -> Arc<Directive> {
        let stack = self.stack.lock();
        stack
            .iter()
            .rev()
            .find(|set| set.matches(method))
            .or_else(|| stack.first())
            .map(|set| set.for_kind(kind).clone())
            .unwrap_or_default()
    }

    /// Push one set
    pub fn push(&self, set: DirectiveSet) -> Result<(), DirectiveError> {
        let mut stack = self.stack.lock();
        if stack.len() >= self.limit {
            return Err(DirectiveError::StackFull { limit: self.limit });
        }
        stack.push(Arc::new(set));
        Ok(())
    }

    /// Parse a directive file and push all of its sets, or none
    ///
    /// The first directive in the file ends up on top.
    pub fn push_json(&self, text: &str) -> Result<usize, DirectiveError> {
        let sets = DirectiveSet::parse_json(text)?;
        let count = sets.len();
        let mut stack = self.stack.lock();
        if stack.len() + count > self.limit {
            return Err(DirectiveError::StackFull { limit: self.limit });
        }
        stack.extend(sets.into_iter().rev().map(Arc::new));
        Ok(count)
    }

    /// Pop up to `count` sets; the default set stays. Returns how many were popped.
    pub fn pop(&self, count: usize) -> usize {
        let mut stack = self.stack.lock();
        let removable = (stack.len() - 1).min(count);
        let keep = stack.len() - removable;
        stack.truncate(keep);
        removable
    }

    /// Remove everything but the default set
    pub fn clear(&self) {
        self.stack.lock().truncate(1);
    }

    /// Number of sets, including the default
    pub fn depth(&self) -> usize {
        self.stack.lock().len()
    }

    /// Print the stack top to bottom
    pub fn print(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let stack = self.stack.lock();
        for set in stack.iter().rev() {
            writeln!(out, "{}", set)?;
        }
        Ok(())
    }
}

impl Default for DirectivesStack {
    fn default() -> Self {
        Self::new()
    }
}
