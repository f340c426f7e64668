//! Line-oriented macro preprocessor: object and function-like `#define`,
//! `#undef`, and `#include` with include-cycle detection and
//! once-per-resolved-path memoization.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

use crate::error::PreprocessError;

#[derive(Clone, Debug)]
enum MacroDef {
    Object(String),
    Function { params: Vec<String>, body: String },
}

/// Embedded contents for `#include <...>` headers. This C subset has no
/// user-space library to declare, so system headers are present only so
/// that `#include <stdio.h>`-style lines in ported source don't need to
/// be stripped by hand; their content is empty.
static SYSTEM_INCLUDES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("stdio.h", "");
    m.insert("stdlib.h", "");
    m.insert("string.h", "");
    m
});

pub struct Preprocessor {
    macros: HashMap<String, MacroDef>,
    processed: HashSet<PathBuf>,
}

impl Preprocessor {
    pub fn new() -> Self {
        Preprocessor {
            macros: HashMap::new(),
            processed: HashSet::new(),
        }
    }

    /// Expands `source`, which was read from `origin` (a display name
    /// used in error messages) located in `dir` (used to resolve
    /// `#include "..."`).
    pub fn process_source(&mut self, source: &str, origin: &str, dir: &Path) -> Result<String, PreprocessError> {
        let mut stack: Vec<PathBuf> = Vec::new();
        self.process(source, origin, dir, &mut stack)
    }

    fn process(
        &mut self,
        source: &str,
        origin: &str,
        dir: &Path,
        stack: &mut Vec<PathBuf>,
    ) -> Result<String, PreprocessError> {
        let mut out = String::new();
        for (idx, raw_line) in source.lines().enumerate() {
            let line_no = idx + 1;
            let trimmed = raw_line.trim_start();
            if let Some(rest) = trimmed.strip_prefix('#') {
                let rest = rest.trim_start();
                if let Some(def) = rest.strip_prefix("define") {
                    self.handle_define(def.trim(), origin, line_no)?;
                } else if let Some(name) = rest.strip_prefix("undef") {
                    self.macros.remove(name.trim());
                } else if let Some(inc) = rest.strip_prefix("include") {
                    let expanded = self.handle_include(inc.trim(), origin, dir, line_no, stack)?;
                    out.push_str(&expanded);
                } else {
                    // Unknown directives are passed through untouched;
                    // only define/undef/include are part of this subset.
                }
            } else {
                let expanded = self.expand_text(raw_line, &HashSet::new());
                out.push_str(&canonicalize_spacing(&expanded));
                out.push('\n');
            }
        }
        Ok(out)
    }

    fn handle_define(&mut self, text: &str, origin: &str, line: usize) -> Result<(), PreprocessError> {
        let text = text.trim();
        let name_end = text
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(text.len());
        if name_end == 0 {
            return Err(PreprocessError::MalformedDefine {
                file: origin.to_string(),
                line,
            });
        }
        let name = &text[..name_end];
        let rest = &text[name_end..];

        if let Some(rest) = rest.strip_prefix('(') {
            let close = rest.find(')').ok_or_else(|| PreprocessError::MalformedDefine {
                file: origin.to_string(),
                line,
            })?;
            let params: Vec<String> = rest[..close]
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            let body = rest[close + 1..].trim().to_string();
            self.macros.insert(name.to_string(), MacroDef::Function { params, body });
        } else {
            let body = rest.trim().to_string();
            self.macros.insert(name.to_string(), MacroDef::Object(body));
        }
        Ok(())
    }

    fn handle_include(
        &mut self,
        text: &str,
        origin: &str,
        dir: &Path,
        line: usize,
        stack: &mut Vec<PathBuf>,
    ) -> Result<String, PreprocessError> {
        let (name, is_system) = if let Some(inner) = text.strip_prefix('"').and_then(|t| t.strip_suffix('"')) {
            (inner.to_string(), false)
        } else if let Some(inner) = text.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
            (inner.to_string(), true)
        } else {
            return Err(PreprocessError::UnresolvedInclude {
                file: origin.to_string(),
                included: text.to_string(),
            });
        };

        if is_system {
            let content = SYSTEM_INCLUDES
                .get(name.as_str())
                .ok_or_else(|| PreprocessError::UnresolvedInclude {
                    file: origin.to_string(),
                    included: name.clone(),
                })?;
            let marker = PathBuf::from(format!("<{name}>"));
            if stack.contains(&marker) {
                return Err(PreprocessError::IncludeCycle {
                    file: origin.to_string(),
                    included: name,
                });
            }
            if self.processed.contains(&marker) {
                return Ok(String::new());
            }
            self.processed.insert(marker.clone());
            stack.push(marker.clone());
            let expanded = self.process(content, &name, dir, stack)?;
            stack.pop();
            return Ok(expanded);
        }

        let resolved = dir.join(&name);
        let canonical = resolved.canonicalize().unwrap_or(resolved.clone());
        if stack.contains(&canonical) {
            return Err(PreprocessError::IncludeCycle {
                file: origin.to_string(),
                included: name,
            });
        }
        if self.processed.contains(&canonical) {
            return Ok(String::new());
        }
        let content = fs::read_to_string(&resolved).map_err(|_| PreprocessError::UnresolvedInclude {
            file: origin.to_string(),
            included: name.clone(),
        })?;
        self.processed.insert(canonical.clone());
        stack.push(canonical.clone());
        let sub_dir = resolved.parent().unwrap_or(dir).to_path_buf();
        let expanded = self.process(&content, &name, &sub_dir, stack)?;
        stack.pop();
        Ok(expanded)
    }

    /// Expands macro invocations in a single line of text, skipping over
    /// string and character literals. `active` holds the macro names
    /// currently being expanded on the call stack, so a macro body that
    /// mentions its own name is left untouched (preventing infinite
    /// recursion) rather than re-expanded.
    fn expand_text(&self, text: &str, active: &HashSet<String>) -> String {
        let chars: Vec<char> = text.chars().collect();
        let mut out = String::new();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c == '"' || c == '\'' {
                let quote = c;
                out.push(c);
                i += 1;
                while i < chars.len() {
                    out.push(chars[i]);
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        i += 1;
                        out.push(chars[i]);
                    } else if chars[i] == quote {
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                continue;
            }
            if c.is_alphabetic() || c == '_' {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                if active.contains(&ident) {
                    out.push_str(&ident);
                    continue;
                }
                match self.macros.get(&ident) {
                    Some(MacroDef::Object(body)) => {
                        let mut next_active = active.clone();
                        next_active.insert(ident.clone());
                        out.push_str(&self.expand_text(body, &next_active));
                    }
                    Some(MacroDef::Function { params, body }) => {
                        let mut j = i;
                        while j < chars.len() && chars[j].is_whitespace() {
                            j += 1;
                        }
                        if j < chars.len() && chars[j] == '(' {
                            let (args, after) = scan_args(&chars, j);
                            let substituted = substitute_params(body, params, &args);
                            let mut next_active = active.clone();
                            next_active.insert(ident.clone());
                            out.push_str(&self.expand_text(&substituted, &next_active));
                            i = after;
                        } else {
                            out.push_str(&ident);
                        }
                    }
                    None => out.push_str(&ident),
                }
                continue;
            }
            out.push(c);
            i += 1;
        }
        out
    }
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Scans a balanced, comma-separated argument list starting at `chars[open]`
/// (which must be `(`). Returns the raw argument texts and the index just
/// past the closing `)`.
fn scan_args(chars: &[char], open: usize) -> (Vec<String>, usize) {
    let mut depth = 0i32;
    let mut i = open;
    let mut args = Vec::new();
    let mut current = String::new();
    loop {
        if i >= chars.len() {
            break;
        }
        let c = chars[i];
        match c {
            '(' => {
                depth += 1;
                if depth > 1 {
                    current.push(c);
                }
            }
            ')' => {
                depth -= 1;
                if depth == 0 {
                    if !current.trim().is_empty() || !args.is_empty() {
                        args.push(current.trim().to_string());
                    }
                    i += 1;
                    break;
                }
                current.push(c);
            }
            ',' if depth == 1 => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => {
                if depth >= 1 {
                    current.push(c);
                }
            }
        }
        i += 1;
    }
    if args.len() == 1 && args[0].is_empty() {
        args.clear();
    }
    (args, i)
}

/// Re-tokenizes a fully macro-expanded line and re-emits it with a single
/// space between tokens, except none inside `( )` or directly before `;`
/// or `,`. Expansion splices macro bodies in verbatim with whatever
/// spacing the `#define` happened to use, so without this pass
/// `MIN(5,10)` renders as `((5)<(10)?(5):(10))` instead of the spaced
/// form the rest of the toolchain treats as canonical; the lexer doesn't
/// care either way, but the output text is meant to be human-readable.
fn canonicalize_spacing(text: &str) -> String {
    let tokens = tokenize_for_spacing(text);
    let mut out = String::new();
    let mut prev: Option<&str> = None;
    for tok in &tokens {
        if let Some(p) = prev {
            let no_space = tok == ")" || tok == ";" || tok == "," || p == "(";
            if !no_space {
                out.push(' ');
            }
        }
        out.push_str(tok);
        prev = Some(tok);
    }
    out
}

const SPACING_TWO_CHAR_OPS: &[&str] = &[
    "==", "!=", "<=", ">=", "&&", "||", "<<", ">>", "++", "--", "+=", "-=", "*=", "/=", "->",
];

/// Splits a line into tokens for [`canonicalize_spacing`]. String/char
/// literals and `//`/`/* */` comments are copied through as a single
/// opaque token each, so their contents are never reformatted.
fn tokenize_for_spacing(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            let start = i;
            i += 1;
            while i < chars.len() {
                if chars[i] == '\\' && i + 1 < chars.len() {
                    i += 2;
                    continue;
                }
                if chars[i] == quote {
                    i += 1;
                    break;
                }
                i += 1;
            }
            tokens.push(chars[start..i].iter().collect());
            continue;
        }
        if c == '/' && chars.get(i + 1) == Some(&'/') {
            tokens.push(chars[i..].iter().collect());
            break;
        }
        if c == '/' && chars.get(i + 1) == Some(&'*') {
            let start = i;
            i += 2;
            while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                i += 1;
            }
            i = if i < chars.len() { i + 2 } else { chars.len() };
            tokens.push(chars[start..i].iter().collect());
            continue;
        }
        if c.is_alphanumeric() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(chars[start..i].iter().collect());
            continue;
        }
        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        if SPACING_TWO_CHAR_OPS.contains(&two.as_str()) {
            tokens.push(two);
            i += 2;
            continue;
        }
        tokens.push(c.to_string());
        i += 1;
    }
    tokens
}

fn substitute_params(body: &str, params: &[String], args: &[String]) -> String {
    let mut result = String::new();
    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let ident: String = chars[start..i].iter().collect();
            if let Some(pos) = params.iter().position(|p| p == &ident) {
                if let Some(arg) = args.get(pos) {
                    result.push_str(arg);
                } else {
                    result.push_str(&ident);
                }
            } else {
                result.push_str(&ident);
            }
            continue;
        }
        result.push(c);
        i += 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn object_macro_expands() {
        let mut pp = Preprocessor::new();
        let out = pp
            .process_source("#define WIDTH 80\nint w = WIDTH;\n", "t.c", Path::new("."))
            .unwrap();
        assert!(out.contains("int w = 80;"));
    }

    #[test]
    fn function_macro_substitutes_args_and_rescans() {
        let mut pp = Preprocessor::new();
        let src = "#define MIN(a,b) ((a)<(b)?(a):(b))\nint m=MIN(5,10);\n";
        let out = pp.process_source(src, "t.c", Path::new(".")).unwrap();
        assert!(out.contains("int m = ((5) < (10) ? (5) : (10));"));
    }

    #[test]
    fn macro_substitution_skips_string_literals() {
        let mut pp = Preprocessor::new();
        let src = "#define X 1\nchar *s = \"X\";\n";
        let out = pp.process_source(src, "t.c", Path::new(".")).unwrap();
        assert!(out.contains("\"X\""));
    }

    #[test]
    fn undef_removes_macro() {
        let mut pp = Preprocessor::new();
        let src = "#define X 1\n#undef X\nint y = X;\n";
        let out = pp.process_source(src, "t.c", Path::new(".")).unwrap();
        assert!(out.contains("int y = X;"));
    }
}
