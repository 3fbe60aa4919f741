//! Code Sanitizer
//!
//! Turns raw model output into a script that has a fair chance of parsing:
//! fence stripping, ASCII normalization, operator respacing, geometry accessor
//! fixes, indentation reconstruction and import backfill, in that order.
//!
//! Indentation is rebuilt with a depth counter, not a parser. Blocks nested
//! more than one level that close together, and expressions spanning several
//! lines, can come out wrong; the original text is kept next to the result.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Imports every generated script gets, in the order they are prepended
pub const REQUIRED_IMPORTS: [&str; 5] = [
    "import pandas as pd",
    "import geopandas as gpd",
    "import numpy as np",
    "from shapely.geometry import Point",
    "from shapely import wkt",
];

const INDENT_UNIT: &str = "    ";
const FENCE: &str = "```";

/// Keywords that continue the block opened before them
const CONTINUATION_KEYWORDS: &[&str] = &["else", "elif", "except", "finally"];

/// Keywords that leave the current block unconditionally
const EXIT_KEYWORDS: &[&str] = &["return", "break", "continue", "pass", "raise"];

const DOUBLED_DISTANCE: &str = ".geometry.geometry.distance(";
const GEOMETRY_DISTANCE: &str = ".geometry.distance(";

/// Operator tokens, longest first. `true` means the token gets one space on
/// each side, `false` means it is copied as-is.
const OPERATOR_TOKENS: &[(&str, bool)] = &[
    ("**=", true),
    ("//=", true),
    (">>=", true),
    ("<<=", true),
    ("==", true),
    ("!=", true),
    ("<=", true),
    (">=", true),
    ("+=", true),
    ("-=", true),
    ("*=", true),
    ("/=", true),
    ("%=", true),
    ("&=", true),
    ("|=", true),
    ("^=", true),
    (":=", true),
    ("->", false),
    ("<<", false),
    (">>", false),
    ("<", true),
    (">", true),
    ("=", true),
];

lazy_static! {
    static ref WHITESPACE_RUN: Regex = Regex::new(r"\s+").unwrap();
    /// `= =`, `! =`, `< =`, `> =` and wider gaps
    static ref SPLIT_COMPARISON: Regex = Regex::new(r"([=!<>])[ \t]+=").unwrap();
}

/// Sanitized script together with the text it was derived from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SanitizedScript {
    pub original: String,
    pub text: String,
}

/// Code sanitizer
#[derive(Debug, Clone)]
pub struct CodeSanitizer {
    required_imports: Vec<String>,
}

impl CodeSanitizer {
    pub fn new() -> Self {
        Self {
            required_imports: REQUIRED_IMPORTS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn sanitize(&self, raw: &str) -> SanitizedScript {
        let code = strip_fences(raw);
        let code = normalize_chars(code);

        let cleaned: Vec<String> = code
            .trim()
            .lines()
            .map(|line| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    return line.to_string();
                }
                let line = if line.contains('"') || line.contains('\'') {
                    line.to_string()
                } else {
                    respace_operators(line)
                };
                fix_geometry_access(&line)
            })
            .collect();

        let text = reindent(&cleaned).join("\n");
        let text = self.backfill_imports(text);

        SanitizedScript {
            original: raw.to_string(),
            text,
        }
    }

    fn backfill_imports(&self, code: String) -> String {
        let missing: Vec<&str> = self
            .required_imports
            .iter()
            .map(|s| s.as_str())
            .filter(|import| !code.lines().any(|line| line.trim() == *import))
            .collect();

        if missing.is_empty() {
            return code;
        }
        if code.is_empty() {
            return missing.join("\n");
        }
        format!("{}\n{}", missing.join("\n"), code)
    }
}

impl Default for CodeSanitizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Content of the first fenced block, or the whole text when there is none.
/// An info string (`python`, `py`, ...) on the opening fence line is dropped.
pub fn strip_fences(text: &str) -> &str {
    let Some(open) = text.find(FENCE) else {
        return text;
    };
    let after = &text[open + FENCE.len()..];
    let block = match after.find(FENCE) {
        Some(close) => &after[..close],
        None => after,
    };

    match block.split_once('\n') {
        Some((first, rest)) if is_info_string(first) => rest,
        _ => block,
    }
}

fn is_info_string(line: &str) -> bool {
    line.trim()
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+' | '.'))
}

/// Keep printable ASCII plus newline and tab
pub fn normalize_chars(text: &str) -> String {
    text.chars()
        .filter(|c| matches!(*c, '\n' | '\t' | ' '..='~'))
        .collect()
}

/// Canonicalize split comparison operators and pad assignment/comparison
/// operators with single spaces. Callers skip lines holding string literals.
pub fn respace_operators(line: &str) -> String {
    let line = SPLIT_COMPARISON.replace_all(line, "${1}=");
    let chars: Vec<char> = line.chars().collect();
    let mut out = String::with_capacity(line.len() + 8);

    let mut i = 0;
    'scan: while i < chars.len() {
        for (token, padded) in OPERATOR_TOKENS {
            let len = token.len();
            if i + len <= chars.len() && chars[i..i + len].iter().copied().eq(token.chars()) {
                if *padded {
                    out.push(' ');
                    out.push_str(token);
                    out.push(' ');
                } else {
                    out.push_str(token);
                }
                i += len;
                continue 'scan;
            }
        }
        out.push(chars[i]);
        i += 1;
    }

    WHITESPACE_RUN.replace_all(&out, " ").trim().to_string()
}

/// Route `.distance(` calls through the geometry accessor exactly once
pub fn fix_geometry_access(line: &str) -> String {
    let mut out = line.replace(".distance(", GEOMETRY_DISTANCE);
    while out.contains(DOUBLED_DISTANCE) {
        out = out.replace(DOUBLED_DISTANCE, GEOMETRY_DISTANCE);
    }
    out
}

/// Rebuild indentation for already-stripped lines
pub fn reindent(lines: &[String]) -> Vec<String> {
    let mut depth = 0usize;
    let mut out = Vec::with_capacity(lines.len());

    for (i, line) in lines.iter().enumerate() {
        let stripped = line.trim();
        if stripped.is_empty() {
            out.push(String::new());
            continue;
        }
        if stripped.starts_with('#') {
            out.push(indented(depth, stripped));
            continue;
        }

        if starts_with_keyword(stripped, CONTINUATION_KEYWORDS) {
            depth = depth.saturating_sub(1);
            out.push(indented(depth, stripped));
            if opens_block(stripped) {
                depth += 1;
            }
            continue;
        }

        out.push(indented(depth, stripped));

        if opens_block(stripped) {
            depth += 1;
        } else if starts_with_keyword(stripped, EXIT_KEYWORDS) {
            let next = lines[i + 1..]
                .iter()
                .map(|l| l.trim())
                .find(|l| !l.is_empty() && !l.starts_with('#'));
            if let Some(next) = next {
                if !starts_with_keyword(next, CONTINUATION_KEYWORDS) {
                    depth = depth.saturating_sub(1);
                }
            }
        }
    }

    out
}

fn indented(depth: usize, line: &str) -> String {
    format!("{}{}", INDENT_UNIT.repeat(depth), line)
}

fn opens_block(line: &str) -> bool {
    line.ends_with(':')
}

/// `line` starts with one of `keywords` as a whole word
fn starts_with_keyword(line: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| {
        line.strip_prefix(kw)
            .map(|rest| {
                rest.chars()
                    .next()
                    .map_or(true, |c| !(c.is_ascii_alphanumeric() || c == '_'))
            })
            .unwrap_or(false)
    })
}
