//! Specification-line splitting.
//!
//! Declaration lines arrive as raw text (`real(rk), intent(in),
//! dimension(nx, ny) :: a, b`). Everything that needs to look inside them
//! goes through this module, so paren- and quote-aware scanning lives in
//! exactly one place and never leaks into the symbol model or the
//! backends.

use snafu::ensure;

use crate::error::{MalformedDeclarationSnafu, Result, UnbalancedParenthesesSnafu};

/// A declaration line divided at its top-level `::` separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitDeclaration {
    /// Type and attribute text left of `::`, trimmed.
    pub prefix: String,
    /// Symbol list right of `::`, trimmed.
    pub symbols: String,
}

impl SplitDeclaration {
    /// Declared symbol names in source order, initializers and per-name
    /// dimension specs stripped.
    pub fn symbol_names(&self) -> Vec<&str> {
        split_top_level(&self.symbols, ',')
            .into_iter()
            .filter_map(first_identifier)
            .collect()
    }

    /// Dimension size expressions declared for `symbol_name`.
    ///
    /// A `dimension(...)` attribute wins; otherwise the paren group
    /// attached to the name itself is used. No dimensions means scalar.
    pub fn declared_dimensions(&self, symbol_name: &str) -> Vec<String> {
        if let Some(spec) = directive_argument(&self.prefix, "dimension") {
            return split_arguments(&spec);
        }
        for entry in split_top_level(&self.symbols, ',') {
            let entry = entry.trim();
            let Some(name) = first_identifier(entry) else { continue };
            if !name.eq_ignore_ascii_case(symbol_name) {
                continue;
            }
            let rest = entry[name.len()..].trim_start();
            if rest.starts_with('(')
                && let Some(end) = matching_paren(rest)
            {
                return split_arguments(&rest[1..end - 1]);
            }
        }
        Vec::new()
    }

    /// Intent attribute payload, lowercased (`in`, `out`, `inout`).
    pub fn intent(&self) -> Option<String> {
        directive_argument(&self.prefix, "intent").map(|i| i.trim().to_ascii_lowercase())
    }
}

/// Split one specification line at the top-level `::`.
pub fn split(line: &str) -> Result<SplitDeclaration> {
    ensure!(balanced(line), UnbalancedParenthesesSnafu { text: line.to_string() });
    let sep = find_top_level(line, "::");
    let Some(sep) = sep else {
        return MalformedDeclarationSnafu { line: line.to_string() }.fail();
    };
    Ok(SplitDeclaration {
        prefix: line[..sep].trim().to_string(),
        symbols: line[sep + 2..].trim().to_string(),
    })
}

/// Remove the named attributes from a declaration prefix.
///
/// Matching is on the leading identifier of each comma component, so
/// `"intent"` strips `intent(inout)` and `"dimension"` strips
/// `dimension(nx, ny)`. Case-insensitive.
pub fn purge_directives(prefix: &str, names: &[&str]) -> String {
    let kept: Vec<&str> = split_top_level(prefix, ',')
        .into_iter()
        .map(str::trim)
        .filter(|component| {
            let Some(head) = first_identifier(component) else {
                return true;
            };
            !names.iter().any(|n| head.eq_ignore_ascii_case(n))
        })
        .collect();
    kept.join(", ")
}

/// Payload of a parenthesized attribute, e.g. `directive_argument(p,
/// "intent")` on `real, intent(in)` yields `in`.
pub fn directive_argument(prefix: &str, name: &str) -> Option<String> {
    for component in split_top_level(prefix, ',') {
        let component = component.trim();
        let Some(head) = first_identifier(component) else { continue };
        if !head.eq_ignore_ascii_case(name) {
            continue;
        }
        let rest = component[head.len()..].trim_start();
        if rest.starts_with('(')
            && let Some(end) = matching_paren(rest)
        {
            return Some(rest[1..end - 1].trim().to_string());
        }
    }
    None
}

/// Split an argument or size list on top-level commas, trimming each item.
pub fn split_arguments(text: &str) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    split_top_level(text, ',').into_iter().map(|s| s.trim().to_string()).collect()
}

/// Leading identifier of an expression, if it starts with one.
pub fn first_identifier(text: &str) -> Option<&str> {
    let trimmed = text.trim_start();
    let mut end = 0;
    for (i, c) in trimmed.char_indices() {
        let valid = if i == 0 { c.is_ascii_alphabetic() || c == '_' } else { c.is_ascii_alphanumeric() || c == '_' };
        if !valid {
            break;
        }
        end = i + c.len_utf8();
    }
    (end > 0).then(|| &trimmed[..end])
}

/// Whether `ident` occurs in `text` as a whole identifier.
///
/// Case-insensitive, so `nx` is found in `SIZE(NX)` but not in `nxy`.
pub fn contains_identifier(text: &str, ident: &str) -> bool {
    if ident.is_empty() {
        return false;
    }
    let text_lower = text.to_ascii_lowercase();
    let ident_lower = ident.to_ascii_lowercase();
    let bytes = text_lower.as_bytes();
    let mut from = 0;
    while let Some(pos) = text_lower[from..].find(&ident_lower) {
        let start = from + pos;
        let end = start + ident_lower.len();
        let before_ok = start == 0 || !is_ident_byte(bytes[start - 1]);
        let after_ok = end == bytes.len() || !is_ident_byte(bytes[end]);
        if before_ok && after_ok {
            return true;
        }
        from = start + 1;
    }
    false
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Tracks paren depth and quoting while scanning a line left to right.
#[derive(Debug, Default, Clone, Copy)]
struct ScanState {
    depth: u32,
    quote: Option<char>,
}

impl ScanState {
    fn step(&mut self, c: char) {
        match (self.quote, c) {
            (Some(q), _) if c == q => self.quote = None,
            (Some(_), _) => {}
            (None, '\'') | (None, '"') => self.quote = Some(c),
            (None, '(') => self.depth += 1,
            (None, ')') => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
    }

    fn at_top(&self) -> bool {
        self.depth == 0 && self.quote.is_none()
    }
}

fn balanced(text: &str) -> bool {
    let mut open: i64 = 0;
    let mut state = ScanState::default();
    for c in text.chars() {
        if state.quote.is_none() {
            match c {
                '(' => open += 1,
                ')' => {
                    open -= 1;
                    if open < 0 {
                        return false;
                    }
                }
                _ => {}
            }
        }
        state.step(c);
    }
    open == 0 && state.quote.is_none()
}

/// Byte offset of the first top-level occurrence of `needle`.
fn find_top_level(text: &str, needle: &str) -> Option<usize> {
    let mut state = ScanState::default();
    for (i, c) in text.char_indices() {
        if state.at_top() && text[i..].starts_with(needle) {
            return Some(i);
        }
        state.step(c);
    }
    None
}

/// Split on `sep` at paren depth zero, outside quotes.
pub fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut state = ScanState::default();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if c == sep && state.at_top() {
            parts.push(&text[start..i]);
            start = i + c.len_utf8();
        }
        state.step(c);
    }
    parts.push(&text[start..]);
    parts
}

/// Byte offset one past the paren matching `text`'s leading `(`.
fn matching_paren(text: &str) -> Option<usize> {
    debug_assert!(text.starts_with('('));
    let mut state = ScanState::default();
    for (i, c) in text.char_indices() {
        state.step(c);
        if i > 0 && state.at_top() {
            return Some(i + c.len_utf8());
        }
    }
    None
}
