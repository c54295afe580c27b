//! Comma-separated option strings for codecs and optimizer passes.
//!
//! Grammar: `name` enables, `-name` disables, `name[1-4:8]` enables and
//! attaches a sample index set (colon-separated spans or singletons).
//! Parsing is total; malformed ranges collapse to empty sets and
//! unknown tokens are simply carried without effect.

#[derive(Clone, Debug)]
struct Token {
    name: String,
    enabled: bool,
    range: Vec<usize>,
}

/// A parsed option string.
#[derive(Clone, Debug, Default)]
pub struct Options {
    tokens: Vec<Token>,
}

impl Options {
    pub fn parse(input: &str) -> Self {
        let mut tokens = Vec::new();
        for raw in input.split(',') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let (enabled, rest) = match raw.strip_prefix('-') {
                Some(rest) => (false, rest),
                None => (true, raw),
            };
            let (name, range) = match rest.split_once('[') {
                Some((name, tail)) => {
                    (name, parse_range(tail.strip_suffix(']').unwrap_or(tail)))
                }
                None => (rest, Vec::new()),
            };
            if name.is_empty() {
                continue;
            }
            tokens.push(Token { name: name.to_string(), enabled, range });
        }
        Self { tokens }
    }

    /// True iff `name` appears, false iff `-name` appears, else `default`.
    pub fn has(&self, name: &str, default: bool) -> bool {
        for token in &self.tokens {
            if token.name == name {
                return token.enabled;
            }
        }
        default
    }

    /// Sample indices attached to `name`; empty when absent or malformed.
    pub fn range(&self, name: &str) -> &[usize] {
        for token in &self.tokens {
            if token.name == name {
                return &token.range;
            }
        }
        &[]
    }
}

fn parse_range(input: &str) -> Vec<usize> {
    let mut out = Vec::new();
    for part in input.split(':') {
        match part.split_once('-') {
            Some((lo, hi)) => match (lo.parse::<usize>(), hi.parse::<usize>()) {
                (Ok(lo), Ok(hi)) if lo <= hi => out.extend(lo..=hi),
                _ => return Vec::new(),
            },
            None => match part.parse::<usize>() {
                Ok(v) => out.push(v),
                Err(_) => return Vec::new(),
            },
        }
    }
    out
}
