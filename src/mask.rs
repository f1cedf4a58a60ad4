// src/mask.rs

//! Secret masking for everything that leaves the engine: log lines, error
//! messages, and failed-ledger records.
//!
//! Two layers: field-keyed masking for values whose field name is known, and
//! pattern scanning for free-form text. Masking is idempotent: the partial
//! mask keeps the first three and last two characters and replaces the
//! interior with a fixed run of `•`, so re-masking already-masked text
//! reproduces it exactly.

use std::collections::HashMap;

use regex::{Captures, Regex};

const MASK_CHAR: char = '•';
const MASK_RUN: usize = 15;
const FULL_MASK: &str = "********";

/// How a field's value is redacted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskStrategy {
    /// Leave the value untouched.
    None,
    /// Replace the whole value with a fixed placeholder.
    Full,
    /// Keep the first three and last two characters.
    Partial,
}

/// Redacts secrets by field name and by scanning free text.
pub struct Masker {
    enabled: bool,
    fields: HashMap<String, MaskStrategy>,
    patterns: Vec<Regex>,
}

impl Masker {
    pub fn new() -> Self {
        let mut fields = HashMap::new();
        fields.insert("cf_api_token".to_string(), MaskStrategy::Partial);
        fields.insert("server_password".to_string(), MaskStrategy::Full);
        fields.insert("password".to_string(), MaskStrategy::Full);
        fields.insert("api_token".to_string(), MaskStrategy::Partial);
        fields.insert("token".to_string(), MaskStrategy::Partial);
        fields.insert("secret".to_string(), MaskStrategy::Full);
        fields.insert("key".to_string(), MaskStrategy::Partial);
        fields.insert("access_key".to_string(), MaskStrategy::Partial);
        fields.insert("secret_key".to_string(), MaskStrategy::Partial);

        // Order matters: key=value forms first, the bare long-token catch-all
        // last. Replacement text contains `•`, which no pattern matches, so a
        // second pass over masked text is a no-op.
        let patterns = vec![
            Regex::new(r#"(cf_api_token|api_token|token|access_key|secret_key)["'\s:=]+([A-Za-z0-9_-]{16,})"#)
                .expect("token pattern compiles"),
            Regex::new(r#"(password|passwd)["'\s:=]+([^\s"')]{8,})"#)
                .expect("password pattern compiles"),
            Regex::new(r"Bearer\s+([A-Za-z0-9._\-+=/]{20,})").expect("bearer pattern compiles"),
            Regex::new(r"\b[A-Za-z0-9]{32,}\b").expect("bare token pattern compiles"),
        ];

        Self {
            enabled: true,
            fields,
            patterns,
        }
    }

    pub fn with_enabled(enabled: bool) -> Self {
        let mut masker = Self::new();
        masker.enabled = enabled;
        masker
    }

    /// Mask a value whose field name is known.
    ///
    /// Unmapped fields are masked partially when the name contains a
    /// sensitive keyword, otherwise returned unchanged.
    pub fn mask_field(&self, field: &str, value: &str) -> String {
        if !self.enabled {
            return value.to_string();
        }

        let strategy = match self.fields.get(field) {
            Some(strategy) => *strategy,
            None if is_sensitive_field(field) => MaskStrategy::Partial,
            None => MaskStrategy::None,
        };

        apply_strategy(value, strategy)
    }

    /// Scan free text and mask every sensitive pattern occurrence.
    pub fn mask_text(&self, text: &str) -> String {
        if !self.enabled || text.is_empty() {
            return text.to_string();
        }

        let mut result = text.to_string();
        for pattern in &self.patterns {
            result = pattern
                .replace_all(&result, |caps: &Captures| mask_capture(caps))
                .into_owned();
        }
        result
    }

    /// Override the strategy for a field.
    pub fn set_strategy(&mut self, field: &str, strategy: MaskStrategy) {
        self.fields.insert(field.to_string(), strategy);
    }
}

impl Default for Masker {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_strategy(value: &str, strategy: MaskStrategy) -> String {
    match strategy {
        MaskStrategy::None => value.to_string(),
        MaskStrategy::Full => FULL_MASK.to_string(),
        MaskStrategy::Partial => mask_partial(value),
    }
}

/// Keep the first three and last two characters; the interior becomes a
/// fixed-width run so output length does not leak the secret's length.
/// Values of five characters or fewer are fully masked.
fn mask_partial(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    if chars.len() <= 5 {
        return MASK_CHAR.to_string().repeat(chars.len());
    }

    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    let run: String = MASK_CHAR.to_string().repeat(MASK_RUN);
    format!("{head}{run}{tail}")
}

/// Replace only the secret-bearing capture group, keeping key names and the
/// `Bearer` keyword visible.
fn mask_capture(caps: &Captures) -> String {
    let full = caps.get(0).expect("capture group 0 always present");

    // key=value forms: group 2 is the value.
    let value = caps.get(2).or_else(|| caps.get(1));
    let value = match value {
        Some(value) => value,
        None => return mask_partial(full.as_str()),
    };

    let start = value.start() - full.start();
    let end = value.end() - full.start();
    let text = full.as_str();
    format!(
        "{}{}{}",
        &text[..start],
        mask_partial(value.as_str()),
        &text[end..]
    )
}

fn is_sensitive_field(field: &str) -> bool {
    const KEYWORDS: [&str; 10] = [
        "password",
        "passwd",
        "pwd",
        "token",
        "api_key",
        "apikey",
        "secret",
        "key",
        "private",
        "credential",
    ];

    let lower = field.to_lowercase();
    KEYWORDS.iter().any(|keyword| lower.contains(keyword))
}
