//! `{variable}` substitution for scripted text, re-prompts and webhook
//! requests.
//!
//! Unbound placeholders render as the empty string.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::debug;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\}").expect("placeholder pattern is valid")
});

fn substitute(template: &str, variables: &HashMap<String, String>, escape: fn(&str) -> String) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match variables.get(&caps[1]) {
            Some(value) => escape(value),
            None => {
                debug!(placeholder = &caps[1], "Unbound template placeholder");
                String::new()
            }
        })
        .into_owned()
}

/// Substitute placeholders with their raw values.
pub fn render(template: &str, variables: &HashMap<String, String>) -> String {
    substitute(template, variables, str::to_string)
}

/// Substitute placeholders inside a JSON document. Values are escaped so a
/// caller-provided string can never break out of the surrounding JSON string.
pub fn render_json(template: &str, variables: &HashMap<String, String>) -> String {
    substitute(template, variables, escape_json)
}

fn escape_json(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// Placeholder names in order of appearance.
pub fn placeholders(template: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}
