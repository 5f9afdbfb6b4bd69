//! Strict parsing and rendering of the `key=value` exchange format used in
//! every proposal prompt.
//!
//! The parser scans lines rather than evaluating anything: a line starting
//! with `<var>=` opens that variable's value, and subsequent lines that open
//! no other variable are appended as continuation lines. When no configured
//! variable is found the parse fails closed with an empty map.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

/// Strips the wrapping quotes completion services like to add around a whole
/// response.
pub fn strip_outer_quotes(text: &str) -> &str {
    text.trim().trim_matches('\'').trim_matches('"')
}

/// Extracts `variables` from a completion response.
///
/// Values keep internal newlines: every line after a `var=` opener that does
/// not itself open another variable is treated as a continuation of the
/// current value.
pub fn extract_variations(text: &str, variables: &[String]) -> HashMap<String, String> {
    let mut result: HashMap<String, String> = HashMap::new();
    let mut current: Option<String> = None;
    for line in text.lines() {
        let opened = variables.iter().find_map(|var| {
            line.strip_prefix(var.as_str())
                .and_then(|rest| rest.strip_prefix('='))
                .map(|value| (var.clone(), value))
        });
        match opened {
            Some((var, value)) => {
                result.insert(var.clone(), strip_outer_quotes(value).to_string());
                current = Some(var);
            }
            None => {
                if let Some(var) = &current {
                    let value = result.get_mut(var).unwrap();
                    value.push('\n');
                    value.push_str(line);
                }
            }
        }
    }
    result
}

/// Renders variables as `var=value` lines, in the order given. Variables
/// missing from the map are skipped.
pub fn render_input(values: &HashMap<String, String>, variables: &[String]) -> String {
    let mut out = String::new();
    for var in variables {
        if let Some(value) = values.get(var) {
            out.push_str(var);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
    }
    out
}

/// The fixed tail instruction demanding the response in parseable form.
pub fn render_output_format(variables: &[String]) -> String {
    let mut prompt = String::from("Do not write code. Please respond with the given format:\n");
    for var in variables {
        prompt.push_str(&format!("{var}={{your generated {var}}}"));
    }
    prompt
}

fn placeholder_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"\{([A-Za-z0-9_]+)\}").unwrap())
}

/// Template placeholders (`{name}`) appearing in a candidate value, deduped
/// in first-appearance order.
pub fn extract_placeholders(text: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for capture in placeholder_regex().captures_iter(text) {
        let name = capture[1].to_string();
        if !seen.contains(&name) {
            seen.push(name);
        }
    }
    seen
}

/// Instruction appended to generation prompts when the source candidate
/// carries template placeholders. Preservation is prompt-enforced only;
/// generated candidates are not validated against it.
pub fn render_placeholder_restriction(placeholders: &[String]) -> String {
    let rendered: Vec<String> = placeholders.iter().map(|p| format!("{{{p}}}")).collect();
    format!(
        "\nThe generated text must keep these template placeholders exactly as written: {}.\n",
        rendered.join(", ")
    )
}
