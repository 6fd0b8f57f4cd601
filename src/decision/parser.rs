//! Tolerant extraction of a decision array out of an arbitrary LLM reply
//! (spec §4.3). Models wrap JSON in prose, markdown fences, smart quotes,
//! trailing commas, and occasionally hand the parser live arithmetic where a
//! number belongs; none of that is a parse failure here.

use serde_json::Value;

use super::types::RawDecision;
use crate::error::AppError;

const SYMBOL_WHITELIST: &[&str] = &[
    "BTCUSDT", "ETHUSDT", "SOLUSDT", "BNBUSDT", "XRPUSDT", "DOGEUSDT", "ADAUSDT", "AVAXUSDT",
    "LINKUSDT", "LTCUSDT",
];

#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub cot_trace: String,
    pub raw_decisions: Vec<RawDecision>,
}

pub fn parse_llm_reply(input: &str) -> Result<ParseOutcome, AppError> {
    let (candidate_source, cot_trace) = extract_candidate(input);
    let normalized = normalize_punctuation(&candidate_source);
    let without_trailing_commas = strip_trailing_commas(&normalized);
    let neutralized = neutralize_risk_usd_arithmetic(&without_trailing_commas);
    let neutralized = if neutralized.trim_start().starts_with('{') {
        format!("[{neutralized}]")
    } else {
        neutralized
    };

    match serde_json::from_str::<Vec<RawDecision>>(&neutralized) {
        Ok(decisions) => Ok(ParseOutcome {
            cot_trace,
            raw_decisions: decisions,
        }),
        Err(_) => match serde_json::from_str::<Vec<String>>(&neutralized) {
            Ok(strings) => {
                let decisions = strings
                    .into_iter()
                    .map(|s| RawDecision {
                        symbol: infer_symbol(&s).unwrap_or_default(),
                        action: "wait".to_string(),
                        leverage: None,
                        position_size_usd: None,
                        stop_loss: None,
                        take_profit: None,
                        confidence: None,
                        risk_usd: None,
                        reasoning: s,
                    })
                    .collect();
                Ok(ParseOutcome {
                    cot_trace,
                    raw_decisions: decisions,
                })
            }
            Err(e) => Err(AppError::ParseError(format!(
                "could not decode decision array or string fallback: {e}"
            ))),
        },
    }
}

/// Step 1-2: prefer a fenced block's contents; within that (or the raw
/// input), locate the outermost balanced array, or failing that an object
/// containing `"action"`.
fn extract_candidate(input: &str) -> (String, String) {
    if let Some((fence_start, fence_body, fence_end)) = find_fenced_block(input) {
        let cot = input[..fence_start].trim().to_string();
        if let Some(structure) = find_structure(fence_body) {
            return (structure, cot);
        }
        // Fenced block exists but has no recognizable structure inside it;
        // fall through to scanning the whole input.
        let _ = fence_end;
    }

    if let Some(structure) = find_structure(input) {
        let prefix_end = input.find(&structure).unwrap_or(0);
        let cot = input[..prefix_end].trim().to_string();
        return (structure, cot);
    }

    (input.trim().to_string(), String::new())
}

fn find_fenced_block(input: &str) -> Option<(usize, &str, usize)> {
    let start = input.find("```")?;
    let after_open = start + 3;
    let rest = &input[after_open..];
    let first_newline = rest.find('\n').unwrap_or(0);
    let body_start = after_open + first_newline + 1;
    let close_rel = rest.find("```")?;
    let body_end = after_open + close_rel;
    if body_start > body_end {
        return None;
    }
    Some((start, input[body_start..body_end].trim(), body_end + 3))
}

fn find_structure(text: &str) -> Option<String> {
    if let Some(arr) = find_balanced(text, '[', ']') {
        return Some(arr);
    }
    // Look for an object containing the key "action"; scan every `{` and
    // keep the first balanced span whose contents mention it.
    let bytes = text.as_bytes();
    for (idx, b) in bytes.iter().enumerate() {
        if *b == b'{' {
            if let Some(span) = find_balanced(&text[idx..], '{', '}') {
                if span.contains("\"action\"") {
                    return Some(span);
                }
            }
        }
    }
    None
}

/// Scan for the first `open`, then track bracket depth while respecting
/// string literals and backslash escapes, returning the outermost balanced
/// span including delimiters.
fn find_balanced(text: &str, open: char, close: char) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.iter().position(|&c| c == open)?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for i in start..chars.len() {
        let c = chars[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Some(chars[start..=i].iter().collect());
                }
            }
            _ => {}
        }
    }
    None
}

fn normalize_punctuation(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{FF1A}' => ':',
            '\u{FF0C}' => ',',
            other => other,
        })
        .collect()
}

/// Remove a trailing comma that precedes `}` or `]`, skipping commas inside
/// string literals and honoring backslash escapes.
fn strip_trailing_commas(input: &str) -> String {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
            continue;
        }
        if c == ',' {
            // Look ahead past whitespace for a closing bracket.
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

/// Replace any `"risk_usd": <value>` whose value is not a plain numeric
/// literal (e.g. `12*2`, `"n/a"`) with `0`.
fn neutralize_risk_usd_arithmetic(input: &str) -> String {
    const KEY: &str = "\"risk_usd\"";
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    loop {
        match rest.find(KEY) {
            None => {
                out.push_str(rest);
                break;
            }
            Some(key_pos) => {
                let value_start_rel = key_pos + KEY.len();
                out.push_str(&rest[..value_start_rel]);
                let after_key = &rest[value_start_rel..];
                let colon_rel = match after_key.find(':') {
                    Some(p) => p,
                    None => {
                        out.push_str(after_key);
                        break;
                    }
                };
                out.push_str(&after_key[..=colon_rel]);
                let value_region = &after_key[colon_rel + 1..];
                let (value_text, value_len) = take_json_value_span(value_region);
                if is_plain_number(value_text.trim()) {
                    out.push_str(value_text);
                } else {
                    out.push('0');
                }
                rest = &value_region[value_len..];
            }
        }
    }
    out
}

/// Grab the text of the next JSON value up to (but excluding) an unquoted
/// `,`/`}`/`]`, respecting string literals.
fn take_json_value_span(text: &str) -> (&str, usize) {
    let mut in_string = false;
    let mut escaped = false;
    for (byte_idx, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            ',' | '}' | ']' => return (&text[..byte_idx], byte_idx),
            _ => {}
        }
    }
    (text, text.len())
}

fn is_plain_number(s: &str) -> bool {
    !s.is_empty() && s.parse::<f64>().is_ok()
}

fn infer_symbol(s: &str) -> Option<String> {
    let token = s.split_whitespace().find(|w| {
        w.chars().next().map(|c| c.is_ascii_uppercase()).unwrap_or(false)
            && w.chars().all(|c| c.is_ascii_alphanumeric())
    })?;
    SYMBOL_WHITELIST
        .iter()
        .find(|sym| **sym == token || sym.starts_with(token))
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_array_wrapped_in_prose_and_fence() {
        let input = "思路...\n```json\n[{\"symbol\":\"BTCUSDT\",\"action\":\"hold\",\"reasoning\":\"x\"}]\n```";
        let outcome = parse_llm_reply(input).unwrap();
        assert_eq!(outcome.raw_decisions.len(), 1);
        assert_eq!(outcome.raw_decisions[0].symbol, "BTCUSDT");
    }

    #[test]
    fn strips_trailing_commas_inside_and_outside_strings() {
        let input = r#"[{"a":"b,",},]"#;
        let cleaned = strip_trailing_commas(input);
        assert_eq!(cleaned, r#"[{"a":"b,"}]"#);
    }

    #[test]
    fn neutralizes_arithmetic_risk_usd() {
        let input = r#"[{"symbol":"BTCUSDT","action":"open_long","leverage":5,"position_size_usd":100,"stop_loss":59400,"take_profit":62300,"risk_usd":12*2,"reasoning":"x"}]"#;
        let outcome = parse_llm_reply(input).unwrap();
        assert_eq!(outcome.raw_decisions.len(), 1);
        assert_eq!(outcome.raw_decisions[0].risk_usd, Some(0.0));
    }

    #[test]
    fn string_array_falls_back_to_wait_decisions() {
        let input = r#"["BTCUSDT looks range-bound, standing aside", "no edge on ETH right now"]"#;
        let outcome = parse_llm_reply(input).unwrap();
        assert_eq!(outcome.raw_decisions.len(), 2);
        assert!(outcome.raw_decisions.iter().all(|d| d.action == "wait"));
        assert!(outcome.raw_decisions.iter().all(|d| !d.reasoning.is_empty()));
    }

    #[test]
    fn scenario_one_tolerant_parse() {
        let input = "思路...\n[{\"symbol\":\"BTCUSDT\",\"action\":\"open_long\",\"leverage\":5,\"position_size_usd\":100,\"stop_loss\":59400,\"take_profit\":62300,\"risk_usd\":12*2,\"reasoning\":\"x\"}]";
        let outcome = parse_llm_reply(input).unwrap();
        assert_eq!(outcome.raw_decisions.len(), 1);
        assert_eq!(outcome.raw_decisions[0].risk_usd, Some(0.0));
        assert_eq!(outcome.cot_trace, "思路...");
    }

    #[test]
    fn smart_quotes_and_fullwidth_punctuation_normalize() {
        let input = "[{\u{201C}symbol\u{201D}\u{FF1A} \u{201C}BTCUSDT\u{201D}\u{FF0C} \u{201C}action\u{201D}: \u{201C}hold\u{201D}\u{FF0C} \u{201C}reasoning\u{201D}: \u{201C}x\u{201D}}]";
        let outcome = parse_llm_reply(input).unwrap();
        assert_eq!(outcome.raw_decisions.len(), 1);
        assert_eq!(outcome.raw_decisions[0].symbol, "BTCUSDT");
    }

    #[test]
    fn object_with_action_key_extracted_without_surrounding_array() {
        let input = "here you go: {\"symbol\":\"ETHUSDT\",\"action\":\"hold\",\"reasoning\":\"y\"} done";
        let structure = find_structure(input).unwrap();
        assert!(structure.starts_with('{'));
        assert!(structure.contains("\"action\""));
    }

    #[test]
    fn bare_object_decision_parses_as_single_element_list() {
        let input = "here you go: {\"symbol\":\"ETHUSDT\",\"action\":\"hold\",\"reasoning\":\"y\"} done";
        let outcome = parse_llm_reply(input).unwrap();
        assert_eq!(outcome.raw_decisions.len(), 1);
        assert_eq!(outcome.raw_decisions[0].action, "hold");
    }
}
