//! Post-processing: turn raw model output into a fixed-shape [`AnalysisResult`].
//!
//! ## Why is post-processing necessary?
//!
//! Even well-prompted models return output that cannot be shown as-is:
//!
//! - JSON wrapped in ` ```json ... ``` ` fences or surrounded by prose
//! - cards missing, duplicated, out of order or with unknown ids
//! - confidence as a string, out of range, or absent
//! - copied personal identifiers and prescriptive wording ("you must …")
//!
//! The UI renders exactly five cards in a fixed order, so this module always
//! produces exactly those five, substituting localized fallback text for any
//! card the model got wrong. It never fails: a document is never left
//! unexplained because of a formatting glitch.
//!
//! ## Order of operations
//!
//! 1. Text hygiene (line endings, trailing whitespace, blank runs, invisible chars)
//! 2. Sanitisation + length cap per card and for the notice
//! 3. One-time confidence penalty when the sanitizer altered anything
//! 4. Low-confidence caution prepended to the notice

use crate::config::ServiceConfig;
use crate::error::ModelError;
use crate::pipeline::sanitize::Sanitizer;
use crate::prompts::{low_confidence_prefix, CardId, Lang, PromptDefaults};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One explanation card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    pub title: String,
    pub text: String,
}

/// The shaped result returned to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Always within `0.0..=1.0`.
    pub confidence: f64,
    /// Exactly five cards, in [`CardId::ALL`] order.
    pub cards: Vec<Card>,
    pub notice: String,
}

/// Telemetry-only flags; never used for control flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultStats {
    /// The sanitizer altered at least one card or the notice.
    pub sanitized: bool,
    /// Final confidence fell below the low-confidence threshold.
    pub confidence_low: bool,
}

/// Output of [`build_result`].
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltResult {
    pub result: AnalysisResult,
    pub stats: ResultStats,
}

/// Caps and thresholds used while shaping a result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResultPolicy {
    pub card_max_chars: usize,
    pub notice_max_chars: usize,
    pub low_confidence_threshold: f64,
    pub sanitizer_penalty: f64,
}

impl Default for ResultPolicy {
    fn default() -> Self {
        Self::from(&ServiceConfig::default())
    }
}

impl From<&ServiceConfig> for ResultPolicy {
    fn from(c: &ServiceConfig) -> Self {
        Self {
            card_max_chars: c.card_max_chars,
            notice_max_chars: c.notice_max_chars,
            low_confidence_threshold: c.low_confidence_threshold,
            sanitizer_penalty: c.sanitizer_penalty,
        }
    }
}

/// Shape raw model output with the default policy.
pub fn build_result(raw: &Value, defaults: &PromptDefaults) -> BuiltResult {
    build_result_with(raw, defaults, &ResultPolicy::default())
}

/// Shape raw model output into exactly five cards, a clamped confidence and
/// a sanitized notice.
///
/// Non-object `raw` is treated as `{}`; a non-list `cards` as `[]`.
pub fn build_result_with(raw: &Value, defaults: &PromptDefaults, policy: &ResultPolicy) -> BuiltResult {
    let empty = Map::new();
    let obj = raw.as_object().unwrap_or(&empty);
    let sanitizer = Sanitizer::shared();

    let mut confidence = read_confidence(obj.get("confidence"));

    let raw_cards: &[Value] = obj
        .get("cards")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    let mut any_modified = false;
    let cards: Vec<Card> = CardId::ALL
        .into_iter()
        .map(|id| {
            let found = raw_cards
                .iter()
                .find(|c| c.get("id").and_then(Value::as_str) == Some(id.as_str()));
            let (card, modified) = shape_card(id, found, defaults.lang, policy, sanitizer);
            any_modified |= modified;
            card
        })
        .collect();

    let mut notice = match obj.get("notice").and_then(Value::as_str) {
        Some(text) => {
            let s = sanitizer.sanitize_capped(&clean_text(text), policy.notice_max_chars);
            any_modified |= s.was_modified;
            s.text
        }
        None => String::new(),
    };
    if notice.is_empty() {
        notice = defaults.notice.clone();
    }

    if any_modified {
        confidence = (confidence - policy.sanitizer_penalty).clamp(0.0, 1.0);
    }

    let confidence_low = confidence < policy.low_confidence_threshold;
    if confidence_low {
        notice = format!("{}{}", low_confidence_prefix(defaults.lang), notice);
    }

    BuiltResult {
        result: AnalysisResult {
            confidence,
            cards,
            notice,
        },
        stats: ResultStats {
            sanitized: any_modified,
            confidence_low,
        },
    }
}

/// Shape one card from its (possibly absent or malformed) raw object.
///
/// Returns the card and whether the sanitizer altered its text.
pub fn shape_card(
    id: CardId,
    raw: Option<&Value>,
    lang: Lang,
    policy: &ResultPolicy,
    sanitizer: &Sanitizer,
) -> (Card, bool) {
    let sanitized = raw
        .and_then(|v| v.get("text"))
        .and_then(Value::as_str)
        .map(|t| sanitizer.sanitize_capped(&clean_text(t), policy.card_max_chars))
        .filter(|s| !s.text.is_empty());

    let (text, modified) = match sanitized {
        Some(s) => (s.text, s.was_modified),
        None => (id.fallback(lang).to_string(), false),
    };

    (
        Card {
            id: id.as_str().to_string(),
            title: id.title(lang).to_string(),
            text,
        },
        modified,
    )
}

fn read_confidence(v: Option<&Value>) -> f64 {
    v.and_then(Value::as_f64)
        .filter(|c| c.is_finite())
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(0.0)
}

// ── JSON extraction ──────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*\s*\n(.*?)\n?```\s*$").unwrap());

/// Pull the JSON object out of a model reply.
///
/// Strips outer code fences, then parses the span from the first `{` to the
/// last `}`.
///
/// # Errors
/// - [`ModelError::NoJson`] when there is no `{ … }` span
/// - [`ModelError::InvalidJson`] when the span does not parse
pub fn extract_json_object(text: &str) -> Result<Value, ModelError> {
    let trimmed = text.trim();
    let unfenced = RE_OUTER_FENCES
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map_or(trimmed, |m| m.as_str());

    let start = unfenced.find('{').ok_or(ModelError::NoJson)?;
    let end = unfenced.rfind('}').ok_or(ModelError::NoJson)?;
    if end < start {
        return Err(ModelError::NoJson);
    }
    serde_json::from_str(&unfenced[start..=end]).map_err(|e| ModelError::InvalidJson(e.to_string()))
}

// ── Text hygiene ─────────────────────────────────────────────────────────────

static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{3,}").unwrap());

/// Normalise line endings, trim trailing whitespace per line, collapse runs
/// of blank lines and drop invisible Unicode.
pub fn clean_text(input: &str) -> String {
    let s = input.replace("\r\n", "\n").replace('\r', "\n");
    let s = s
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n");
    let s = RE_BLANK_LINES.replace_all(&s, "\n\n");
    s.replace(
        [
            '\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}',
        ],
        "",
    )
    .trim()
    .to_string()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::default_notice;
    use serde_json::json;

    fn defaults() -> PromptDefaults {
        PromptDefaults::for_lang(Lang::En)
    }

    fn ids(r: &AnalysisResult) -> Vec<&str> {
        r.cards.iter().map(|c| c.id.as_str()).collect()
    }

    const FIXED: [&str; 5] = ["whatIs", "whatSays", "dates", "terms", "whatUsuallyHappens"];

    #[test]
    fn always_five_cards_in_fixed_order() {
        let inputs = [
            json!(null),
            json!("just a string"),
            json!({}),
            json!({"cards": "not a list"}),
            json!({"cards": [{"id": "terms", "text": "A term."}, {"id": "whatIs", "text": "A fine."}]}),
            json!({"cards": [{"id": "bogus", "text": "x"}, 42, null, {"text": "no id"}]}),
        ];
        for raw in inputs {
            let built = build_result(&raw, &defaults());
            assert_eq!(ids(&built.result), FIXED, "input: {raw}");
        }
    }

    #[test]
    fn found_cards_keep_text_missing_cards_fall_back() {
        let raw = json!({
            "confidence": 0.8,
            "cards": [{"id": "dates", "text": "Pay by 12 May."}],
            "notice": "Check the original."
        });
        let built = build_result(&raw, &defaults());
        let r = &built.result;
        assert_eq!(r.cards[2].text, "Pay by 12 May.");
        assert_eq!(r.cards[2].title, "Dates");
        assert_eq!(r.cards[0].text, CardId::WhatIs.fallback(Lang::En));
        assert_eq!(r.notice, "Check the original.");
        assert_eq!(r.confidence, 0.8);
        assert_eq!(built.stats, ResultStats::default());
    }

    #[test]
    fn malformed_card_text_falls_back() {
        let raw = json!({"cards": [{"id": "whatIs", "text": 7}, {"id": "terms", "text": "   "}]});
        let r = build_result(&raw, &defaults()).result;
        assert_eq!(r.cards[0].text, CardId::WhatIs.fallback(Lang::En));
        assert_eq!(r.cards[3].text, CardId::Terms.fallback(Lang::En));
    }

    #[test]
    fn confidence_is_clamped_and_defaults_to_zero() {
        for (input, expected) in [
            (json!(1.7), 1.0),
            (json!(-3), 0.0),
            (json!("0.9"), 0.0),
            (json!(null), 0.0),
            (json!(0.5), 0.5),
        ] {
            let r = build_result(&json!({ "confidence": input }), &defaults()).result;
            assert_eq!(r.confidence, expected, "input {input}");
            assert!((0.0..=1.0).contains(&r.confidence));
        }
    }

    #[test]
    fn penalty_applies_once_regardless_of_card_count() {
        let raw = json!({
            "confidence": 0.9,
            "cards": [
                {"id": "whatIs", "text": "You must pay."},
                {"id": "whatSays", "text": "You must sign."},
                {"id": "dates", "text": "You must reply immediately."}
            ],
            "notice": "Email help@agency.gov"
        });
        let built = build_result(&raw, &defaults());
        assert!((built.result.confidence - 0.8).abs() < 1e-9);
        assert!(built.stats.sanitized);
        assert!(!built.stats.confidence_low);
        assert!(built.result.notice.contains("[***]"));
    }

    #[test]
    fn low_confidence_prefixes_notice() {
        let raw = json!({"confidence": 0.5, "cards": [{"id": "whatIs", "text": "You must pay."}]});
        let built = build_result(&raw, &defaults());
        assert!((built.result.confidence - 0.4).abs() < 1e-9);
        assert!(built.stats.confidence_low);
        assert!(built.result.notice.starts_with(low_confidence_prefix(Lang::En)));
        assert!(built.result.notice.ends_with(default_notice(Lang::En)));
    }

    #[test]
    fn long_text_is_capped() {
        let long = "word ".repeat(400);
        let raw = json!({"confidence": 1, "cards": [{"id": "terms", "text": long}], "notice": long});
        let r = build_result(&raw, &defaults()).result;
        assert!(r.cards[3].text.chars().count() <= 500);
        assert!(r.notice.chars().count() <= 420);
    }

    #[test]
    fn extract_plain_object() {
        let v = extract_json_object(r#"{"confidence": 0.7}"#).unwrap();
        assert_eq!(v["confidence"], 0.7);
    }

    #[test]
    fn extract_fenced_and_wrapped_object() {
        let fenced = "```json\n{\"notice\": \"n\"}\n```";
        assert_eq!(extract_json_object(fenced).unwrap()["notice"], "n");
        let prose = "Here you go: {\"a\": {\"b\": 1}} hope it helps";
        assert_eq!(extract_json_object(prose).unwrap()["a"]["b"], 1);
    }

    #[test]
    fn extract_errors() {
        assert!(matches!(extract_json_object("no json"), Err(ModelError::NoJson)));
        assert!(matches!(extract_json_object("} {"), Err(ModelError::NoJson)));
        assert!(matches!(
            extract_json_object("{\"a\": }"),
            Err(ModelError::InvalidJson(_))
        ));
    }

    #[test]
    fn clean_text_hygiene() {
        let input = "line one  \r\n\r\n\r\n\r\nline\u{200B} two\u{FEFF}";
        assert_eq!(clean_text(input), "line one\n\nline two");
    }
}
