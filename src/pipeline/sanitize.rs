//! Sanitisation of model-generated text before it reaches the user.
//!
//! Two passes run over every piece of text, in order:
//!
//! 1. **Redaction**: personal identifiers the model copied from the photo
//!    (tax IDs, payment references, emails, phone numbers) are replaced by
//!    [`REDACTION_MASK`]. The patterns target disjoint token shapes, so their
//!    relative order does not change the result; each runs over the whole
//!    string and replaces non-overlapping matches.
//! 2. **Softening**: directive phrasing ("you must …") is rewritten into
//!    descriptive phrasing ("the document indicates that …"). Readers are
//!    often anxious; the service describes documents, it does not give orders.
//!
//! Both passes are tables of [`Rule`]s, so rules can be added and tested one
//! at a time. Nothing here returns an error.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

/// Replaces every redacted identifier.
pub const REDACTION_MASK: &str = "[***]";

/// Appended to truncated text.
pub const ELLIPSIS: char = '…';

/// One `(pattern → replacement)` substitution.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: &'static str,
    pub pattern: Regex,
    pub replacement: &'static str,
}

impl Rule {
    /// Build a rule from a trusted, compile-time pattern.
    ///
    /// # Panics
    /// If `pattern` is not a valid regex.
    pub fn new(name: &'static str, pattern: &str, replacement: &'static str) -> Self {
        Self {
            name,
            pattern: Regex::new(pattern).unwrap(),
            replacement,
        }
    }

    /// Apply the rule, keeping a leading capital when the match had one.
    /// Returns `None` when nothing matched.
    pub fn apply(&self, text: &str) -> Option<String> {
        if !self.pattern.is_match(text) {
            return None;
        }
        let out = self.pattern.replace_all(text, |caps: &Captures<'_>| {
            let matched = &caps[0];
            if matched.chars().next().is_some_and(char::is_uppercase) {
                capitalise(self.replacement)
            } else {
                self.replacement.to_string()
            }
        });
        Some(out.into_owned())
    }
}

fn capitalise(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Result of [`Sanitizer::sanitize`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Sanitized {
    pub text: String,
    /// Any redaction or softening rule fired.
    pub was_modified: bool,
    pub redacted: bool,
    pub softened: bool,
}

/// Ordered redaction and softening tables.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    redactions: Vec<Rule>,
    softeners: Vec<Rule>,
}

static DEFAULT_SANITIZER: Lazy<Sanitizer> =
    Lazy::new(|| Sanitizer::new(default_redactions(), default_softeners()));

impl Default for Sanitizer {
    fn default() -> Self {
        DEFAULT_SANITIZER.clone()
    }
}

impl Sanitizer {
    pub fn new(redactions: Vec<Rule>, softeners: Vec<Rule>) -> Self {
        Self {
            redactions,
            softeners,
        }
    }

    /// The built-in rule tables, shared process-wide.
    pub fn shared() -> &'static Sanitizer {
        &DEFAULT_SANITIZER
    }

    pub fn redactions(&self) -> &[Rule] {
        &self.redactions
    }

    pub fn softeners(&self) -> &[Rule] {
        &self.softeners
    }

    /// Redact, then soften. Empty input yields empty output.
    pub fn sanitize(&self, text: &str) -> Sanitized {
        self.sanitize_fragment(text.trim())
    }

    /// Like [`Sanitizer::sanitize`] but keeps surrounding whitespace, for
    /// pieces of a longer text.
    pub fn sanitize_fragment(&self, text: &str) -> Sanitized {
        if text.is_empty() {
            return Sanitized::default();
        }
        let mut out = text.to_string();

        let mut redacted = false;
        for rule in &self.redactions {
            if let Some(next) = rule.apply(&out) {
                out = next;
                redacted = true;
            }
        }

        let mut softened = false;
        for rule in &self.softeners {
            if let Some(next) = rule.apply(&out) {
                out = next;
                softened = true;
            }
        }

        Sanitized {
            text: out,
            was_modified: redacted || softened,
            redacted,
            softened,
        }
    }

    /// [`Sanitizer::sanitize`] followed by [`truncate_text`].
    pub fn sanitize_capped(&self, text: &str, max_chars: usize) -> Sanitized {
        let mut s = self.sanitize(text);
        s.text = truncate_text(&s.text, max_chars);
        s
    }
}

/// Sanitizes streamed text one sentence at a time.
///
/// Deltas are buffered until a sentence boundary (`.`, `?` or `!` followed
/// by whitespace, or a newline) so an identifier split across deltas is
/// still seen whole by the redaction rules.
#[derive(Debug)]
pub struct StreamingSanitizer<'a> {
    sanitizer: &'a Sanitizer,
    pending: String,
    modified: bool,
}

impl<'a> StreamingSanitizer<'a> {
    pub fn new(sanitizer: &'a Sanitizer) -> Self {
        Self {
            sanitizer,
            pending: String::new(),
            modified: false,
        }
    }

    /// Buffer `delta`; return the sanitized text up to the last complete
    /// sentence, if any.
    pub fn push(&mut self, delta: &str) -> Option<String> {
        self.pending.push_str(delta);
        let cut = last_sentence_boundary(&self.pending)?;
        let ready: String = self.pending.drain(..cut).collect();
        self.emit(&ready)
    }

    /// Sanitize whatever is still buffered.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        self.emit(&rest)
    }

    /// Any rule fired on any emitted segment.
    pub fn was_modified(&self) -> bool {
        self.modified
    }

    fn emit(&mut self, text: &str) -> Option<String> {
        let s = self.sanitizer.sanitize_fragment(text);
        self.modified |= s.was_modified;
        Some(s.text).filter(|t| !t.is_empty())
    }
}

/// Byte offset just past the last sentence boundary.
fn last_sentence_boundary(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    (0..bytes.len())
        .rev()
        .find(|&i| {
            bytes[i] == b'\n'
                || (i > 0
                    && bytes[i].is_ascii_whitespace()
                    && matches!(bytes[i - 1], b'.' | b'?' | b'!'))
        })
        .map(|i| i + 1)
}

/// Sanitize with the built-in rules.
pub fn sanitize(text: &str) -> Sanitized {
    Sanitizer::shared().sanitize(text)
}

/// Cap `text` at `max_chars` characters including the trailing ellipsis.
///
/// Cuts at the last whitespace when that keeps at least 60% of the budget,
/// otherwise mid-word.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }
    let budget = max_chars - 1;
    let mut cut: String = text.chars().take(budget).collect();
    if let Some(idx) = cut.rfind(char::is_whitespace) {
        if cut[..idx].chars().count() * 10 >= budget * 6 {
            cut.truncate(idx);
        }
    }
    let mut out = cut.trim_end().to_string();
    out.push(ELLIPSIS);
    out
}

// ── Rule tables ──────────────────────────────────────────────────────────────

/// Tax IDs (DNI/NIF and NIE), payment references, emails, phone numbers.
pub fn default_redactions() -> Vec<Rule> {
    vec![
        Rule::new("tax_id_nif", r"\b\d{8}[\s-]?[A-Za-z]\b", REDACTION_MASK),
        Rule::new(
            "tax_id_nie",
            r"\b[XYZxyz][\s-]?\d{7}[\s-]?[A-Za-z]\b",
            REDACTION_MASK,
        ),
        Rule::new(
            "payment_reference",
            r"(?i)\b(?:IBAN|referencia(?:\s+de\s+pago)?|payment\s+reference|n[ºo°]\s*de\s+cuenta|account\s+(?:no|number))\b[\s:#.]*(?-i:[A-Z0-9]*\d[A-Z0-9 -]{4,}[A-Z0-9])",
            REDACTION_MASK,
        ),
        Rule::new(
            "iban",
            r"\b[A-Z]{2}\d{2}(?:[ ]?[A-Z0-9]{4}){4,7}(?:[ ]?[A-Z0-9]{1,3})?\b",
            REDACTION_MASK,
        ),
        Rule::new(
            "email",
            r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
            REDACTION_MASK,
        ),
        Rule::new(
            "phone",
            r"(?:\+\d{2}[\s.-]?|\b)[6789]\d{2}(?:[\s.-]?\d{3}[\s.-]?\d{3}|(?:[\s.-]?\d{2}){3})\b",
            REDACTION_MASK,
        ),
    ]
}

/// Directive → descriptive rewrites, applied in order.
pub fn default_softeners() -> Vec<Rule> {
    vec![
        Rule::new(
            "en_you_must",
            r"(?i)\byou\s+must\b",
            "the document indicates that you should",
        ),
        Rule::new(
            "en_you_have_to",
            r"(?i)\byou\s+(?:have|need)\s+to\b",
            "the document indicates that you may need to",
        ),
        Rule::new(
            "en_mandatory",
            r"(?i)\bit\s+is\s+mandatory\s+to\b",
            "the document says it is required to",
        ),
        Rule::new("en_immediately", r"(?i)\bimmediately\b", "within the stated deadline"),
        Rule::new(
            "es_usted_debe",
            r"(?i)\busted\s+debe\b",
            "el documento indica que hay que",
        ),
        Rule::new("es_debes", r"(?i)\bdebes\b", "el documento indica que hay que"),
        Rule::new(
            "es_tiene_que",
            r"(?i)\btienes?\s+que\b",
            "el documento indica que hay que",
        ),
        Rule::new(
            "es_obligatorio",
            r"(?i)\bes\s+obligatorio\b",
            "el documento indica que es necesario",
        ),
        Rule::new("es_inmediatamente", r"(?i)\binmediatamente\b", "en el plazo indicado"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_empty_output() {
        let s = sanitize("   ");
        assert_eq!(s.text, "");
        assert!(!s.was_modified);
    }

    #[test]
    fn every_redaction_rule_masks_its_sample() {
        let samples = [
            ("tax_id_nif", "DNI 12345678Z del titular", "12345678Z"),
            ("tax_id_nie", "NIE X1234567L del titular", "X1234567L"),
            (
                "payment_reference",
                "Referencia de pago: 0023 4455 6677 8899",
                "0023 4455 6677",
            ),
            ("iban", "cuenta ES91 2100 0418 4502 0005 1332", "2100 0418"),
            ("email", "escriba a maria.lopez@correo.es hoy", "maria.lopez@correo.es"),
            ("phone", "llame al 612 345 678", "612 345 678"),
            ("phone", "call +34612345678 now", "612345678"),
        ];
        for (name, input, secret) in samples {
            let out = sanitize(input);
            assert!(out.redacted, "[{name}] nothing redacted in {input:?}");
            assert!(!out.text.contains(secret), "[{name}] leaked: {}", out.text);
            assert!(out.text.contains(REDACTION_MASK), "[{name}] no mask: {}", out.text);
        }
    }

    #[test]
    fn rules_run_in_isolation() {
        let rule = default_redactions()
            .into_iter()
            .find(|r| r.name == "email")
            .unwrap();
        assert_eq!(rule.apply("no address here"), None);
        assert_eq!(
            rule.apply("a@b.co and c@d.org").as_deref(),
            Some("[***] and [***]")
        );
    }

    #[test]
    fn reference_label_without_digits_is_kept() {
        let input = "Referencia al expediente abierto";
        assert_eq!(sanitize(input).text, input);
    }

    #[test]
    fn prose_after_reference_label_is_kept() {
        let input = "Referencia 3 de marzo de 2025, sobre la multa.";
        assert_eq!(sanitize(input).text, input);
        let out = sanitize("Referencia 3 AB12 CD34 EF56");
        assert!(out.redacted);
        assert!(!out.text.contains("CD34"));
    }

    #[test]
    fn dates_and_amounts_survive() {
        let input = "Plazo hasta el 12/05/2025. Importe: 150,00 €. Expediente 2024/118.";
        let out = sanitize(input);
        assert_eq!(out.text, input);
        assert!(!out.was_modified);
    }

    #[test]
    fn softening_rewrites_directives_and_keeps_capitals() {
        let out = sanitize("You must pay the fine. Then you have to sign.");
        assert!(out.softened);
        assert!(!out.redacted);
        assert!(out.was_modified);
        assert!(out.text.starts_with("The document indicates that you should pay"));
        assert!(out.text.contains("the document indicates that you may need to sign"));
        assert!(!out.text.to_lowercase().contains("you must"));
    }

    #[test]
    fn spanish_softening() {
        let out = sanitize("Usted debe pagar inmediatamente.");
        assert_eq!(
            out.text,
            "El documento indica que hay que pagar en el plazo indicado."
        );
    }

    #[test]
    fn truncation_respects_word_boundaries() {
        let text = "uno dos tres cuatro cinco seis siete";
        let out = truncate_text(text, 16);
        assert!(out.chars().count() <= 16, "got {out:?}");
        assert!(out.ends_with(ELLIPSIS));
        assert_eq!(out, "uno dos tres…");
    }

    #[test]
    fn truncation_falls_back_to_mid_word() {
        let out = truncate_text("abcdefghijklmnopqrstuvwxyz", 10);
        assert_eq!(out, "abcdefghi…");
    }

    #[test]
    fn truncation_noop_when_short() {
        assert_eq!(truncate_text("corto", 10), "corto");
        assert_eq!(truncate_text("áéíóú", 5), "áéíóú");
    }

    #[test]
    fn fragments_keep_surrounding_whitespace() {
        let out = Sanitizer::shared().sanitize_fragment(" you must sign. ");
        assert_eq!(out.text, " the document indicates that you should sign. ");
        assert_eq!(Sanitizer::shared().sanitize_fragment("  ").text, "  ");
    }

    #[test]
    fn streaming_redacts_identifiers_split_across_deltas() {
        let sanitizer = Sanitizer::shared();
        let mut s = StreamingSanitizer::new(sanitizer);
        let mut out = String::new();
        for delta in ["Call 612 ", "345 678 for ", "help. Then ", "write to a@", "b.es"] {
            if let Some(seg) = s.push(delta) {
                out.push_str(&seg);
            }
        }
        out.extend(s.finish());
        assert_eq!(out, "Call [***] for help. Then write to [***]");
        assert!(s.was_modified());
    }

    #[test]
    fn streaming_emits_at_sentence_boundaries() {
        let mut s = StreamingSanitizer::new(Sanitizer::shared());
        assert_eq!(s.push("First part"), None);
        assert_eq!(s.push(" ends. Sec").as_deref(), Some("First part ends. "));
        assert_eq!(s.push("ond\nthird").as_deref(), Some("Second\n"));
        assert_eq!(s.finish().as_deref(), Some("third"));
        assert_eq!(s.finish(), None);
        assert!(!s.was_modified());
    }

    #[test]
    fn custom_tables_are_honoured() {
        let s = Sanitizer::new(
            vec![Rule::new("pin", r"\bPIN \d{4}\b", REDACTION_MASK)],
            vec![],
        );
        let out = s.sanitize("your PIN 1234 and you must");
        assert_eq!(out.text, "your [***] and you must");
        assert!(!out.softened);
    }
}
