//! Prompts and localized fixed copy.
//!
//! Everything the model is told, and every piece of text the service shows
//! when the model output is missing or unusable, lives here. The five card
//! identities and their order are fixed: the UI renders them positionally and
//! the post-processor never lets model output change them.

use serde::{Deserialize, Serialize};

/// Languages the service can explain documents in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    /// Spanish (default).
    #[default]
    Es,
    /// English.
    En,
}

impl Lang {
    /// Parse a language tag such as `es`, `en-GB` or `ES`.
    pub fn parse(tag: &str) -> Option<Self> {
        let primary = tag.trim().split(['-', '_']).next()?.to_ascii_lowercase();
        match primary.as_str() {
            "es" => Some(Lang::Es),
            "en" => Some(Lang::En),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Lang::Es => "es",
            Lang::En => "en",
        }
    }
}

/// The five fixed card identities, in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CardId {
    WhatIs,
    WhatSays,
    Dates,
    Terms,
    WhatUsuallyHappens,
}

impl CardId {
    /// All identities in their fixed order.
    pub const ALL: [CardId; 5] = [
        CardId::WhatIs,
        CardId::WhatSays,
        CardId::Dates,
        CardId::Terms,
        CardId::WhatUsuallyHappens,
    ];

    /// Wire identifier used in model output and in events.
    pub fn as_str(self) -> &'static str {
        match self {
            CardId::WhatIs => "whatIs",
            CardId::WhatSays => "whatSays",
            CardId::Dates => "dates",
            CardId::Terms => "terms",
            CardId::WhatUsuallyHappens => "whatUsuallyHappens",
        }
    }

    /// Inverse of [`CardId::as_str`]. Matching is exact.
    pub fn parse(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == id)
    }

    pub fn title(self, lang: Lang) -> &'static str {
        match (lang, self) {
            (Lang::Es, CardId::WhatIs) => "Qué es",
            (Lang::Es, CardId::WhatSays) => "Qué dice",
            (Lang::Es, CardId::Dates) => "Fechas",
            (Lang::Es, CardId::Terms) => "Términos",
            (Lang::Es, CardId::WhatUsuallyHappens) => "Qué suele pasar",
            (Lang::En, CardId::WhatIs) => "What it is",
            (Lang::En, CardId::WhatSays) => "What it says",
            (Lang::En, CardId::Dates) => "Dates",
            (Lang::En, CardId::Terms) => "Terms",
            (Lang::En, CardId::WhatUsuallyHappens) => "What usually happens",
        }
    }

    /// Shown when the model gave nothing usable for this card.
    pub fn fallback(self, lang: Lang) -> &'static str {
        match (lang, self) {
            (Lang::Es, CardId::WhatIs) => {
                "No hemos podido identificar con claridad el tipo de documento."
            }
            (Lang::Es, CardId::WhatSays) => {
                "No hemos podido resumir el contenido. Revisa el documento original."
            }
            (Lang::Es, CardId::Dates) => "No hemos encontrado fechas claras en el documento.",
            (Lang::Es, CardId::Terms) => "No hay términos destacados que explicar.",
            (Lang::Es, CardId::WhatUsuallyHappens) => {
                "No podemos indicar qué suele ocurrir en este caso. Consulta con el organismo emisor."
            }
            (Lang::En, CardId::WhatIs) => "We could not clearly identify the type of document.",
            (Lang::En, CardId::WhatSays) => {
                "We could not summarise the content. Please check the original document."
            }
            (Lang::En, CardId::Dates) => "We did not find clear dates in the document.",
            (Lang::En, CardId::Terms) => "There are no notable terms to explain.",
            (Lang::En, CardId::WhatUsuallyHappens) => {
                "We cannot say what usually happens in this case. Ask the issuing office."
            }
        }
    }
}

/// Defaults the post-processor falls back on for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptDefaults {
    pub lang: Lang,
    pub notice: String,
}

impl PromptDefaults {
    pub fn for_lang(lang: Lang) -> Self {
        Self {
            lang,
            notice: default_notice(lang).to_string(),
        }
    }
}

/// Notice shown when the model gave none.
pub fn default_notice(lang: Lang) -> &'static str {
    match lang {
        Lang::Es => {
            "Esta explicación es orientativa y no sustituye el asesoramiento de un profesional. \
             Comprueba siempre los datos en el documento original."
        }
        Lang::En => {
            "This explanation is for guidance only and is not professional advice. \
             Always check the details against the original document."
        }
    }
}

/// Sentence prepended to the notice when confidence is low.
pub fn low_confidence_prefix(lang: Lang) -> &'static str {
    match lang {
        Lang::Es => "La lectura del documento no es fiable; revisa la foto o haz otra con más luz. ",
        Lang::En => "The document could not be read reliably; check the photo or take another in better light. ",
    }
}

/// System prompt for the analyze call. The model must answer with one JSON
/// object; cards are emitted in fixed order so they can be streamed.
pub fn analyze_prompt(lang: Lang) -> String {
    let language = match lang {
        Lang::Es => "Spanish",
        Lang::En => "English",
    };
    let ids = CardId::ALL
        .iter()
        .map(|c| format!("\"{}\"", c.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        r#"You help people understand official letters and forms. You receive a photo of a document.

Reply with ONE JSON object and nothing else, in this exact shape:
{{"confidence": <number 0-1: how legible and complete the document is>,
  "cards": [{{"id": <one of {ids}>, "text": <plain-language explanation>}}, ...],
  "notice": <one short caution sentence>}}

Rules:
1. Write in {language}, short sentences, no legal jargon. Explain jargon in "terms".
2. Emit the cards in the order listed above, one object per id.
3. Describe what the document says; never tell the reader what they must do.
4. Do not copy personal identifiers (ID numbers, account numbers, emails, phone numbers).
5. If a part is not legible, say so instead of guessing and lower the confidence."#
    )
}

/// System prompt for the OCR call.
pub const OCR_PROMPT: &str = r#"Transcribe all legible text in the document photo.
Preserve reading order and line breaks. Do not add commentary.
Reply with a JSON object {"text": <transcription>}."#;

/// System prompt for follow-up questions. `{context}` is the analysis or OCR
/// text the question refers to.
pub fn qa_prompt(lang: Lang, context: &str) -> String {
    let language = match lang {
        Lang::Es => "Spanish",
        Lang::En => "English",
    };
    format!(
        "You answer follow-up questions about a document the user photographed.\n\
         Answer in {language}, in at most 5 short sentences, using only the document context below.\n\
         If the context does not contain the answer, say so. Never give orders; describe what the document indicates.\n\n\
         Document context:\n\"\"\"{context}\"\"\""
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn card_ids_round_trip_in_fixed_order() {
        let ids: Vec<_> = CardId::ALL.iter().map(|c| c.as_str()).collect();
        assert_eq!(
            ids,
            ["whatIs", "whatSays", "dates", "terms", "whatUsuallyHappens"]
        );
        for c in CardId::ALL {
            assert_eq!(CardId::parse(c.as_str()), Some(c));
        }
        assert_eq!(CardId::parse("WhatIs"), None);
    }

    #[test]
    fn lang_parse_accepts_region_tags() {
        assert_eq!(Lang::parse("en-GB"), Some(Lang::En));
        assert_eq!(Lang::parse("ES"), Some(Lang::Es));
        assert_eq!(Lang::parse("fr"), None);
    }

    #[test]
    fn analyze_prompt_lists_every_card() {
        let p = analyze_prompt(Lang::En);
        for c in CardId::ALL {
            assert!(p.contains(c.as_str()), "missing {}", c.as_str());
        }
        assert!(p.contains("English"));
    }

    #[test]
    fn qa_prompt_embeds_context() {
        let p = qa_prompt(Lang::Es, "Multa de tráfico");
        assert!(p.contains("Multa de tráfico"));
        assert!(p.contains("Spanish"));
    }
}
