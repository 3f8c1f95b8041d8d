//! Recognition of content-safety rejections and construction of the
//! rephrase request used by the one-shot retry.

use atelier_core::EngineError;

use crate::provider::GenerateTextOptions;

/// Message substrings that mark a provider error as a safety rejection.
const SAFETY_MARKERS: &[&str] = &["safety_violations", "safety", "content policy", "rejected"];

const CATEGORY_MARKER: &str = "safety_violations=[";

/// A provider error recognized as a content-safety rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyRejection {
    pub message: String,
    pub category: Option<String>,
}

impl SafetyRejection {
    pub fn into_error(self) -> EngineError {
        EngineError::SafetyViolation {
            message: self.message,
            category: self.category,
        }
    }
}

/// Classify a provider error by message shape. Only image-generation errors
/// go through this; non-safety errors return `None` and propagate as-is.
pub fn classify(err: &EngineError) -> Option<SafetyRejection> {
    match err {
        EngineError::SafetyViolation { message, category } => Some(SafetyRejection {
            message: message.clone(),
            category: category.clone(),
        }),
        EngineError::Provider(message) => {
            let lower = message.to_ascii_lowercase();
            if SAFETY_MARKERS.iter().any(|marker| lower.contains(marker)) {
                Some(SafetyRejection {
                    message: message.clone(),
                    category: parse_category(message),
                })
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Pull the violation category out of a `safety_violations=[<cat>]` marker,
/// if present.
fn parse_category(message: &str) -> Option<String> {
    let start = message.find(CATEGORY_MARKER)? + CATEGORY_MARKER.len();
    let rest = &message[start..];
    let end = rest.find(']')?;
    let category = rest[..end].trim();
    if category.is_empty() {
        None
    } else {
        Some(category.to_string())
    }
}

/// Build the rephrase request: ask the text provider for a safer prompt
/// that preserves the artistic intent of the rejected one.
pub(crate) fn rephrase_request(
    rejected_prompt: &str,
    category: Option<&str>,
) -> (String, GenerateTextOptions) {
    let mut message = String::from(
        "The following image prompt was rejected by a content-safety filter. \
         Rewrite it so it passes the filter while preserving the artistic \
         intent, subject, and style. Reply with the rewritten prompt only.\n\n",
    );
    if let Some(category) = category {
        message.push_str(&format!("Rejection category: {category}\n\n"));
    }
    message.push_str("Prompt:\n");
    message.push_str(rejected_prompt);

    let options = GenerateTextOptions {
        system_prompt: Some(
            "You rewrite image-generation prompts to comply with content-safety \
             policies without losing their creative intent."
                .to_string(),
        ),
        max_tokens: 500,
        temperature: 0.7,
    };

    (message, options)
}
