//! Prompt templates and response parsing for feature interpretation
//!
//! Three templates:
//! - `Plain`: top examples only, free-text one-sentence answer
//! - `Contrastive`: top examples vs. examples where the feature is silent
//! - `Structured`: contrastive, answer as JSON `{label, reasoning, attributes}`
//!
//! Scoring prompts ask what percentage of a sample set matches a list of
//! attributes; the answer is parsed with [`parse_percent`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SaeError;
use crate::interpreter::InterpreterError;
use crate::registry::{ExampleActivation, FeatureEntry};

/// Template used to ask for an explanation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptType {
    Plain,
    Contrastive,
    #[default]
    Structured,
}

impl FromStr for PromptType {
    type Err = SaeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(Self::Plain),
            "contrastive" => Ok(Self::Contrastive),
            "structured" => Ok(Self::Structured),
            other => Err(SaeError::config(format!(
                "unknown prompt type '{other}' (expected plain, contrastive, structured)"
            ))),
        }
    }
}

impl fmt::Display for PromptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plain => "plain",
            Self::Contrastive => "contrastive",
            Self::Structured => "structured",
        })
    }
}

/// A chat prompt: system instructions plus one user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Explanation extracted from an interpreter response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedExplanation {
    pub explanation: String,
    pub label: Option<String>,
    pub attributes: Vec<String>,
}

#[derive(Deserialize)]
struct StructuredResponse {
    #[serde(default)]
    label: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    attributes: Vec<String>,
}

#[derive(Deserialize)]
struct PercentResponse {
    percent: f64,
}

/// Builds interpretation and scoring prompts.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    system_prompt: String,
    /// Characters kept per example text
    max_content_length: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_content_length: 500,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_max_content_length(mut self, length: usize) -> Self {
        self.max_content_length = length;
        self
    }

    /// Interpretation prompt from the entry's first `k` top examples.
    pub fn build(&self, entry: &FeatureEntry, prompt_type: PromptType, k: usize) -> Prompt {
        let top: Vec<&ExampleActivation> = entry.top_examples.iter().take(k).collect();
        let mut user = format!(
            "Feature {} (max activation {:.4}, density {:.4}).\n\n\
             Texts where the feature activates most strongly:\n{}",
            entry.feature_id,
            entry.stats.max_activation,
            entry.stats.density,
            self.render(&top, true)
        );

        let contrast: Vec<&ExampleActivation> = entry.contrast_examples.iter().take(k).collect();
        if prompt_type != PromptType::Plain && !contrast.is_empty() {
            user.push_str("\nTexts where the feature does not activate:\n");
            user.push_str(&self.render(&contrast, false));
        }

        match prompt_type {
            PromptType::Plain => user.push_str(
                "\nIn one sentence, describe what these texts have in common.",
            ),
            PromptType::Contrastive => user.push_str(
                "\nIn one sentence, describe what distinguishes the activating texts \
                 from the non-activating ones.",
            ),
            PromptType::Structured => user.push_str(
                "\nIdentify what distinguishes the activating texts from the \
                 non-activating ones. Respond ONLY with a JSON object:\n\
                 {\"label\": \"short name\", \"reasoning\": \"one or two sentences\", \
                 \"attributes\": [\"attribute\", ...]}",
            ),
        }

        Prompt {
            system: self.system_prompt.clone(),
            user,
        }
    }

    /// Ask what percentage of `examples` show all of `attributes`.
    pub fn build_scoring(&self, attributes: &[String], examples: &[ExampleActivation]) -> Prompt {
        let refs: Vec<&ExampleActivation> = examples.iter().collect();
        let user = format!(
            "Attributes:\n{}\n\nTexts:\n{}\n\
             What percentage of the texts above exhibit these attributes? \
             Respond ONLY with a JSON object: {{\"percent\": 0-100}}",
            attributes
                .iter()
                .map(|a| format!("- {a}"))
                .collect::<Vec<_>>()
                .join("\n"),
            self.render(&refs, false)
        );
        Prompt {
            system: SCORING_SYSTEM_PROMPT.to_string(),
            user,
        }
    }

    fn render(&self, examples: &[&ExampleActivation], with_activation: bool) -> String {
        let mut out = String::new();
        for (i, example) in examples.iter().enumerate() {
            let text = match &example.text {
                Some(t) => truncate_chars(t, self.max_content_length),
                None => format!("example #{}", example.example_id),
            };
            if with_activation {
                out.push_str(&format!(
                    "{}. [{:.3}] \"{}\"\n",
                    i + 1,
                    example.activation,
                    text
                ));
            } else {
                out.push_str(&format!("{}. \"{}\"\n", i + 1, text));
            }
        }
        out
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = "You are an interpretability researcher. \
You are shown texts on which one latent feature of a sparse autoencoder fires, \
and optionally texts on which it stays silent. Describe the concept the feature \
detects as specifically as the evidence allows.";

const SCORING_SYSTEM_PROMPT: &str = "You grade how well a list of attributes \
describes a set of texts. Answer with a single percentage.";

/// Cut `text` to at most `max_chars` characters, marking the cut with `...`.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

/// Strip a surrounding markdown code fence, if any.
fn strip_code_fence(response: &str) -> &str {
    let trimmed = response.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the language tag line
    let body = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// First balanced `{...}` object in `text`.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse an interpretation response for `prompt_type`.
pub fn parse_explanation(
    response: &str,
    prompt_type: PromptType,
) -> Result<ParsedExplanation, InterpreterError> {
    let body = strip_code_fence(response);
    if body.is_empty() {
        return Err(InterpreterError::Malformed("empty response".into()));
    }

    if prompt_type != PromptType::Structured {
        return Ok(ParsedExplanation {
            explanation: body.to_string(),
            label: None,
            attributes: Vec::new(),
        });
    }

    let json = extract_json_object(body)
        .ok_or_else(|| InterpreterError::Malformed("no JSON object in response".into()))?;
    let parsed: StructuredResponse = serde_json::from_str(json)
        .map_err(|e| InterpreterError::Malformed(format!("invalid JSON: {e}")))?;

    let label = parsed.label.trim().to_string();
    let reasoning = parsed.reasoning.trim().to_string();
    let explanation = if reasoning.is_empty() {
        label.clone()
    } else {
        reasoning
    };
    if explanation.is_empty() {
        return Err(InterpreterError::Malformed(
            "response has neither label nor reasoning".into(),
        ));
    }
    Ok(ParsedExplanation {
        explanation,
        label: (!label.is_empty()).then_some(label),
        attributes: parsed
            .attributes
            .into_iter()
            .map(|a| a.trim().to_string())
            .filter(|a| !a.is_empty())
            .collect(),
    })
}

/// Parse a scoring response: `{"percent": N}` or a bare number, 0..=100.
pub fn parse_percent(response: &str) -> Result<f32, InterpreterError> {
    let body = strip_code_fence(response);
    let value = match extract_json_object(body) {
        Some(json) => serde_json::from_str::<PercentResponse>(json)
            .map_err(|e| InterpreterError::Malformed(format!("invalid JSON: {e}")))?
            .percent,
        None => body
            .trim_end_matches('%')
            .trim()
            .parse::<f64>()
            .map_err(|_| InterpreterError::Malformed(format!("not a percentage: '{body}'")))?,
    };
    if !(0.0..=100.0).contains(&value) {
        return Err(InterpreterError::Malformed(format!(
            "percentage out of range: {value}"
        )));
    }
    Ok(value as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FeatureStats;

    fn example(id: u64, activation: f32, text: Option<&str>) -> ExampleActivation {
        ExampleActivation {
            example_id: id,
            activation,
            text: text.map(String::from),
        }
    }

    fn entry() -> FeatureEntry {
        FeatureEntry {
            feature_id: 12,
            top_examples: vec![
                example(3, 2.5, Some("the river bank flooded")),
                example(8, 1.0, None),
                example(9, 0.5, Some("a canal lock")),
            ],
            stats: FeatureStats {
                max_activation: 2.5,
                mean_activation: 0.1,
                density: 0.05,
            },
            contrast_examples: vec![example(1, 0.0, Some("tax returns are due"))],
            interpretation: Default::default(),
        }
    }

    #[test]
    fn test_prompt_type_from_str() {
        assert_eq!("plain".parse::<PromptType>().unwrap(), PromptType::Plain);
        assert_eq!(
            "Structured".parse::<PromptType>().unwrap(),
            PromptType::Structured
        );
        assert!("fancy".parse::<PromptType>().is_err());
        assert_eq!(PromptType::Contrastive.to_string(), "contrastive");
    }

    #[test]
    fn test_build_respects_k_and_missing_text() {
        let prompt = PromptBuilder::new().build(&entry(), PromptType::Plain, 2);
        assert!(prompt.user.contains("the river bank flooded"));
        assert!(prompt.user.contains("example #8"));
        assert!(!prompt.user.contains("a canal lock"));
        // plain prompts carry no negative evidence
        assert!(!prompt.user.contains("tax returns"));
    }

    #[test]
    fn test_contrastive_includes_contrast_examples() {
        let prompt = PromptBuilder::new().build(&entry(), PromptType::Contrastive, 5);
        assert!(prompt.user.contains("does not activate"));
        assert!(prompt.user.contains("tax returns are due"));

        let structured = PromptBuilder::new().build(&entry(), PromptType::Structured, 5);
        assert!(structured.user.contains("\"attributes\""));
    }

    #[test]
    fn test_truncation_on_char_boundary() {
        assert_eq!(truncate_chars("héllo wörld", 7), "héllo w...");
        assert_eq!(truncate_chars("short", 10), "short");
        let prompt = PromptBuilder::new()
            .with_max_content_length(3)
            .build(&entry(), PromptType::Plain, 1);
        assert!(prompt.user.contains("\"the...\""));
    }

    #[test]
    fn test_parse_structured_with_fence() {
        let response = "```json\n{\"label\": \"water\", \"reasoning\": \"Bodies of water.\", \
                        \"attributes\": [\"rivers\", \" \", \"canals\"]}\n```";
        let parsed = parse_explanation(response, PromptType::Structured).unwrap();
        assert_eq!(parsed.explanation, "Bodies of water.");
        assert_eq!(parsed.label.as_deref(), Some("water"));
        assert_eq!(parsed.attributes, vec!["rivers", "canals"]);
    }

    #[test]
    fn test_parse_structured_embedded_object() {
        let response = "Sure! {\"label\": \"braces {}\", \"reasoning\": \"\"} hope that helps";
        let parsed = parse_explanation(response, PromptType::Structured).unwrap();
        assert_eq!(parsed.explanation, "braces {}");
    }

    #[test]
    fn test_parse_malformed() {
        assert!(matches!(
            parse_explanation("   ", PromptType::Plain),
            Err(InterpreterError::Malformed(_))
        ));
        assert!(matches!(
            parse_explanation("no json here", PromptType::Structured),
            Err(InterpreterError::Malformed(_))
        ));
        assert!(matches!(
            parse_explanation("{\"attributes\": []}", PromptType::Structured),
            Err(InterpreterError::Malformed(_))
        ));
    }

    #[test]
    fn test_parse_plain_trims() {
        let parsed = parse_explanation("  Mentions of rivers.\n", PromptType::Plain).unwrap();
        assert_eq!(parsed.explanation, "Mentions of rivers.");
        assert!(parsed.label.is_none());
    }

    #[test]
    fn test_parse_percent() {
        assert_eq!(parse_percent("{\"percent\": 80}").unwrap(), 80.0);
        assert_eq!(parse_percent("35%").unwrap(), 35.0);
        assert!(parse_percent("{\"percent\": 120}").is_err());
        assert!(parse_percent("most of them").is_err());
    }
}
