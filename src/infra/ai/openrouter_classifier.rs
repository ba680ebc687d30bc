// Content classifier backed by an OpenRouter chat-completion model.

use crate::core::moderation::{
    parse_classification, ClassificationRequest, ClassifierError, ContentClassifier, Verdict,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::json;
use std::fmt::Write as _;

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

const SYSTEM_PROMPT: &str = r#"You are a moderation assistant for a Discord server.
Judge the message ONLY against the server rules you are given. Be lenient: banter,
jokes and ambiguous messages are not violations. Flag only clear, serious breaches.

Respond with a single JSON object and nothing else:
{
  "reasoning": "<short explanation referencing the rule>",
  "violation": true | false,
  "rule_violated": "<rule name, or \"None\">",
  "action": "IGNORE" | "WARN" | "DELETE" | "TIMEOUT_SHORT" | "TIMEOUT_MEDIUM" | "TIMEOUT_LONG" | "KICK" | "BAN" | "NOTIFY_MODS" | "SUICIDAL"
}

Use NOTIFY_MODS when a human should look at it without any punishment.
Use SUICIDAL only for clear, serious statements of intent to self-harm."#;

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Clone)]
pub struct ClassifierSettings {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            model: "google/gemini-2.5-flash".to_string(),
            temperature: 0.1,
            max_tokens: 500,
        }
    }
}

pub struct OpenRouterClassifier {
    client: Client,
    api_key: String,
    settings: ClassifierSettings,
}

impl OpenRouterClassifier {
    pub fn new(api_key: String, settings: ClassifierSettings) -> Self {
        Self {
            client: Client::new(),
            api_key,
            settings,
        }
    }
}

/// Render the user turn: rules first, then the message under review.
fn build_prompt(request: &ClassificationRequest) -> String {
    let mut prompt = String::from("Server rules:\n");
    if request.rules.is_empty() {
        prompt.push_str("- Be respectful. No harassment, hate speech, scams or spam.\n");
    }
    for rule in &request.rules {
        let _ = write!(prompt, "- {}", rule.label());
        if !rule.instructions.trim().is_empty() {
            let _ = write!(prompt, ": {}", rule.instructions.trim());
        }
        prompt.push('\n');
    }

    if let Some(channel_rules) = &request.channel_rules {
        let _ = writeln!(prompt, "\nExtra rules for this channel:\n{}", channel_rules);
    }
    if !request.matched_rules.is_empty() {
        let _ = writeln!(
            prompt,
            "\nKeyword filters matched: {}",
            request.matched_rules.join(", ")
        );
    }

    let _ = write!(
        prompt,
        "\nAuthor: {}\nMessage:\n\"\"\"\n{}\n\"\"\"",
        request.author_name, request.content
    );
    prompt
}

#[async_trait]
impl ContentClassifier for OpenRouterClassifier {
    async fn classify(&self, request: &ClassificationRequest) -> Result<Verdict, ClassifierError> {
        let messages = [
            ChatMessage {
                role: "system",
                content: SYSTEM_PROMPT.to_string(),
            },
            ChatMessage {
                role: "user",
                content: build_prompt(request),
            },
        ];

        let payload = json!({
            "model": self.settings.model,
            "messages": messages,
            "temperature": self.settings.temperature,
            "max_tokens": self.settings.max_tokens,
            "response_format": { "type": "json_object" },
        });

        let response = self
            .client
            .post(OPENROUTER_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| ClassifierError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("OpenRouter API error: {} - {}", status, text);
            return Err(match status {
                StatusCode::TOO_MANY_REQUESTS => ClassifierError::Unavailable(message),
                s if s.is_server_error() => ClassifierError::Unavailable(message),
                _ => ClassifierError::Transport(message),
            });
        }

        let response_json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ClassifierError::Malformed(e.to_string()))?;

        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ClassifierError::Malformed("missing message content".to_string()))?;

        parse_classification(content)
    }
}

/// Stand-in used when no API key is configured. Every message comes back
/// as unknown, which the pipeline treats as "no action".
pub struct UnconfiguredClassifier;

#[async_trait]
impl ContentClassifier for UnconfiguredClassifier {
    async fn classify(&self, _request: &ClassificationRequest) -> Result<Verdict, ClassifierError> {
        Err(ClassifierError::Unavailable(
            "no classifier API key configured".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::moderation::SuggestedAction;
    use crate::core::policy::KeywordRule;

    fn request() -> ClassificationRequest {
        ClassificationRequest {
            guild_id: 1,
            channel_id: 2,
            author_name: "someone".to_string(),
            content: "hello there".to_string(),
            rules: vec![KeywordRule {
                name: "No slurs".to_string(),
                keywords: Default::default(),
                regex_patterns: vec![],
                instructions: "Targeted hate speech only.".to_string(),
                action: SuggestedAction::Ban,
            }],
            matched_rules: vec!["No slurs".to_string()],
            channel_rules: Some("English only".to_string()),
        }
    }

    #[test]
    fn prompt_lists_rules_context_and_message() {
        let prompt = build_prompt(&request());
        assert!(prompt.contains("- No slurs: Targeted hate speech only."));
        assert!(prompt.contains("English only"));
        assert!(prompt.contains("Keyword filters matched: No slurs"));
        assert!(prompt.ends_with("hello there\n\"\"\""));
    }

    #[tokio::test]
    async fn unconfigured_classifier_is_unavailable() {
        let result = UnconfiguredClassifier.classify(&request()).await;
        assert!(matches!(result, Err(ClassifierError::Unavailable(_))));
    }
}
