use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::config::LlmConfig;
use crate::models::Difficulty;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("request to LLM API failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("LLM API error ({status}): {body}")]
    Api { status: u16, body: String },
    #[error("LLM API returned no content")]
    EmptyResponse,
    #[error("could not parse LLM output: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GeneratedKnowledgePoint {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GeneratedFlashcard {
    pub front: String,
    pub back: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GeneratedExercise {
    pub question: String,
    #[serde(default)]
    pub options: Option<serde_json::Value>,
    #[serde(default)]
    pub correct_answer: Option<String>,
    #[serde(default)]
    pub explanation: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    content: Option<String>,
}

/// Client for an OpenAI-compatible chat completions endpoint.
#[derive(Clone)]
pub struct LlmClient {
    config: LlmConfig,
    client: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn chat(
        &self,
        system: &str,
        user: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, LlmError> {
        let body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "max_tokens": max_tokens,
            "temperature": temperature,
        });

        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            log::warn!("LLM API returned {}: {}", status, body);
            return Err(LlmError::Api { status, body });
        }

        let chat: ChatResponse = resp.json().await?;
        chat.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or(LlmError::EmptyResponse)
    }

    pub async fn summarize(&self, content: &str, max_length: usize) -> Result<String, LlmError> {
        self.chat(
            "You are a helpful assistant that creates concise summaries of educational content.",
            &format!(
                "Please create a concise summary of the following content in {} characters or less:\n\n{}",
                max_length, content
            ),
            (max_length / 4).max(16) as u32,
            0.3,
        )
        .await
    }

    pub async fn extract_knowledge_points(
        &self,
        content: &str,
    ) -> Result<Vec<GeneratedKnowledgePoint>, LlmError> {
        let answer = self
            .chat(
                "You are an educational assistant that extracts key knowledge points from learning materials. \
                 Return a JSON array of objects with 'title', 'description', and 'category' fields.",
                &format!("Extract the main knowledge points from this content:\n\n{}", content),
                1000,
                0.2,
            )
            .await?;
        parse_json_array(&answer)
    }

    pub async fn generate_flashcards(
        &self,
        topic: &str,
        count: u32,
    ) -> Result<Vec<GeneratedFlashcard>, LlmError> {
        let answer = self
            .chat(
                "You are an educational assistant that creates effective flashcards for learning. \
                 Return a JSON array of objects with 'front' (question) and 'back' (answer) fields.",
                &format!("Create {} flashcards to help learn about: {}", count, topic),
                800,
                0.4,
            )
            .await?;
        parse_json_array(&answer)
    }

    pub async fn generate_exercises(
        &self,
        topic: &str,
        difficulty: Difficulty,
        count: u32,
    ) -> Result<Vec<GeneratedExercise>, LlmError> {
        let answer = self
            .chat(
                &format!(
                    "You are an educational assistant creating {} level practice exercises. \
                     Return a JSON array of objects with 'question', 'options' (for multiple choice), \
                     'correct_answer', and 'explanation' fields.",
                    difficulty
                ),
                &format!("Create {} {} level exercises about: {}", count, difficulty, topic),
                1200,
                0.4,
            )
            .await?;
        parse_json_array(&answer)
    }
}

/// Parses a JSON array out of a model answer, tolerating a surrounding
/// markdown code fence.
pub fn parse_json_array<T: DeserializeOwned>(answer: &str) -> Result<Vec<T>, LlmError> {
    let mut body = answer.trim();
    if let Some(rest) = body.strip_prefix("```") {
        // Skip the language tag on the opening fence.
        body = rest.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        body = body.trim_end().strip_suffix("```").unwrap_or(body);
    }
    Ok(serde_json::from_str(body.trim())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_array() {
        let cards: Vec<GeneratedFlashcard> =
            parse_json_array(r#"[{"front": "2+2?", "back": "4"}]"#).unwrap();
        assert_eq!(
            cards,
            vec![GeneratedFlashcard {
                front: "2+2?".to_string(),
                back: "4".to_string()
            }]
        );
    }

    #[test]
    fn parses_fenced_array() {
        let answer = "```json\n[{\"title\": \"Mitosis\", \"category\": \"Biology\"}]\n```";
        let points: Vec<GeneratedKnowledgePoint> = parse_json_array(answer).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].title, "Mitosis");
        assert_eq!(points[0].description, None);
        assert_eq!(points[0].category.as_deref(), Some("Biology"));
    }

    #[test]
    fn prose_is_a_parse_error() {
        let result: Result<Vec<GeneratedExercise>, _> =
            parse_json_array("Sure! Here are some exercises:");
        assert!(matches!(result, Err(LlmError::Parse(_))));
    }

    #[test]
    fn exercises_tolerate_missing_fields() {
        let exercises: Vec<GeneratedExercise> =
            parse_json_array(r#"[{"question": "Define entropy."}]"#).unwrap();
        assert_eq!(exercises[0].correct_answer, None);
        assert_eq!(exercises[0].options, None);
    }
}
