//! Answer synthesis over retrieved passages.
//!
//! [`AnswerGenerator`] is the seam the engine talks through;
//! [`OllamaGenerator`] implements it against `/api/generate`. Every failure
//! mode here, timeout included, is a [`SynthesisError`] the engine converts
//! into the retrieval-only fallback answer. A query never fails because the
//! generator did.
//!
//! The prompt numbers each passage so the model can cite `[n]`; the
//! fallback renderer reuses the same numbering, which keeps citations
//! stable between a synthesized answer and its fallback twin.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::SynthesisConfig;

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("generation request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("generation API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("malformed generation response: {0}")]
    Response(String),
}

/// One passage handed to the generator, already resolved to display form.
#[derive(Debug, Clone)]
pub struct ContextPassage {
    pub title: String,
    pub page_first: u32,
    pub page_last: u32,
    pub score: f32,
    pub text: String,
}

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    fn model(&self) -> &str;
    async fn generate(
        &self,
        question: &str,
        passages: &[ContextPassage],
    ) -> Result<String, SynthesisError>;
}

/// Generator backed by a local Ollama instance. The whole attempt runs
/// under one timeout; there is no retry, the fallback is the retry.
pub struct OllamaGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
    temperature: f32,
    timeout: Duration,
}

impl OllamaGenerator {
    pub fn new(config: &SynthesisConfig) -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: reqwest::Client::builder().build()?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    async fn send(&self, prompt: &str) -> Result<String, SynthesisError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
            "options": { "temperature": self.temperature },
        });
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SynthesisError::Api {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let json: serde_json::Value = response.json().await?;
        parse_generate_response(&json)
    }
}

#[async_trait]
impl AnswerGenerator for OllamaGenerator {
    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        question: &str,
        passages: &[ContextPassage],
    ) -> Result<String, SynthesisError> {
        let prompt = build_prompt(question, passages);
        match tokio::time::timeout(self.timeout, self.send(&prompt)).await {
            Ok(result) => result,
            Err(_) => Err(SynthesisError::Timeout(self.timeout)),
        }
    }
}

fn parse_generate_response(json: &serde_json::Value) -> Result<String, SynthesisError> {
    let answer = json
        .get("response")
        .and_then(|r| r.as_str())
        .ok_or_else(|| SynthesisError::Response("missing response field".to_string()))?
        .trim()
        .to_string();
    if answer.is_empty() {
        return Err(SynthesisError::Response("empty response".to_string()));
    }
    Ok(answer)
}

/// `true` when Ollama answers `/api/tags` within a couple of seconds.
pub async fn probe(base_url: &str) -> bool {
    let Ok(client) = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    else {
        return false;
    };
    let url = format!("{}/api/tags", base_url.trim_end_matches('/'));
    matches!(client.get(url).send().await, Ok(r) if r.status().is_success())
}

pub fn build_prompt(question: &str, passages: &[ContextPassage]) -> String {
    let mut prompt = String::from(
        "You are answering a question using only the document excerpts below.\n\nContext:\n",
    );
    for (i, passage) in passages.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] {}, {}:\n{}\n\n",
            i + 1,
            passage.title,
            page_range(passage.page_first, passage.page_last),
            passage.text.trim()
        ));
    }
    prompt.push_str(&format!(
        "Question: {}\n\nAnswer using only the context above and cite the passages you used by \
         their number, like [1]. If the context does not contain the answer, say that the \
         indexed documents do not cover it.",
        question.trim()
    ));
    prompt
}

/// Retrieval-only answer used whenever generation is skipped or fails.
pub fn fallback_answer(passages: &[ContextPassage]) -> String {
    let mut out = String::from(
        "No generated answer is available; these are the most relevant passages.\n",
    );
    for (i, passage) in passages.iter().enumerate() {
        out.push_str(&format!(
            "\n[{}] {}, {} (score {:.2}):\n{}\n",
            i + 1,
            passage.title,
            page_range(passage.page_first, passage.page_last),
            passage.score,
            passage.text.trim()
        ));
    }
    out
}

pub fn page_range(first: u32, last: u32) -> String {
    if first == last {
        format!("p.{}", first)
    } else {
        format!("p.{}-{}", first, last)
    }
}
