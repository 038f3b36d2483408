use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::agent::provider::{Message, Role, image_data_url};
use crate::types::Attachment;

#[derive(Clone, Copy)]
pub(crate) struct MiniMaxProvider;

// ── Wire types ────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ApiMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
}

#[derive(Deserialize)]
struct ApiChoice {
    message: ApiChoiceMessage,
}

#[derive(Deserialize)]
struct ApiChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    reasoning_details: Vec<ReasoningDetail>,
}

#[derive(Deserialize)]
struct ReasoningDetail {
    text: String,
}

// ── Implementation ────────────────────────────────────────────────────────────

impl MiniMaxProvider {
    pub(crate) async fn chat(
        &self,
        client: &reqwest::Client,
        messages: &[Message],
        model: &str,
    ) -> Result<String> {
        let (base_url, api_key) = credentials()?;
        let body = ApiRequest {
            model: model.to_string(),
            messages: messages
                .iter()
                .map(|m| ApiMessage {
                    role: match m.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    content: m.content.clone(),
                })
                .collect(),
            max_tokens: None,
            temperature: Some(1.0),
        };

        let resp = client
            .post(format!("{base_url}/chat/completions"))
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await
            .context("HTTP request failed")?;

        parse_response(resp).await
    }

    /// MiniMax 的视觉接口同样走 chat/completions，消息内容为
    /// text / image_url 分段数组。
    pub(crate) async fn vision(
        &self,
        client: &reqwest::Client,
        prompt: &str,
        images: &[Attachment],
        model: &str,
    ) -> Result<String> {
        let (base_url, api_key) = credentials()?;
        let mut content = vec![json!({ "type": "text", "text": prompt })];
        for image in images {
            content.push(json!({
                "type": "image_url",
                "image_url": { "url": image_data_url(image) }
            }));
        }
        let body: Value = json!({
            "model": model,
            "messages": [{ "role": "user", "content": content }],
        });

        let resp = client
            .post(format!("{base_url}/chat/completions"))
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&body)
            .send()
            .await
            .context("HTTP request failed")?;

        parse_response(resp).await
    }
}

fn credentials() -> Result<(String, String)> {
    const BASE_URL: &str = "https://api.minimaxi.com/v1";
    let base_url = std::env::var("MINIMAX_BASE_URL").unwrap_or_else(|_| BASE_URL.to_string());
    let api_key = std::env::var("MINIMAX_API_KEY").context("MINIMAX_API_KEY env var not set")?;
    Ok((base_url, api_key))
}

async fn parse_response(resp: reqwest::Response) -> Result<String> {
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("API error {status}: {text}"));
    }
    let parsed: ApiResponse = resp.json().await.context("failed to parse API response")?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("API returned no choices"))?;
    let text = choice
        .message
        .content
        .filter(|t| !t.is_empty())
        .or_else(|| {
            choice
                .message
                .reasoning_details
                .into_iter()
                .next()
                .map(|d| d.text)
        })
        .unwrap_or_default();
    if text.is_empty() {
        return Err(anyhow!("API returned empty content"));
    }
    Ok(text)
}
