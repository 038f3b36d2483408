use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::agent::provider::{Message, Role, image_data_url};
use crate::types::Attachment;

#[derive(Clone, Copy)]
pub(crate) struct GlmProvider;

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

#[derive(Serialize)]
struct VisionRequest {
    model: String,
    messages: Vec<VisionMessage>,
}

#[derive(Serialize)]
struct VisionMessage {
    role: &'static str,
    content: Vec<ContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
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
}

// ── Implementation ────────────────────────────────────────────────────────────

impl GlmProvider {
    pub(crate) async fn chat(
        &self,
        client: &reqwest::Client,
        messages: &[Message],
        model: &str,
    ) -> Result<String> {
        let (base_url, api_key) = credentials()?;
        let body = ApiRequest {
            model: model.to_string(),
            messages: to_api_messages(messages),
            max_tokens: None,
            temperature: None,
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

    pub(crate) async fn vision(
        &self,
        client: &reqwest::Client,
        prompt: &str,
        images: &[Attachment],
        model: &str,
    ) -> Result<String> {
        let (base_url, api_key) = credentials()?;
        let mut content = vec![ContentPart::Text {
            text: prompt.to_string(),
        }];
        for image in images {
            content.push(ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: image_data_url(image),
                },
            });
        }
        let body = VisionRequest {
            model: model.to_string(),
            messages: vec![VisionMessage {
                role: "user",
                content,
            }],
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
}

fn credentials() -> Result<(String, String)> {
    const BASE_URL: &str = "https://open.bigmodel.cn/api/paas/v4";
    let base_url = std::env::var("BIGMODEL_BASE_URL").unwrap_or_else(|_| BASE_URL.to_string());
    let api_key = std::env::var("BIGMODEL_API_KEY").context("BIGMODEL_API_KEY env var not set")?;
    Ok((base_url, api_key))
}

fn to_api_messages(messages: &[Message]) -> Vec<ApiMessage> {
    messages
        .iter()
        .map(|m| ApiMessage {
            role: match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: m.content.clone(),
        })
        .collect()
}

async fn parse_response(resp: reqwest::Response) -> Result<String> {
    if !resp.status().is_success() {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        return Err(anyhow!("API error {status}: {text}"));
    }
    let parsed: ApiResponse = resp.json().await.context("failed to parse API response")?;
    let text = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();
    if text.is_empty() {
        return Err(anyhow!("API returned empty content"));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_parts_serialize_with_tagged_type() {
        let part = ContentPart::ImageUrl {
            image_url: ImageUrl { url: "data:image/png;base64,AA==".into() },
        };
        let json = serde_json::to_value(&part).unwrap();
        assert_eq!(json["type"], "image_url");
        assert_eq!(json["image_url"]["url"], "data:image/png;base64,AA==");
    }
}
