use anyhow::{Result, bail};

use crate::agent::provider_glm::GlmProvider;
use crate::agent::provider_minimax::MiniMaxProvider;
use crate::types::Attachment;

// ── Conversation message types ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

// ── HTTP client ───────────────────────────────────────────────────────────────

pub fn build_http_client() -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();

    if let Ok(proxy_url) = std::env::var("HTTP_PROXY") {
        builder = builder.proxy(reqwest::Proxy::all(&proxy_url)?);
    }

    if let Ok(ms) = std::env::var("API_TIMEOUT_MS") {
        if let Ok(ms) = ms.parse::<u64>() {
            builder = builder
                .timeout(std::time::Duration::from_millis(ms))
                .connect_timeout(std::time::Duration::from_secs(10));
        }
    }

    builder.build().map_err(Into::into)
}

// ── Gateway contract ──────────────────────────────────────────────────────────

/// Stateless chat access for callers that need a model reply. Callers
/// that expect JSON strip fences and parse on their side.
pub trait ChatApi: Send + Sync + 'static {
    fn chat(&self, messages: &[Message]) -> impl Future<Output = Result<String>> + Send;
    fn vision(
        &self,
        prompt: &str,
        images: &[Attachment],
    ) -> impl Future<Output = Result<String>> + Send;
}

// ── Backend selector ──────────────────────────────────────────────────────────

/// 当前使用的 LLM 后端，内部持有已选定的模型名称。
/// 通过 `LLM_PROVIDER=minimax/glm` 显式指定，
/// 或自动检测：只有 MINIMAX_API_KEY 时选 MiniMax，否则默认 GLM。
#[derive(Clone)]
pub enum LlmBackend {
    Glm(String),
    MiniMax(String),
}

impl LlmBackend {
    pub fn from_env() -> Self {
        let is_minimax = match std::env::var("LLM_PROVIDER").as_deref() {
            Ok("minimax") => true,
            Ok("glm") => false,
            _ => {
                std::env::var("BIGMODEL_API_KEY").is_err()
                    && std::env::var("MINIMAX_API_KEY").is_ok()
            }
        };
        if is_minimax {
            let model =
                std::env::var("MINIMAX_MODEL").unwrap_or_else(|_| "MiniMax-M2.5".to_string());
            LlmBackend::MiniMax(model)
        } else {
            let model = std::env::var("BIGMODEL_MODEL").unwrap_or_else(|_| "glm-5".to_string());
            LlmBackend::Glm(model)
        }
    }

    fn vision_model(&self) -> String {
        if let Ok(model) = std::env::var("VISION_MODEL") {
            return model;
        }
        match self {
            Self::Glm(_) => "glm-4v-plus".to_string(),
            Self::MiniMax(_) => "MiniMax-VL-01".to_string(),
        }
    }

    fn required_key_name(&self) -> &'static str {
        match self {
            Self::Glm(_) => "BIGMODEL_API_KEY",
            Self::MiniMax(_) => "MINIMAX_API_KEY",
        }
    }
}

// ── Gateway ───────────────────────────────────────────────────────────────────

/// Uniform call surface over the chat providers. One instance per
/// process; every call is stateless and provider wire formats never
/// leak to callers.
#[derive(Clone)]
pub struct LlmGateway {
    client: reqwest::Client,
    backend: LlmBackend,
}

impl LlmGateway {
    pub fn from_env() -> Result<Self> {
        let backend = LlmBackend::from_env();
        let key = backend.required_key_name();
        if std::env::var(key).is_err() {
            bail!("{key} is not set; the planner and tools need a chat provider");
        }
        Ok(Self {
            client: build_http_client()?,
            backend,
        })
    }

    pub fn model_name(&self) -> &str {
        match &self.backend {
            LlmBackend::Glm(m) | LlmBackend::MiniMax(m) => m,
        }
    }

    pub async fn chat(&self, messages: &[Message]) -> Result<String> {
        match &self.backend {
            LlmBackend::Glm(model) => GlmProvider.chat(&self.client, messages, model).await,
            LlmBackend::MiniMax(model) => {
                MiniMaxProvider.chat(&self.client, messages, model).await
            }
        }
    }

    pub async fn vision(&self, prompt: &str, images: &[Attachment]) -> Result<String> {
        let model = self.backend.vision_model();
        match &self.backend {
            LlmBackend::Glm(_) => {
                GlmProvider.vision(&self.client, prompt, images, &model).await
            }
            LlmBackend::MiniMax(_) => {
                MiniMaxProvider.vision(&self.client, prompt, images, &model).await
            }
        }
    }
}

impl ChatApi for LlmGateway {
    async fn chat(&self, messages: &[Message]) -> Result<String> {
        LlmGateway::chat(self, messages).await
    }

    async fn vision(&self, prompt: &str, images: &[Attachment]) -> Result<String> {
        LlmGateway::vision(self, prompt, images).await
    }
}

/// Encode an attachment as the `data:` URL the vision endpoints accept.
pub(crate) fn image_data_url(attachment: &Attachment) -> String {
    use base64::Engine as _;
    let kind = match attachment.name.rsplit('.').next() {
        Some("jpg") | Some("jpeg") => "jpeg",
        Some("webp") => "webp",
        _ => "png",
    };
    let encoded = base64::engine::general_purpose::STANDARD.encode(&attachment.bytes);
    format!("data:image/{kind};base64,{encoded}")
}
