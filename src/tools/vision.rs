use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;

use super::scene;
use crate::{
    agent::planner::strip_code_fences,
    agent::provider::ChatApi,
    bridge::Bridge,
    errors::ToolError,
    types::Attachment,
};

const ANALYZE_PROMPT: &str = "\
Describe this reference image for a 3D artist: the main subject, its \
shape and proportions, colors and materials, and anything about the \
composition or lighting worth reproducing. Be concrete and brief.";

/// Describe the user's reference images. The description is advisory,
/// so a failing vision call degrades to a templated note instead of
/// failing the subtask.
pub async fn analyze_image(gateway: &impl ChatApi, attachments: &[Attachment]) -> Value {
    if attachments.is_empty() {
        return json!({ "analysis": "No images were attached.", "imageCount": 0 });
    }
    match gateway.vision(ANALYZE_PROMPT, attachments).await {
        Ok(analysis) => json!({ "analysis": analysis, "imageCount": attachments.len() }),
        Err(e) => {
            warn!(error = %e, "vision analysis failed; using templated description");
            json!({
                "analysis": format!(
                    "{} reference image(s) were provided. Detailed visual analysis was \
                     unavailable; treat them as general guidance for subject and composition.",
                    attachments.len()
                ),
                "imageCount": attachments.len(),
                "fallback": true,
            })
        }
    }
}

/// Verdict of the screenshot-versus-expectation check.
#[derive(Debug, Serialize, Deserialize)]
pub struct VisionVerdict {
    pub matches: bool,
    pub confidence: f64,
    pub quality_score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    pub pass: bool,
}

fn rubric(expected_outcome: &str) -> String {
    format!(
        "You are verifying a 3D scene against an expected outcome.\n\
         Expected outcome: {expected_outcome}\n\n\
         Look at the screenshot and answer with JSON ONLY, no prose, in exactly this shape:\n\
         {{\"matches\": bool, \"confidence\": 0.0-1.0, \"quality_score\": 0-10, \
         \"issues\": [string], \"suggestions\": [string], \"pass\": bool}}"
    )
}

/// Screenshot the viewport and have the vision model judge it against
/// the expected outcome. The model must answer in strict JSON.
pub async fn validate_with_vision(
    bridge: &Bridge,
    gateway: &impl ChatApi,
    expected_outcome: &str,
) -> Result<Value, ToolError> {
    let shot = scene::viewport_screenshot(bridge).await?;
    let reply = gateway
        .vision(&rubric(expected_outcome), std::slice::from_ref(&shot))
        .await
        .map_err(|e| ToolError::Llm(e.to_string()))?;
    let verdict = parse_verdict(&reply)?;
    Ok(json!({ "validation": verdict }))
}

pub(crate) fn parse_verdict(reply: &str) -> Result<VisionVerdict, ToolError> {
    let stripped = strip_code_fences(reply);
    serde_json::from_str(stripped.trim()).map_err(|e| ToolError::JsonParse(e.to_string()))
}
