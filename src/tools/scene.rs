use base64::Engine as _;
use serde_json::{Value, json};

use crate::{bridge::Bridge, errors::ToolError, types::Attachment};

const SCREENSHOT_MAX_SIZE: u32 = 1024;

/// Snapshot of the scene graph as the host reports it.
pub async fn scene_info(bridge: &Bridge) -> Result<Value, ToolError> {
    let scene = bridge.send("get_scene_info", json!({})).await?;
    Ok(json!({ "sceneContext": scene }))
}

/// Grab the current viewport as an image attachment for the vision
/// model. The host returns the PNG bytes base64-encoded.
pub async fn viewport_screenshot(bridge: &Bridge) -> Result<Attachment, ToolError> {
    let shot = bridge
        .send("get_viewport_screenshot", json!({ "max_size": SCREENSHOT_MAX_SIZE }))
        .await?;
    let encoded = shot
        .get("image")
        .or_else(|| shot.get("data"))
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::ImportFailed("screenshot response had no image data".into()))?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| ToolError::ImportFailed(format!("screenshot was not valid base64: {e}")))?;
    Ok(Attachment {
        name: "viewport.png".to_string(),
        bytes,
    })
}

/// Human-readable one-liner about the scene, used for AI-visible run
/// notes and the templated final answer.
pub fn summarize_scene(scene_context: &Value) -> Option<String> {
    let scene = scene_context.get("sceneContext").unwrap_or(scene_context);
    let objects = scene.get("objects").and_then(Value::as_array);
    let count = scene
        .get("object_count")
        .and_then(Value::as_u64)
        .or_else(|| objects.map(|list| list.len() as u64))?;

    let names: Vec<&str> = objects
        .map(|list| {
            list.iter()
                .filter_map(|o| o.get("name").and_then(Value::as_str))
                .take(8)
                .collect()
        })
        .unwrap_or_default();

    if names.is_empty() {
        Some(format!("The scene contains {count} objects."))
    } else {
        Some(format!("The scene contains {count} objects: {}.", names.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_summary_uses_count_and_names() {
        let payload = json!({ "sceneContext": {
            "object_count": 3,
            "objects": [ { "name": "Cube" }, { "name": "Light" }, { "name": "Camera" } ]
        }});
        assert_eq!(
            summarize_scene(&payload).unwrap(),
            "The scene contains 3 objects: Cube, Light, Camera."
        );
    }

    #[test]
    fn scene_summary_falls_back_to_array_length() {
        let payload = json!({ "objects": [ { "name": "Cube" } ] });
        assert_eq!(summarize_scene(&payload).unwrap(), "The scene contains 1 objects: Cube.");
    }

    #[test]
    fn unknown_scene_shape_yields_no_summary() {
        assert_eq!(summarize_scene(&json!({ "foo": 1 })), None);
    }
}
