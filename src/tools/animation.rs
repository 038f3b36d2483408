use serde_json::{Value, json};

use super::code_exec;
use crate::{bridge::Bridge, errors::ToolError};

const FRAMES_PER_SECOND: f64 = 24.0;
const DEFAULT_DURATION_SECS: f64 = 2.0;

/// The fixed animation vocabulary. Each variant expands to a
/// deterministic keyframe script; there is no model involvement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnimationType {
    Hop,
    Walk,
    Rotate,
    Bounce,
}

impl AnimationType {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "hop" => Some(Self::Hop),
            "walk" => Some(Self::Walk),
            "rotate" => Some(Self::Rotate),
            "bounce" => Some(Self::Bounce),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Hop => "hop",
            Self::Walk => "walk",
            Self::Rotate => "rotate",
            Self::Bounce => "bounce",
        }
    }
}

/// Build the keyframe script and run it through the code executor.
pub async fn create_animation(
    bridge: &Bridge,
    animation_type: &str,
    target_object: Option<&str>,
    duration_secs: Option<f64>,
    code_retries: u32,
) -> Result<Value, ToolError> {
    let kind = AnimationType::parse(animation_type).ok_or_else(|| {
        ToolError::Schema(format!(
            "animationType must be one of hop/walk/rotate/bounce, got `{animation_type}`"
        ))
    })?;
    let frames = ((duration_secs.unwrap_or(DEFAULT_DURATION_SECS)) * FRAMES_PER_SECOND)
        .round()
        .max(2.0) as u32;
    let script = keyframe_script(kind, target_object, frames);
    code_exec::execute(bridge, &script, code_retries).await?;
    Ok(json!({
        "animation": {
            "type": kind.label(),
            "frames": frames,
            "target": target_object.unwrap_or("active object"),
        }
    }))
}

/// Deterministic keyframe template. The target defaults to the active
/// object so the tool composes with a preceding import step.
pub(crate) fn keyframe_script(kind: AnimationType, target: Option<&str>, frames: u32) -> String {
    let mut script = String::from("import bpy\n");
    match target {
        Some(name) => {
            script.push_str(&format!("obj = bpy.data.objects.get({name:?})\n"));
            script.push_str("if obj is None:\n    obj = bpy.context.view_layer.objects.active\n");
        }
        None => script.push_str("obj = bpy.context.view_layer.objects.active\n"),
    }
    script.push_str("base = obj.location.copy()\n");
    script.push_str(&format!("end = {frames}\n"));

    match kind {
        AnimationType::Hop => script.push_str(
            "for i, frac in enumerate((0.0, 0.5, 1.0)):\n\
             \x20   frame = 1 + int(end * frac)\n\
             \x20   obj.location.z = base.z + (2.0 if frac == 0.5 else 0.0)\n\
             \x20   obj.keyframe_insert(data_path='location', frame=frame)\n",
        ),
        AnimationType::Walk => script.push_str(
            "steps = 4\n\
             for i in range(steps + 1):\n\
             \x20   frame = 1 + int(end * i / steps)\n\
             \x20   obj.location.x = base.x + i * 0.5\n\
             \x20   obj.location.z = base.z + (0.25 if i % 2 else 0.0)\n\
             \x20   obj.keyframe_insert(data_path='location', frame=frame)\n",
        ),
        AnimationType::Rotate => script.push_str(
            "import math\n\
             obj.rotation_euler.z = 0.0\n\
             obj.keyframe_insert(data_path='rotation_euler', frame=1)\n\
             obj.rotation_euler.z = math.tau\n\
             obj.keyframe_insert(data_path='rotation_euler', frame=1 + end)\n",
        ),
        AnimationType::Bounce => script.push_str(
            "for i, z in enumerate((0.0, 1.5, 0.0, 0.75, 0.0)):\n\
             \x20   frame = 1 + int(end * i / 4)\n\
             \x20   obj.location.z = base.z + z\n\
             \x20   obj.keyframe_insert(data_path='location', frame=frame)\n",
        ),
    }
    script.push_str("bpy.context.scene.frame_end = max(bpy.context.scene.frame_end, 1 + end)\n");
    script
}
