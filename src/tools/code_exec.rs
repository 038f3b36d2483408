use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::{debug, info};

use super::sanitize::sanitize;
use crate::{
    bridge::Bridge,
    errors::{BridgeError, ToolError},
};

const REPAIR_BACKOFF: Duration = Duration::from_millis(500);

const CONTEXT_GUARD: &str = "\
if bpy.context.view_layer.objects.active is None and bpy.context.scene.objects:
    bpy.context.view_layer.objects.active = bpy.context.scene.objects[0]";

const EDIT_MODE_GUARD: &str = "\
if bpy.context.object and bpy.context.object.mode != 'EDIT':
    bpy.ops.object.mode_set(mode='EDIT')";

const SELECTION_GUARD: &str = "bpy.ops.object.select_all(action='SELECT')";

/// Sanitize and run Python on the host. Failures whose error text maps
/// to a known cause get the matching guard snippet prepended before the
/// next attempt; unknown remote failures are retried as-is within the
/// attempt budget.
pub async fn execute(bridge: &Bridge, code: &str, max_attempts: u32) -> Result<Value, ToolError> {
    let mut code = sanitize(code);
    let max_attempts = max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        match bridge.send("execute_code", json!({ "code": code })).await {
            Ok(result) => return Ok(json!({ "result": result })),
            Err(BridgeError::Remote(message)) if attempt < max_attempts => {
                match repair_snippet(&message) {
                    Some(guard) => {
                        info!(attempt, error = %message, "auto-repair: prepending guard snippet");
                        code = format!("{guard}\n{code}");
                    }
                    None => {
                        debug!(attempt, error = %message, "no known repair; retrying unchanged")
                    }
                }
                sleep(REPAIR_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Map a remote error message to the guard that prevents it.
pub(crate) fn repair_snippet(error: &str) -> Option<&'static str> {
    let lowered = error.to_lowercase();
    if lowered.contains("'bpy' is not defined") || lowered.contains("name 'bpy'") {
        Some("import bpy")
    } else if lowered.contains("context is incorrect") || lowered.contains("poll() failed") {
        Some(CONTEXT_GUARD)
    } else if lowered.contains("edit mode") || lowered.contains("mode must be") {
        Some(EDIT_MODE_GUARD)
    } else if lowered.contains("no objects selected")
        || lowered.contains("nothing selected")
        || lowered.contains("no active object")
    {
        Some(SELECTION_GUARD)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::frame::FrameBuffer;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn error_messages_map_to_guards() {
        assert_eq!(repair_snippet("NameError: name 'bpy' is not defined"), Some("import bpy"));
        assert_eq!(
            repair_snippet("RuntimeError: Operator bpy.ops.mesh.extrude poll() failed"),
            Some(CONTEXT_GUARD)
        );
        assert_eq!(repair_snippet("mesh must be in edit mode"), Some(EDIT_MODE_GUARD));
        assert_eq!(repair_snippet("Error: No objects selected"), Some(SELECTION_GUARD));
        assert_eq!(repair_snippet("ZeroDivisionError: division by zero"), None);
    }

    #[tokio::test]
    async fn repair_prepends_the_matching_guard_before_the_second_attempt() {
        let (client, mut server) = tokio::io::duplex(8192);
        let bridge = Bridge::with_stream(client, 16);

        let host = tokio::spawn(async move {
            let mut frames = FrameBuffer::new();
            let mut chunk = [0u8; 2048];
            let mut seen: Vec<serde_json::Value> = Vec::new();

            // First attempt fails with a wrong-context error.
            while seen.is_empty() {
                let n = server.read(&mut chunk).await.unwrap();
                frames.extend(&chunk[..n]);
                while let Some(f) = frames.next_frame() {
                    seen.push(f);
                }
            }
            let reply = json!({ "status": "error", "message": "poll() failed" }).to_string();
            server.write_all(reply.as_bytes()).await.unwrap();

            // Second attempt succeeds.
            while seen.len() < 2 {
                let n = server.read(&mut chunk).await.unwrap();
                frames.extend(&chunk[..n]);
                while let Some(f) = frames.next_frame() {
                    seen.push(f);
                }
            }
            let reply = json!({ "status": "success", "result": "ok" }).to_string();
            server.write_all(reply.as_bytes()).await.unwrap();
            seen
        });

        let result = execute(&bridge, "print('hi')", 3).await.unwrap();
        assert_eq!(result["result"], "ok");

        let seen = host.await.unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0]["type"], "execute_code");
        let first_code = seen[0]["params"]["code"].as_str().unwrap();
        let second_code = seen[1]["params"]["code"].as_str().unwrap();
        assert!(!first_code.contains("objects.active"));
        assert!(second_code.starts_with(CONTEXT_GUARD));
    }
}
