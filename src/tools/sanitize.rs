use std::sync::OnceLock;

use regex::Regex;

/// Clean model-written Python before it reaches the host interpreter.
/// The host runs a current Blender build, while models routinely emit
/// operators and keyword arguments from older API versions; each rule
/// below rewrites one known-bad pattern into a runnable equivalent.
///
/// The whole pipeline is idempotent: sanitizing already-sanitized code
/// is a no-op.
pub fn sanitize(code: &str) -> String {
    let code = strip_markdown_fences(code);
    let code = remove_deprecated_params(&code);
    let code = rewrite_delete_all(&code);
    let code = rewrite_loopcut_slide(&code);
    let code = drop_addon_enables(&code);
    let code = flatten_texture_node_paths(&code);
    let code = ensure_edit_mode(&code);
    ensure_bpy_import(&code)
}

fn strip_markdown_fences(code: &str) -> String {
    let mut lines: Vec<&str> = code
        .lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect();
    // A bare language token sometimes survives above the code.
    if lines.first().map(|l| l.trim() == "python").unwrap_or(false) {
        lines.remove(0);
    }
    lines.join("\n")
}

fn constraint_axis_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r",?\s*constraint_axis\s*=\s*\([^)]*\)").expect("sanitize regex"))
}

fn deprecated_kwarg_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r",?\s*(use_undo|use_global)\s*=\s*[A-Za-z_][\w.]*").expect("sanitize regex")
    })
}

fn dangling_comma_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(\s*,\s*").expect("sanitize regex"))
}

/// `use_undo`, `use_global` and `constraint_axis` no longer exist on the
/// operators models use them with.
fn remove_deprecated_params(code: &str) -> String {
    let code = constraint_axis_re().replace_all(code, "");
    let code = deprecated_kwarg_re().replace_all(&code, "");
    dangling_comma_re().replace_all(&code, "(").into_owned()
}

/// There is no `object.delete_all` operator; select-then-delete is the
/// supported spelling.
fn rewrite_delete_all(code: &str) -> String {
    code.replace(
        "bpy.ops.object.delete_all()",
        "bpy.ops.object.select_all(action='SELECT')\nbpy.ops.object.delete()",
    )
}

fn number_cuts_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"number_cuts\s*=\s*(\d+)").expect("sanitize regex"))
}

/// `loopcut_slide` needs interactive modal state the host cannot
/// provide; a plain loop cut with the same cut count is the headless
/// equivalent.
fn rewrite_loopcut_slide(code: &str) -> String {
    code.lines()
        .map(|line| {
            if !line.contains("bpy.ops.mesh.loopcut_slide") {
                return line.to_string();
            }
            let cuts = number_cuts_re()
                .captures(line)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str())
                .unwrap_or("1");
            let indent: String = line.chars().take_while(|c| c.is_whitespace()).collect();
            format!("{indent}bpy.ops.mesh.loopcut(number_cuts={cuts})")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn drop_addon_enables(code: &str) -> String {
    code.lines()
        .filter(|line| {
            !line.contains("bpy.ops.preferences.addon_enable") && !line.contains("addon_utils.enable")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Node types must be named by their flat string identifier, not the
/// `bpy.types` attribute path models sometimes write.
fn flatten_texture_node_paths(code: &str) -> String {
    code.replace("bpy.types.ShaderNodeTexNoise", "'ShaderNodeTexNoise'")
        .replace("bpy.types.ShaderNodeTexImage", "'ShaderNodeTexImage'")
}

/// Mesh-editing operators fail outside edit mode.
fn ensure_edit_mode(code: &str) -> String {
    let uses_mesh_api = code.contains("bpy.ops.mesh.") || code.contains("bmesh");
    let switches_mode = code.contains("mode_set(mode='EDIT'");
    if uses_mesh_api && !switches_mode {
        format!("bpy.ops.object.mode_set(mode='EDIT')\n{code}")
    } else {
        code.to_string()
    }
}

/// Exactly one `import bpy`, first line.
fn ensure_bpy_import(code: &str) -> String {
    let body: Vec<&str> = code.lines().filter(|line| line.trim() != "import bpy").collect();
    let mut out = String::from("import bpy\n");
    out.push_str(&body.join("\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_is_idempotent() {
        let samples = [
            "```python\nimport bpy\nbpy.ops.object.delete(use_global=False)\n```",
            "bpy.ops.mesh.loopcut_slide(MESH_OT_loopcut={\"number_cuts\":3})",
            "import bpy\nbpy.ops.transform.translate(value=(1,0,0), constraint_axis=(True, False, False))",
            "bmesh.new()",
            "print('hello')",
        ];
        for sample in samples {
            let once = sanitize(sample);
            assert_eq!(sanitize(&once), once, "not idempotent for {sample:?}");
        }
    }

    #[test]
    fn sanitized_code_always_starts_with_the_bpy_import() {
        for sample in ["print(1)", "import bpy\nprint(1)", "print(1)\nimport bpy"] {
            let out = sanitize(sample);
            assert!(out.starts_with("import bpy\n"), "missing import in {out:?}");
            assert_eq!(out.matches("import bpy").count(), 1);
        }
    }

    #[test]
    fn markdown_fences_and_language_tokens_are_stripped() {
        let out = sanitize("```python\nprint(1)\n```");
        assert!(!out.contains("```"));
        assert!(out.contains("print(1)"));

        let out = sanitize("python\nprint(2)");
        assert!(!out.contains("python\n"));
    }

    #[test]
    fn deprecated_keyword_arguments_are_removed() {
        let out = sanitize("bpy.ops.object.delete(use_global=False)");
        assert!(out.contains("bpy.ops.object.delete()"));

        let out = sanitize("bpy.ops.object.delete(use_global=False, confirm=True)");
        assert!(out.contains("bpy.ops.object.delete(confirm=True)"));

        let out =
            sanitize("bpy.ops.transform.translate(value=(1,0,0), constraint_axis=(True, False, False))");
        assert!(out.contains("bpy.ops.transform.translate(value=(1,0,0))"));
        assert!(!out.contains("constraint_axis"));
    }

    #[test]
    fn delete_all_becomes_select_then_delete() {
        let out = sanitize("bpy.ops.object.delete_all()");
        assert!(out.contains("bpy.ops.object.select_all(action='SELECT')"));
        assert!(out.contains("bpy.ops.object.delete()"));
        assert!(!out.contains("delete_all"));
    }

    #[test]
    fn loopcut_slide_keeps_the_cut_count() {
        let out = sanitize("    bpy.ops.mesh.loopcut_slide(MESH_OT_loopcut={\"number_cuts\":4})");
        assert!(out.contains("    bpy.ops.mesh.loopcut(number_cuts=4)"));
        assert!(!out.contains("loopcut_slide"));

        let out = sanitize("bpy.ops.mesh.loopcut_slide()");
        assert!(out.contains("bpy.ops.mesh.loopcut(number_cuts=1)"));
    }

    #[test]
    fn addon_enable_lines_are_dropped() {
        let out = sanitize("bpy.ops.preferences.addon_enable(module='node_wrangler')\nprint(1)");
        assert!(!out.contains("addon_enable"));
        assert!(out.contains("print(1)"));
    }

    #[test]
    fn texture_node_paths_are_flattened() {
        let out = sanitize("tree.nodes.new(bpy.types.ShaderNodeTexNoise)");
        assert!(out.contains("tree.nodes.new('ShaderNodeTexNoise')"));
    }

    #[test]
    fn mesh_api_without_edit_mode_gets_a_mode_switch() {
        let out = sanitize("bpy.ops.mesh.primitive_cube_add()");
        let import_pos = out.find("import bpy").unwrap();
        let mode_pos = out.find("mode_set(mode='EDIT')").unwrap();
        assert!(import_pos < mode_pos);

        // Already switching: no duplicate insert.
        let already = "bpy.ops.object.mode_set(mode='EDIT')\nbpy.ops.mesh.extrude_region()";
        let out = sanitize(already);
        assert_eq!(out.matches("mode_set(mode='EDIT')").count(), 1);
    }
}
