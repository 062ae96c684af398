//! Blender bridge: scene scripts and headless execution.
//!
//! A [`SceneScript`] describes a single textured object with a sun light, a
//! camera and Cycles settings. The object is either a primitive (optionally
//! displaced by a depth map) or an imported GLB. The script can additionally
//! export the object as GLB and render a still.
//! [`BlenderRunner`] executes such a script with
//! `blender --background --python-exit-code 1 --python <script>`.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::BlenderConfig;

#[derive(Error, Debug)]
pub enum BlenderError {
    #[error("Blender executable not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Blender exited with {status}: {output}")]
    Failed { status: String, output: String },

    #[error("Blender timed out after {0}s")]
    Timeout(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Primitive the scene is built around.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    #[default]
    Cube,
    Sphere,
    Plane,
}

impl ObjectType {
    fn add_op(self) -> &'static str {
        match self {
            ObjectType::Cube => "bpy.ops.mesh.primitive_cube_add(size=2, location=(0, 0, 0))",
            ObjectType::Sphere => {
                "bpy.ops.mesh.primitive_uv_sphere_add(radius=1, location=(0, 0, 0))"
            }
            ObjectType::Plane => "bpy.ops.mesh.primitive_plane_add(size=2, location=(0, 0, 0))",
        }
    }
}

/// Builder for a Blender Python scene script.
#[derive(Debug, Clone)]
pub struct SceneScript {
    object: ObjectType,
    import_glb: Option<PathBuf>,
    texture: Option<PathBuf>,
    depth: Option<PathBuf>,
    subdivision_levels: u32,
    displacement_strength: f32,
    resolution: u32,
    samples: u32,
    export_glb: Option<PathBuf>,
    render_to: Option<PathBuf>,
}

impl SceneScript {
    pub fn new(object: ObjectType) -> Self {
        Self::from_config(&BlenderConfig {
            object,
            ..Default::default()
        })
    }

    pub fn from_config(config: &BlenderConfig) -> Self {
        Self {
            object: config.object,
            import_glb: None,
            texture: None,
            depth: None,
            subdivision_levels: config.subdivision_levels,
            displacement_strength: config.displacement_strength,
            resolution: config.resolution,
            samples: config.samples,
            export_glb: None,
            render_to: None,
        }
    }

    /// Build the scene around this mesh instead of a primitive. An imported
    /// mesh already carries its relief, so depth displacement is skipped.
    pub fn import_glb(mut self, path: impl Into<PathBuf>) -> Self {
        self.import_glb = Some(path.into());
        self
    }

    pub fn texture(mut self, path: impl Into<PathBuf>) -> Self {
        self.texture = Some(path.into());
        self
    }

    /// Displace the object by this depth map.
    pub fn depth(mut self, path: impl Into<PathBuf>) -> Self {
        self.depth = Some(path.into());
        self
    }

    /// Export the object as binary glTF at the end of the script.
    pub fn export_glb(mut self, path: impl Into<PathBuf>) -> Self {
        self.export_glb = Some(path.into());
        self
    }

    /// Render a PNG still at the end of the script.
    pub fn render_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.render_to = Some(path.into());
        self
    }

    /// Python source of the script.
    pub fn to_python(&self) -> String {
        let mut py = String::new();
        // Writing into a String cannot fail.
        let _ = self.write_python(&mut py);
        py
    }

    fn write_python(&self, py: &mut String) -> std::fmt::Result {
        writeln!(py, "import bpy")?;
        writeln!(py)?;
        writeln!(py, "bpy.ops.object.select_all(action='SELECT')")?;
        writeln!(py, "bpy.ops.object.delete(use_global=False)")?;
        writeln!(py)?;
        match &self.import_glb {
            Some(glb) => {
                writeln!(py, "bpy.ops.import_scene.gltf(filepath={})", py_str(glb))?;
                writeln!(
                    py,
                    "obj = next(o for o in bpy.context.selected_objects if o.type == 'MESH')"
                )?;
                writeln!(py, "bpy.context.view_layer.objects.active = obj")?;
            }
            None => {
                writeln!(py, "{}", self.object.add_op())?;
                writeln!(py, "obj = bpy.context.active_object")?;
            }
        }
        writeln!(py, "obj.name = \"promptforge_object\"")?;
        writeln!(py)?;
        writeln!(py, "mat = bpy.data.materials.new(name=\"promptforge_material\")")?;
        writeln!(py, "mat.use_nodes = True")?;
        writeln!(py, "nodes = mat.node_tree.nodes")?;
        writeln!(py, "links = mat.node_tree.links")?;
        writeln!(py, "bsdf = nodes[\"Principled BSDF\"]")?;

        if let Some(texture) = &self.texture {
            writeln!(py)?;
            writeln!(py, "tex = nodes.new('ShaderNodeTexImage')")?;
            writeln!(py, "tex.image = bpy.data.images.load({})", py_str(texture))?;
            writeln!(py, "links.new(tex.outputs['Color'], bsdf.inputs['Base Color'])")?;
        }

        if let (Some(depth), None) = (&self.depth, &self.import_glb) {
            writeln!(py)?;
            writeln!(py, "depth_img = bpy.data.images.load({})", py_str(depth))?;
            writeln!(py, "depth_img.colorspace_settings.name = 'Non-Color'")?;
            writeln!(py, "disp_tex = nodes.new('ShaderNodeTexImage')")?;
            writeln!(py, "disp_tex.image = depth_img")?;
            writeln!(py, "disp = nodes.new('ShaderNodeDisplacement')")?;
            writeln!(py, "links.new(disp_tex.outputs['Color'], disp.inputs['Height'])")?;
            writeln!(
                py,
                "links.new(disp.outputs['Displacement'], nodes['Material Output'].inputs['Displacement'])"
            )?;
            writeln!(py, "subsurf = obj.modifiers.new(name=\"Subdivision\", type='SUBSURF')")?;
            writeln!(py, "subsurf.levels = {}", self.subdivision_levels)?;
            writeln!(py, "subsurf.render_levels = {}", self.subdivision_levels)?;
            writeln!(py, "height = bpy.data.textures.new(\"promptforge_depth\", type='IMAGE')")?;
            writeln!(py, "height.image = depth_img")?;
            writeln!(py, "displace = obj.modifiers.new(name=\"Displace\", type='DISPLACE')")?;
            writeln!(py, "displace.texture = height")?;
            writeln!(py, "displace.texture_coords = 'UV'")?;
            writeln!(py, "displace.strength = {:.3}", self.displacement_strength)?;
        }

        writeln!(py)?;
        writeln!(py, "obj.data.materials.clear()")?;
        writeln!(py, "obj.data.materials.append(mat)")?;
        writeln!(py)?;
        writeln!(py, "bpy.ops.object.light_add(type='SUN', location=(5, 5, 10))")?;
        writeln!(py, "bpy.context.active_object.data.energy = 3")?;
        writeln!(py, "bpy.ops.object.camera_add(location=(7, -7, 5), rotation=(1.1, 0, 0.785))")?;
        writeln!(py, "scene = bpy.context.scene")?;
        writeln!(py, "scene.camera = bpy.context.active_object")?;
        writeln!(py, "scene.render.engine = 'CYCLES'")?;
        writeln!(py, "scene.render.resolution_x = {}", self.resolution)?;
        writeln!(py, "scene.render.resolution_y = {}", self.resolution)?;
        writeln!(py, "scene.cycles.samples = {}", self.samples)?;

        if let Some(glb) = &self.export_glb {
            writeln!(py)?;
            writeln!(py, "bpy.ops.object.select_all(action='DESELECT')")?;
            writeln!(py, "obj.select_set(True)")?;
            writeln!(py, "bpy.context.view_layer.objects.active = obj")?;
            writeln!(
                py,
                "bpy.ops.export_scene.gltf(filepath={}, export_format='GLB', use_selection=True, export_apply=True)",
                py_str(glb)
            )?;
        }

        if let Some(render) = &self.render_to {
            writeln!(py)?;
            writeln!(py, "scene.render.image_settings.file_format = 'PNG'")?;
            writeln!(py, "scene.render.filepath = {}", py_str(render))?;
            writeln!(py, "bpy.ops.render.render(write_still=True)")?;
        }
        Ok(())
    }

    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_python())
    }
}

/// Double-quoted Python string literal for a path.
fn py_str(path: &Path) -> String {
    let raw = path.to_string_lossy();
    let mut out = String::with_capacity(raw.len() + 2);
    out.push('"');
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Runs scripts in a headless Blender.
#[derive(Debug, Clone)]
pub struct BlenderRunner {
    executable: PathBuf,
    timeout: Duration,
}

impl BlenderRunner {
    pub fn new(executable: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            executable: executable.into(),
            timeout,
        }
    }

    pub fn from_config(config: &BlenderConfig) -> Self {
        Self::new(
            config.executable.clone(),
            Duration::from_secs(config.timeout_secs),
        )
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Whether the executable can be found.
    pub fn is_available(&self) -> bool {
        crate::device::which(&self.executable.to_string_lossy()).is_some()
    }

    /// Execute `script`; returns Blender's stdout.
    pub async fn run_script(&self, script: &Path) -> Result<String, BlenderError> {
        debug!(blender = %self.executable.display(), script = %script.display(), "Running Blender");
        let child = Command::new(&self.executable)
            .arg("--background")
            .arg("--python-exit-code")
            .arg("1")
            .arg("--python")
            .arg(script)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| BlenderError::Timeout(self.timeout.as_secs()))?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BlenderError::NotFound(self.executable.clone()),
                _ => BlenderError::Io(e),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let text = if stderr.trim().is_empty() { stdout.as_str() } else { &*stderr };
            return Err(BlenderError::Failed {
                status: output.status.to_string(),
                output: last_lines(text, 20),
            });
        }
        info!(script = %script.display(), "Blender script finished");
        Ok(stdout)
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_without_depth_has_no_displacement() {
        let py = SceneScript::new(ObjectType::Sphere)
            .texture("/tmp/tex.png")
            .to_python();
        assert!(py.contains("primitive_uv_sphere_add"));
        assert!(py.contains("bpy.data.images.load(\"/tmp/tex.png\")"));
        assert!(!py.contains("DISPLACE"));
        assert!(!py.contains("export_scene"));
        assert!(py.contains("scene.cycles.samples = 128"));
    }

    #[test]
    fn test_script_with_depth_export_and_render() {
        let py = SceneScript::new(ObjectType::Plane)
            .texture("t.png")
            .depth("d.png")
            .export_glb("out/mesh.glb")
            .render_to("out/render.png")
            .to_python();
        assert!(py.contains("'Non-Color'"));
        assert!(py.contains("subsurf.levels = 3"));
        assert!(py.contains("type='DISPLACE'"));
        assert!(py.contains("filepath=\"out/mesh.glb\", export_format='GLB'"));
        assert!(py.contains("bpy.ops.render.render(write_still=True)"));
        // Export happens before render.
        assert!(py.find("export_scene").unwrap() < py.find("render.render").unwrap());
    }

    #[test]
    fn test_imported_mesh_replaces_primitive() {
        let py = SceneScript::new(ObjectType::Cube)
            .import_glb("/out/3d/rock.glb")
            .texture("/out/images/rock.png")
            .depth("/staging/depth.png")
            .to_python();
        assert!(py.contains("bpy.ops.import_scene.gltf(filepath=\"/out/3d/rock.glb\")"));
        assert!(!py.contains("primitive_cube_add"));
        assert!(py.contains("bpy.data.images.load(\"/out/images/rock.png\")"));
        assert!(!py.contains("DISPLACE"));
        assert!(py.find("import_scene").unwrap() < py.find("materials.append").unwrap());
    }

    #[test]
    fn test_py_str_escapes() {
        assert_eq!(py_str(Path::new("a\"b\\c")), "\"a\\\"b\\\\c\"");
    }

    #[test]
    fn test_last_lines() {
        assert_eq!(last_lines("a\nb\nc\n", 2), "b\nc");
        assert_eq!(last_lines("a", 5), "a");
    }

    #[tokio::test]
    async fn test_missing_executable() {
        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("scene.py");
        SceneScript::new(ObjectType::Cube).write(&script).unwrap();
        let runner = BlenderRunner::new(dir.path().join("no-blender"), Duration::from_secs(5));
        assert!(!runner.is_available());
        assert!(matches!(
            runner.run_script(&script).await,
            Err(BlenderError::NotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_script_reports_output() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let fake = dir.path().join("blender");
        std::fs::write(&fake, "#!/bin/sh\necho 'Traceback: boom' >&2\nexit 1\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let script = dir.path().join("scene.py");
        SceneScript::new(ObjectType::Cube).write(&script).unwrap();
        let runner = BlenderRunner::new(&fake, Duration::from_secs(5));
        match runner.run_script(&script).await {
            Err(BlenderError::Failed { output, .. }) => assert_eq!(output, "Traceback: boom"),
            other => panic!("expected Failed, got {other:?}"),
        }
    }
}
