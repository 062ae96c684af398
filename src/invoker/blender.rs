//! Mesh stage through headless Blender.

use std::path::PathBuf;

use async_trait::async_trait;

use super::{BackendKind, InvokeError, Invoker, StageInput};
use crate::blender::{BlenderRunner, SceneScript};
use crate::config::BlenderConfig;
use crate::request::OutputKind;

/// Builds a displaced, textured primitive and exports it as GLB.
pub struct BlenderMeshInvoker {
    runner: BlenderRunner,
    config: BlenderConfig,
}

impl BlenderMeshInvoker {
    pub fn from_config(config: &BlenderConfig) -> Self {
        Self {
            runner: BlenderRunner::from_config(config),
            config: config.clone(),
        }
    }
}

#[async_trait]
impl Invoker for BlenderMeshInvoker {
    fn backend(&self) -> BackendKind {
        BackendKind::Blender
    }

    fn supports(&self, kind: OutputKind) -> bool {
        kind == OutputKind::Mesh
    }

    async fn invoke(&self, kind: OutputKind, input: &StageInput<'_>) -> Result<PathBuf, InvokeError> {
        if kind != OutputKind::Mesh {
            return Err(InvokeError::Unsupported {
                kind,
                backend: BackendKind::Blender,
            });
        }
        let texture = input.upstream(kind, OutputKind::Texture)?;
        let depth = input.upstream(kind, OutputKind::Depth)?;
        let output = input.output_path(kind, "glb");
        let script = input.work_dir.join("mesh_scene.py");

        SceneScript::from_config(&self.config)
            .texture(texture)
            .depth(depth)
            .export_glb(&output)
            .write(&script)?;
        self.runner.run_script(&script).await?;

        if !output.is_file() {
            return Err(InvokeError::NoOutputFile {
                program: self.runner.executable().display().to_string(),
                path: output,
            });
        }
        Ok(output)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::device::Device;
    use crate::request::GenerationRequest;

    /// Stand-in for Blender that writes whatever `filepath=` the script names.
    const FAKE_BLENDER: &str = r#"#!/bin/sh
out=$(sed -n 's/.*filepath="\([^"]*\)".*/\1/p' "$5" | head -n 1)
[ -n "$out" ] && printf 'glTF' > "$out"
"#;

    #[tokio::test]
    async fn test_mesh_stage_exports_glb() {
        let dir = tempfile::TempDir::new().unwrap();
        let fake = dir.path().join("blender");
        std::fs::write(&fake, FAKE_BLENDER).unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let texture = dir.path().join("texture.png");
        let depth = dir.path().join("depth.png");
        std::fs::write(&texture, b"png").unwrap();
        std::fs::write(&depth, b"png").unwrap();
        let upstream = BTreeMap::from([
            (OutputKind::Texture, texture),
            (OutputKind::Depth, depth),
        ]);

        let invoker = BlenderMeshInvoker::from_config(&BlenderConfig {
            executable: fake,
            ..Default::default()
        });
        let request = GenerationRequest::new("crate").with_kinds([OutputKind::Mesh]);
        let input = StageInput {
            request: &request,
            prompt: "crate",
            model: "blender",
            device: Device::Cpu,
            upstream: &upstream,
            work_dir: dir.path(),
        };

        let mesh = invoker.invoke(OutputKind::Mesh, &input).await.unwrap();
        assert_eq!(mesh, dir.path().join("mesh.glb"));
        assert_eq!(std::fs::read(&mesh).unwrap(), b"glTF");
        let script = std::fs::read_to_string(dir.path().join("mesh_scene.py")).unwrap();
        assert!(script.contains("type='DISPLACE'"));
    }

    #[tokio::test]
    async fn test_mesh_stage_needs_depth() {
        let dir = tempfile::TempDir::new().unwrap();
        let upstream = BTreeMap::from([(OutputKind::Texture, dir.path().join("t.png"))]);
        let invoker = BlenderMeshInvoker::from_config(&BlenderConfig::default());
        let request = GenerationRequest::new("crate");
        let input = StageInput {
            request: &request,
            prompt: "crate",
            model: "blender",
            device: Device::Cpu,
            upstream: &upstream,
            work_dir: dir.path(),
        };
        assert!(matches!(
            invoker.invoke(OutputKind::Mesh, &input).await,
            Err(InvokeError::MissingInput {
                needed: OutputKind::Depth,
                ..
            })
        ));
    }
}
