//! Subprocess backend: one configured argv template per stage.
//!
//! Placeholders are substituted inside every argument:
//! `{prompt} {negative_prompt} {output} {texture} {depth} {width} {height}
//! {seed} {steps} {guidance} {model} {device}`. A run succeeds when the
//! process exits with status 0 and `{output}` exists afterwards.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use super::{BackendKind, InvokeError, Invoker, StageInput};
use crate::config::CommandsConfig;
use crate::request::OutputKind;

/// Keep at most this many bytes of stderr in errors.
const STDERR_TAIL: usize = 2000;

pub struct CommandInvoker {
    config: CommandsConfig,
}

impl CommandInvoker {
    pub fn new(config: CommandsConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Invoker for CommandInvoker {
    fn backend(&self) -> BackendKind {
        BackendKind::Command
    }

    fn supports(&self, kind: OutputKind) -> bool {
        self.config.template(kind).is_some()
    }

    async fn invoke(&self, kind: OutputKind, input: &StageInput<'_>) -> Result<PathBuf, InvokeError> {
        let template = self.config.template(kind).ok_or(InvokeError::Unsupported {
            kind,
            backend: BackendKind::Command,
        })?;
        let output = input.output_path(kind, kind.default_extension());
        let argv = template
            .iter()
            .map(|arg| expand(arg, kind, input, &output))
            .collect::<Result<Vec<_>, _>>()?;
        let (program, args) = argv.split_first().ok_or(InvokeError::Unsupported {
            kind,
            backend: BackendKind::Command,
        })?;

        debug!(kind = %kind, program = %program, ?args, "Running stage command");
        run_argv(program, args, input.work_dir, self.config.timeout_secs, &output).await?;

        info!(kind = %kind, program = %program, "Stage command complete");
        Ok(output)
    }
}

/// Run `program` in `work_dir`. Succeeds when it exits with status 0 within
/// `secs` and `output` exists afterwards.
pub(crate) async fn run_argv(
    program: &str,
    args: &[String],
    work_dir: &Path,
    secs: u64,
    output: &Path,
) -> Result<(), InvokeError> {
    let child = Command::new(program)
        .args(args)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let result = tokio::time::timeout(Duration::from_secs(secs), child)
        .await
        .map_err(|_| InvokeError::Timeout {
            program: program.to_string(),
            secs,
        })?
        .map_err(|e| InvokeError::CommandFailed {
            program: program.to_string(),
            status: "spawn error".to_string(),
            stderr: e.to_string(),
        })?;

    if !result.status.success() {
        return Err(InvokeError::CommandFailed {
            program: program.to_string(),
            status: result.status.to_string(),
            stderr: stderr_tail(&result.stderr),
        });
    }
    if !output.is_file() {
        return Err(InvokeError::NoOutputFile {
            program: program.to_string(),
            path: output.to_path_buf(),
        });
    }
    Ok(())
}

/// Substitute placeholders in one argument. `{texture}` and `{depth}` fail
/// only when used and not produced.
fn expand(arg: &str, kind: OutputKind, input: &StageInput<'_>, output: &Path) -> Result<String, InvokeError> {
    let request = input.request;
    let path_str = |p: &Path| p.to_string_lossy().into_owned();

    substitute(arg, |name| {
        let value = match name {
            "prompt" => input.prompt.to_string(),
            "negative_prompt" => request.negative_prompt.clone().unwrap_or_default(),
            "output" => path_str(output),
            "width" => request.size.width.to_string(),
            "height" => request.size.height.to_string(),
            "seed" => input.seed().to_string(),
            "steps" => request.steps.to_string(),
            "guidance" => request.guidance_scale.to_string(),
            "model" => input.model.to_string(),
            "device" => input.device.to_string(),
            "texture" => path_str(input.upstream(kind, OutputKind::Texture)?),
            "depth" => path_str(input.upstream(kind, OutputKind::Depth)?),
            _ => return Ok(None),
        };
        Ok(Some(value))
    })
}

/// Replace each `{name}` in `template` with `lookup(name)`, left to right.
///
/// Substituted text is never scanned again. Names `lookup` does not know
/// (`Ok(None)`) are kept verbatim.
pub(crate) fn substitute<E>(
    template: &str,
    mut lookup: impl FnMut(&str) -> Result<Option<String>, E>,
) -> Result<String, E> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let token = after
            .find('}')
            .map(|close| &after[..close])
            .filter(|name| !name.is_empty() && name.bytes().all(|b| b.is_ascii_lowercase() || b == b'_'));
        match token {
            Some(name) => {
                match lookup(name)? {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[name.len() + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let start = text
        .char_indices()
        .map(|(i, _)| i)
        .find(|&i| text.len() - i <= STDERR_TAIL)
        .unwrap_or(text.len());
    text[start..].to_string()
}
