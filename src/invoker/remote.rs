//! Remote generation server backend.
//!
//! Each stage is one `POST {url}/api/generate`. Stages after texture send the
//! texture as `image` so the server derives the requested kind from it.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use super::{BackendKind, InvokeError, Invoker, StageInput};
use crate::device::Device;
use crate::protocol::{self, GenerateRequest, GenerateResponse};
use crate::request::OutputKind;

pub struct RemoteInvoker {
    client: reqwest::Client,
    base_url: String,
    device: Option<Device>,
}

impl RemoteInvoker {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, InvokeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|source| InvokeError::Http {
                url: base_url.to_string(),
                source,
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            device: None,
        })
    }

    /// Ask the server to run on `device` instead of its own default.
    pub fn with_device(mut self, device: Device) -> Self {
        self.device = Some(device);
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}/api/generate", self.base_url)
    }

    async fn body(&self, kind: OutputKind, input: &StageInput<'_>) -> Result<GenerateRequest, InvokeError> {
        let mut body = GenerateRequest::from_request(input.request, &[kind]);
        body.prompt = input.prompt.to_string();
        body.name = Some(input.model.to_string());
        body.device = self.device.map(|d| d.to_string());
        if kind != OutputKind::Texture {
            let texture = input.upstream(kind, OutputKind::Texture)?;
            let bytes = tokio::fs::read(texture).await?;
            body.image = Some(protocol::encode_data_url(
                protocol::mime_for_path(texture),
                &bytes,
            ));
        }
        Ok(body)
    }
}

#[async_trait]
impl Invoker for RemoteInvoker {
    fn backend(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn supports(&self, _kind: OutputKind) -> bool {
        true
    }

    async fn invoke(&self, kind: OutputKind, input: &StageInput<'_>) -> Result<PathBuf, InvokeError> {
        let url = self.endpoint();
        let body = self.body(kind, input).await?;
        debug!(url = %url, kind = %kind, model = %input.model, "Calling remote backend");

        let http_err = |source| InvokeError::Http {
            url: url.clone(),
            source,
        };
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(http_err)?;
        let status = response.status();
        let text = response.text().await.map_err(http_err)?;
        let reply: GenerateResponse = match serde_json::from_str(&text) {
            Ok(reply) => reply,
            Err(e) if status.is_success() => {
                return Err(InvokeError::Backend(format!("malformed reply from {url}: {e}")))
            }
            Err(_) => return Err(InvokeError::Backend(format!("{url} answered {status}"))),
        };

        if !status.is_success() || !reply.success {
            return Err(InvokeError::Backend(
                reply
                    .error
                    .unwrap_or_else(|| format!("{url} answered {status}")),
            ));
        }

        let payload = reply
            .payload_for(kind)
            .ok_or(InvokeError::MissingOutput(kind))?;
        let (mime, bytes) = protocol::decode_data_url(&payload.data)?;
        let path = input.output_path(kind, protocol::extension_for_mime(&mime, kind));
        tokio::fs::write(&path, &bytes).await?;

        info!(
            kind = %kind,
            bytes = bytes.len(),
            generation_time = reply.generation_time,
            "Remote stage complete"
        );
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_trims_slash() {
        let invoker = RemoteInvoker::new("http://gpu-box:7860/", 5).unwrap();
        assert_eq!(invoker.endpoint(), "http://gpu-box:7860/api/generate");
    }

    #[tokio::test]
    async fn test_body_inlines_upstream_texture() {
        use std::collections::BTreeMap;

        use crate::request::GenerationRequest;

        let dir = tempfile::TempDir::new().unwrap();
        let texture = dir.path().join("texture.png");
        std::fs::write(&texture, b"png-bytes").unwrap();

        let request = GenerationRequest::new("moss").with_seed(Some(4));
        let invoker = RemoteInvoker::new("http://gpu-box:7860", 5).unwrap().with_device(Device::Cuda);

        let none = BTreeMap::new();
        let input = StageInput {
            request: &request,
            prompt: "moss, detailed",
            model: "MiDaS_small",
            device: Device::Cpu,
            upstream: &none,
            work_dir: dir.path(),
        };
        assert!(matches!(
            invoker.body(OutputKind::Depth, &input).await,
            Err(InvokeError::MissingInput { needed: OutputKind::Texture, .. })
        ));

        let produced = BTreeMap::from([(OutputKind::Texture, texture)]);
        let input = StageInput {
            upstream: &produced,
            ..input
        };
        let body = invoker.body(OutputKind::Depth, &input).await.unwrap();
        assert_eq!(body.kinds, vec![OutputKind::Depth]);
        assert_eq!(body.prompt, "moss, detailed");
        assert_eq!(body.name.as_deref(), Some("MiDaS_small"));
        assert_eq!(body.device.as_deref(), Some("cuda"));
        let (mime, bytes) = protocol::decode_data_url(body.image.as_deref().unwrap()).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, b"png-bytes");

        let body = invoker.body(OutputKind::Texture, &input).await.unwrap();
        assert!(body.image.is_none());
    }
}
