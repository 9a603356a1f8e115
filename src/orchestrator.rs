//! Image → caption → music prompt → clip.
//!
//! Captioning and prompt writing are remote services behind the
//! [`ImageCaptioner`] and [`PromptWriter`] traits; [`clients`] holds the HTTP
//! implementations. Synthesis goes through a [`SynthesisManager`]. Errors from
//! any stage propagate unchanged.
//!
//! The `photong --image` CLI path drives the same collaborators from
//! [`CollaboratorSettings::from_env`].

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::Result;
use crate::engine::{GenerateRequest, SynthesizedClip};
use crate::manager::SynthesisManager;

pub mod clients;

pub use clients::{AzureCaptioner, CollaboratorSettings, HfPromptWriter};

/// Describes an image in natural language.
pub trait ImageCaptioner: Send + Sync {
    fn caption(&self, image: &[u8]) -> impl Future<Output = Result<String>> + Send;
}

/// Turns a scene description into a musical style prompt.
pub trait PromptWriter: Send + Sync {
    fn prompt_for(&self, caption: &str) -> impl Future<Output = Result<String>> + Send;
}

/// Result of the full image pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub caption: String,
    pub prompt: String,
    pub audio: String,
    pub duration: f64,
}

/// Result of synthesis from a caller-supplied prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferencePromptResponse {
    pub audio: String,
    pub duration: f64,
}

impl From<SynthesizedClip> for InferencePromptResponse {
    fn from(clip: SynthesizedClip) -> Self {
        Self {
            audio: clip.audio,
            duration: clip.duration_s,
        }
    }
}

pub struct Orchestrator<C, P> {
    captioner: C,
    writer: P,
    synthesis: SynthesisManager,
}

impl<C: ImageCaptioner, P: PromptWriter> Orchestrator<C, P> {
    pub fn new(captioner: C, writer: P, synthesis: SynthesisManager) -> Self {
        Self {
            captioner,
            writer,
            synthesis,
        }
    }

    pub fn synthesis(&self) -> &SynthesisManager {
        &self.synthesis
    }

    /// Caption the image, derive a music prompt from the caption, synthesize.
    pub async fn image_to_music(
        &self,
        image: &[u8],
        seed: u64,
        alpha: Option<f64>,
        seed_image: Option<String>,
    ) -> Result<InferenceResponse> {
        let caption = self.captioner.caption(image).await?;
        tracing::info!(%caption, "image captioned");
        let prompt = self.writer.prompt_for(&caption).await?;
        tracing::info!(%prompt, "music prompt written");

        let clip = self
            .synthesis
            .generate(GenerateRequest {
                prompt: prompt.clone(),
                seed,
                alpha,
                seed_image_name: seed_image,
            })
            .await?;
        Ok(InferenceResponse {
            caption,
            prompt,
            audio: clip.audio,
            duration: clip.duration_s,
        })
    }

    /// Synthesize directly from a prompt; the collaborators are not called.
    pub async fn prompt_to_music(
        &self,
        prompt: &str,
        seed: u64,
        alpha: Option<f64>,
        seed_image: Option<String>,
    ) -> Result<InferencePromptResponse> {
        let clip = self
            .synthesis
            .generate(GenerateRequest {
                prompt: prompt.to_string(),
                seed,
                alpha,
                seed_image_name: seed_image,
            })
            .await?;
        Ok(clip.into())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::Error;
    use crate::audio::MP3_DATA_URI_PREFIX;
    use crate::engine::AudioSynthesisEngine;
    use crate::testing::{FakeSampler, test_engine_config, test_params};

    struct FixedCaptioner(Option<String>);

    impl ImageCaptioner for FixedCaptioner {
        async fn caption(&self, image: &[u8]) -> Result<String> {
            assert!(!image.is_empty());
            self.0
                .clone()
                .ok_or_else(|| Error::Collaborator("captioning service returned 503".into()))
        }
    }

    #[derive(Default)]
    struct RecordingWriter {
        seen: Mutex<Vec<String>>,
    }

    impl PromptWriter for RecordingWriter {
        async fn prompt_for(&self, caption: &str) -> Result<String> {
            self.seen.lock().unwrap().push(caption.to_string());
            Ok("acoustic folk country guitar".to_string())
        }
    }

    fn orchestrator(
        dir: &std::path::Path,
        caption: Option<&str>,
    ) -> (Orchestrator<FixedCaptioner, RecordingWriter>, FakeSampler) {
        let sampler = FakeSampler::new(test_params(), 64);
        let engine = AudioSynthesisEngine::new(test_engine_config(dir), sampler.clone()).unwrap();
        let orchestrator = Orchestrator::new(
            FixedCaptioner(caption.map(String::from)),
            RecordingWriter::default(),
            SynthesisManager::with_engine(engine),
        );
        (orchestrator, sampler)
    }

    #[tokio::test]
    async fn test_image_to_music_chains_all_stages() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, sampler) = orchestrator(dir.path(), Some("a country house"));

        let response = orchestrator
            .image_to_music(b"\x89PNG", 42, None, None)
            .await
            .unwrap();
        assert_eq!(response.caption, "a country house");
        assert_eq!(response.prompt, "acoustic folk country guitar");
        assert!(response.audio.starts_with(MP3_DATA_URI_PREFIX));
        assert!(response.duration > 0.0);

        assert_eq!(
            orchestrator.writer.seen.lock().unwrap().as_slice(),
            ["a country house".to_string()]
        );
        let calls = sampler.calls.lock().unwrap().clone();
        assert_eq!(calls[0].blend.start.prompt(), "acoustic folk country guitar");
        assert_eq!(calls[0].blend.start.seed(), 42);
    }

    #[tokio::test]
    async fn test_captioner_failure_stops_pipeline() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, sampler) = orchestrator(dir.path(), None);
        let result = orchestrator.image_to_music(b"img", 1, None, None).await;
        assert!(matches!(result, Err(Error::Collaborator(_))));
        assert!(orchestrator.writer.seen.lock().unwrap().is_empty());
        assert_eq!(sampler.call_count(), 0);
    }

    #[tokio::test]
    async fn test_prompt_to_music_skips_collaborators() {
        let dir = tempfile::tempdir().unwrap();
        let (orchestrator, sampler) = orchestrator(dir.path(), None);
        let response = orchestrator
            .prompt_to_music("church organ", 7, Some(0.25), Some("missing".into()))
            .await
            .unwrap();
        assert!(response.audio.starts_with(MP3_DATA_URI_PREFIX));
        assert_eq!(sampler.call_count(), 1);

        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("audio").is_some());
        assert!(json.get("duration").is_some());
    }
}
