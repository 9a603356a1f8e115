//! photong CLI: text-to-music through spectrogram diffusion.
//!
//! Downloads the diffusion checkpoint from HuggingFace on first run unless the
//! config points at a local copy.
//!
//! With `--image` instead of `--prompt`, the image is captioned and the caption
//! turned into a music prompt by the remote collaborators first. Credentials
//! come from `AZ_CV_KEY`, `AZ_CV_ENDPOINT` and `HF_TOKEN`.
//!
//! # Output
//!
//! Writes the clip to --output (`.mp3` or `.wav`) and prints a one-line JSON
//! summary to stdout on success:
//!
//! ```json
//! {"path":"/tmp/folk.mp3","duration_s":5.11,"sample_rate":44100,"channels":1}
//! ```
//!
//! `--image` runs add `"caption"` and `"prompt"` fields.
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use clap::Parser;
use photong::{
    audio::{AudioFormat, write_audio},
    config::EngineConfig,
    engine::{AudioSynthesisEngine, GenerateRequest, InterpolateRequest},
    manager::preferred_device,
    orchestrator::{CollaboratorSettings, ImageCaptioner, PromptWriter},
    sampler::ConditioningState,
};

#[derive(Parser, Debug)]
#[command(
    name = "photong",
    about = "Generate a music clip from a text prompt or an image",
    long_about = "Generate a short music clip from a text prompt or an image.\n\
                  The prompt conditions a spectrogram diffusion model; the image is\n\
                  converted back to audio and written to --output."
)]
struct Args {
    /// Musical style prompt, e.g. "acoustic folk guitar".
    #[arg(long, short = 'p', required_unless_present = "image", conflicts_with = "image")]
    prompt: Option<String>,

    /// Caption this image and derive the prompt from it (needs AZ_CV_KEY,
    /// AZ_CV_ENDPOINT and HF_TOKEN).
    #[arg(long, short = 'i')]
    image: Option<PathBuf>,

    /// Random seed for the initial latent noise.
    #[arg(long, short = 's', default_value_t = 42)]
    seed: u64,

    /// Interpolation position. Only matters together with --end-prompt.
    #[arg(long, short = 'a')]
    alpha: Option<f64>,

    /// Interpolate toward this prompt instead of generating from --prompt alone.
    #[arg(long)]
    end_prompt: Option<String>,

    /// Seed of the end state (defaults to --seed).
    #[arg(long, requires = "end_prompt")]
    end_seed: Option<u64>,

    /// Seed image name (PNG stem in the seed image directory).
    #[arg(long)]
    seed_image: Option<String>,

    /// JSON engine config. Missing fields take their defaults.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Output file path. Format determined by extension (.mp3 or .wav).
    #[arg(long, short = 'o')]
    output: PathBuf,

    /// Also write the generated spectrogram as PNG.
    #[arg(long)]
    spectrogram: Option<PathBuf>,

    /// CUDA device ordinal. Overrides the config.
    #[arg(long)]
    device: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // Validate output path has a supported extension
    let ext = args
        .output
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("mp3");
    if AudioFormat::parse(ext).is_none() {
        anyhow::bail!("unsupported output format '{ext}'. Use .mp3 or .wav");
    }

    let mut config = match &args.config {
        Some(path) => EngineConfig::from_json_file(path)
            .map_err(|e| anyhow::anyhow!("failed to load config {}: {e}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(ordinal) = args.device {
        config.model.cuda_device = ordinal;
    }

    for path in std::iter::once(&args.output).chain(args.spectrogram.as_ref()) {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
    }

    let (prompt, described) = match (&args.prompt, &args.image) {
        (Some(prompt), _) => (prompt.clone(), None),
        (None, Some(path)) => {
            let (caption, prompt) = describe_image(path)?;
            (prompt.clone(), Some((caption, prompt)))
        }
        (None, None) => anyhow::bail!("either --prompt or --image is required"),
    };

    let device = preferred_device(config.model.cuda_device);
    tracing::info!("Using device: {:?}", device);
    tracing::info!("Loading {}...", config.model.checkpoint);

    let (denoising, guidance) = (config.denoising, config.guidance);
    let mut engine = AudioSynthesisEngine::load(config, &device)
        .map_err(|e| anyhow::anyhow!("failed to load model: {e}"))?;

    let clip = match &args.end_prompt {
        Some(end_prompt) => {
            let request = InterpolateRequest {
                start: ConditioningState::new(prompt.as_str(), args.seed, denoising, guidance),
                end: ConditioningState::new(
                    end_prompt.as_str(),
                    args.end_seed.unwrap_or(args.seed),
                    denoising,
                    guidance,
                ),
                alpha: args.alpha.unwrap_or(engine.config().alpha),
                step_count: None,
                seed_image_name: args.seed_image.clone(),
                deadline: None,
            };
            engine.interpolate(&request)
        }
        None => engine.generate(&GenerateRequest {
            prompt: prompt.clone(),
            seed: args.seed,
            alpha: args.alpha,
            seed_image_name: args.seed_image.clone(),
        }),
    }
    .map_err(|e| anyhow::anyhow!("generation failed: {e}"))?;

    write_audio(&args.output, &clip.segment)
        .map_err(|e| anyhow::anyhow!("failed to write audio: {e}"))?;
    if let Some(path) = &args.spectrogram {
        clip.spectrogram
            .save(path)
            .map_err(|e| anyhow::anyhow!("failed to write spectrogram: {e}"))?;
    }

    // Machine-readable summary for the caller
    let mut summary = serde_json::json!({
        "path": args.output,
        "duration_s": clip.duration_s,
        "sample_rate": clip.segment.sample_rate(),
        "channels": clip.segment.channels(),
    });
    if let Some((caption, prompt)) = described {
        summary["caption"] = caption.into();
        summary["prompt"] = prompt.into();
    }
    println!("{summary}");

    Ok(())
}

/// Caption the image and turn the caption into a music prompt.
fn describe_image(path: &std::path::Path) -> anyhow::Result<(String, String)> {
    let bytes = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("failed to read image {}: {e}", path.display()))?;
    let settings = CollaboratorSettings::from_env()?;
    let captioner = settings.captioner()?;
    let writer = settings.prompt_writer()?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let caption = captioner.caption(&bytes).await?;
        tracing::info!(%caption, "image captioned");
        let prompt = writer.prompt_for(&caption).await?;
        tracing::info!(%prompt, "music prompt written");
        Ok::<_, anyhow::Error>((caption, prompt))
    })
}
