//! Example: generate a short clip, then walk halfway toward a second prompt.
//!
//! Usage: cargo run --release --example generate [-- <seed> [output_format]]
//!
//! output_format: mp3 (default), wav

use photong::audio::{AudioFormat, write_audio};
use photong::config::EngineConfig;
use photong::engine::{AudioSynthesisEngine, GenerateRequest, InterpolateRequest};
use photong::manager::preferred_device;
use photong::sampler::ConditioningState;

fn main() -> photong::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let args: Vec<String> = std::env::args().collect();
    let seed: u64 = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(42);

    let format = args
        .get(2)
        .and_then(|s| AudioFormat::parse(s))
        .unwrap_or(AudioFormat::Mp3);

    let config = EngineConfig::default();
    let device = preferred_device(config.model.cuda_device);
    println!("Using device: {:?}", device);

    println!("Loading {}...", config.model.checkpoint);
    let mut engine = AudioSynthesisEngine::load(config, &device)?;

    let prompt = "acoustic folk country guitar";
    println!("Generating \"{prompt}\" (seed {seed})...");
    let clip = engine.generate(&GenerateRequest::new(prompt, seed))?;
    let output_path = format!("folk.{}", format.extension());
    write_audio(&output_path, &clip.segment)?;
    clip.spectrogram.save("folk.png")?;
    println!("Saved {:.2}s to {output_path} (spectrogram in folk.png)", clip.duration_s);

    let (denoising, guidance) = (engine.config().denoising, engine.config().guidance);
    let request = InterpolateRequest {
        start: ConditioningState::new(prompt, seed, denoising, guidance),
        end: ConditioningState::new("jazz music with trumpets", seed + 1, denoising, guidance),
        alpha: 0.5,
        step_count: Some(4),
        seed_image_name: None,
        deadline: None,
    };
    println!("Interpolating halfway toward \"jazz music with trumpets\"...");
    let blended = engine.interpolate(&request)?;
    let output_path = format!("folk_to_jazz.{}", format.extension());
    write_audio(&output_path, &blended.segment)?;
    println!("Saved {:.2}s to {output_path}", blended.duration_s);

    Ok(())
}
