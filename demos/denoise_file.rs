//! Example: Denoise a 48 kHz WAV file with DCUNet-20
//!
//! Usage: cargo run --release --example denoise_file -- input.wav output.wav [model_dir/]

use dcunet_rt::Denoiser;
use std::path::Path;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <input.wav> <output.wav> [model_dir]", args[0]);
        std::process::exit(1);
    }

    let input_path = Path::new(&args[1]);
    let output_path = Path::new(&args[2]);
    let model_dir = if args.len() > 3 {
        Path::new(&args[3]).to_path_buf()
    } else {
        // Default to models/dcunet20 relative to crate root
        Path::new(env!("CARGO_MANIFEST_DIR")).join("models/dcunet20")
    };

    println!("Loading model from {:?}...", model_dir);
    let denoiser = Denoiser::from_model_dir(&model_dir)?;
    let config = denoiser.config();
    println!(
        "Complexity {}, {:?} mask, {:.4}s frames",
        config.model_complexity,
        config.mask_arithmetic,
        denoiser.frame_seconds()
    );

    let start = std::time::Instant::now();
    let result = denoiser.denoise_file(input_path, output_path)?;
    let elapsed = start.elapsed();

    let audio_secs = result.samples.len() as f32 / denoiser.sample_rate() as f32;
    let rtf = elapsed.as_secs_f32() / audio_secs;
    println!(
        "Done in {:.2}s over {} frame(s) (RTF: {:.3}x realtime)",
        elapsed.as_secs_f32(),
        result.iterations,
        rtf
    );
    println!("Saved to {}", output_path.display());
    Ok(())
}
