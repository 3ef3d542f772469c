use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn, Level};

use lyrgen::generator::{GenerationParams, ModelSlot};
use lyrgen::model::{load_generator, ModelSource, DEFAULT_MODEL, DEFAULT_ONNX_FILE, GPT2_CONTEXT};
use lyrgen::sampling::SamplingParams;
use lyrgen::spectral::companion_path;
use lyrgen::synth::{render_companion, RenderConfig};
use lyrgen::extract_midi_features;

#[derive(Parser, Debug)]
#[command(name = "lyrgen", about = "Generate lyrics from MIDI features and a prompt")]
struct Opt {
    /// Path to a MIDI file
    #[arg(long)]
    midi: PathBuf,
    /// Seed text for generation
    #[arg(long, default_value = "")]
    prompt: String,
    /// Number of tokens to generate
    #[arg(long, default_value_t = 50)]
    length: usize,
    /// Hugging Face Hub repository holding tokenizer.json and the ONNX decoder
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,
    /// Local directory to load the model from instead of the hub
    #[arg(long)]
    model_dir: Option<PathBuf>,
    /// ONNX graph path inside the repository or directory
    #[arg(long, default_value = DEFAULT_ONNX_FILE)]
    onnx_file: String,
    #[arg(long, default_value_t = 0.9)]
    top_p: f64,
    /// 0 disables top-k filtering
    #[arg(long, default_value_t = 50)]
    top_k: usize,
    #[arg(long, default_value_t = 1.0)]
    temperature: f64,
    /// Fixed RNG seed for reproducible output
    #[arg(long)]
    seed: Option<u64>,
    /// How many lyric variants to generate with the same loaded model
    #[arg(long, default_value_t = 1)]
    count: usize,
    /// GM SoundFont (.sf2) used to render the companion WAV when it does not exist yet
    #[arg(long)]
    soundfont: Option<PathBuf>,
    /// Print the extracted features as JSON and skip generation
    #[arg(long)]
    features_only: bool,
    /// More log output on stderr (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Opt {
    fn model_source(&self) -> ModelSource {
        ModelSource {
            name: self.model.clone(),
            local_dir: self.model_dir.clone(),
            onnx_file: self.onnx_file.clone(),
            context_len: GPT2_CONTEXT,
        }
    }

    fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            max_length: self.length,
            sampling: SamplingParams { top_p: self.top_p, top_k: self.top_k, temperature: self.temperature },
            seed: self.seed,
        }
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    init_logging(opt.verbose);

    if let Some(sf) = &opt.soundfont {
        if companion_path(&opt.midi).exists() {
            info!("companion audio already present, not rendering");
        } else if let Err(e) = render_companion(&opt.midi, sf, &RenderConfig::default()) {
            warn!("could not render companion audio: {e:#}");
        }
    }

    let record = extract_midi_features(&opt.midi).into_record();
    if opt.features_only {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    let source = opt.model_source();
    let base = opt.generation_params();
    let mut slot = ModelSlot::new();

    for i in 0..opt.count.max(1) {
        let generator = slot.get_or_try_load(|| load_generator(&source))?;
        let params = GenerationParams { seed: base.seed.map(|s| s.wrapping_add(i as u64)), ..base.clone() };
        let text = generator.generate(&record, &opt.prompt, &params)?;
        if i > 0 {
            println!();
        }
        println!("{text}");
    }

    Ok(())
}
