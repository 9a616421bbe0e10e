use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::DType;
use clap::{Parser, ValueEnum};
use generation::{generate, GenerationConfig, GenerationReport};
use inference_core::setup_device;
use model::{ArchitectureConfig, Model};
use serde::Serialize;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("generation failed: {err:#}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Generate from a randomly initialised model of a given architecture",
    long_about = None
)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Architecture config.json")]
    config: PathBuf,

    #[arg(
        short,
        long,
        value_name = "IDS",
        value_delimiter = ',',
        required = true,
        help = "Comma-separated prompt token ids"
    )]
    prompt: Vec<u32>,

    #[arg(long, value_name = "PATH", help = "Generation settings as JSON")]
    generation: Option<PathBuf>,

    #[arg(long)]
    max_tokens: Option<usize>,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    top_p: Option<f32>,

    #[arg(long)]
    top_k: Option<usize>,

    #[arg(long)]
    min_p: Option<f32>,

    #[arg(long)]
    repetition_penalty: Option<f32>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long, value_enum, default_value_t = Precision::F32)]
    dtype: Precision,

    #[arg(long, help = "Print token ids to stderr as they are generated")]
    stream: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Precision {
    F32,
    F16,
    Bf16,
}

impl From<Precision> for DType {
    fn from(precision: Precision) -> Self {
        match precision {
            Precision::F32 => DType::F32,
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

#[derive(Serialize)]
struct Output {
    success: bool,
    tokens: Vec<u32>,
    #[serde(flatten)]
    report: GenerationReport,
}

fn generation_config(args: &Args, architecture: &ArchitectureConfig) -> Result<GenerationConfig> {
    let mut config = match &args.generation {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        }
        None => GenerationConfig::default(),
    };
    if let Some(max_tokens) = args.max_tokens {
        config.max_tokens = max_tokens;
    }
    if let Some(temperature) = args.temperature {
        config.temperature = temperature;
    }
    if let Some(top_p) = args.top_p {
        config.top_p = top_p;
    }
    if let Some(min_p) = args.min_p {
        config.min_p = min_p;
    }
    config.top_k = args.top_k.or(config.top_k);
    config.repetition_penalty = args.repetition_penalty.or(config.repetition_penalty);
    config.seed = args.seed.or(config.seed);
    if config.stop_tokens.is_empty() {
        config.stop_tokens = architecture.stop_tokens();
    }
    config.validate()?;
    Ok(config)
}

fn run() -> Result<()> {
    let args = Args::parse();

    let raw = std::fs::read_to_string(&args.config)
        .with_context(|| format!("reading {}", args.config.display()))?;
    let architecture = ArchitectureConfig::from_json(&raw)?;
    let config = generation_config(&args, &architecture)?;

    let device = setup_device()?;
    let model = Model::with_init(architecture, &device, args.dtype.into())?;

    let output = generate(&model, &args.prompt, &config, |token| {
        if args.stream {
            eprint!("{token} ");
        }
        true
    })?;
    if args.stream {
        eprintln!();
    }

    let json = serde_json::to_string_pretty(&Output {
        success: true,
        tokens: output.tokens,
        report: output.report,
    })?;
    println!("{json}");
    Ok(())
}
