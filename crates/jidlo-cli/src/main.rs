use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jidlo_contracts::events::EventWriter;
use jidlo_contracts::models::{ModelRegistry, VISION_CAPABILITY};
use jidlo_contracts::prompts::{DEFAULT_PROMPT_ID, PROMPT_CATALOG};
use jidlo_engine::config::DEFAULT_MAX_TOKENS;
use jidlo_engine::normalize::DEFAULT_JPEG_QUALITY;
use jidlo_engine::{
    AnalysisOutcome, AnalyzerConfig, ConfigError, ConfigOptions, FoodAnalyzer, Normalizer,
    UploadedImage,
};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const DEFAULT_LOG_FILTER: &str = "jidlo_engine=info,jidlo_cli=info";

const EXIT_OK: i32 = 0;
const EXIT_FATAL: i32 = 1;
const EXIT_ANALYSIS_FAILED: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "jidlo-rs", version, about = "Food photo nutrition analyzer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Normalize a photo and ask the model to analyze it.
    Analyze(AnalyzeArgs),
    /// Write the normalized JPEG that would be sent, without calling the API.
    Normalize(NormalizeArgs),
    /// List registered vision models.
    Models(ListArgs),
    /// List prompt templates.
    Prompts(ListArgs),
}

#[derive(Debug, Parser)]
struct AnalyzeArgs {
    #[arg(long)]
    image: PathBuf,
    /// Declared media type; inferred from the extension when omitted.
    #[arg(long)]
    media_type: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    prompt: Option<String>,
    #[arg(long)]
    max_tokens: Option<u32>,
    #[arg(long)]
    secrets: Option<PathBuf>,
    #[arg(long)]
    events: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY)]
    quality: u8,
}

#[derive(Debug, Parser)]
struct NormalizeArgs {
    #[arg(long)]
    image: PathBuf,
    #[arg(long)]
    media_type: Option<String>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY)]
    quality: u8,
}

#[derive(Debug, Parser)]
struct ListArgs {
    #[arg(long)]
    json: bool,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("jidlo-rs error: {err:#}");
            std::process::exit(EXIT_FATAL);
        }
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Analyze(args) => run_analyze(args),
        Command::Normalize(args) => run_normalize(args),
        Command::Models(args) => {
            println!("{}", render_models(args.json)?);
            Ok(EXIT_OK)
        }
        Command::Prompts(args) => {
            println!("{}", render_prompts(args.json)?);
            Ok(EXIT_OK)
        }
    }
}

fn run_analyze(args: AnalyzeArgs) -> Result<i32> {
    // The key is checked before the image is touched.
    let config = match AnalyzerConfig::load(&config_options(&args)) {
        Ok(config) => config,
        Err(ConfigError::MissingApiKey { secrets }) => {
            eprintln!(
                "Chybí API klíč. Nastavte ANTHROPIC_API_KEY v prostředí, v souboru .env nebo v {}.",
                secrets.display()
            );
            return Ok(EXIT_FATAL);
        }
        Err(err) => return Err(err).context("invalid configuration"),
    };
    info!(model = %config.model.name, prompt = config.prompt.id, "configuration loaded");

    let upload = UploadedImage::from_path(&args.image, args.media_type.as_deref())?;
    let run_id = Uuid::new_v4().to_string();
    let events = match args.events {
        Some(path) => EventWriter::new(path, run_id),
        None => EventWriter::discard(run_id),
    };
    let mut analyzer =
        FoodAnalyzer::new(config, events).with_normalizer(Normalizer::with_quality(args.quality));

    println!("Probíhá analýza...");
    let outcome = analyzer.submit(upload);
    let (message, code) = render_outcome(&outcome);
    println!("{message}");
    Ok(code)
}

fn config_options(args: &AnalyzeArgs) -> ConfigOptions {
    ConfigOptions {
        model: args.model.clone(),
        prompt: args.prompt.clone(),
        max_tokens: args.max_tokens,
        secrets_path: args.secrets.clone(),
        api_base: None,
    }
}

fn render_outcome(outcome: &AnalysisOutcome) -> (String, i32) {
    match outcome {
        AnalysisOutcome::Success(text) => (format!("Analýza dokončena!\n\n{text}"), EXIT_OK),
        AnalysisOutcome::Failure(failure) => (
            format!("Došlo k chybě při analýze: {failure}"),
            EXIT_ANALYSIS_FAILED,
        ),
    }
}

fn run_normalize(args: NormalizeArgs) -> Result<i32> {
    let upload = UploadedImage::from_path(&args.image, args.media_type.as_deref())?;
    let normalized = Normalizer::with_quality(args.quality)
        .normalize(&upload)
        .with_context(|| format!("failed normalizing {}", args.image.display()))?;
    if let Some(parent) = args.out.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    let (width, height) = normalized.dimensions();
    let summary = format!(
        "{} {}x{} rotated {}° {} bytes sha256={}",
        args.out.display(),
        width,
        height,
        normalized.rotation().degrees(),
        normalized.bytes().len(),
        normalized.sha256_hex()
    );
    fs::write(&args.out, normalized.into_bytes())
        .with_context(|| format!("failed writing {}", args.out.display()))?;
    println!("{summary}");
    Ok(EXIT_OK)
}

fn render_models(json: bool) -> Result<String> {
    let registry = ModelRegistry::new(None);
    let models = registry.by_capability(VISION_CAPABILITY);
    if json {
        return Ok(serde_json::to_string_pretty(&models)?);
    }
    let default = models.first().map(|model| model.name.clone());
    let lines: Vec<String> = models
        .iter()
        .map(|model| {
            let marker = if Some(&model.name) == default.as_ref() {
                "*"
            } else {
                " "
            };
            format!(
                "{marker} {:<32} max_tokens<={:<6} (sent: {})",
                model.name,
                model.max_output_tokens,
                model.clamp_output_tokens(DEFAULT_MAX_TOKENS)
            )
        })
        .collect();
    Ok(lines.join("\n"))
}

fn render_prompts(json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string_pretty(PROMPT_CATALOG)?);
    }
    let lines: Vec<String> = PROMPT_CATALOG
        .iter()
        .map(|template| {
            let marker = if template.id == DEFAULT_PROMPT_ID {
                "*"
            } else {
                " "
            };
            format!("{marker} {:<10} {}", template.id, template.description)
        })
        .collect();
    Ok(lines.join("\n"))
}
