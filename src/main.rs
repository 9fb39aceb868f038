use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use llm_session::config::Settings;
use llm_session::{logging, Backend, Runtime, SimBackend, SimModelSpec, StopReason, StreamEvent, TokenStream};

/// Stream completions from a local model
#[derive(Parser)]
#[command(name = "llm-session")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Directory holding default.toml and an optional local.toml
    #[arg(long, default_value = "config")]
    config_dir: PathBuf,

    /// Compute backend
    #[arg(long, value_enum, default_value_t = BackendKind::Llama)]
    backend: BackendKind,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// llama.cpp (needs the `llama` feature)
    Llama,
    /// Deterministic byte-level simulator
    Sim,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a completion for a prompt
    Run {
        /// Path to the model file
        model: PathBuf,

        /// Prompt text
        prompt: String,

        /// Maximum tokens to generate
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Context window size
        #[arg(long)]
        n_ctx: Option<u32>,

        /// Number of layers to offload to the GPU
        #[arg(long)]
        gpu_layers: Option<u32>,

        /// Stop after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Load a model and print what the backend reports about it
    Info {
        /// Path to the model file
        model: PathBuf,
    },
}

impl Commands {
    fn model(&self) -> &Path {
        match self {
            Commands::Run { model, .. } | Commands::Info { model } => model,
        }
    }

    fn apply(&self, settings: &mut Settings) {
        if let Commands::Run {
            max_tokens,
            n_ctx,
            gpu_layers,
            timeout_ms,
            ..
        } = self
        {
            if let Some(max_tokens) = max_tokens {
                settings.generation.max_tokens = Some(*max_tokens);
            }
            if let Some(n_ctx) = n_ctx {
                settings.context.n_ctx = *n_ctx;
            }
            if let Some(gpu_layers) = gpu_layers {
                settings.model.gpu_layers = *gpu_layers;
            }
            if timeout_ms.is_some() {
                settings.generation.timeout_ms = *timeout_ms;
            }
        }
    }
}

fn load_settings(config_dir: &Path) -> Result<Settings> {
    if config_dir.join("default.toml").exists() {
        Settings::from_dir(config_dir).context("Failed to load settings")
    } else {
        Ok(Settings::default())
    }
}

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(120));
    pb.set_message(message);
    pb
}

async fn execute<B: Backend>(runtime: Runtime<B>, command: Commands, settings: Settings) -> Result<()> {
    println!("{} {}", "system:".dimmed(), runtime.system_info());

    let path = command.model().to_path_buf();
    let pb = spinner(format!("Loading {}", path.display()));
    let loader = runtime.clone();
    let params = settings.model.clone();
    let load_path = path.clone();
    let loaded = tokio::task::spawn_blocking(move || loader.load_model(load_path, params)).await?;
    pb.finish_and_clear();
    let model = loaded.with_context(|| format!("Failed to load {}", path.display()))?;
    println!("{} {}", "model:".dimmed(), model.describe()?.green());

    let Commands::Run { prompt, .. } = command else {
        return Ok(());
    };

    let context = Arc::new(model.create_context(settings.context.clone())?);
    let tokenizer = context.tokenizer();
    let mut stream = TokenStream::start(Arc::clone(&context), prompt, settings.generation.to_options())?;

    let cancel = stream.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut stdout = std::io::stdout();
    let mut emitted = 0usize;
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::Token(token) => {
                emitted += 1;
                print!("{}", tokenizer.decode(&[token]));
                stdout.flush()?;
            }
            StreamEvent::Stopped { reason, cause, error } => {
                println!();
                let summary = format!("[{:?} after {} tokens]", reason, emitted);
                match reason {
                    StopReason::Eos | StopReason::MaxLength => println!("{}", summary.dimmed()),
                    StopReason::Cancelled => println!("{} {:?}", summary.yellow(), cause),
                    StopReason::Error => {
                        println!("{}", summary.red());
                        if let Some(error) = error {
                            bail!(error);
                        }
                    }
                }
            }
        }
    }

    info!(emitted, occupied = context.occupied(), "Generation finished");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings(&cli.config_dir)?;
    cli.command.apply(&mut settings);
    settings.validate()?;

    let _guard = logging::init(&settings.logging).map_err(|e| anyhow::anyhow!(e))?;
    info!("llm-session starting up");

    match cli.backend {
        BackendKind::Sim => {
            let backend = SimBackend::new()
                .with_model(cli.command.model(), SimModelSpec::default())
                .with_gpu_layer_budget(u32::MAX);
            execute(Runtime::new(backend), cli.command, settings).await
        }
        #[cfg(feature = "llama")]
        BackendKind::Llama => {
            execute(Runtime::new(llm_session::LlamaCppBackend::new()), cli.command, settings).await
        }
        #[cfg(not(feature = "llama"))]
        BackendKind::Llama => bail!("built without the `llama` feature; rerun with --backend sim"),
    }
}
