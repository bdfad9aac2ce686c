use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use drumscribe::pipeline::TraceWriter;
use drumscribe::{ModelCache, Transcription, TranscriberConfig, TranscriptionPipeline};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "drumscribe")]
#[command(about = "Transcribe drum recordings to General MIDI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Verbose logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Transcribe an audio file and write a MIDI file
    Transcribe {
        /// Input audio (wav, mp3, flac, ogg, m4a, ...)
        input: PathBuf,

        /// Output MIDI file
        #[arg(short = 'o', long)]
        output: PathBuf,

        #[command(flatten)]
        options: PipelineArgs,
    },

    /// Print the detected drum events as JSON
    Events {
        /// Input audio
        input: PathBuf,

        #[command(flatten)]
        options: PipelineArgs,
    },
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Model URL or local path (needs the `onnx` feature to load)
    #[arg(long)]
    model: Option<String>,

    /// JSON configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    sample_rate: Option<u32>,

    #[arg(long)]
    fft_size: Option<usize>,

    #[arg(long)]
    hop_size: Option<usize>,

    #[arg(long)]
    n_mels: Option<usize>,

    /// Lowest mel band edge in Hz
    #[arg(long)]
    fmin: Option<f32>,

    /// Highest mel band edge in Hz (default: Nyquist)
    #[arg(long)]
    fmax: Option<f32>,

    /// Model inference budget in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Fail on undecodable input instead of substituting a synthetic click train
    #[arg(long)]
    strict_decode: bool,

    /// Append JSONL progress entries to this file
    #[arg(long)]
    trace: Option<PathBuf>,
}

impl PipelineArgs {
    fn load_config(&self) -> Result<TranscriberConfig> {
        let mut config = match &self.config {
            Some(path) => TranscriberConfig::from_json_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => TranscriberConfig::default(),
        };

        if let Some(model) = &self.model {
            config.model = Some(model.clone());
        }
        if let Some(rate) = self.sample_rate {
            config.sample_rate = rate;
        }
        if let Some(fft_size) = self.fft_size {
            config.features.fft_size = fft_size;
        }
        if let Some(hop_size) = self.hop_size {
            config.features.hop_size = hop_size;
        }
        if let Some(n_mels) = self.n_mels {
            config.features.n_mels = n_mels;
        }
        if let Some(fmin) = self.fmin {
            config.features.fmin = fmin;
        }
        if self.fmax.is_some() {
            config.features.fmax = self.fmax;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.inference_timeout_ms = timeout_ms;
        }
        if self.strict_decode {
            config.synthesize_on_decode_failure = false;
        }

        Ok(config)
    }

    async fn run(&self, input: &Path) -> Result<Transcription> {
        let config = self.load_config()?;
        let pipeline = TranscriptionPipeline::new(config, Arc::new(ModelCache::default()))?;

        let audio = tokio::fs::read(input)
            .await
            .with_context(|| format!("reading {}", input.display()))?;
        let trace = self.trace.clone().map(TraceWriter::new);

        let transcription = pipeline.transcribe_with_trace(&audio, trace.as_ref()).await?;
        if transcription.is_degraded() {
            log::warn!(
                "{} could not be decoded; output was transcribed from a synthetic click train",
                input.display()
            );
        }
        if let Some(reason) = &transcription.fallback_reason {
            log::warn!("Model not used: {}", reason);
        }
        Ok(transcription)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    match &cli.command {
        Command::Transcribe {
            input,
            output,
            options,
        } => {
            let transcription = options.run(input).await?;
            tokio::fs::write(output, &transcription.midi)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            log::info!(
                "Wrote {} events ({} detector) to {}",
                transcription.events.total(),
                transcription.detector,
                output.display()
            );
        }
        Command::Events { input, options } => {
            let transcription = options.run(input).await?;
            println!("{}", serde_json::to_string_pretty(&transcription.events)?);
        }
    }

    Ok(())
}
