use clap::{Parser, Subcommand};
use recognition_gateway::{Error, GatewayConfig, RecognitionService, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(name = "recognition-gateway")]
#[command(about = "Cached image recognition over a local ONNX classifier")]
struct Args {
    /// JSON config file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recognize a single image
    Recognize {
        image: PathBuf,
        /// Minimum confidence in [0, 1]
        #[arg(short, long)]
        threshold: Option<f64>,
        /// Skip the result cache for this request
        #[arg(long)]
        no_cache: bool,
        /// Attach an estimated object location
        #[arg(long)]
        enhanced: bool,
    },
    /// Perceptual similarity of two images
    Compare { first: PathBuf, second: PathBuf },
    /// Run every image in a directory through recognition
    Index { directory: PathBuf },
    /// Remove all cached recognition results
    ClearCache,
    /// Remove expired cache entries
    PurgeExpired,
    /// Load and warm the model, then report its state
    Warm,
}

#[derive(Serialize)]
struct Similarity {
    similarity: f64,
}

#[derive(Serialize)]
struct CacheOutcome {
    success: bool,
    removed: Option<usize>,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn read_image(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .map_err(|e| Error::Path(format!("{}: {e}", path.display())))
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    }
    .with_env_overrides()?
    .with_persistent_cache_default();
    let service = RecognitionService::from_config(config)?;

    match args.command {
        Command::Recognize {
            image,
            threshold,
            no_cache,
            enhanced,
        } => {
            let mut options = service.default_options();
            if let Some(threshold) = threshold {
                options.threshold = threshold;
            }
            options.use_cache = !no_cache;
            options.enhanced_analysis = enhanced;
            let bytes = read_image(&image).await?;
            print_json(&service.recognize(bytes, &options).await?)
        }
        Command::Compare { first, second } => {
            let a = read_image(&first).await?;
            let b = read_image(&second).await?;
            let similarity = service.compare_images(a, b).await;
            print_json(&Similarity { similarity })
        }
        Command::Index { directory } => {
            print_json(&service.index_reference_images(&directory).await?)
        }
        Command::ClearCache => {
            let success = service.clear_recognition_cache().await;
            print_json(&CacheOutcome {
                success,
                removed: None,
            })
        }
        Command::PurgeExpired => {
            let removed = service.purge_expired_cache().await?;
            print_json(&CacheOutcome {
                success: true,
                removed: Some(removed),
            })
        }
        Command::Warm => print_json(&service.ensure_model_loaded().await?),
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        log::error!("{err}");
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
