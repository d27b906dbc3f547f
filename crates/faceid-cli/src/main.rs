use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use faceid_engine::{spawn_engine, Config};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "faceid", about = "Face registration and recognition")]
struct Cli {
    /// TOML config file; FACEID_* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a person from one or more photos
    Register {
        /// Display name, also the person's corpus directory
        #[arg(short, long)]
        name: String,
        /// Image files
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Recognize every face in an image
    Recognize { image: PathBuf },
    /// Rebuild the classifier from the processed corpus
    Retrain,
    /// List registered identities
    List,
    /// Delete one registration by id
    Delete { id: String },
    /// Re-run alignment over a person's raw images
    Align { name: String },
    /// Show classifier state and configuration
    Status,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    };
    tracing::debug!(data_dir = %config.data_dir.display(), "configuration loaded");

    let engine = spawn_engine(&config).context("failed to start engine")?;

    match cli.command {
        Commands::Register { name, images } => {
            let mut uploads = Vec::with_capacity(images.len());
            for path in &images {
                uploads.push(
                    std::fs::read(path).with_context(|| format!("reading {}", path.display()))?,
                );
            }
            print_json(&engine.register(name, uploads).await?)?;
        }
        Commands::Recognize { image } => {
            let bytes =
                std::fs::read(&image).with_context(|| format!("reading {}", image.display()))?;
            let report = engine.recognize(bytes).await?;
            if report.detected_faces == 0 {
                tracing::info!("no faces detected");
            }
            print_json(&report)?;
        }
        Commands::Retrain => {
            print_json(&engine.retrain().await?)?;
        }
        Commands::List => {
            print_json(&engine.list_identities().await?)?;
        }
        Commands::Delete { id } => {
            print_json(&engine.delete_identity(id).await?)?;
        }
        Commands::Align { name } => {
            print_json(&engine.align_person(name).await?)?;
        }
        Commands::Status => {
            print_json(&engine.status().await?)?;
        }
    }

    Ok(())
}
