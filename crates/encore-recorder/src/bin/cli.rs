//! Encore recording management CLI.
//!
//! Inspects and maintains stored recordings. Live capture and replay run
//! through the platform integrations, not this binary.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use encore_core::action::{redact, validate, ActionKind};
use encore_recorder::storage::RecordingStorage;

#[derive(Parser)]
#[command(name = "encore")]
#[command(about = "Desktop action recorder - manage stored recordings")]
struct Cli {
    /// Storage directory (defaults to ~/.encore)
    #[arg(long)]
    dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List saved recordings
    List,

    /// Show a recording
    Show {
        /// Recording file
        file: String,

        /// Show all actions
        #[arg(long)]
        all: bool,
    },

    /// Check a recording's stream invariants
    Validate {
        /// Recording file
        file: String,
    },

    /// Print a redacted copy as JSON
    Export {
        /// Recording file
        file: String,
    },

    /// Delete a recording
    Delete {
        /// Recording file
        file: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let storage = match &cli.dir {
        Some(dir) => RecordingStorage::with_dir(dir)?,
        None => RecordingStorage::new()?,
    };

    match cli.command {
        Commands::List => list(&storage)?,
        Commands::Show { file, all } => show(&storage, &file, all)?,
        Commands::Validate { file } => validate_file(&storage, &file)?,
        Commands::Export { file } => export(&storage, &file)?,
        Commands::Delete { file } => {
            storage.delete(&file)?;
            println!("Deleted {}", file);
        }
    }

    Ok(())
}

fn list(storage: &RecordingStorage) -> Result<()> {
    let files = storage.list()?;
    if files.is_empty() {
        println!("No recordings in {}", storage.path().display());
        return Ok(());
    }
    for file in files {
        let summary = storage
            .load(&file)
            .map(|r| format!("{} ({} actions)", r.name, r.actions.len()))
            .unwrap_or_else(|e| format!("unreadable: {}", e));
        println!("{:40} {}", file, summary);
    }
    Ok(())
}

fn show(storage: &RecordingStorage, file: &str, all: bool) -> Result<()> {
    let recording = storage.load(file)?;
    println!("Name:    {}", recording.name);
    if let Some(description) = &recording.description {
        println!("About:   {}", description);
    }
    if let Some(url) = &recording.url {
        println!("URL:     {}", url);
    }
    println!("Created: {}", recording.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("Actions: {}", recording.actions.len());

    let shown = if all {
        recording.actions.len()
    } else {
        recording.actions.len().min(20)
    };
    for action in &recording.actions[..shown] {
        let detail = match &action.kind {
            ActionKind::MouseClick { x, y, .. }
            | ActionKind::MouseDoubleClick { x, y }
            | ActionKind::MouseRightClick { x, y } => format!("at ({}, {})", x, y),
            ActionKind::Scroll { dx, dy, .. } => format!("by ({}, {})", dx, dy),
            ActionKind::KeyPress { key } => key.clone(),
            ActionKind::KeyType { text } => format!("{} chars", text.len()),
            ActionKind::CredentialInput {
                credential_name,
                field,
            } => format!("{}/{}", credential_name, field),
            ActionKind::Screenshot { .. } => String::new(),
            ActionKind::Wait { duration_ms } => format!("{}ms", duration_ms),
            ActionKind::OpenUrl { url } => url.clone(),
        };
        println!(
            "  {:>8}ms  {:20} {}",
            action.offset_ms,
            action.kind.label(),
            detail
        );
    }
    if shown < recording.actions.len() {
        println!("  ... {} more (use --all)", recording.actions.len() - shown);
    }
    Ok(())
}

fn validate_file(storage: &RecordingStorage, file: &str) -> Result<()> {
    let recording = storage.load(file)?;
    match validate(&recording) {
        Ok(()) => {
            println!("OK: {} actions, offsets monotonic, references clean", recording.actions.len());
            Ok(())
        }
        Err(err) => {
            println!("INVALID: {}", err);
            std::process::exit(1);
        }
    }
}

fn export(storage: &RecordingStorage, file: &str) -> Result<()> {
    let recording = storage.load(file)?;
    let safe = redact(&recording);
    println!("{}", serde_json::to_string_pretty(&safe)?);
    Ok(())
}
