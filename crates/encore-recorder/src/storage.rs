//! Recording storage - JSON lines format.
//!
//! First line is the recording metadata, each following line one action.
//! Playback runs append to a single `runs.jsonl` next to the recordings.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use encore_core::action::{RecordedAction, Recording};

use crate::playback::PlaybackRun;

#[derive(Serialize, Deserialize)]
struct Meta {
    id: Uuid,
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    actions: usize,
}

pub struct RecordingStorage {
    dir: PathBuf,
}

impl RecordingStorage {
    pub fn new() -> Result<Self> {
        let home = std::env::var("HOME").context("HOME not set")?;
        Self::with_dir(PathBuf::from(home).join(".encore"))
    }

    pub fn with_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Save a recording as JSON lines. Returns the written path.
    pub fn save(&self, recording: &Recording) -> Result<PathBuf> {
        let ts = recording.created_at.format("%Y%m%d_%H%M%S");
        let filename = format!("{}_{}.jsonl", sanitize(&recording.name), ts);
        let path = self.dir.join(&filename);

        let file = File::create(&path)?;
        let mut w = BufWriter::new(file);

        let meta = Meta {
            id: recording.id,
            name: recording.name.clone(),
            description: recording.description.clone(),
            url: recording.url.clone(),
            created_at: recording.created_at,
            updated_at: recording.updated_at,
            actions: recording.actions.len(),
        };
        serde_json::to_writer(&mut w, &meta)?;
        writeln!(w)?;

        for action in &recording.actions {
            serde_json::to_writer(&mut w, action)?;
            writeln!(w)?;
        }

        w.flush()?;
        tracing::debug!(path = %path.display(), actions = recording.actions.len(), "recording saved");
        Ok(path)
    }

    pub fn load(&self, filename: &str) -> Result<Recording> {
        let path = self.dir.join(filename);
        let file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        let meta_line = lines.next().context("empty recording file")??;
        let meta: Meta = serde_json::from_str(&meta_line).context("invalid recording metadata")?;

        let mut actions = Vec::with_capacity(meta.actions);
        for line in lines {
            let line = line?;
            if !line.is_empty() {
                let action: RecordedAction = serde_json::from_str(&line)?;
                actions.push(action);
            }
        }

        Ok(Recording {
            id: meta.id,
            name: meta.name,
            description: meta.description,
            url: meta.url,
            actions,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
        })
    }

    /// List saved recording files, sorted by name.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".jsonl") && name != "runs.jsonl" {
                    files.push(name.to_string());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn delete(&self, filename: &str) -> Result<()> {
        fs::remove_file(self.dir.join(filename))?;
        Ok(())
    }

    /// Append a finished run to the shared run log.
    pub fn append_run(&self, run: &PlaybackRun) -> Result<PathBuf> {
        let path = self.dir.join("runs.jsonl");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut w = BufWriter::new(file);
        serde_json::to_writer(&mut w, run)?;
        writeln!(w)?;
        w.flush()?;
        Ok(path)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
