use std::{fs::File, io::BufReader, sync::Arc};

use anyhow::{Context, Result};
use diffcast_capabilities::Capabilities;
use diffcast_core::{config::Config, video::Stage};
use diffcast_db::{Database, Records};
use diffcast_pipeline::Orchestrator;
use serde::Serialize;
use typed_path::Utf8NativePathBuf;

// For argp::FromArgs
pub fn native_path(value: &str) -> Result<Utf8NativePathBuf, String> {
    Ok(Utf8NativePathBuf::from(value))
}

// For argp::FromArgs
pub fn stage(value: &str) -> Result<Stage, String> {
    value.parse().map_err(|_| format!("unknown stage '{value}'"))
}

pub fn load_config(path: &Utf8NativePathBuf) -> Result<Config> {
    let file = File::open(path.with_platform_encoding())
        .with_context(|| format!("Failed to open {}", path))?;
    serde_yaml::from_reader(BufReader::new(file))
        .with_context(|| format!("Failed to parse {}", path))
}

/// Orchestrator over the configured database, plus the database handle so the
/// caller can close it.
pub async fn open_orchestrator(config: &Config) -> Result<(Orchestrator, Database)> {
    let db = Database::new(&config.db).await.context("Failed to open database")?;
    let records = Records::new(Arc::new(db.clone()));
    let caps = Capabilities::from_config(config).context("Failed to set up capabilities")?;
    Ok((Orchestrator::new(records, caps, config.pipeline.clone()), db))
}

pub fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("Failed to serialize output")?);
    Ok(())
}
