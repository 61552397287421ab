//! Batch files.
//!
//! A batch is either JSON or TOML, chosen by file extension:
//!
//! ```toml
//! [[tasks]]
//! id = "migrate-users"
//! resources = ["db/users"]
//! priority = 10
//!
//! [tasks.payload.phases.implementation]
//! run = "./migrate.sh"
//! artifacts = ["migrated.ok"]
//!
//! [references]
//! "db/users" = ["db/accounts"]
//! ```

use std::path::Path;

use crate::core::Batch;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchFormat {
    Json,
    Toml,
}

impl BatchFormat {
    /// `.toml` files are TOML, everything else is JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => BatchFormat::Toml,
            _ => BatchFormat::Json,
        }
    }
}

pub fn parse(contents: &str, format: BatchFormat) -> Result<Batch> {
    let batch: Batch = match format {
        BatchFormat::Json => serde_json::from_str(contents)?,
        BatchFormat::Toml => toml::from_str(contents)?,
    };
    if batch.is_empty() {
        return Err(Error::Validation("Batch contains no tasks".to_string()));
    }
    Ok(batch)
}

pub fn load(path: &Path) -> Result<Batch> {
    let contents = std::fs::read_to_string(path)?;
    parse(&contents, BatchFormat::from_path(path))
}
