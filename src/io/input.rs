//! JSON Lines input for the CLI.
//!
//! Each non-empty line is one record: `{"id": "node-1", "vector": [0.1, 0.2]}`.

use std::io::BufRead;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::NodeId;

/// One embedding record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: NodeId,
    pub vector: Vec<f32>,
}

#[derive(Error, Debug)]
pub enum InputError {
    #[error("Failed to read '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Reads records from any buffered reader, skipping blank lines.
pub fn read_records(reader: impl BufRead) -> Result<Vec<EmbeddingRecord>, InputError> {
    let mut records = Vec::new();
    for (number, line) in reader.lines().enumerate() {
        let line = line.map_err(|source| InputError::Read {
            path: "<input>".to_string(),
            source,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|source| InputError::Parse {
            line: number + 1,
            source,
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Reads a JSON Lines file of embedding records.
pub fn load_records(path: &Path) -> Result<Vec<EmbeddingRecord>, InputError> {
    let file = std::fs::File::open(path).map_err(|source| InputError::Read {
        path: path.display().to_string(),
        source,
    })?;
    read_records(std::io::BufReader::new(file))
}
