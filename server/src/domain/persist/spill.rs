//! Local spill file for the persistence writer
//!
//! The only local persistent state in the pipeline: a length-prefixed
//! sequence of MessagePack span records behind a 4-byte magic header `AGSP`
//! and a 4-byte version. Spans land here when the columnar store stays down
//! past the retry budget and are replayed on the next successful flush.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use thiserror::Error;

use crate::data::types::Span;

/// File magic
const MAGIC: &[u8; 4] = b"AGSP";

/// Format version
const VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SpillError {
    #[error("spill file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("spill file has bad magic or version")]
    BadHeader,
    #[error("spill record encode error: {0}")]
    Encode(String),
}

/// Append spans to the spill file, writing the header if the file is new.
pub fn append_spans(path: &Path, spans: &[Span]) -> Result<(), SpillError> {
    if spans.is_empty() {
        return Ok(());
    }

    let is_new = !path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);

    if is_new {
        writer.write_all(MAGIC)?;
        writer.write_all(&VERSION.to_le_bytes())?;
    }

    for span in spans {
        let record = rmp_serde::to_vec_named(span).map_err(|e| SpillError::Encode(e.to_string()))?;
        writer.write_all(&(record.len() as u32).to_le_bytes())?;
        writer.write_all(&record)?;
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Read every span retained in the spill file. A truncated or undecodable
/// tail (torn write during a crash) is dropped with a warning; everything
/// before it is recovered.
pub fn read_spans(path: &Path) -> Result<Vec<Span>, SpillError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);

    let mut header = [0u8; 8];
    if let Err(e) = reader.read_exact(&mut header) {
        if e.kind() == ErrorKind::UnexpectedEof {
            return Err(SpillError::BadHeader);
        }
        return Err(e.into());
    }
    if &header[0..4] != MAGIC || u32::from_le_bytes(header[4..8].try_into().unwrap()) != VERSION {
        return Err(SpillError::BadHeader);
    }

    let mut spans = Vec::new();
    loop {
        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;

        let mut record = vec![0u8; len];
        match reader.read_exact(&mut record) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                tracing::warn!(
                    path = %path.display(),
                    recovered = spans.len(),
                    "Spill file ends in a torn record, dropping the tail"
                );
                break;
            }
            Err(e) => return Err(e.into()),
        }

        match rmp_serde::from_slice::<Span>(&record) {
            Ok(span) => spans.push(span),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    recovered = spans.len(),
                    "Undecodable spill record, dropping the tail"
                );
                break;
            }
        }
    }

    Ok(spans)
}

/// Remove the spill file after its contents are durably flushed.
pub fn clear(path: &Path) -> Result<(), SpillError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
