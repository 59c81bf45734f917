//! Append-only JSON-lines audit trail of raw and detailed transaction records.
//! Written for operators; the running process never reads it back.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

const RAW_LOG: &str = "transactions.log";
const DETAIL_LOG: &str = "detailed_info.log";

pub struct AuditLog {
    raw: Mutex<File>,
    detail: Mutex<File>,
}

impl AuditLog {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create audit directory {}", dir.display()))?;

        Ok(Self {
            raw: Mutex::new(Self::open_append(&dir.join(RAW_LOG))?),
            detail: Mutex::new(Self::open_append(&dir.join(DETAIL_LOG))?),
        })
    }

    fn open_append(path: &Path) -> Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open audit log {}", path.display()))
    }

    /// Raw provider payload as received (websocket notification or webhook item)
    pub fn record_raw<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        Self::append(&self.raw, value)
    }

    /// Detail record fetched for a signature
    pub fn record_detail<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        Self::append(&self.detail, value)
    }

    fn append<T: Serialize + ?Sized>(file: &Mutex<File>, value: &T) -> Result<()> {
        let mut line = serde_json::to_vec(value).context("Failed to serialize audit record")?;
        line.push(b'\n');
        let mut file = file
            .lock()
            .map_err(|_| anyhow::anyhow!("Audit log lock poisoned"))?;
        file.write_all(&line).context("Failed to append audit record")
    }
}
