use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;

use crate::model::ProductRecord;

#[derive(Serialize)]
struct OverflowLine<'a> {
    failed_at: String,
    reason: &'a str,
    record: &'a ProductRecord,
}

/// Where batches go once the sink gave up on them, one JSON line per record.
#[derive(Debug, Clone, Default)]
pub struct OverflowLog {
    path: Option<PathBuf>,
}

impl OverflowLog {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn record(&self, batch: &[ProductRecord], reason: &str) -> io::Result<()> {
        let Some(path) = &self.path else {
            log::error!(
                "Undeliverable batch of {} records ({reason}), no overflow file configured: {:?}",
                batch.len(),
                batch.iter().map(|r| r.product_id).collect::<Vec<_>>()
            );
            return Ok(());
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut wtr = BufWriter::new(file);
        let failed_at = Utc::now().to_rfc3339();
        for record in batch {
            let line = OverflowLine {
                failed_at: failed_at.clone(),
                reason,
                record,
            };
            serde_json::to_writer(&mut wtr, &line)?;
            wtr.write_all(b"\n")?;
        }
        wtr.flush()?;
        log::warn!(
            "Wrote {} undeliverable records to {}",
            batch.len(),
            path.display()
        );
        Ok(())
    }
}
