use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use harvest_crawler::{PersistOutcome, ProductRecord, Rejection, Sink, SinkError};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Pretty-printed array of records.
    Json,
    Csv,
}

impl OutputFormat {
    /// Guesses the format from the file extension, JSON unless it says csv.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => Self::Csv,
            _ => Self::Json,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CsvOptions {
    #[serde(default = "default_csv_delimiter")]
    pub delimiter: char,
    #[serde(default)]
    pub crlf: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            crlf: false,
        }
    }
}

fn default_csv_delimiter() -> char {
    CsvOptions::default().delimiter
}

impl From<&CsvOptions> for csv::WriterBuilder {
    fn from(c: &CsvOptions) -> Self {
        let mut builder = csv::WriterBuilder::new();
        builder.delimiter(c.delimiter as u8);
        builder.terminator(if c.crlf {
            csv::Terminator::CRLF
        } else {
            csv::Terminator::Any(b'\n')
        });
        builder
    }
}

const CSV_HEADER: [&str; 18] = [
    "product_id",
    "name",
    "brand",
    "product_url",
    "images",
    "unit",
    "quantity_label",
    "price_mrp",
    "price_sp",
    "discount_percent",
    "is_best_value",
    "available_quantity",
    "availability_code",
    "category_main",
    "category_mid",
    "category_leaf",
    "created_at_on_web_site",
    "updated_at_on_web_site",
];

fn csv_row(r: &ProductRecord) -> [String; 18] {
    let opt = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_default();
    [
        r.product_id.to_string(),
        r.name.clone(),
        r.brand.clone(),
        r.url.clone(),
        r.images.join(" "),
        r.unit.clone(),
        r.quantity_label.clone(),
        opt(r.price_mrp),
        opt(r.price_sp),
        opt(r.discount_percent),
        r.is_best_value.to_string(),
        r.available_quantity.to_string(),
        r.availability_code.clone(),
        r.category_main.clone(),
        r.category_mid.clone(),
        r.category_leaf.clone(),
        r.created_at_on_web_site.clone().unwrap_or_default(),
        r.updated_at_on_web_site.clone().unwrap_or_default(),
    ]
}

/// Keeps every accepted record keyed by product id and rewrites the output
/// file after each batch. The file is replaced through a rename so readers
/// never see a half-written one.
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    format: OutputFormat,
    csv: CsvOptions,
    records: Mutex<BTreeMap<u64, ProductRecord>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, format: OutputFormat) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs_err::create_dir_all(parent)
                .with_context(|| format!("Couldn't prepare output directory for {}", path.display()))?;
        }
        Ok(Self {
            path,
            format,
            csv: CsvOptions::default(),
            records: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn with_csv_options(mut self, csv: CsvOptions) -> Self {
        self.csv = csv;
        self
    }

    async fn write_out(&self, snapshot: Vec<ProductRecord>) -> Result<(), SinkError> {
        let path = self.path.clone();
        let format = self.format;
        let options = self.csv.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, format, &options, &snapshot))
            .await
            .map_err(|e| SinkError::Unavailable(format!("writer task failed: {e}")))??;
        Ok(())
    }
}

fn malformed(record: &ProductRecord) -> Option<&'static str> {
    if record.product_id == 0 {
        Some("missing product id")
    } else if record.name.trim().is_empty() {
        Some("missing product name")
    } else {
        None
    }
}

fn write_atomically(
    path: &Path,
    format: OutputFormat,
    options: &CsvOptions,
    records: &[ProductRecord],
) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let file = fs_err::File::create(&tmp)?;
    match format {
        OutputFormat::Json => {
            let mut wtr = io::BufWriter::new(file);
            serde_json::to_writer_pretty(&mut wtr, records)?;
            wtr.write_all(b"\n")?;
            wtr.flush()?;
        }
        OutputFormat::Csv => {
            let mut wtr = csv::WriterBuilder::from(options).from_writer(file);
            wtr.write_record(CSV_HEADER)?;
            for record in records {
                wtr.write_record(csv_row(record))?;
            }
            wtr.flush()?;
        }
    }
    fs_err::rename(&tmp, path)
}

#[async_trait]
impl Sink for FileSink {
    async fn persist_batch(&self, batch: &[ProductRecord]) -> Result<PersistOutcome, SinkError> {
        let mut outcome = PersistOutcome::default();
        // Held through the write so files land in batch order.
        let mut records = self.records.lock().await;
        for record in batch {
            match malformed(record) {
                Some(reason) => outcome
                    .rejected
                    .push(Rejection::malformed(record.product_id, reason)),
                None => {
                    records.insert(record.product_id, record.clone());
                    outcome.accepted.push(record.product_id);
                }
            }
        }
        if outcome.accepted.is_empty() {
            return Ok(outcome);
        }

        self.write_out(records.values().cloned().collect()).await?;
        log::debug!(
            "Wrote {} records to {}",
            outcome.accepted.len(),
            self.path.display()
        );
        Ok(outcome)
    }

    async fn finalize(&self) -> Result<(), SinkError> {
        let records = self.records.lock().await;
        self.write_out(records.values().cloned().collect()).await?;
        let count = records.len();
        log::info!("Saved {count} records to {}", self.path.display());
        Ok(())
    }
}
