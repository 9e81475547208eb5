use std::fs::{self, File};
use std::io::{self, Write};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{CommandFactory, Parser};
use clap_complete::{generate, Shell};
use harvest_bigbasket::{
    root_category, BigBasketExtractor, CsvOptions, FileSink, OutputFormat, DEFAULT_BASE_URL,
    ROOT_ID,
};
use harvest_crawler::{
    CategoryEntry, Collaborators, CrawlerConfig, Extractor, HttpFetcher, IdentityRotator,
    LeafCategory, OnQueueFull, Payload, Pipeline, ProductRef, Throttle, UserAgentProfile,
};
use tokio::runtime;

/// Category-walking product harvester
#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: SubCommand,
}

#[derive(Debug, clap::Subcommand)]
pub enum SubCommand {
    #[command(name = "crawl")]
    Crawl(CrawlArgs),
    #[command(name = "extract")]
    Extract(ExtractArgs),
    #[command(hide = true)]
    Completion,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum Format {
    Json,
    Csv,
}

impl From<Format> for OutputFormat {
    fn from(f: Format) -> Self {
        match f {
            Format::Json => Self::Json,
            Format::Csv => Self::Csv,
        }
    }
}

/// Walk the catalog and save every product
#[derive(Debug, clap::Args)]
pub struct CrawlArgs {
    /// Path to the output file that will contain scraped products
    #[arg(long, short)]
    pub output_file: PathBuf,
    /// Output format, guessed from the file extension when omitted
    #[arg(value_enum, long)]
    pub format: Option<Format>,
    /// Field delimiter for csv output
    #[arg(long, default_value_t = ',')]
    pub csv_delimiter: char,
    /// Terminate csv records with CRLF
    #[arg(long)]
    pub csv_crlf: bool,
    /// Catalog API base URL
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    pub base_url: String,
    /// Optional default crawler yaml configuration file
    #[arg(env = "HARVEST_CRAWLER_CONFIG", long)]
    pub crawler_config: Option<PathBuf>,
    /// JSON array of proxy URLs, replaces the configured pool
    #[arg(long)]
    pub proxies: Option<PathBuf>,
    /// JSON array of user agents (strings or objects with client hints)
    #[arg(long)]
    pub user_agents: Option<PathBuf>,
    /// Override crawler's number of workers
    #[arg(long)]
    pub concurrency: Option<usize>,
    /// Override crawler's batch size
    #[arg(long)]
    pub batch_size: Option<usize>,
    /// Override crawler's flush interval
    #[arg(long)]
    pub flush_interval_secs: Option<u64>,
    /// Override crawler's maximum retries per item
    #[arg(long)]
    pub max_retries: Option<u32>,
    /// Override crawler's behaviour when the work queue is full
    #[arg(value_enum, long)]
    pub on_queue_full: Option<OnQueueFull>,
    /// Where undeliverable records are appended as JSON lines
    #[arg(long)]
    pub overflow_file: Option<PathBuf>,
    /// Cap outbound requests per second
    #[arg(long)]
    pub requests_per_second: Option<NonZeroUsize>,
    /// Seed identity rotation for reproducible runs
    #[arg(long)]
    pub seed: Option<u64>,
    /// Also write the run summary as JSON to this file
    #[arg(long)]
    pub summary: Option<PathBuf>,
    /// No SIGINT handling, buffered records are lost on interrupt
    #[arg(long)]
    pub no_sigint: bool,
    /// When quiet no logs are outputted
    #[arg(long, short)]
    pub quiet: bool,
}

impl TryFrom<&CrawlArgs> for CrawlerConfig {
    type Error = anyhow::Error;

    fn try_from(args: &CrawlArgs) -> Result<Self, Self::Error> {
        let mut conf = if let Some(file) = args.crawler_config.as_ref().map(File::open) {
            serde_yaml::from_reader(file?)?
        } else {
            CrawlerConfig::default()
        };
        if let Some(path) = &args.proxies {
            conf.proxies = serde_json::from_reader::<_, Vec<String>>(File::open(path)?)?;
        }
        if let Some(path) = &args.user_agents {
            conf.user_agents =
                serde_json::from_reader::<_, Vec<UserAgentProfile>>(File::open(path)?)?;
        }
        if let Some(concurrency) = args.concurrency {
            conf.concurrency = concurrency;
        }
        if let Some(batch_size) = args.batch_size {
            conf.batch_size = batch_size;
        }
        if let Some(flush_interval_secs) = args.flush_interval_secs {
            conf.flush_interval_secs = flush_interval_secs;
        }
        if let Some(max_retries) = args.max_retries {
            conf.max_retries = max_retries;
        }
        if let Some(on_queue_full) = args.on_queue_full {
            conf.on_queue_full = on_queue_full;
        }
        if let Some(overflow_file) = &args.overflow_file {
            conf.overflow_path = Some(overflow_file.clone());
        }
        if let Some(rps) = args.requests_per_second {
            conf.throttle = Some(Throttle::PerSecond(rps));
        }
        if args.seed.is_some() {
            conf.seed = args.seed;
        }
        Ok(conf)
    }
}

impl From<&CrawlArgs> for CsvOptions {
    fn from(args: &CrawlArgs) -> Self {
        Self {
            delimiter: args.csv_delimiter,
            crlf: args.csv_crlf,
        }
    }
}

pub fn crawl(args: CrawlArgs) -> anyhow::Result<()> {
    let crawler_conf = CrawlerConfig::try_from(&args)?;
    crawler_conf.validate()?;
    let format = args
        .format
        .map(OutputFormat::from)
        .unwrap_or_else(|| OutputFormat::from_path(&args.output_file));

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let summary = rt.block_on(async {
        let parts = Collaborators {
            fetcher: Arc::new(HttpFetcher::new(&crawler_conf)?),
            rotator: Arc::new(IdentityRotator::from_config(&crawler_conf)?),
            extractor: Arc::new(BigBasketExtractor::new(args.base_url.as_str())),
            sink: Arc::new(
                FileSink::new(&args.output_file, format)?
                    .with_csv_options(CsvOptions::from(&args)),
            ),
        };
        let pipeline = Pipeline::new(crawler_conf, parts)?;

        if !args.no_sigint {
            let cancel = pipeline.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("Interrupted, flushing buffered records before exiting");
                    cancel.cancel();
                }
            });
        }

        Ok::<_, anyhow::Error>(pipeline.run(root_category()).await)
    })?;

    println!("{summary}");
    if let Some(path) = &args.summary {
        let mut file = File::create(path)?;
        serde_json::to_writer_pretty(&mut file, &summary)?;
        file.write_all(b"\n")?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum PayloadKind {
    Categories,
    Listing,
    Product,
}

/// Parse a saved API response and print what gets extracted from it
#[derive(Debug, clap::Args)]
pub struct ExtractArgs {
    /// A local JSON payload
    #[arg(long)]
    pub file: PathBuf,
    /// Which endpoint the payload was saved from
    #[arg(value_enum, long, default_value = "listing")]
    pub kind: PayloadKind,
    /// Category whose children to print, for category trees
    #[arg(long, default_value = ROOT_ID)]
    pub category: String,
}

pub fn extract(args: ExtractArgs) -> anyhow::Result<()> {
    let payload = Payload::new(200, fs::read_to_string(&args.file)?);
    let extractor = BigBasketExtractor::default();
    let leaf = LeafCategory::new(
        CategoryEntry::new(args.category.as_str(), args.category.as_str(), false),
        vec![],
    );
    let mut out = io::stdout().lock();

    match args.kind {
        PayloadKind::Categories => {
            let parent = if args.category == ROOT_ID {
                root_category()
            } else {
                CategoryEntry::new(args.category.as_str(), "", true)
            };
            let children = extractor.parse_category_page(&payload, &parent)?;
            serde_json::to_writer_pretty(&mut out, &children)?;
        }
        PayloadKind::Listing => {
            let page = extractor.parse_product_list_page(&payload, &leaf)?;
            log::info!("Listing reports {:?} pages", page.page_count);
            let records = page
                .products
                .iter()
                .filter_map(|p| match p {
                    ProductRef::Resolved(record) => Some(record.as_ref()),
                    ProductRef::Detail(url) => {
                        log::info!("Needs a detail fetch: {url}");
                        None
                    }
                    ProductRef::Unparsable { reference, reason } => {
                        log::warn!("Unparsable product {reference}: {reason}");
                        None
                    }
                })
                .collect::<Vec<_>>();
            serde_json::to_writer_pretty(&mut out, &records)?;
        }
        PayloadKind::Product => {
            let record = extractor.parse_product_detail(&payload, &leaf)?;
            serde_json::to_writer_pretty(&mut out, &record)?;
        }
    }
    writeln!(out)?;
    Ok(())
}

fn init_logger(default_filter: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.cmd {
        SubCommand::Crawl(args) => {
            if !args.quiet {
                init_logger("harvest_crawler=info,harvest_bigbasket=info");
            }
            crawl(args)
        }
        SubCommand::Extract(args) => {
            init_logger("harvest_bigbasket=info");
            extract(args)
        }
        SubCommand::Completion => {
            generate(Shell::Bash, &mut Args::command(), "harvest", &mut io::stdout());
            Ok(())
        }
    }
}
