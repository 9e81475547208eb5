mod extractor;
mod sink;

pub use extractor::{root_category, BigBasketExtractor, DEFAULT_BASE_URL, ROOT_ID};
pub use sink::{CsvOptions, FileSink, OutputFormat};
