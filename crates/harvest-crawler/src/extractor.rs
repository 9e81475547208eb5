use crate::error::ParseError;
use crate::fetch::Payload;
use crate::model::{CategoryEntry, LeafCategory, ListingPage, ProductRecord};

/// Site-specific knowledge: where pages live and how to read them.
pub trait Extractor: Send + Sync {
    fn category_target(&self, category: &CategoryEntry) -> String;

    fn listing_target(&self, leaf: &LeafCategory, page: u32) -> String;

    fn parse_category_page(
        &self,
        payload: &Payload,
        parent: &CategoryEntry,
    ) -> Result<Vec<CategoryEntry>, ParseError>;

    fn parse_product_list_page(
        &self,
        payload: &Payload,
        leaf: &LeafCategory,
    ) -> Result<ListingPage, ParseError>;

    fn parse_product_detail(
        &self,
        payload: &Payload,
        leaf: &LeafCategory,
    ) -> Result<ProductRecord, ParseError>;
}
