use harvest_crawler::{
    CategoryEntry, Extractor, LeafCategory, ListingPage, ParseError, Payload, ProductRecord,
    ProductRef,
};
use serde::Deserialize;
use serde_json::Value;

pub const DEFAULT_BASE_URL: &str = "https://www.bigbasket.com/";

/// Id of the entry the walk starts from. The tree endpoint returns the
/// whole taxonomy, so the root has no id of its own on the site.
pub const ROOT_ID: &str = "catalog";

const CATEGORY_TREE: &str = "ui-svc/v1/category-tree";
const PRODUCT_LISTING: &str = "listing-svc/v2/products";

pub fn root_category() -> CategoryEntry {
    CategoryEntry::root(ROOT_ID)
}

/// Reads the grocery catalog JSON API.
#[derive(Debug, Clone)]
pub struct BigBasketExtractor {
    base_url: String,
}

impl Default for BigBasketExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_URL)
    }
}

impl BigBasketExtractor {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self { base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn absolute(&self, url: &str) -> String {
        match url.strip_prefix('/') {
            Some(path) => format!("{}{path}", self.base_url),
            None => url.to_string(),
        }
    }

    fn record(&self, product: ApiProduct) -> Result<ProductRecord, ParseError> {
        let product_id = id_of(&product.id)
            .filter(|&id| id > 0)
            .ok_or_else(|| ParseError(format!("product without id: {}", product.id)))?;

        let record = ProductRecord {
            product_id,
            name: product.desc,
            brand: product.brand.name,
            url: self.absolute(&product.absolute_url),
            images: product.images.into_iter().filter_map(|i| i.l).collect(),
            unit: product.unit,
            quantity_label: text_of(&product.magnitude),
            price_mrp: paise(&product.pricing.discount.mrp),
            price_sp: paise(&product.pricing.discount.prim_price.sp),
            discount_percent: None,
            is_best_value: product.is_best_value,
            available_quantity: product.sku_max_quantity,
            availability_code: product.availability.avail_status,
            category_main: product.category.tlc_name,
            category_mid: product.category.mlc_name,
            category_leaf: product.category.llc_name,
            created_at_on_web_site: product.parent_info.as_ref().and_then(|p| p.created_on.clone()),
            updated_at_on_web_site: product.parent_info.and_then(|p| p.updated_on),
        };
        Ok(record.with_derived_discount())
    }
}

impl Extractor for BigBasketExtractor {
    fn category_target(&self, _category: &CategoryEntry) -> String {
        format!("{}{CATEGORY_TREE}", self.base_url)
    }

    fn listing_target(&self, leaf: &LeafCategory, page: u32) -> String {
        format!(
            "{}{PRODUCT_LISTING}?type={}&slug={}&page={page}",
            self.base_url,
            leaf.entry.kind.as_deref().unwrap_or_default(),
            leaf.entry.slug.as_deref().unwrap_or(&leaf.entry.id),
        )
    }

    fn parse_category_page(
        &self,
        payload: &Payload,
        parent: &CategoryEntry,
    ) -> Result<Vec<CategoryEntry>, ParseError> {
        let tree: CategoryTreeResponse = serde_json::from_str(&payload.body)?;
        let children = if parent.id == ROOT_ID {
            &tree.categories
        } else {
            find(&tree.categories, &parent.id)
                .map(|node| &node.children)
                .ok_or_else(|| ParseError(format!("category {} not in tree", parent.id)))?
        };
        Ok(children.iter().map(ApiCategory::entry).collect())
    }

    fn parse_product_list_page(
        &self,
        payload: &Payload,
        leaf: &LeafCategory,
    ) -> Result<ListingPage, ParseError> {
        let listing: ListingResponse = serde_json::from_str(&payload.body)?;
        let info = listing
            .tabs
            .into_iter()
            .next()
            .and_then(|tab| tab.product_info)
            .ok_or_else(|| ParseError::new("listing without product_info"))?;

        let mut products = Vec::with_capacity(info.products.len());
        for (index, raw) in info.products.into_iter().enumerate() {
            let reference = match raw.get("id") {
                Some(serde_json::Value::String(id)) => id.clone(),
                Some(id) => id.to_string(),
                None => format!("#{index} of {leaf}"),
            };
            // One bad entry does not spoil the page.
            let parsed = serde_json::from_value::<ApiProduct>(raw)
                .map_err(ParseError::from)
                .and_then(|p| self.record(p));
            products.push(match parsed {
                Ok(record) => ProductRef::Resolved(Box::new(record)),
                Err(e) => {
                    log::warn!("Unparsable product {reference} in {leaf}: {e}");
                    ProductRef::Unparsable {
                        reference,
                        reason: e.to_string(),
                    }
                }
            });
        }

        Ok(ListingPage {
            products,
            page_count: Some(info.number_of_pages.max(1)),
        })
    }

    fn parse_product_detail(
        &self,
        payload: &Payload,
        _leaf: &LeafCategory,
    ) -> Result<ProductRecord, ParseError> {
        let product: ApiProduct = serde_json::from_str(&payload.body)?;
        self.record(product)
    }
}

fn find<'a>(nodes: &'a [ApiCategory], id: &str) -> Option<&'a ApiCategory> {
    nodes.iter().find_map(|node| {
        if text_of(&node.id) == id {
            Some(node)
        } else {
            find(&node.children, id)
        }
    })
}

fn id_of(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn text_of(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Prices come in paise; zero or missing means unknown.
fn paise(v: &Value) -> Option<f64> {
    let amount = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;
    (amount > 0.0).then(|| amount / 100.0)
}

#[derive(Debug, Deserialize)]
struct CategoryTreeResponse {
    #[serde(default)]
    categories: Vec<ApiCategory>,
}

#[derive(Debug, Deserialize)]
struct ApiCategory {
    id: Value,
    #[serde(default)]
    name: String,
    #[serde(default)]
    slug: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    children: Vec<ApiCategory>,
}

impl ApiCategory {
    fn entry(&self) -> CategoryEntry {
        CategoryEntry {
            id: text_of(&self.id),
            name: self.name.clone(),
            slug: self.slug.clone(),
            kind: self.kind.clone(),
            has_children: !self.children.is_empty(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListingResponse {
    #[serde(default)]
    tabs: Vec<Tab>,
}

#[derive(Debug, Deserialize)]
struct Tab {
    product_info: Option<ProductInfo>,
}

#[derive(Debug, Deserialize)]
struct ProductInfo {
    #[serde(default = "default_number_of_pages")]
    number_of_pages: u32,
    #[serde(default)]
    products: Vec<Value>,
}

fn default_number_of_pages() -> u32 {
    1
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiProduct {
    id: Value,
    desc: String,
    brand: Brand,
    absolute_url: String,
    unit: String,
    magnitude: Value,
    images: Vec<Image>,
    pricing: Pricing,
    availability: Availability,
    is_best_value: bool,
    sku_max_quantity: u32,
    category: ApiProductCategory,
    parent_info: Option<ParentInfo>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Brand {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Image {
    l: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Pricing {
    discount: Discount,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Discount {
    mrp: Value,
    prim_price: PrimPrice,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PrimPrice {
    sp: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Availability {
    avail_status: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ApiProductCategory {
    tlc_name: String,
    mlc_name: String,
    llc_name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ParentInfo {
    created_on: Option<String>,
    updated_on: Option<String>,
}
