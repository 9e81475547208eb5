use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::identity::Identity;

/// A category as announced by its parent's page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    pub has_children: bool,
}

impl CategoryEntry {
    pub fn new(id: impl Into<String>, name: impl Into<String>, has_children: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            slug: None,
            kind: None,
            has_children,
        }
    }

    /// The entry a walk starts from; always fetched.
    pub fn root(id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(id.clone(), id, true)
    }
}

pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryNode {
    pub entry: CategoryEntry,
    /// Index of the parent in the owning [`CategoryTree`], `None` for the root.
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl CategoryNode {
    /// A node that failed expansion still claims children and is no leaf.
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty() && !self.entry.has_children
    }
}

/// A discovered subtree, assembled bottom-up by the walker.
#[derive(Debug, Clone)]
pub struct Subtree {
    pub entry: CategoryEntry,
    pub children: Vec<Subtree>,
}

/// Immutable arena holding the whole taxonomy. Parents are referenced by
/// index so paths can be rebuilt without owning cycles.
#[derive(Debug, Clone, Default)]
pub struct CategoryTree {
    nodes: Vec<CategoryNode>,
}

impl CategoryTree {
    pub fn root(&self) -> Option<&CategoryNode> {
        self.nodes.first()
    }

    pub fn get(&self, id: NodeId) -> Option<&CategoryNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Names from the root's first child down to `id`. The root itself is
    /// the catalog entry point and not part of any product path.
    pub fn path(&self, id: NodeId) -> Vec<String> {
        let mut path = vec![];
        let mut cur = Some(id);
        while let Some(node) = cur.and_then(|i| self.nodes.get(i)) {
            if node.parent.is_some() {
                path.push(node.entry.name.clone());
            }
            cur = node.parent;
        }
        path.reverse();
        path
    }

    pub fn leaves(&self) -> impl Iterator<Item = LeafCategory> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.is_leaf() && node.parent.is_some())
            .map(|(id, node)| LeafCategory::new(node.entry.clone(), self.path(id)))
    }

    fn insert(&mut self, subtree: Subtree, parent: Option<NodeId>) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(CategoryNode {
            entry: subtree.entry,
            parent,
            children: vec![],
        });
        let children = subtree
            .children
            .into_iter()
            .map(|child| self.insert(child, Some(id)))
            .collect();
        self.nodes[id].children = children;
        id
    }
}

impl From<Subtree> for CategoryTree {
    fn from(subtree: Subtree) -> Self {
        let mut tree = Self::default();
        tree.insert(subtree, None);
        tree
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafCategory {
    pub entry: CategoryEntry,
    /// Main / Mid / Leaf names, outermost first.
    pub path: Vec<String>,
}

impl LeafCategory {
    pub fn new(entry: CategoryEntry, path: Vec<String>) -> Self {
        Self { entry, path }
    }

    pub fn main(&self) -> &str {
        self.path.first().map(String::as_str).unwrap_or_default()
    }

    pub fn mid(&self) -> &str {
        match self.path.len() {
            0..=2 => "",
            _ => &self.path[1],
        }
    }

    pub fn leaf(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }
}

impl fmt::Display for LeafCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.entry.id, self.path.join(" > "))
    }
}

/// A category that could not be expanded after all retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryError {
    pub category_id: String,
    pub path: Vec<String>,
    pub attempts: u32,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub enum Discovered {
    Leaf(LeafCategory),
    Error(DiscoveryError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub product_id: u64,
    pub name: String,
    pub brand: String,
    pub url: String,
    pub images: Vec<String>,
    pub unit: String,
    pub quantity_label: String,
    pub price_mrp: Option<f64>,
    pub price_sp: Option<f64>,
    pub discount_percent: Option<f64>,
    pub is_best_value: bool,
    pub available_quantity: u32,
    pub availability_code: String,
    pub category_main: String,
    pub category_mid: String,
    pub category_leaf: String,
    pub created_at_on_web_site: Option<String>,
    pub updated_at_on_web_site: Option<String>,
}

impl ProductRecord {
    /// Recomputes `discount_percent` from the two prices, rounded to 2 decimals.
    pub fn with_derived_discount(mut self) -> Self {
        self.discount_percent = match (self.price_mrp, self.price_sp) {
            (Some(mrp), Some(sp)) if mrp > 0.0 => {
                Some((((mrp - sp) / mrp) * 100.0 * 100.0).round() / 100.0)
            }
            _ => None,
        };
        self
    }

    /// Fills empty category columns from the leaf the record was found under.
    pub fn with_category_fallback(mut self, leaf: &LeafCategory) -> Self {
        if self.category_main.is_empty() {
            self.category_main = leaf.main().to_string();
        }
        if self.category_mid.is_empty() {
            self.category_mid = leaf.mid().to_string();
        }
        if self.category_leaf.is_empty() {
            self.category_leaf = leaf.leaf().to_string();
        }
        self
    }

    pub fn validate(&self) -> Result<(), ParseError> {
        if self.product_id == 0 {
            return Err(ParseError::new("missing product id"));
        }
        if let (Some(mrp), Some(sp)) = (self.price_mrp, self.price_sp) {
            if sp > mrp {
                return Err(ParseError(format!(
                    "product {}: selling price {sp} above mrp {mrp}",
                    self.product_id
                )));
            }
        }
        Ok(())
    }
}

/// What a listing page points at.
#[derive(Debug, Clone, PartialEq)]
pub enum ProductRef {
    /// Needs a detail fetch.
    Detail(String),
    /// The listing already carried the full record.
    Resolved(Box<ProductRecord>),
    /// An entry the extractor could not make sense of. Counted as a failed
    /// product so it shows up in the run report.
    Unparsable { reference: String, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingPage {
    pub products: Vec<ProductRef>,
    /// Total number of listing pages for the leaf, when the payload reports it.
    pub page_count: Option<u32>,
}

#[derive(Debug, Clone)]
pub enum WorkKind {
    /// Enumerate one listing page of a leaf category (pages start at 1).
    Listing { leaf: Arc<LeafCategory>, page: u32 },
    /// Fetch and parse one product detail page.
    Product { url: String, leaf: Arc<LeafCategory> },
    /// Hand a record the sink rejected back to the batch buffer.
    RePersist { record: Box<ProductRecord> },
}

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub kind: WorkKind,
    pub retries: u32,
    /// Identity that got blocked on the previous attempt.
    pub avoid: Option<Identity>,
}

impl WorkItem {
    pub fn new(kind: WorkKind) -> Self {
        Self {
            kind,
            retries: 0,
            avoid: None,
        }
    }

    pub fn listing(leaf: impl Into<Arc<LeafCategory>>, page: u32) -> Self {
        Self::new(WorkKind::Listing {
            leaf: leaf.into(),
            page,
        })
    }

    pub fn product(url: impl Into<String>, leaf: Arc<LeafCategory>) -> Self {
        Self::new(WorkKind::Product {
            url: url.into(),
            leaf,
        })
    }

    pub fn re_persist(record: ProductRecord, retries: u32) -> Self {
        Self {
            kind: WorkKind::RePersist {
                record: Box::new(record),
            },
            retries,
            avoid: None,
        }
    }

    /// A copy for the next attempt.
    pub fn retry(&self, avoid: Option<Identity>) -> Self {
        Self {
            kind: self.kind.clone(),
            retries: self.retries + 1,
            avoid,
        }
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            WorkKind::Listing { leaf, page } => write!(f, "listing {leaf} page {page}"),
            WorkKind::Product { url, .. } => write!(f, "product {url}"),
            WorkKind::RePersist { record } => write!(f, "re-persist {}", record.product_id),
        }
    }
}
