//! Domain types shared by every stage of the pipeline

use basket_recs_core::PipelineError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Raw receipt identifier as found in the line-item files
pub type ReceiptId = i64;

/// Raw item identifier as found in the line-item files
pub type ItemId = i64;

/// One purchase record
///
/// `quantity` may be fractional (weighed goods) or negative (returns); an
/// empty cell is read as `None` and ignored by the aggregations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub receipt_id: ReceiptId,
    pub item_id: ItemId,
    #[serde(default)]
    pub quantity: Option<f32>,
    #[serde(default)]
    pub price: Option<f32>,
    #[serde(default)]
    pub name: Option<String>,
}

impl LineItem {
    pub fn new(receipt_id: ReceiptId, item_id: ItemId, quantity: f32) -> Self {
        Self {
            receipt_id,
            item_id,
            quantity: Some(quantity),
            price: None,
            name: None,
        }
    }

    pub fn with_price(mut self, price: f32) -> Self {
        self.price = Some(price);
        self
    }
}

/// The four retrieval models of the ensemble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Bm25,
    Tfidf,
    Cosine,
    Als,
}

impl ModelKind {
    pub const ALL: [ModelKind; 4] = [
        ModelKind::Bm25,
        ModelKind::Tfidf,
        ModelKind::Cosine,
        ModelKind::Als,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Bm25 => "bm25",
            ModelKind::Tfidf => "tfidf",
            ModelKind::Cosine => "cosine",
            ModelKind::Als => "als",
        }
    }

    /// Similarity models score from the normalized matrix, ALS from the raw one
    pub fn uses_normalized_matrix(&self) -> bool {
        !matches!(self, ModelKind::Als)
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bm25" => Ok(ModelKind::Bm25),
            "tfidf" => Ok(ModelKind::Tfidf),
            "cosine" => Ok(ModelKind::Cosine),
            "als" => Ok(ModelKind::Als),
            other => Err(PipelineError::InvalidInput(format!(
                "unknown model name '{}'",
                other
            ))),
        }
    }
}

/// Candidate in matrix index space, before decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodedCandidate {
    pub receipt_idx: usize,
    pub item_idx: usize,
    pub model_name: ModelKind,
}

/// Candidate row with raw identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Candidate {
    pub receipt_id: ReceiptId,
    pub item_id: ItemId,
    pub model_name: ModelKind,
}

/// Final output: one (or k) items per receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub receipt_id: ReceiptId,
    pub item_id: ItemId,
    pub score: f32,
    /// 1-based position within the receipt
    pub rank: usize,
}

/// Held-out item per receipt used for evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub receipt_id: ReceiptId,
    pub item_id: ItemId,
}
