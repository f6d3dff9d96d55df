pub mod items_processed;
pub mod manager;
pub mod perplexity;
pub mod sparsity_phi;
pub mod sparsity_theta;
pub mod top_tokens;

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::batch::Batch;
use crate::config::ScoreConfig;
use crate::error::{ArtmError, Result};
use crate::model::phi_matrix::PhiMatrix;
use crate::model::token::Token;

pub use items_processed::ItemsProcessed;
pub use manager::{ScoreManager, ScoreTracker};
pub use perplexity::Perplexity;
pub use sparsity_phi::SparsityPhi;
pub use sparsity_theta::SparsityTheta;
pub use top_tokens::TopTokens;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemsProcessedScore {
    pub num_items: u64,
    pub num_batches: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PerplexityScore {
    /// `exp(-raw / normalizer)`
    pub value: f64,
    /// Σ n_dw ln p(w|d)
    pub raw: f64,
    /// Σ n_dw
    pub normalizer: f64,
    /// token occurrences whose p(w|d) was zero
    pub zero_words: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SparsityScore {
    /// `zero / total`
    pub value: f64,
    pub zero: u64,
    pub total: u64,
}

impl SparsityScore {
    pub fn new(zero: u64, total: u64) -> Self {
        let value = if total > 0 { zero as f64 / total as f64 } else { 0.0 };
        Self { value, zero, total }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicTopTokens {
    pub topic_name: String,
    pub tokens: Vec<(Token, f32)>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopTokensScore {
    pub topics: Vec<TopicTopTokens>,
}

/// Value of a score, one variant per score type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScoreData {
    ItemsProcessed(ItemsProcessedScore),
    Perplexity(PerplexityScore),
    SparsityTheta(SparsityScore),
    SparsityPhi(SparsityScore),
    TopTokens(TopTokensScore),
}

impl ScoreData {
    /// Fold `other` into `self`.
    ///
    /// # Errors
    /// `InvalidOperation` when the two values are of different variants;
    /// `self` is left untouched.
    pub fn append(&mut self, other: &ScoreData) -> Result<()> {
        match (self, other) {
            (ScoreData::ItemsProcessed(a), ScoreData::ItemsProcessed(b)) => {
                a.num_items += b.num_items;
                a.num_batches += b.num_batches;
            }
            (ScoreData::Perplexity(a), ScoreData::Perplexity(b)) => {
                a.raw += b.raw;
                a.normalizer += b.normalizer;
                a.zero_words += b.zero_words;
                a.value = perplexity::perplexity_value(a.raw, a.normalizer);
            }
            (ScoreData::SparsityTheta(a), ScoreData::SparsityTheta(b)) => {
                *a = SparsityScore::new(a.zero + b.zero, a.total + b.total);
            }
            // point-in-time: the newer value wins
            (ScoreData::SparsityPhi(a), ScoreData::SparsityPhi(b)) => *a = *b,
            (ScoreData::TopTokens(a), ScoreData::TopTokens(b)) => *a = b.clone(),
            (a, b) => {
                return Err(ArtmError::invalid(format!("score variant mismatch: {} vs {}", a.kind(), b.kind())));
            }
        }
        Ok(())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ScoreData::ItemsProcessed(_) => ItemsProcessed::TYPE_NAME,
            ScoreData::Perplexity(_) => Perplexity::TYPE_NAME,
            ScoreData::SparsityTheta(_) => SparsityTheta::TYPE_NAME,
            ScoreData::SparsityPhi(_) => SparsityPhi::TYPE_NAME,
            ScoreData::TopTokens(_) => TopTokens::TYPE_NAME,
        }
    }
}

/// One processed document as seen by a cumulative score.
pub struct ItemScoreInput<'a> {
    pub batch: &'a Batch,
    pub item_index: usize,
    /// `(batch token id, n_dw)` of every token occurrence
    pub tokens: &'a [(usize, f32)],
    pub pwt: &'a dyn PhiMatrix,
    /// batch token id → Pwt token id
    pub pwt_index: &'a [Option<usize>],
    /// final topic distribution of the document
    pub theta: &'a [f32],
}

/// Score calculator contract.
///
/// Cumulative scores are appended per item / per batch by the processors and
/// merged in the score managers; the others are computed from a Pwt on
/// request.
pub trait ScoreCalculator: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;
    fn score_type(&self) -> &'static str;
    fn is_cumulative(&self) -> bool;

    /// Empty value of the right variant.
    fn create_score(&self) -> ScoreData;

    fn append_item_score(&self, _input: &ItemScoreInput<'_>, _score: &mut ScoreData) {}

    fn append_batch_score(&self, _batch: &Batch, _score: &mut ScoreData) {}

    fn calculate_score(&self, _pwt: &dyn PhiMatrix) -> Option<ScoreData> {
        None
    }

    fn append_score(&self, src: &ScoreData, dst: &mut ScoreData) -> Result<()> {
        dst.append(src)
    }
}

type ScoreCtor = fn(&ScoreConfig) -> Result<Arc<dyn ScoreCalculator>>;

/// Type tag → constructor registry.
pub struct ScoreFactory {
    ctors: IndexMap<&'static str, ScoreCtor>,
}

impl fmt::Debug for ScoreFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ctors.keys()).finish()
    }
}

impl Default for ScoreFactory {
    fn default() -> Self {
        let mut factory = Self { ctors: IndexMap::new() };
        factory.register(ItemsProcessed::TYPE_NAME, |c| ItemsProcessed::from_config(c).map(|s| Arc::new(s) as Arc<dyn ScoreCalculator>));
        factory.register(Perplexity::TYPE_NAME, |c| Perplexity::from_config(c).map(|s| Arc::new(s) as Arc<dyn ScoreCalculator>));
        factory.register(SparsityTheta::TYPE_NAME, |c| SparsityTheta::from_config(c).map(|s| Arc::new(s) as Arc<dyn ScoreCalculator>));
        factory.register(SparsityPhi::TYPE_NAME, |c| SparsityPhi::from_config(c).map(|s| Arc::new(s) as Arc<dyn ScoreCalculator>));
        factory.register(TopTokens::TYPE_NAME, |c| TopTokens::from_config(c).map(|s| Arc::new(s) as Arc<dyn ScoreCalculator>));
        factory
    }
}

impl ScoreFactory {
    pub fn register(&mut self, type_name: &'static str, ctor: ScoreCtor) {
        self.ctors.insert(type_name, ctor);
    }

    pub fn create(&self, config: &ScoreConfig) -> Result<Arc<dyn ScoreCalculator>> {
        match self.ctors.get(config.type_name.as_str()) {
            Some(ctor) => ctor(config),
            None => Err(ArtmError::unknown_type("score", config.type_name.clone())),
        }
    }
}
