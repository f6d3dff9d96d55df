use crate::batch::Batch;
use crate::config::ScoreConfig;
use crate::error::Result;
use crate::score::{ItemScoreInput, ItemsProcessedScore, ScoreCalculator, ScoreData};

/// Number of processed documents and batches.
///
/// A pass that silently skipped every batch shows up here as zero.
#[derive(Debug)]
pub struct ItemsProcessed {
    name: String,
}

impl ItemsProcessed {
    pub const TYPE_NAME: &'static str = "ItemsProcessed";

    pub fn from_config(config: &ScoreConfig) -> Result<Self> {
        Ok(Self { name: config.name.clone() })
    }
}

impl ScoreCalculator for ItemsProcessed {
    fn name(&self) -> &str {
        &self.name
    }

    fn score_type(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn is_cumulative(&self) -> bool {
        true
    }

    fn create_score(&self) -> ScoreData {
        ScoreData::ItemsProcessed(ItemsProcessedScore::default())
    }

    fn append_item_score(&self, _input: &ItemScoreInput<'_>, score: &mut ScoreData) {
        if let ScoreData::ItemsProcessed(s) = score {
            s.num_items += 1;
        }
    }

    fn append_batch_score(&self, _batch: &Batch, score: &mut ScoreData) {
        if let ScoreData::ItemsProcessed(s) = score {
            s.num_batches += 1;
        }
    }
}
