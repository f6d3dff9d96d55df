use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::ScoreConfig;
use crate::error::Result;
use crate::model::phi_matrix::PhiMatrix;
use crate::model::token::DEFAULT_CLASS;
use crate::score::{ScoreCalculator, ScoreData, SparsityScore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SparsityPhiConfig {
    pub class_id: String,
    pub topic_name: Vec<String>,
    pub eps: f32,
}

impl Default for SparsityPhiConfig {
    fn default() -> Self {
        Self {
            class_id: DEFAULT_CLASS.to_string(),
            topic_name: Vec::new(),
            eps: 1e-37,
        }
    }
}

/// Share of Pwt cells of one class below `eps`.
#[derive(Debug)]
pub struct SparsityPhi {
    name: String,
    params: SparsityPhiConfig,
}

impl SparsityPhi {
    pub const TYPE_NAME: &'static str = "SparsityPhi";

    pub fn from_config(config: &ScoreConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            params: config.params()?,
        })
    }
}

impl ScoreCalculator for SparsityPhi {
    fn name(&self) -> &str {
        &self.name
    }

    fn score_type(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn is_cumulative(&self) -> bool {
        false
    }

    fn create_score(&self) -> ScoreData {
        ScoreData::SparsityPhi(SparsityScore::default())
    }

    fn calculate_score(&self, pwt: &dyn PhiMatrix) -> Option<ScoreData> {
        let topics: Vec<usize> = (0..pwt.topic_size())
            .filter(|&t| self.params.topic_name.is_empty() || self.params.topic_name.iter().any(|n| n == pwt.topic_name(t)))
            .collect();
        let eps = self.params.eps;
        let (zero, total) = (0..pwt.token_size())
            .into_par_iter()
            .filter(|&w| pwt.token(w).class_id == self.params.class_id)
            .map(|w| {
                let zero = topics.iter().filter(|&&t| pwt.get(w, t).abs() < eps).count() as u64;
                (zero, topics.len() as u64)
            })
            .reduce(|| (0, 0), |a, b| (a.0 + b.0, a.1 + b.1));
        Some(ScoreData::SparsityPhi(SparsityScore::new(zero, total)))
    }
}
