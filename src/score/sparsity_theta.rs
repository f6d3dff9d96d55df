use serde::{Deserialize, Serialize};

use crate::config::ScoreConfig;
use crate::error::Result;
use crate::score::{ItemScoreInput, ScoreCalculator, ScoreData, SparsityScore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SparsityThetaConfig {
    pub topic_name: Vec<String>,
    pub eps: f32,
}

impl Default for SparsityThetaConfig {
    fn default() -> Self {
        Self {
            topic_name: Vec::new(),
            eps: 1e-37,
        }
    }
}

/// Share of (document, topic) weights below `eps`.
#[derive(Debug)]
pub struct SparsityTheta {
    name: String,
    params: SparsityThetaConfig,
}

impl SparsityTheta {
    pub const TYPE_NAME: &'static str = "SparsityTheta";

    pub fn from_config(config: &ScoreConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            params: config.params()?,
        })
    }
}

impl ScoreCalculator for SparsityTheta {
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
        ScoreData::SparsityTheta(SparsityScore::default())
    }

    fn append_item_score(&self, input: &ItemScoreInput<'_>, score: &mut ScoreData) {
        let ScoreData::SparsityTheta(s) = score else {
            return;
        };
        let topic_names = input.pwt.topic_names();
        let mut zero = 0u64;
        let mut total = 0u64;
        for (t, value) in input.theta.iter().enumerate() {
            if !self.params.topic_name.is_empty() && !self.params.topic_name.contains(&topic_names[t]) {
                continue;
            }
            total += 1;
            if value.abs() < self.params.eps {
                zero += 1;
            }
        }
        *s = SparsityScore::new(s.zero + zero, s.total + total);
    }
}
