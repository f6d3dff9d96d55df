use serde::{Deserialize, Serialize};

use crate::config::ScoreConfig;
use crate::error::Result;
use crate::model::phi_matrix::PhiMatrix;
use crate::score::{ItemScoreInput, PerplexityScore, ScoreCalculator, ScoreData};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerplexityConfig {
    /// classes whose tokens are scored; empty means all
    pub class_id: Vec<String>,
}

/// `exp(-Σ n_dw ln p(w|d) / Σ n_dw)` over processed documents.
#[derive(Debug)]
pub struct Perplexity {
    name: String,
    params: PerplexityConfig,
}

impl Perplexity {
    pub const TYPE_NAME: &'static str = "Perplexity";

    pub fn from_config(config: &ScoreConfig) -> Result<Self> {
        Ok(Self {
            name: config.name.clone(),
            params: config.params()?,
        })
    }
}

pub(crate) fn perplexity_value(raw: f64, normalizer: f64) -> f64 {
    if normalizer > 0.0 {
        (-raw / normalizer).exp()
    } else {
        0.0
    }
}

impl ScoreCalculator for Perplexity {
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
        ScoreData::Perplexity(PerplexityScore::default())
    }

    fn append_item_score(&self, input: &ItemScoreInput<'_>, score: &mut ScoreData) {
        let ScoreData::Perplexity(s) = score else {
            return;
        };
        for &(token_id, n_dw) in input.tokens {
            if n_dw <= 0.0 {
                continue;
            }
            if !self.params.class_id.is_empty()
                && !self.params.class_id.iter().any(|c| c == input.batch.class_of(token_id))
            {
                continue;
            }
            let p_dw = match input.pwt_index[token_id] {
                Some(pwt_id) => (0..input.pwt.topic_size())
                    .map(|t| input.pwt.get(pwt_id, t) * input.theta[t])
                    .sum::<f32>(),
                None => 0.0,
            };
            s.normalizer += n_dw as f64;
            if p_dw > 0.0 {
                s.raw += n_dw as f64 * (p_dw as f64).ln();
            } else {
                s.zero_words += 1;
            }
        }
        s.value = perplexity_value(s.raw, s.normalizer);
    }
}
