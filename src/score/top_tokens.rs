use std::cmp::Ordering;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::config::ScoreConfig;
use crate::error::{ArtmError, Result};
use crate::model::phi_matrix::PhiMatrix;
use crate::model::token::DEFAULT_CLASS;
use crate::score::{ScoreCalculator, ScoreData, TopTokensScore, TopicTopTokens};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopTokensConfig {
    pub num_tokens: usize,
    pub class_id: String,
    pub topic_name: Vec<String>,
}

impl Default for TopTokensConfig {
    fn default() -> Self {
        Self {
            num_tokens: 10,
            class_id: DEFAULT_CLASS.to_string(),
            topic_name: Vec::new(),
        }
    }
}

/// Highest weighted tokens of every topic.
#[derive(Debug)]
pub struct TopTokens {
    name: String,
    params: TopTokensConfig,
}

impl TopTokens {
    pub const TYPE_NAME: &'static str = "TopTokens";

    pub fn from_config(config: &ScoreConfig) -> Result<Self> {
        let params: TopTokensConfig = config.params()?;
        if params.num_tokens == 0 {
            return Err(ArtmError::out_of_range("num_tokens", 0));
        }
        Ok(Self {
            name: config.name.clone(),
            params,
        })
    }
}

impl ScoreCalculator for TopTokens {
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
        ScoreData::TopTokens(TopTokensScore::default())
    }

    fn calculate_score(&self, pwt: &dyn PhiMatrix) -> Option<ScoreData> {
        let class_tokens: Vec<usize> = (0..pwt.token_size())
            .filter(|&w| pwt.token(w).class_id == self.params.class_id)
            .collect();
        let topics: Vec<usize> = (0..pwt.topic_size())
            .filter(|&t| self.params.topic_name.is_empty() || self.params.topic_name.iter().any(|n| n == pwt.topic_name(t)))
            .collect();

        let topics = topics
            .par_iter()
            .map(|&t| {
                let mut weights: Vec<(usize, f32)> = class_tokens
                    .iter()
                    .map(|&w| (w, pwt.get(w, t)))
                    .filter(|&(_, p)| p > 0.0)
                    .collect();
                // 同値は token index 順
                weights.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal).then(a.0.cmp(&b.0)));
                weights.truncate(self.params.num_tokens);
                TopicTopTokens {
                    topic_name: pwt.topic_name(t).to_string(),
                    tokens: weights.into_iter().map(|(w, p)| (pwt.token(w).clone(), p)).collect(),
                }
            })
            .collect();
        Some(ScoreData::TopTokens(TopTokensScore { topics }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::phi_matrix::DensePhiMatrix;
    use crate::model::token::Token;

    #[test]
    fn tokens_sorted_by_weight() {
        let mut pwt = DensePhiMatrix::new("pwt", vec!["t0".into(), "t1".into()]);
        for (w, row) in [("a", [0.1f32, 0.6]), ("b", [0.7, 0.0]), ("c", [0.2, 0.4])] {
            let id = pwt.add_token(Token::word(w));
            pwt.set_row(id, &row);
        }
        let params = TopTokensConfig { num_tokens: 2, ..Default::default() };
        let calc = TopTokens::from_config(&ScoreConfig::new("top", TopTokens::TYPE_NAME, &params).unwrap()).unwrap();
        let Some(ScoreData::TopTokens(score)) = calc.calculate_score(&pwt) else { panic!("wrong variant") };

        assert_eq!(score.topics.len(), 2);
        let t0: Vec<&str> = score.topics[0].tokens.iter().map(|(t, _)| t.keyword.as_str()).collect();
        assert_eq!(t0, vec!["b", "c"]);
        let t1: Vec<&str> = score.topics[1].tokens.iter().map(|(t, _)| t.keyword.as_str()).collect();
        assert_eq!(t1, vec!["a", "c"]);
    }
}
