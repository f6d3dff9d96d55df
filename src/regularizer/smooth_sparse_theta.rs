use std::collections::HashSet;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::config::RegularizerConfig;
use crate::error::Result;
use crate::regularizer::{check_type, topic_mask, AgentContext, RegularizeThetaAgent, Regularizer};

/// Parameters of [`SmoothSparseTheta`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothSparseThetaConfig {
    /// topics to regularize; empty means all
    pub topic_name: Vec<String>,
    /// per inner pass multiplier; passes beyond the list use 1
    pub alpha_iter: Vec<f32>,
    /// restrict to documents with these titles; empty means all
    pub item_title: Vec<String>,
}

/// Smoothing (tau > 0) or sparsing (tau < 0) of document distributions:
/// `r_td = tau * alpha(iter)` for the selected topics.
#[derive(Debug)]
pub struct SmoothSparseTheta {
    params: RwLock<SmoothSparseThetaConfig>,
}

impl SmoothSparseTheta {
    pub const TYPE_NAME: &'static str = "SmoothSparseTheta";

    pub fn from_config(config: &RegularizerConfig) -> Result<Self> {
        check_type(Self::TYPE_NAME, config)?;
        Ok(Self {
            params: RwLock::new(config.params()?),
        })
    }

    fn params(&self) -> SmoothSparseThetaConfig {
        self.params.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Regularizer for SmoothSparseTheta {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn create_regularize_theta_agent(&self, ctx: &AgentContext<'_>) -> Option<Box<dyn RegularizeThetaAgent>> {
        let params = self.params();
        let topic_weight = topic_mask(ctx.topic_names, &params.topic_name);
        let item_mask = if params.item_title.is_empty() {
            None
        } else {
            let titles: HashSet<&str> = params.item_title.iter().map(|t| t.as_str()).collect();
            Some(ctx.batch.item.iter().map(|item| titles.contains(item.title.as_str())).collect())
        };
        Some(Box::new(SmoothSparseThetaAgent {
            tau: ctx.tau,
            alpha_iter: params.alpha_iter,
            topic_weight,
            item_mask,
        }))
    }

    fn reconfigure(&self, config: &RegularizerConfig) -> Result<()> {
        check_type(Self::TYPE_NAME, config)?;
        let params: SmoothSparseThetaConfig = config.params()?;
        *self.params.write().unwrap_or_else(|e| e.into_inner()) = params;
        Ok(())
    }
}

struct SmoothSparseThetaAgent {
    tau: f32,
    alpha_iter: Vec<f32>,
    topic_weight: Vec<f32>,
    item_mask: Option<Vec<bool>>,
}

impl RegularizeThetaAgent for SmoothSparseThetaAgent {
    fn apply(&self, item_index: usize, inner_iter: usize, _theta: &[f32], r_td: &mut [f32]) {
        if let Some(mask) = &self.item_mask {
            if !mask.get(item_index).copied().unwrap_or(false) {
                return;
            }
        }
        let alpha = self.alpha_iter.get(inner_iter).copied().unwrap_or(1.0);
        let coef = self.tau * alpha;
        for (r, w) in r_td.iter_mut().zip(&self.topic_weight) {
            *r += coef * w;
        }
    }
}
