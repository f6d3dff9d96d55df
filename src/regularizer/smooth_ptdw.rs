use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::config::RegularizerConfig;
use crate::error::{ArtmError, Result};
use crate::regularizer::{check_type, AgentContext, RegularizePtdwAgent, Regularizer};
use crate::utils::datastruct::DenseMatrix;

/// Parameters of [`SmoothPtdw`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothPtdwConfig {
    /// number of neighbouring tokens on each side
    pub window: usize,
}

impl Default for SmoothPtdwConfig {
    fn default() -> Self {
        Self { window: 2 }
    }
}

impl SmoothPtdwConfig {
    fn validate(&self) -> Result<()> {
        if self.window == 0 {
            return Err(ArtmError::out_of_range("window", 0));
        }
        Ok(())
    }
}

/// Token level smoothing: every token posterior is pulled towards the mean
/// posterior of its neighbours, `p'(t|d,w_i) = p(t|d,w_i) + tau * mean_j p(t|d,w_j)`
/// for `0 < |i - j| <= window`.
#[derive(Debug)]
pub struct SmoothPtdw {
    params: RwLock<SmoothPtdwConfig>,
}

impl SmoothPtdw {
    pub const TYPE_NAME: &'static str = "SmoothPtdw";

    pub fn from_config(config: &RegularizerConfig) -> Result<Self> {
        check_type(Self::TYPE_NAME, config)?;
        let params: SmoothPtdwConfig = config.params()?;
        params.validate()?;
        Ok(Self {
            params: RwLock::new(params),
        })
    }
}

impl Regularizer for SmoothPtdw {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn create_regularize_ptdw_agent(&self, ctx: &AgentContext<'_>) -> Option<Box<dyn RegularizePtdwAgent>> {
        let window = self.params.read().unwrap_or_else(|e| e.into_inner()).window;
        Some(Box::new(SmoothPtdwAgent { tau: ctx.tau, window }))
    }

    fn reconfigure(&self, config: &RegularizerConfig) -> Result<()> {
        check_type(Self::TYPE_NAME, config)?;
        let params: SmoothPtdwConfig = config.params()?;
        params.validate()?;
        *self.params.write().unwrap_or_else(|e| e.into_inner()) = params;
        Ok(())
    }
}

struct SmoothPtdwAgent {
    tau: f32,
    window: usize,
}

impl RegularizePtdwAgent for SmoothPtdwAgent {
    fn apply(&self, _item_index: usize, _inner_iter: usize, ptdw: &mut DenseMatrix<f32>) {
        let rows = ptdw.no_rows();
        if rows < 2 {
            return;
        }
        let original = ptdw.clone();
        let mut mean = vec![0.0f32; ptdw.no_columns()];
        for i in 0..rows {
            let lo = i.saturating_sub(self.window);
            let hi = (i + self.window).min(rows - 1);
            mean.iter_mut().for_each(|m| *m = 0.0);
            for j in (lo..=hi).filter(|&j| j != i) {
                for (m, v) in mean.iter_mut().zip(original.row(j)) {
                    *m += v;
                }
            }
            let count = (hi - lo) as f32;
            for (p, m) in ptdw.row_mut(i).iter_mut().zip(&mean) {
                *p += self.tau * m / count;
            }
        }
    }
}
