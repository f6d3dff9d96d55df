use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::config::RegularizerConfig;
use crate::error::Result;
use crate::model::phi_matrix::{DensePhiMatrix, PhiMatrix};
use crate::regularizer::{check_type, topic_mask, PhiContext, Regularizer};

/// Parameters of [`DecorrelatorPhi`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecorrelatorPhiConfig {
    pub topic_name: Vec<String>,
    pub class_id: Vec<String>,
}

/// Pushes topics apart: `r_wt = -p_wt * Σ_{s != t} p_ws` over the selected
/// topics.
#[derive(Debug)]
pub struct DecorrelatorPhi {
    params: RwLock<DecorrelatorPhiConfig>,
}

impl DecorrelatorPhi {
    pub const TYPE_NAME: &'static str = "DecorrelatorPhi";

    pub fn from_config(config: &RegularizerConfig) -> Result<Self> {
        check_type(Self::TYPE_NAME, config)?;
        Ok(Self {
            params: RwLock::new(config.params()?),
        })
    }
}

impl Regularizer for DecorrelatorPhi {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn regularize_phi(&self, ctx: &PhiContext<'_>, result: &DensePhiMatrix) -> bool {
        let params = self.params.read().unwrap_or_else(|e| e.into_inner()).clone();
        let mask = topic_mask(ctx.pwt.topic_names(), &params.topic_name);
        let topic_size = mask.len();

        let mut p = vec![0.0f32; topic_size];
        let mut r = vec![0.0f32; topic_size];
        for token_id in 0..ctx.pwt.token_size() {
            if !params.class_id.is_empty() && !params.class_id.contains(&ctx.pwt.token(token_id).class_id) {
                continue;
            }
            ctx.pwt.get_row(token_id, &mut p);
            let total: f32 = p.iter().zip(&mask).map(|(v, m)| v * m).sum();
            for t in 0..topic_size {
                r[t] = if mask[t] > 0.0 { -p[t] * (total - p[t]) } else { 0.0 };
            }
            result.set_row(token_id, &r);
        }
        true
    }

    fn reconfigure(&self, config: &RegularizerConfig) -> Result<()> {
        check_type(Self::TYPE_NAME, config)?;
        let params: DecorrelatorPhiConfig = config.params()?;
        *self.params.write().unwrap_or_else(|e| e.into_inner()) = params;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::token::Token;
    use crate::utils::datastruct::ThreadSafeHolder;

    #[test]
    fn correction_is_minus_p_times_rest() {
        let config = RegularizerConfig::new("dec", DecorrelatorPhi::TYPE_NAME, 1.0, &DecorrelatorPhiConfig::default()).unwrap();
        let reg = DecorrelatorPhi::from_config(&config).unwrap();

        let mut pwt = DensePhiMatrix::new("pwt", vec!["t0".into(), "t1".into(), "t2".into()]);
        pwt.add_token(Token::word("a"));
        pwt.set_row(0, &[0.5, 0.25, 0.25]);
        let dictionaries = ThreadSafeHolder::new();
        let ctx = PhiContext { pwt: &pwt, nwt: &pwt, dictionaries: &dictionaries };
        let result = DensePhiMatrix::with_shape_of("rwt", &pwt);
        assert!(reg.regularize_phi(&ctx, &result));
        assert_eq!(result.to_rows()[0], vec![-0.25, -0.1875, -0.1875]);
    }
}
