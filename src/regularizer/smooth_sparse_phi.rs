use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::config::RegularizerConfig;
use crate::error::Result;
use crate::model::phi_matrix::{DensePhiMatrix, PhiMatrix};
use crate::regularizer::{check_type, topic_mask, PhiContext, Regularizer};

/// Parameters of [`SmoothSparsePhi`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothSparsePhiConfig {
    /// topics to regularize; empty means all
    pub topic_name: Vec<String>,
    /// classes to regularize; empty means all
    pub class_id: Vec<String>,
    /// weight every token by its dictionary value
    pub dictionary_name: Option<String>,
}

/// Smoothing (tau > 0) or sparsing (tau < 0) of topic distributions:
/// `r_wt = 1` (or the dictionary value of `w`) for selected topics and classes.
#[derive(Debug)]
pub struct SmoothSparsePhi {
    params: RwLock<SmoothSparsePhiConfig>,
}

impl SmoothSparsePhi {
    pub const TYPE_NAME: &'static str = "SmoothSparsePhi";

    pub fn from_config(config: &RegularizerConfig) -> Result<Self> {
        check_type(Self::TYPE_NAME, config)?;
        Ok(Self {
            params: RwLock::new(config.params()?),
        })
    }

    fn params(&self) -> SmoothSparsePhiConfig {
        self.params.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Regularizer for SmoothSparsePhi {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn regularize_phi(&self, ctx: &PhiContext<'_>, result: &DensePhiMatrix) -> bool {
        let params = self.params();
        let dictionary = match &params.dictionary_name {
            Some(name) => match ctx.dictionaries.get(name.as_str()) {
                Some(dictionary) => Some(dictionary),
                None => {
                    log::error!("SmoothSparsePhi: dictionary '{}' does not exist", name);
                    return false;
                }
            },
            None => None,
        };

        let mask = topic_mask(ctx.pwt.topic_names(), &params.topic_name);
        let mut row = vec![0.0f32; mask.len()];
        for token_id in 0..ctx.pwt.token_size() {
            let token = ctx.pwt.token(token_id);
            if !params.class_id.is_empty() && !params.class_id.contains(&token.class_id) {
                continue;
            }
            let coef = match &dictionary {
                // 辞書にない token は正則化しない
                Some(dictionary) => match dictionary.entry(token) {
                    Some(entry) => entry.value,
                    None => continue,
                },
                None => 1.0,
            };
            row.iter_mut().zip(&mask).for_each(|(r, m)| *r = coef * m);
            result.set_row(token_id, &row);
        }
        true
    }

    fn reconfigure(&self, config: &RegularizerConfig) -> Result<()> {
        check_type(Self::TYPE_NAME, config)?;
        let params: SmoothSparsePhiConfig = config.params()?;
        *self.params.write().unwrap_or_else(|e| e.into_inner()) = params;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::dictionary::{Dictionary, DictionaryEntry};
    use crate::model::token::Token;
    use crate::utils::datastruct::ThreadSafeHolder;
    use std::sync::Arc;

    fn pwt() -> DensePhiMatrix {
        let mut pwt = DensePhiMatrix::new("pwt", vec!["t0".into(), "t1".into()]);
        pwt.add_token(Token::word("a"));
        pwt.add_token(Token::word("b"));
        pwt.add_token(Token::new("@labels", "x"));
        pwt
    }

    #[test]
    fn writes_mask_for_selected_classes() {
        let params = SmoothSparsePhiConfig {
            topic_name: vec!["t1".into()],
            class_id: vec!["@default_class".into()],
            dictionary_name: None,
        };
        let config = RegularizerConfig::new("ssp", SmoothSparsePhi::TYPE_NAME, 0.1, &params).unwrap();
        let reg = SmoothSparsePhi::from_config(&config).unwrap();

        let pwt = pwt();
        let dictionaries = ThreadSafeHolder::new();
        let ctx = PhiContext { pwt: &pwt, nwt: &pwt, dictionaries: &dictionaries };
        let result = DensePhiMatrix::with_shape_of("rwt", &pwt);
        assert!(reg.regularize_phi(&ctx, &result));
        assert_eq!(result.to_rows(), vec![vec![0.0, 1.0], vec![0.0, 1.0], vec![0.0, 0.0]]);
    }

    #[test]
    fn dictionary_values_weight_tokens() {
        let mut dict = Dictionary::new("dict");
        dict.add_entry(Token::word("b"), DictionaryEntry { value: 0.25, tf: 1.0, df: 1.0 });
        let dictionaries = ThreadSafeHolder::new();
        dictionaries.set("dict".to_string(), Arc::new(dict));

        let params = SmoothSparsePhiConfig { dictionary_name: Some("dict".into()), ..Default::default() };
        let config = RegularizerConfig::new("ssp", SmoothSparsePhi::TYPE_NAME, 0.1, &params).unwrap();
        let reg = SmoothSparsePhi::from_config(&config).unwrap();

        let pwt = pwt();
        let ctx = PhiContext { pwt: &pwt, nwt: &pwt, dictionaries: &dictionaries };
        let result = DensePhiMatrix::with_shape_of("rwt", &pwt);
        assert!(reg.regularize_phi(&ctx, &result));
        assert_eq!(result.to_rows()[0], vec![0.0, 0.0]);
        assert_eq!(result.to_rows()[1], vec![0.25, 0.25]);

        let missing = SmoothSparsePhiConfig { dictionary_name: Some("nope".into()), ..Default::default() };
        reg.reconfigure(&RegularizerConfig::new("ssp", SmoothSparsePhi::TYPE_NAME, 0.1, &missing).unwrap())
            .unwrap();
        assert!(!reg.regularize_phi(&ctx, &DensePhiMatrix::with_shape_of("rwt", &pwt)));
    }
}
