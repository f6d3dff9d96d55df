use std::collections::HashMap;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ArtmError, Result};
use crate::model::dictionary::Dictionary;
use crate::model::phi_matrix::{DensePhiMatrix, PhiMatrix};
use crate::model::token::{ClassId, Token};
use crate::utils::math::{stable_hash, PROBABILITY_EPS};

/// Per class, per topic normalization constants `n_t`.
pub type Normalizers = HashMap<ClassId, Vec<f32>>;

/// A canonical topic model: raw counts (Nwt) and the probabilities derived
/// from them (Pwt). Both matrices share the same tokens and topics.
///
/// Published models are immutable snapshots; synchronization builds a new
/// `TopicModel` and swaps the registry entry.
#[derive(Debug, Clone)]
pub struct TopicModel {
    name: String,
    nwt: Arc<DensePhiMatrix>,
    pwt: Arc<DensePhiMatrix>,
}

impl TopicModel {
    /// Build a model from counts, deriving Pwt without regularization.
    pub fn from_nwt(name: impl Into<String>, nwt: DensePhiMatrix) -> Result<Self> {
        let name = name.into();
        let pwt = calc_pwt(&name, &nwt, None)?;
        Ok(Self {
            name,
            nwt: Arc::new(nwt),
            pwt: Arc::new(pwt),
        })
    }

    pub fn from_parts(name: impl Into<String>, nwt: DensePhiMatrix, pwt: DensePhiMatrix) -> Result<Self> {
        check_same_shape(&nwt, &pwt)?;
        Ok(Self {
            name: name.into(),
            nwt: Arc::new(nwt),
            pwt: Arc::new(pwt),
        })
    }

    /// Seed a model with token-hashed pseudo-random counts for every
    /// dictionary token of the configured classes (all classes when empty).
    pub fn initialize(
        name: impl Into<String>,
        dictionary: &Dictionary,
        topic_names: &[String],
        class_filter: &[ClassId],
        seed: u64,
    ) -> Result<Self> {
        if topic_names.is_empty() {
            return Err(ArtmError::out_of_range("topic_names.len()", 0));
        }
        if dictionary.is_empty() {
            return Err(ArtmError::invalid(format!("dictionary '{}' is empty", dictionary.name)));
        }
        let name = name.into();
        let mut nwt = DensePhiMatrix::new(name.clone(), topic_names.to_vec());
        for token in dictionary.tokens() {
            if class_filter.is_empty() || class_filter.contains(&token.class_id) {
                nwt.add_token(token.clone());
            }
        }
        if nwt.token_size() == 0 {
            return Err(ArtmError::invalid(format!(
                "dictionary '{}' has no tokens of the requested classes",
                dictionary.name
            )));
        }

        let mut row = vec![0.0f32; topic_names.len()];
        for token_id in 0..nwt.token_size() {
            let mut rng = ChaCha8Rng::seed_from_u64(token_seed(nwt.token(token_id), seed));
            row.iter_mut().for_each(|v| *v = rng.gen::<f32>());
            nwt.set_row(token_id, &row);
        }
        Self::from_nwt(name, nwt)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nwt(&self) -> &Arc<DensePhiMatrix> {
        &self.nwt
    }

    pub fn pwt(&self) -> &Arc<DensePhiMatrix> {
        &self.pwt
    }

    pub fn topic_names(&self) -> &[String] {
        self.pwt.topic_names()
    }

    pub fn token_size(&self) -> usize {
        self.pwt.token_size()
    }

    /// Serializable copy of both matrices.
    pub fn snapshot(&self) -> TopicModelData {
        TopicModelData {
            name: self.name.clone(),
            topic_names: self.topic_names().to_vec(),
            tokens: self.pwt.tokens().iter().cloned().collect(),
            nwt: self.nwt.to_rows(),
            pwt: self.pwt.to_rows(),
        }
    }
}

/// Exported form of a topic model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicModelData {
    pub name: String,
    pub topic_names: Vec<String>,
    pub tokens: Vec<Token>,
    pub nwt: Vec<Vec<f32>>,
    pub pwt: Vec<Vec<f32>>,
}

/// Seed of the random generator of one token row.
pub fn token_seed(token: &Token, seed: u64) -> u64 {
    let parts: [&[u8]; 3] = [
        token.class_id.as_bytes(),
        token.keyword.as_bytes(),
        token.transaction_type.as_bytes(),
    ];
    stable_hash(&parts) ^ seed
}

fn check_same_shape(a: &dyn PhiMatrix, b: &dyn PhiMatrix) -> Result<()> {
    if a.token_size() != b.token_size() || a.topic_size() != b.topic_size() {
        return Err(ArtmError::invalid(format!(
            "inconsistent matrix shapes: {} is {}x{}, {} is {}x{}",
            a.model_name(),
            a.token_size(),
            a.topic_size(),
            b.model_name(),
            b.token_size(),
            b.topic_size()
        )));
    }
    Ok(())
}

/// `n_t(class) = Σ_w max(Nwt(w,t) + Rwt(w,t), 0)` over tokens of each class.
pub fn find_normalizers(nwt: &dyn PhiMatrix, rwt: Option<&dyn PhiMatrix>) -> Result<Normalizers> {
    if let Some(rwt) = rwt {
        check_same_shape(nwt, rwt)?;
    }
    let topic_size = nwt.topic_size();
    let normalizers = (0..nwt.token_size())
        .into_par_iter()
        .fold(Normalizers::new, |mut acc, token_id| {
            let class_id = &nwt.token(token_id).class_id;
            let n_t = acc
                .entry(class_id.clone())
                .or_insert_with(|| vec![0.0f32; topic_size]);
            for (topic_id, n) in n_t.iter_mut().enumerate() {
                let mut value = nwt.get(token_id, topic_id);
                if let Some(rwt) = rwt {
                    value += rwt.get(token_id, topic_id);
                }
                if value > 0.0 {
                    *n += value;
                }
            }
            acc
        })
        .reduce(Normalizers::new, merge_normalizers);
    Ok(normalizers)
}

fn merge_normalizers(mut a: Normalizers, b: Normalizers) -> Normalizers {
    for (class_id, n_t) in b {
        match a.get_mut(&class_id) {
            Some(target) => target.iter_mut().zip(n_t).for_each(|(x, y)| *x += y),
            None => {
                a.insert(class_id, n_t);
            }
        }
    }
    a
}

/// Write `max(Nwt + Rwt, 0) / n_t` into `pwt`.
///
/// `pwt` must have the shape of `nwt`. Topics whose normalizer is not
/// positive keep their previous value.
pub fn normalize(nwt: &dyn PhiMatrix, rwt: Option<&dyn PhiMatrix>, pwt: &DensePhiMatrix) -> Result<Normalizers> {
    check_same_shape(nwt, pwt)?;
    let normalizers = find_normalizers(nwt, rwt)?;
    let topic_size = nwt.topic_size();

    (0..nwt.token_size()).into_par_iter().for_each(|token_id| {
        let Some(n_t) = normalizers.get(&nwt.token(token_id).class_id) else {
            return;
        };
        for topic_id in 0..topic_size {
            if n_t[topic_id] <= 0.0 {
                continue;
            }
            let mut value = nwt.get(token_id, topic_id);
            if let Some(rwt) = rwt {
                value += rwt.get(token_id, topic_id);
            }
            let mut p = value.max(0.0) / n_t[topic_id];
            if p < PROBABILITY_EPS {
                p = 0.0;
            }
            pwt.set(token_id, topic_id, p);
        }
    });
    Ok(normalizers)
}

/// Fresh Pwt computed from `nwt` (plus optional regularizer correction).
pub fn calc_pwt(name: &str, nwt: &dyn PhiMatrix, rwt: Option<&dyn PhiMatrix>) -> Result<DensePhiMatrix> {
    let pwt = DensePhiMatrix::with_shape_of(name, nwt);
    normalize(nwt, rwt, &pwt)?;
    Ok(pwt)
}

/// Add `weight * source` into `target`, adding missing tokens to `target`.
///
/// With `topic_names` the source topics are matched to target topics by name;
/// without it they are matched by position, which requires equal topic
/// counts. Returns `false` (and changes nothing) when no topic matches.
pub fn apply_topic_model_operation(
    target: &mut DensePhiMatrix,
    source: &dyn PhiMatrix,
    weight: f32,
    topic_names: Option<&[String]>,
) -> bool {
    let topic_map: Vec<Option<usize>> = match topic_names {
        Some(names) => {
            let by_name: HashMap<&str, usize> = target
                .topic_names()
                .iter()
                .enumerate()
                .map(|(i, n)| (n.as_str(), i))
                .collect();
            names.iter().map(|n| by_name.get(n.as_str()).copied()).collect()
        }
        None if source.topic_size() == target.topic_size() => (0..source.topic_size()).map(Some).collect(),
        None => {
            log::warn!(
                "unable to merge '{}' into '{}': {} topics vs {} and no topic names",
                source.model_name(),
                target.model_name(),
                source.topic_size(),
                target.topic_size()
            );
            return false;
        }
    };
    if topic_map.len() != source.topic_size() {
        log::warn!(
            "unable to merge '{}' into '{}': {} topic names for {} topics",
            source.model_name(),
            target.model_name(),
            topic_map.len(),
            source.topic_size()
        );
        return false;
    }
    if topic_map.iter().all(|m| m.is_none()) {
        log::warn!(
            "unable to merge '{}' into '{}': no topic names in common",
            source.model_name(),
            target.model_name()
        );
        return false;
    }

    let mut src_row = vec![0.0f32; source.topic_size()];
    let mut dst_row = vec![0.0f32; target.topic_size()];
    for token_id in 0..source.token_size() {
        let target_id = target.add_token(source.token(token_id).clone());
        source.get_row(token_id, &mut src_row);
        dst_row.iter_mut().for_each(|v| *v = 0.0);
        for (s, mapped) in topic_map.iter().enumerate() {
            if let Some(t) = mapped {
                dst_row[*t] += weight * src_row[s];
            }
        }
        target.increase_row(target_id, &dst_row);
    }
    true
}
