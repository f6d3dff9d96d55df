use std::collections::HashMap;
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_cbor::Value;

use crate::error::{ArtmError, Result};
use crate::model::token::{ClassId, TransactionTypeName};

/// Layout of the theta matrix returned by transform and stored in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ThetaMatrixType {
    /// every topic weight of every item
    #[default]
    Dense,
    /// only weights above `theta_sparse_eps`, with their topic indices
    Sparse,
}

/// Regularizer declaration: a name, a type tag resolved by the factory, a
/// default coefficient and type specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegularizerConfig {
    pub name: String,
    pub type_name: String,
    pub tau: f32,
    #[serde(default = "null_value")]
    pub config: Value,
}

/// Score declaration, resolved by the score factory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreConfig {
    pub name: String,
    pub type_name: String,
    #[serde(default = "null_value")]
    pub config: Value,
}

fn null_value() -> Value {
    Value::Null
}

/// Deserialize type specific parameters, falling back to their defaults when
/// none were given.
fn decode_params<T>(config: &Value) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    match config {
        Value::Null => Ok(T::default()),
        other => serde_cbor::value::from_value(other.clone()).map_err(ArtmError::from),
    }
}

fn encode_params<T: Serialize>(params: &T) -> Result<Value> {
    serde_cbor::value::to_value(params).map_err(ArtmError::from)
}

impl RegularizerConfig {
    pub fn new<P: Serialize>(name: impl Into<String>, type_name: impl Into<String>, tau: f32, params: &P) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            type_name: type_name.into(),
            tau,
            config: encode_params(params)?,
        })
    }

    pub fn params<T: DeserializeOwned + Default>(&self) -> Result<T> {
        decode_params(&self.config)
    }
}

impl ScoreConfig {
    pub fn new<P: Serialize>(name: impl Into<String>, type_name: impl Into<String>, params: &P) -> Result<Self> {
        Ok(Self {
            name: name.into(),
            type_name: type_name.into(),
            config: encode_params(params)?,
        })
    }

    pub fn params<T: DeserializeOwned + Default>(&self) -> Result<T> {
        decode_params(&self.config)
    }
}

/// Weight lookup for classes or transaction types.
///
/// With no configured weights every key weighs 1; once any weight is
/// configured, unlisted keys weigh 0.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeightTable {
    weights: Option<HashMap<String, f32>>,
}

impl WeightTable {
    pub fn new(keys: &[String], weights: &[f32]) -> Self {
        if keys.is_empty() {
            return Self { weights: None };
        }
        let map = keys
            .iter()
            .enumerate()
            .map(|(i, k)| (k.clone(), weights.get(i).copied().unwrap_or(1.0)))
            .collect();
        Self { weights: Some(map) }
    }

    #[inline]
    pub fn weight(&self, key: &str) -> f32 {
        match &self.weights {
            None => 1.0,
            Some(map) => map.get(key).copied().unwrap_or(0.0),
        }
    }
}

/// Per-call arguments of batch processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessBatchesArgs {
    pub num_document_passes: usize,
    pub class_id: Vec<ClassId>,
    pub class_weight: Vec<f32>,
    pub transaction_typename: Vec<TransactionTypeName>,
    pub transaction_weight: Vec<f32>,
    /// theta / ptdw regularizers applied inside the inner loop
    pub regularizer_name: Vec<String>,
    pub regularizer_tau: Vec<f32>,
    pub reuse_theta: bool,
    pub use_random_theta: bool,
    pub opt_for_avx: bool,
    pub cache_theta: bool,
    pub cache_ptdw: bool,
    pub theta_matrix_type: ThetaMatrixType,
    pub theta_sparse_eps: f32,
    pub predict_class_id: Option<ClassId>,
    /// cumulative scores to append; empty means every registered one
    pub score_name: Vec<String>,
    /// secondary theta cache key used by hierarchical models
    pub ptd_name: Option<String>,
    pub seed: u64,
}

impl Default for ProcessBatchesArgs {
    fn default() -> Self {
        Self {
            num_document_passes: 10,
            class_id: Vec::new(),
            class_weight: Vec::new(),
            transaction_typename: Vec::new(),
            transaction_weight: Vec::new(),
            regularizer_name: Vec::new(),
            regularizer_tau: Vec::new(),
            reuse_theta: false,
            use_random_theta: false,
            opt_for_avx: true,
            cache_theta: false,
            cache_ptdw: false,
            theta_matrix_type: ThetaMatrixType::Dense,
            theta_sparse_eps: 1e-37,
            predict_class_id: None,
            score_name: Vec::new(),
            ptd_name: None,
            seed: 0,
        }
    }
}

impl ProcessBatchesArgs {
    pub fn validate(&self) -> Result<()> {
        check_parallel("class_id", self.class_id.len(), "class_weight", self.class_weight.len())?;
        check_parallel(
            "transaction_typename",
            self.transaction_typename.len(),
            "transaction_weight",
            self.transaction_weight.len(),
        )?;
        check_parallel(
            "regularizer_name",
            self.regularizer_name.len(),
            "regularizer_tau",
            self.regularizer_tau.len(),
        )?;
        if self.num_document_passes == 0 {
            return Err(ArtmError::out_of_range("num_document_passes", 0));
        }
        Ok(())
    }

    pub fn class_weights(&self) -> WeightTable {
        WeightTable::new(&self.class_id, &self.class_weight)
    }

    pub fn transaction_weights(&self) -> WeightTable {
        WeightTable::new(&self.transaction_typename, &self.transaction_weight)
    }
}

fn check_parallel(a: &str, a_len: usize, b: &str, b_len: usize) -> Result<()> {
    // 重み配列は省略可 (全て 1.0)
    if b_len != 0 && a_len != b_len {
        return Err(ArtmError::invalid(format!(
            "{} has {} elements but {} has {}",
            a, a_len, b, b_len
        )));
    }
    Ok(())
}

/// Top-level configuration of a master component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterModelConfig {
    pub topic_name: Vec<String>,
    pub class_id: Vec<ClassId>,
    pub class_weight: Vec<f32>,
    pub transaction_typename: Vec<TransactionTypeName>,
    pub transaction_weight: Vec<f32>,
    pub regularizer_config: Vec<RegularizerConfig>,
    pub score_config: Vec<ScoreConfig>,
    pub num_processors: usize,
    pub num_document_passes: usize,
    pub reuse_theta: bool,
    pub use_random_theta: bool,
    pub opt_for_avx: bool,
    pub cache_theta: bool,
    /// keep per-token topic posteriors, forces the ptdw inference path
    pub cache_ptdw: bool,
    /// secondary theta cache key, lets several models of a hierarchy share
    /// one cache
    pub ptd_name: Option<String>,
    pub disk_cache_path: Option<PathBuf>,
    pub pwt_name: String,
    pub nwt_name: String,
    pub seed: u64,
}

impl Default for MasterModelConfig {
    fn default() -> Self {
        Self {
            topic_name: Vec::new(),
            class_id: Vec::new(),
            class_weight: Vec::new(),
            transaction_typename: Vec::new(),
            transaction_weight: Vec::new(),
            regularizer_config: Vec::new(),
            score_config: Vec::new(),
            num_processors: 1,
            num_document_passes: 10,
            reuse_theta: false,
            use_random_theta: false,
            opt_for_avx: true,
            cache_theta: false,
            cache_ptdw: false,
            ptd_name: None,
            disk_cache_path: None,
            pwt_name: "pwt".to_string(),
            nwt_name: "nwt".to_string(),
            seed: 0,
        }
    }
}

impl MasterModelConfig {
    pub fn with_topics(num_topics: usize) -> Self {
        Self {
            topic_name: crate::model::phi_matrix::default_topic_names(num_topics),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.topic_name.is_empty() {
            return Err(ArtmError::out_of_range("topic_name.len()", 0));
        }
        if self.num_processors == 0 {
            return Err(ArtmError::out_of_range("num_processors", 0));
        }
        if self.pwt_name == self.nwt_name {
            return Err(ArtmError::invalid("pwt_name and nwt_name must differ"));
        }
        check_parallel("class_id", self.class_id.len(), "class_weight", self.class_weight.len())?;
        check_parallel(
            "transaction_typename",
            self.transaction_typename.len(),
            "transaction_weight",
            self.transaction_weight.len(),
        )?;
        let mut names = std::collections::HashSet::new();
        for reg in &self.regularizer_config {
            if !names.insert(reg.name.as_str()) {
                return Err(ArtmError::invalid(format!("duplicate regularizer name '{}'", reg.name)));
            }
        }
        Ok(())
    }

    /// Processing arguments derived from this configuration. Every configured
    /// regularizer is offered to the inner loop with its default tau.
    pub fn process_batches_args(&self) -> ProcessBatchesArgs {
        ProcessBatchesArgs {
            num_document_passes: self.num_document_passes,
            class_id: self.class_id.clone(),
            class_weight: self.class_weight.clone(),
            transaction_typename: self.transaction_typename.clone(),
            transaction_weight: self.transaction_weight.clone(),
            regularizer_name: self.regularizer_config.iter().map(|r| r.name.clone()).collect(),
            regularizer_tau: self.regularizer_config.iter().map(|r| r.tau).collect(),
            reuse_theta: self.reuse_theta,
            use_random_theta: self.use_random_theta,
            opt_for_avx: self.opt_for_avx,
            cache_theta: self.cache_theta,
            cache_ptdw: self.cache_ptdw,
            ptd_name: self.ptd_name.clone(),
            seed: self.seed,
            ..ProcessBatchesArgs::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Params {
        topic_name: Vec<String>,
        alpha: f32,
    }

    #[test]
    fn weight_table_defaults() {
        let empty = WeightTable::new(&[], &[]);
        assert_eq!(empty.weight("anything"), 1.0);

        let table = WeightTable::new(&["@words".to_string(), "@labels".to_string()], &[1.0, 0.0]);
        assert_eq!(table.weight("@words"), 1.0);
        assert_eq!(table.weight("@labels"), 0.0);
        assert_eq!(table.weight("@other"), 0.0);
    }

    #[test]
    fn params_roundtrip_through_config() {
        let params = Params { topic_name: vec!["t0".into()], alpha: 0.5 };
        let config = RegularizerConfig::new("r", "SmoothSparseTheta", -0.1, &params).unwrap();
        assert_eq!(config.params::<Params>().unwrap(), params);

        let bare = RegularizerConfig {
            name: "r".into(),
            type_name: "SmoothSparseTheta".into(),
            tau: 1.0,
            config: Value::Null,
        };
        assert_eq!(bare.params::<Params>().unwrap(), Params::default());
    }

    #[test]
    fn args_validation() {
        let mut args = ProcessBatchesArgs::default();
        assert!(args.validate().is_ok());
        args.class_id = vec!["a".into(), "b".into()];
        args.class_weight = vec![1.0];
        assert!(args.validate().is_err());
        args.class_weight.clear();
        assert!(args.validate().is_ok());
        args.num_document_passes = 0;
        assert!(args.validate().is_err());
    }

    #[test]
    fn master_config_serde_uses_defaults() {
        let config: MasterModelConfig = serde_json::from_str(r#"{"topic_name": ["a", "b"]}"#).unwrap();
        assert_eq!(config.num_processors, 1);
        assert_eq!(config.pwt_name, "pwt");
        assert!(config.validate().is_ok());
        assert!(MasterModelConfig::default().validate().is_err());

        let args = config.process_batches_args();
        assert_eq!(args.num_document_passes, 10);
        assert!(!args.cache_ptdw);
        assert_eq!(args.ptd_name, None);

        let config: MasterModelConfig =
            serde_json::from_str(r#"{"topic_name": ["a"], "cache_ptdw": true, "ptd_name": "level1"}"#).unwrap();
        let args = config.process_batches_args();
        assert!(args.cache_ptdw);
        assert_eq!(args.ptd_name.as_deref(), Some("level1"));
    }
}
