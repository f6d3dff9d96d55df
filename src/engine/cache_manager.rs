use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::RandomState;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::ThetaMatrixType;
use crate::error::{ArtmError, Result};
use crate::utils::math::stable_hash;

/// Rows of topic weights (or token probabilities) of processed items.
///
/// Dense matrices keep every column of every row. Sparse matrices keep the
/// values above the threshold together with their column indices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThetaMatrix {
    pub model_name: String,
    /// column names: topic names, or token keywords for class prediction
    pub topic_names: Vec<String>,
    pub matrix_type: ThetaMatrixType,
    pub item_id: Vec<i32>,
    pub item_title: Vec<String>,
    pub item_weights: Vec<Vec<f32>>,
    /// column index of every weight; empty for dense matrices
    pub topic_indices: Vec<Vec<usize>>,
}

impl ThetaMatrix {
    pub fn new(model_name: impl Into<String>, topic_names: Vec<String>, matrix_type: ThetaMatrixType) -> Self {
        Self {
            model_name: model_name.into(),
            topic_names,
            matrix_type,
            item_id: Vec::new(),
            item_title: Vec::new(),
            item_weights: Vec::new(),
            topic_indices: Vec::new(),
        }
    }

    /// Append one row; sparse matrices drop values not above `eps`.
    pub fn push_item(&mut self, id: i32, title: impl Into<String>, weights: &[f32], eps: f32) {
        self.item_id.push(id);
        self.item_title.push(title.into());
        match self.matrix_type {
            ThetaMatrixType::Dense => self.item_weights.push(weights.to_vec()),
            ThetaMatrixType::Sparse => {
                let (indices, values): (Vec<usize>, Vec<f32>) =
                    weights.iter().enumerate().filter(|&(_, &v)| v > eps).map(|(i, &v)| (i, v)).unzip();
                self.item_weights.push(values);
                self.topic_indices.push(indices);
            }
        }
    }

    pub fn num_items(&self) -> usize {
        self.item_id.len()
    }

    pub fn num_topics(&self) -> usize {
        self.topic_names.len()
    }

    pub fn item_index(&self, title: &str) -> Option<usize> {
        self.item_title.iter().position(|t| t == title)
    }

    /// Row `index` with every column present.
    pub fn dense_row(&self, index: usize) -> Vec<f32> {
        match self.matrix_type {
            ThetaMatrixType::Dense => self.item_weights[index].clone(),
            ThetaMatrixType::Sparse => {
                let mut row = vec![0.0f32; self.num_topics()];
                for (&t, &v) in self.topic_indices[index].iter().zip(&self.item_weights[index]) {
                    row[t] = v;
                }
                row
            }
        }
    }

    /// Append the rows of `other`, which must have the same columns and layout.
    pub fn append(&mut self, other: &ThetaMatrix) -> Result<()> {
        if other.topic_names != self.topic_names || other.matrix_type != self.matrix_type {
            return Err(ArtmError::invalid(format!(
                "can not merge theta matrices of '{}' and '{}' with different layouts",
                self.model_name, other.model_name
            )));
        }
        self.item_id.extend_from_slice(&other.item_id);
        self.item_title.extend(other.item_title.iter().cloned());
        self.item_weights.extend(other.item_weights.iter().cloned());
        self.topic_indices.extend(other.topic_indices.iter().cloned());
        Ok(())
    }
}

/// Cache key: batch id plus the optional name of a hierarchical level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub batch_id: String,
    pub ptd_name: Option<String>,
}

impl CacheKey {
    pub fn new(batch_id: impl Into<String>, ptd_name: Option<&str>) -> Self {
        Self {
            batch_id: batch_id.into(),
            ptd_name: ptd_name.map(str::to_string),
        }
    }

    fn file_name(&self) -> String {
        let hash = match &self.ptd_name {
            Some(ptd_name) => stable_hash(&[self.batch_id.as_bytes(), ptd_name.as_bytes()]),
            None => stable_hash(&[self.batch_id.as_bytes()]),
        };
        format!("{:016x}.theta", hash)
    }
}

#[derive(Debug, Clone)]
enum CacheData {
    InMemory(Arc<ThetaMatrix>),
    OnDisk(PathBuf),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    model_name: String,
    data: CacheData,
}

impl CacheEntry {
    fn release(&self) {
        if let CacheData::OnDisk(path) = &self.data {
            remove_file(path);
        }
    }
}

/// Theta matrices of processed batches, optionally spilled to disk as CBOR.
#[derive(Debug)]
pub struct CacheManager {
    disk_path: Option<PathBuf>,
    entries: DashMap<CacheKey, CacheEntry, RandomState>,
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CacheManager {
    pub fn new(disk_path: Option<PathBuf>) -> Self {
        Self {
            disk_path,
            entries: DashMap::with_hasher(RandomState::new()),
        }
    }

    pub fn disk_path(&self) -> Option<&Path> {
        self.disk_path.as_deref()
    }

    /// Store (replace) the entry of `key`.
    pub fn update_cache_entry(&self, key: CacheKey, theta: ThetaMatrix) -> Result<()> {
        let model_name = theta.model_name.clone();
        let data = match &self.disk_path {
            Some(dir) => {
                let path = dir.join(key.file_name());
                write_theta(&path, &theta)?;
                CacheData::OnDisk(path)
            }
            None => CacheData::InMemory(Arc::new(theta)),
        };
        let same_file = |old: &CacheEntry| matches!((&old.data, &data), (CacheData::OnDisk(a), CacheData::OnDisk(b)) if a == b);
        let entry = CacheEntry { model_name, data: data.clone() };
        if let Some(old) = self.entries.insert(key, entry) {
            if !same_file(&old) {
                old.release();
            }
        }
        Ok(())
    }

    /// Entry of `key`; an unreadable spill file is logged and reported as a miss.
    pub fn find_cache_entry(&self, key: &CacheKey) -> Option<Arc<ThetaMatrix>> {
        let data = self.entries.get(key).map(|e| e.value().data.clone())?;
        match data {
            CacheData::InMemory(theta) => Some(theta),
            CacheData::OnDisk(path) => match read_theta(&path) {
                Ok(theta) => Some(Arc::new(theta)),
                Err(err) => {
                    log::error!("theta cache entry of batch {}: {}", key.batch_id, err);
                    None
                }
            },
        }
    }

    /// Every cached row of one hierarchical level, ordered by batch id.
    pub fn request_theta_matrix(&self, ptd_name: Option<&str>) -> Result<Option<ThetaMatrix>> {
        let mut keys: Vec<CacheKey> = self
            .entries
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.ptd_name.as_deref() == ptd_name)
            .collect();
        keys.sort();

        let mut result: Option<ThetaMatrix> = None;
        for key in keys {
            let Some(theta) = self.find_cache_entry(&key) else {
                continue;
            };
            match result.as_mut() {
                Some(acc) => acc.append(&theta)?,
                None => result = Some(ThetaMatrix::clone(&theta)),
            }
        }
        Ok(result)
    }

    fn remove_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&CacheKey, &CacheEntry) -> bool,
    {
        let keys: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|e| predicate(e.key(), e.value()))
            .map(|e| e.key().clone())
            .collect();
        for key in &keys {
            if let Some((_, entry)) = self.entries.remove(key) {
                entry.release();
            }
        }
        keys.len()
    }

    /// Drop every entry of a batch, whatever its level.
    pub fn erase(&self, batch_id: &str) -> usize {
        self.remove_where(|key, _| key.batch_id == batch_id)
    }

    /// Drop every entry computed with the given model.
    pub fn erase_model(&self, model_name: &str) -> usize {
        self.remove_where(|_, entry| entry.model_name == model_name)
    }

    pub fn clear(&self) {
        self.remove_where(|_, _| true);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.clear();
    }
}

fn write_theta(path: &Path, theta: &ThetaMatrix) -> Result<()> {
    let file = File::create(path).map_err(|source| ArtmError::DiskWrite {
        path: path.to_path_buf(),
        source,
    })?;
    serde_cbor::to_writer(BufWriter::new(file), theta)?;
    Ok(())
}

fn read_theta(path: &Path) -> Result<ThetaMatrix> {
    let file = File::open(path).map_err(|source| ArtmError::DiskRead {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_cbor::from_reader(BufReader::new(file))?)
}

fn remove_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        log::warn!("unable to remove theta cache file {}: {}", path.display(), err);
    }
}
