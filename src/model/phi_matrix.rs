use std::fmt;
use std::hint;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::error::{ArtmError, Result};
use crate::model::token::{ClassId, Token, TokenCollection};

/// [token × topic] weight store.
///
/// Every accessor takes `&self`: a matrix is shared through an `Arc` between
/// processor threads that write their expected counts into it.
/// `increase_row` may be called concurrently for different tokens; calls for
/// the same token are serialized by a per-token lock.
pub trait PhiMatrix: Send + Sync + fmt::Debug {
    fn model_name(&self) -> &str;
    fn topic_size(&self) -> usize;
    fn token_size(&self) -> usize;
    fn topic_names(&self) -> &[String];
    fn tokens(&self) -> &TokenCollection;

    fn topic_name(&self, topic_id: usize) -> &str {
        &self.topic_names()[topic_id]
    }

    fn token(&self, token_id: usize) -> &Token {
        &self.tokens()[token_id]
    }

    fn token_index(&self, token: &Token) -> Option<usize> {
        self.tokens().token_index(token)
    }

    fn has_token(&self, token: &Token) -> bool {
        self.tokens().has_token(token)
    }

    fn get(&self, token_id: usize, topic_id: usize) -> f32;

    /// Bulk read of one token row into `out` (`out.len() == topic_size()`).
    fn get_row(&self, token_id: usize, out: &mut [f32]);

    fn set(&self, token_id: usize, topic_id: usize, value: f32);

    fn increase(&self, token_id: usize, topic_id: usize, delta: f32);

    /// Add `delta` to a whole token row under the row lock.
    fn increase_row(&self, token_id: usize, delta: &[f32]);

    /// Approximate memory footprint of the weights.
    fn byte_size(&self) -> usize;
}

/// f32 stored as the bits of an `AtomicU32`.
#[derive(Default)]
#[repr(transparent)]
pub(crate) struct AtomicF32(AtomicU32);

impl AtomicF32 {
    #[inline]
    pub(crate) fn new(value: f32) -> Self {
        Self(AtomicU32::new(value.to_bits()))
    }

    #[inline]
    pub(crate) fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn store(&self, value: f32) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

impl fmt::Debug for AtomicF32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.load())
    }
}

/// Per-token spin lock.
#[derive(Debug, Default)]
pub(crate) struct SpinLock {
    locked: AtomicBool,
}

pub(crate) struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl SpinLock {
    #[inline]
    pub(crate) fn lock(&self) -> SpinGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                hint::spin_loop();
            }
        }
        SpinGuard { lock: self }
    }
}

impl Drop for SpinGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// Add `delta` to a row of cells while holding its lock.
#[inline]
pub(crate) fn increase_cells(lock: &SpinLock, cells: &[AtomicF32], delta: &[f32]) {
    debug_assert_eq!(cells.len(), delta.len());
    let _guard = lock.lock();
    for (cell, d) in cells.iter().zip(delta) {
        if *d != 0.0 {
            cell.store(cell.load() + *d);
        }
    }
}

#[derive(Debug)]
struct PhiRow {
    lock: SpinLock,
    values: Box<[AtomicF32]>,
}

impl PhiRow {
    fn zeros(topic_size: usize) -> Self {
        Self {
            lock: SpinLock::default(),
            values: (0..topic_size).map(|_| AtomicF32::new(0.0)).collect(),
        }
    }
}

/// Owned dense phi matrix: one row of topic weights per token.
///
/// The token dimension only grows (`add_token`, `reshape`); the topic count is
/// fixed at construction.
#[derive(Debug)]
pub struct DensePhiMatrix {
    model_name: String,
    topic_names: Vec<String>,
    tokens: TokenCollection,
    rows: Vec<PhiRow>,
}

impl DensePhiMatrix {
    pub fn new(model_name: impl Into<String>, topic_names: Vec<String>) -> Self {
        Self {
            model_name: model_name.into(),
            topic_names,
            tokens: TokenCollection::new(),
            rows: Vec::new(),
        }
    }

    /// Zero matrix with the token set and topics of `shape`.
    pub fn with_shape_of(model_name: impl Into<String>, shape: &dyn PhiMatrix) -> Self {
        let mut matrix = Self::new(model_name, shape.topic_names().to_vec());
        matrix.reshape(shape);
        matrix
    }

    /// Deep copy of any phi matrix.
    pub fn copy_of(model_name: impl Into<String>, source: &dyn PhiMatrix) -> Self {
        let matrix = Self::with_shape_of(model_name, source);
        let mut buf = vec![0.0f32; source.topic_size()];
        for token_id in 0..source.token_size() {
            source.get_row(token_id, &mut buf);
            matrix.set_row(token_id, &buf);
        }
        matrix
    }

    /// Deep, independent copy.
    pub fn duplicate(&self) -> Self {
        Self::copy_of(self.model_name.clone(), self)
    }

    /// tokenを追加する (既存tokenなら既存のindex)
    pub fn add_token(&mut self, token: Token) -> usize {
        let index = self.tokens.add(token);
        if index == self.rows.len() {
            self.rows.push(PhiRow::zeros(self.topic_names.len()));
        }
        index
    }

    /// Grow the token dimension so every token of `other` is present.
    /// Existing rows keep their values; new rows are zero.
    pub fn reshape(&mut self, other: &dyn PhiMatrix) {
        for token in other.tokens().iter() {
            self.add_token(token.clone());
        }
    }

    pub fn set_model_name(&mut self, model_name: impl Into<String>) {
        self.model_name = model_name.into();
    }

    pub fn set_topic_name(&mut self, topic_id: usize, name: impl Into<String>) -> Result<()> {
        match self.topic_names.get_mut(topic_id) {
            Some(slot) => {
                *slot = name.into();
                Ok(())
            }
            None => Err(ArtmError::out_of_range("topic_id", topic_id)),
        }
    }

    pub fn set_row(&self, token_id: usize, values: &[f32]) {
        let row = &self.rows[token_id];
        debug_assert_eq!(row.values.len(), values.len());
        let _guard = row.lock.lock();
        for (cell, v) in row.values.iter().zip(values) {
            cell.store(*v);
        }
    }

    /// Multiply every cell by `factor`.
    pub fn scale(&self, factor: f32) {
        for row in &self.rows {
            let _guard = row.lock.lock();
            for cell in row.values.iter() {
                cell.store(cell.load() * factor);
            }
        }
    }

    pub fn clear_values(&self) {
        self.scale(0.0);
    }

    /// Class id of every token, by token index.
    pub fn class_ids(&self) -> Vec<ClassId> {
        self.tokens.iter().map(|t| t.class_id.clone()).collect()
    }

    /// Copy of the weights, token-major.
    pub fn to_rows(&self) -> Vec<Vec<f32>> {
        let mut out = Vec::with_capacity(self.rows.len());
        let mut buf = vec![0.0f32; self.topic_size()];
        for token_id in 0..self.rows.len() {
            self.get_row(token_id, &mut buf);
            out.push(buf.clone());
        }
        out
    }
}

impl PhiMatrix for DensePhiMatrix {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn topic_size(&self) -> usize {
        self.topic_names.len()
    }

    fn token_size(&self) -> usize {
        self.tokens.len()
    }

    fn topic_names(&self) -> &[String] {
        &self.topic_names
    }

    fn tokens(&self) -> &TokenCollection {
        &self.tokens
    }

    #[inline]
    fn get(&self, token_id: usize, topic_id: usize) -> f32 {
        self.rows[token_id].values[topic_id].load()
    }

    #[inline]
    fn get_row(&self, token_id: usize, out: &mut [f32]) {
        let row = &self.rows[token_id];
        debug_assert_eq!(row.values.len(), out.len());
        for (o, cell) in out.iter_mut().zip(row.values.iter()) {
            *o = cell.load();
        }
    }

    #[inline]
    fn set(&self, token_id: usize, topic_id: usize, value: f32) {
        self.rows[token_id].values[topic_id].store(value);
    }

    #[inline]
    fn increase(&self, token_id: usize, topic_id: usize, delta: f32) {
        let row = &self.rows[token_id];
        let _guard = row.lock.lock();
        let cell = &row.values[topic_id];
        cell.store(cell.load() + delta);
    }

    #[inline]
    fn increase_row(&self, token_id: usize, delta: &[f32]) {
        let row = &self.rows[token_id];
        increase_cells(&row.lock, &row.values, delta);
    }

    fn byte_size(&self) -> usize {
        self.rows.len() * (self.topic_size() * std::mem::size_of::<f32>() + std::mem::size_of::<SpinLock>())
    }
}

/// Default topic names: `topic_0`, `topic_1`, ...
pub fn default_topic_names(num_topics: usize) -> Vec<String> {
    (0..num_topics).map(|t| format!("topic_{}", t)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn matrix(tokens: &[&str], topics: usize) -> DensePhiMatrix {
        let mut m = DensePhiMatrix::new("m", default_topic_names(topics));
        for t in tokens {
            m.add_token(Token::word(*t));
        }
        m
    }

    #[test]
    fn add_token_twice_adds_one_row() {
        let mut m = matrix(&[], 3);
        let first = m.add_token(Token::word("a"));
        let before = m.token_size();
        let second = m.add_token(Token::word("a"));
        assert_eq!(first, second);
        assert_eq!(m.token_size(), before);
        assert_eq!(m.token_size(), 1);
    }

    #[test]
    fn get_set_increase() {
        let m = matrix(&["a", "b"], 2);
        m.set(0, 1, 0.5);
        m.increase(0, 1, 0.25);
        m.increase_row(1, &[1.0, 2.0]);
        assert_eq!(m.get(0, 1), 0.75);
        let mut row = [0.0; 2];
        m.get_row(1, &mut row);
        assert_eq!(row, [1.0, 2.0]);
        assert_eq!(m.topic_name(1), "topic_1");
        assert_eq!(m.token(1), &Token::word("b"));
    }

    #[test]
    fn duplicate_is_independent() {
        let m = matrix(&["a"], 2);
        m.set(0, 0, 1.0);
        let copy = m.duplicate();
        m.set(0, 0, 2.0);
        assert_eq!(copy.get(0, 0), 1.0);
        assert_eq!(copy.token_size(), 1);
    }

    #[test]
    fn reshape_grows_only() {
        let mut m = matrix(&["a", "b"], 2);
        m.set(1, 1, 3.0);
        let other = matrix(&["b", "c"], 2);
        m.reshape(&other);
        assert_eq!(m.token_size(), 3);
        assert_eq!(m.get(1, 1), 3.0);
        assert_eq!(m.get(2, 0), 0.0);
        assert_eq!(m.token_index(&Token::word("c")), Some(2));
    }

    #[test]
    fn concurrent_increase_on_same_row_is_serialized() {
        let m = Arc::new(matrix(&["a", "b"], 4));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let m = Arc::clone(&m);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        m.increase_row(i % 2, &[1.0, 1.0, 1.0, 1.0]);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for t in 0..4 {
            assert_eq!(m.get(0, t), 4000.0);
            assert_eq!(m.get(1, t), 4000.0);
        }
    }

    #[test]
    fn rename_topic_keeps_count() {
        let mut m = matrix(&["a"], 2);
        m.set_topic_name(0, "sports").unwrap();
        assert_eq!(m.topic_names(), &["sports".to_string(), "topic_1".to_string()]);
        assert!(m.set_topic_name(5, "x").is_err());
    }
}
