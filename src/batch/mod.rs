pub mod ndw;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ArtmError, Result};
use crate::model::token::{ClassId, Token, TransactionTypeName, DEFAULT_CLASS, DEFAULT_TRANSACTION};

/// One document of a batch.
///
/// `token_id` indexes into the batch vocabulary (`Batch::token`).
/// `transaction_start_index` splits the token list into transactions: with
/// `n` transactions it has `n + 1` entries ending at `token_id.len()`. When it
/// is empty, every token is its own transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Item {
    pub id: i32,
    pub title: String,
    pub token_id: Vec<usize>,
    pub token_weight: Vec<f32>,
    pub transaction_start_index: Vec<usize>,
    /// one entry per transaction, indexing `Batch::transaction_typename`
    pub transaction_typename_id: Vec<usize>,
}

impl Item {
    pub fn num_transactions(&self) -> usize {
        if self.transaction_start_index.is_empty() {
            self.token_id.len()
        } else {
            self.transaction_start_index.len() - 1
        }
    }

    /// Token range of a transaction.
    #[inline]
    pub fn transaction_range(&self, transaction: usize) -> Range<usize> {
        if self.transaction_start_index.is_empty() {
            transaction..transaction + 1
        } else {
            self.transaction_start_index[transaction]..self.transaction_start_index[transaction + 1]
        }
    }

    #[inline]
    pub fn token_weight(&self, index: usize) -> f32 {
        self.token_weight.get(index).copied().unwrap_or(1.0)
    }

    pub fn has_multi_token_transactions(&self) -> bool {
        self.transaction_start_index.windows(2).any(|w| w[1] - w[0] > 1)
    }
}

/// Unit of documents processed together by one processor task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Batch {
    pub id: String,
    pub description: String,
    pub token: Vec<String>,
    /// class of every batch token; empty means every token is of the default class
    pub class_id: Vec<ClassId>,
    pub transaction_typename: Vec<TransactionTypeName>,
    pub item: Vec<Item>,
}

impl Batch {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    #[inline]
    pub fn token_size(&self) -> usize {
        self.token.len()
    }

    #[inline]
    pub fn item_size(&self) -> usize {
        self.item.len()
    }

    #[inline]
    pub fn class_of(&self, token_id: usize) -> &str {
        self.class_id.get(token_id).map(|c| c.as_str()).unwrap_or(DEFAULT_CLASS)
    }

    pub fn token(&self, token_id: usize) -> Token {
        Token::new(self.class_of(token_id), self.token[token_id].clone())
    }

    /// Type name of transaction `transaction` of `item`.
    pub fn transaction_type_of(&self, item: &Item, transaction: usize) -> &str {
        item.transaction_typename_id
            .get(transaction)
            .and_then(|&id| self.transaction_typename.get(id))
            .map(|s| s.as_str())
            .unwrap_or(DEFAULT_TRANSACTION)
    }

    /// Whether any transaction of any item spans more than one token.
    pub fn has_multi_token_transactions(&self) -> bool {
        self.item.iter().any(|item| item.has_multi_token_transactions())
    }

    /// Check the internal references of the batch.
    pub fn validate(&self) -> Result<()> {
        if !self.class_id.is_empty() && self.class_id.len() != self.token.len() {
            return Err(ArtmError::CorruptedMessage(format!(
                "batch {}: {} tokens but {} class ids",
                self.id,
                self.token.len(),
                self.class_id.len()
            )));
        }
        for item in &self.item {
            if let Some(&bad) = item.token_id.iter().find(|&&id| id >= self.token.len()) {
                return Err(ArtmError::CorruptedMessage(format!(
                    "batch {}: item {} refers to token {} out of {}",
                    self.id,
                    item.id,
                    bad,
                    self.token.len()
                )));
            }
            if !item.token_weight.is_empty() && item.token_weight.len() != item.token_id.len() {
                return Err(ArtmError::CorruptedMessage(format!(
                    "batch {}: item {} has {} weights for {} tokens",
                    self.id,
                    item.id,
                    item.token_weight.len(),
                    item.token_id.len()
                )));
            }
            let starts = &item.transaction_start_index;
            if !starts.is_empty() {
                let well_formed = starts[0] == 0
                    && starts.last() == Some(&item.token_id.len())
                    && starts.windows(2).all(|w| w[0] < w[1]);
                if !well_formed {
                    return Err(ArtmError::CorruptedMessage(format!(
                        "batch {}: item {} has malformed transaction_start_index",
                        self.id, item.id
                    )));
                }
            }
            if let Some(&bad) = item
                .transaction_typename_id
                .iter()
                .find(|&&id| id >= self.transaction_typename.len())
            {
                return Err(ArtmError::CorruptedMessage(format!(
                    "batch {}: item {} refers to transaction type {} out of {}",
                    self.id,
                    item.id,
                    bad,
                    self.transaction_typename.len()
                )));
            }
        }
        Ok(())
    }
}

/// Read a CBOR encoded batch file.
pub fn load_batch<P: AsRef<Path>>(path: P) -> Result<Batch> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| ArtmError::DiskRead {
        path: path.to_path_buf(),
        source,
    })?;
    let batch: Batch = serde_cbor::from_reader(BufReader::new(file))?;
    batch.validate()?;
    Ok(batch)
}

/// Write a batch as CBOR.
pub fn save_batch<P: AsRef<Path>>(batch: &Batch, path: P) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|source| ArtmError::DiskWrite {
        path: path.to_path_buf(),
        source,
    })?;
    serde_cbor::to_writer(BufWriter::new(file), batch)?;
    Ok(())
}

/// Where a processor task takes its batch from.
#[derive(Debug, Clone)]
pub enum BatchSource {
    /// already deserialized
    InMemory(Arc<Batch>),
    /// registered in the instance under this name
    Registered(String),
    /// CBOR file on disk
    File(PathBuf),
}

impl BatchSource {
    /// Human readable reference for log lines.
    pub fn describe(&self) -> String {
        match self {
            BatchSource::InMemory(batch) => batch.id.clone(),
            BatchSource::Registered(name) => name.clone(),
            BatchSource::File(path) => path.display().to_string(),
        }
    }
}

///  BatchBuilder
/// tokenをinternしながらBatchを組み立てる
#[derive(Debug, Default)]
pub struct BatchBuilder {
    batch: Batch,
    vocab: IndexMap<Token, usize>,
    types: IndexMap<TransactionTypeName, usize>,
}

impl BatchBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            batch: Batch::new(id),
            ..Self::default()
        }
    }

    fn intern(&mut self, token: &Token) -> usize {
        if let Some(&id) = self.vocab.get(token) {
            return id;
        }
        let id = self.batch.token.len();
        self.batch.token.push(token.keyword.clone());
        self.batch.class_id.push(token.class_id.clone());
        self.vocab.insert(token.clone(), id);
        id
    }

    fn intern_type(&mut self, name: &str) -> usize {
        if let Some(&id) = self.types.get(name) {
            return id;
        }
        let id = self.batch.transaction_typename.len();
        self.batch.transaction_typename.push(name.to_string());
        self.types.insert(name.to_string(), id);
        id
    }

    /// Add a document made of single-token transactions.
    pub fn add_item(&mut self, title: impl Into<String>, tokens: &[(Token, f32)]) -> &mut Self {
        let mut item = Item {
            id: self.batch.item.len() as i32,
            title: title.into(),
            ..Item::default()
        };
        for (token, weight) in tokens {
            let id = self.intern(token);
            item.token_id.push(id);
            item.token_weight.push(*weight);
        }
        self.batch.item.push(item);
        self
    }

    /// Add a document made of transactions. Each transaction is a group of
    /// tokens sharing one weight and one transaction type.
    pub fn add_transaction_item(
        &mut self,
        title: impl Into<String>,
        transactions: &[(&str, Vec<Token>, f32)],
    ) -> &mut Self {
        let mut item = Item {
            id: self.batch.item.len() as i32,
            title: title.into(),
            transaction_start_index: vec![0],
            ..Item::default()
        };
        for (type_name, tokens, weight) in transactions {
            let type_id = self.intern_type(type_name);
            for token in tokens {
                let id = self.intern(token);
                item.token_id.push(id);
                item.token_weight.push(*weight);
            }
            item.transaction_start_index.push(item.token_id.len());
            item.transaction_typename_id.push(type_id);
        }
        self.batch.item.push(item);
        self
    }

    pub fn build(&self) -> Batch {
        self.batch.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_interns_tokens() {
        let batch = BatchBuilder::new("b1")
            .add_item("d1", &[(Token::word("a"), 2.0), (Token::word("b"), 1.0)])
            .add_item("d2", &[(Token::word("b"), 3.0), (Token::new("@labels", "a"), 1.0)])
            .build();
        assert_eq!(batch.token_size(), 3);
        assert_eq!(batch.item[1].token_id, vec![1, 2]);
        assert_eq!(batch.class_of(2), "@labels");
        assert_eq!(batch.token(2), Token::new("@labels", "a"));
        assert!(batch.validate().is_ok());
        assert!(!batch.has_multi_token_transactions());
    }

    #[test]
    fn transactions() {
        let batch = BatchBuilder::new("b")
            .add_transaction_item(
                "d",
                &[
                    ("@pair", vec![Token::word("u"), Token::new("@labels", "l")], 1.0),
                    ("@single", vec![Token::word("v")], 2.0),
                ],
            )
            .build();
        let item = &batch.item[0];
        assert_eq!(item.num_transactions(), 2);
        assert_eq!(item.transaction_range(0), 0..2);
        assert_eq!(batch.transaction_type_of(item, 1), "@single");
        assert!(batch.has_multi_token_transactions());
        assert!(batch.validate().is_ok());
    }

    #[test]
    fn validate_rejects_dangling_token() {
        let mut batch = Batch::new("bad");
        batch.token = vec!["a".into()];
        batch.item.push(Item {
            token_id: vec![3],
            ..Item::default()
        });
        assert!(matches!(batch.validate(), Err(ArtmError::CorruptedMessage(_))));
    }

    #[test]
    fn file_roundtrip() {
        let batch = BatchBuilder::new("disk")
            .add_item("d", &[(Token::word("a"), 1.0)])
            .build();
        let path = std::env::temp_dir().join(format!("artm_batch_{}.cbor", std::process::id()));
        save_batch(&batch, &path).unwrap();
        assert_eq!(load_batch(&path).unwrap(), batch);
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(load_batch(&path), Err(ArtmError::DiskRead { .. })));
    }
}
