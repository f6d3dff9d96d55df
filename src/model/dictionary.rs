use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::batch::Batch;
use crate::model::token::Token;

/// Collection statistics of one token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DictionaryEntry {
    /// normalized term frequency within its class
    pub value: f32,
    /// total weight over the collection
    pub tf: f32,
    /// number of documents containing the token
    pub df: f32,
}

/// Static vocabulary statistics of a collection.
///
/// Read-only once registered; used to seed phi matrices and by regularizers
/// that weight tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dictionary {
    pub name: String,
    #[serde(with = "indexmap::map::serde_seq")]
    entries: IndexMap<Token, DictionaryEntry>,
    /// pairwise co-occurrence values keyed by entry indices (smaller first)
    cooc: HashMap<(usize, usize), f32>,
    num_items: usize,
}

impl Dictionary {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Collect tf / df / value statistics from batches.
    pub fn gather<'a, I>(name: impl Into<String>, batches: I) -> Self
    where
        I: IntoIterator<Item = &'a Batch>,
    {
        let mut dict = Self::new(name);
        for batch in batches {
            let tokens: Vec<Token> = (0..batch.token_size()).map(|i| batch.token(i)).collect();
            let mut seen = vec![usize::MAX; batch.token_size()];
            for (item_index, item) in batch.item.iter().enumerate() {
                dict.num_items += 1;
                for (pos, &token_id) in item.token_id.iter().enumerate() {
                    let entry = dict.entries.entry(tokens[token_id].clone()).or_default();
                    entry.tf += item.token_weight(pos);
                    // 同じ文書内で数えるのは一度だけ
                    if seen[token_id] != item_index {
                        seen[token_id] = item_index;
                        entry.df += 1.0;
                    }
                }
            }
        }
        dict.recalculate_values();
        dict
    }

    /// value = tf / Σ tf over the token's class.
    fn recalculate_values(&mut self) {
        let mut class_sums: HashMap<String, f32> = HashMap::new();
        for (token, entry) in &self.entries {
            *class_sums.entry(token.class_id.clone()).or_default() += entry.tf;
        }
        for (token, entry) in self.entries.iter_mut() {
            let sum = class_sums.get(&token.class_id).copied().unwrap_or(0.0);
            entry.value = if sum > 0.0 { entry.tf / sum } else { 0.0 };
        }
    }

    pub fn add_entry(&mut self, token: Token, entry: DictionaryEntry) -> usize {
        self.entries.insert_full(token, entry).0
    }

    pub fn entry(&self, token: &Token) -> Option<&DictionaryEntry> {
        self.entries.get(token)
    }

    pub fn token_index(&self, token: &Token) -> Option<usize> {
        self.entries.get_index_of(token)
    }

    pub fn tokens(&self) -> impl Iterator<Item = &Token> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Token, &DictionaryEntry)> {
        self.entries.iter()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn set_cooc_value(&mut self, a: &Token, b: &Token, value: f32) -> bool {
        match (self.token_index(a), self.token_index(b)) {
            (Some(i), Some(j)) => {
                self.cooc.insert(ordered(i, j), value);
                true
            }
            _ => false,
        }
    }

    pub fn cooc_value(&self, a: &Token, b: &Token) -> f32 {
        match (self.token_index(a), self.token_index(b)) {
            (Some(i), Some(j)) => self.cooc.get(&ordered(i, j)).copied().unwrap_or(0.0),
            _ => 0.0,
        }
    }
}

#[inline]
fn ordered(i: usize, j: usize) -> (usize, usize) {
    if i <= j {
        (i, j)
    } else {
        (j, i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchBuilder;

    #[test]
    fn gather_counts_tf_and_df() {
        let batch = BatchBuilder::new("b")
            .add_item("d1", &[(Token::word("a"), 2.0), (Token::word("a"), 1.0), (Token::word("b"), 1.0)])
            .add_item("d2", &[(Token::word("b"), 4.0), (Token::new("@labels", "x"), 1.0)])
            .build();
        let dict = Dictionary::gather("dict", [&batch]);
        assert_eq!(dict.size(), 3);
        assert_eq!(dict.num_items(), 2);

        let a = dict.entry(&Token::word("a")).unwrap();
        assert_eq!((a.tf, a.df), (3.0, 1.0));
        let b = dict.entry(&Token::word("b")).unwrap();
        assert_eq!((b.tf, b.df), (5.0, 2.0));
        assert!((a.value - 3.0 / 8.0).abs() < 1e-6);
        assert_eq!(dict.entry(&Token::new("@labels", "x")).unwrap().value, 1.0);
    }

    #[test]
    fn cooc_is_symmetric() {
        let mut dict = Dictionary::new("d");
        dict.add_entry(Token::word("a"), DictionaryEntry::default());
        dict.add_entry(Token::word("b"), DictionaryEntry::default());
        assert!(dict.set_cooc_value(&Token::word("b"), &Token::word("a"), 0.3));
        assert_eq!(dict.cooc_value(&Token::word("a"), &Token::word("b")), 0.3);
        assert_eq!(dict.cooc_value(&Token::word("a"), &Token::word("zzz")), 0.0);
        assert!(!dict.set_cooc_value(&Token::word("a"), &Token::word("zzz"), 1.0));
    }
}
