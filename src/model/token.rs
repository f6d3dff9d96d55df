use std::fmt;

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};

/// Modality (class) identifier, e.g. `@default_class` or `@labels`.
pub type ClassId = String;

/// Transaction type tag.
pub type TransactionTypeName = String;

pub const DEFAULT_CLASS: &str = "@default_class";
pub const DEFAULT_TRANSACTION: &str = "@default_transaction";

/// Token identity: (class id, keyword, transaction type).
///
/// Tokens are immutable once created and compared structurally.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Token {
    pub class_id: ClassId,
    pub keyword: String,
    pub transaction_type: TransactionTypeName,
}

impl Token {
    pub fn new(class_id: impl Into<ClassId>, keyword: impl Into<String>) -> Self {
        Self {
            class_id: class_id.into(),
            keyword: keyword.into(),
            transaction_type: DEFAULT_TRANSACTION.to_string(),
        }
    }

    /// Token of the default class.
    pub fn word(keyword: impl Into<String>) -> Self {
        Self::new(DEFAULT_CLASS, keyword)
    }

    pub fn with_transaction_type(mut self, transaction_type: impl Into<TransactionTypeName>) -> Self {
        self.transaction_type = transaction_type.into();
        self
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.class_id == DEFAULT_CLASS {
            write!(f, "{}", self.keyword)
        } else {
            write!(f, "{}:{}", self.class_id, self.keyword)
        }
    }
}

///  TokenCollection
/// Tokenに密なindexを割り当てる
/// 一度割り当てたindexは変わらない
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenCollection {
    tokens: IndexSet<Token>,
}

impl TokenCollection {
    pub fn new() -> Self {
        Self {
            tokens: IndexSet::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tokens: IndexSet::with_capacity(capacity),
        }
    }

    /// tokenを追加する
    ///
    /// # Returns
    /// * `usize` - tokenのindex (既存なら既存のindex)
    #[inline]
    pub fn add(&mut self, token: Token) -> usize {
        self.tokens.insert_full(token).0
    }

    #[inline]
    pub fn token_index(&self, token: &Token) -> Option<usize> {
        self.tokens.get_index_of(token)
    }

    #[inline]
    pub fn token(&self, index: usize) -> Option<&Token> {
        self.tokens.get_index(index)
    }

    #[inline]
    pub fn has_token(&self, token: &Token) -> bool {
        self.tokens.contains(token)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Token> {
        self.tokens.iter()
    }
}

impl std::ops::Index<usize> for TokenCollection {
    type Output = Token;

    #[inline]
    fn index(&self, index: usize) -> &Token {
        &self.tokens[index]
    }
}

impl FromIterator<Token> for TokenCollection {
    fn from_iter<I: IntoIterator<Item = Token>>(iter: I) -> Self {
        Self {
            tokens: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_idempotent() {
        let mut tokens = TokenCollection::new();
        let a = tokens.add(Token::word("alpha"));
        let b = tokens.add(Token::word("beta"));
        let a2 = tokens.add(Token::word("alpha"));
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(tokens.len(), 2);
    }

    #[test]
    fn class_and_transaction_are_part_of_identity() {
        let mut tokens = TokenCollection::new();
        tokens.add(Token::word("x"));
        tokens.add(Token::new("@labels", "x"));
        tokens.add(Token::word("x").with_transaction_type("@pair"));
        assert_eq!(tokens.len(), 3);
        assert_eq!(tokens.token_index(&Token::new("@labels", "x")), Some(1));
        assert_eq!(tokens.token(0).map(|t| t.to_string()), Some("x".to_string()));
        assert_eq!(tokens.token(1).map(|t| t.to_string()), Some("@labels:x".to_string()));
    }
}
