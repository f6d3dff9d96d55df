pub mod attached;
pub mod dictionary;
pub mod phi_matrix;
pub mod token;
pub mod topic_model;

pub use attached::AttachedPhiMatrix;
pub use dictionary::{Dictionary, DictionaryEntry};
pub use phi_matrix::{default_topic_names, DensePhiMatrix, PhiMatrix};
pub use token::{ClassId, Token, TokenCollection, TransactionTypeName, DEFAULT_CLASS, DEFAULT_TRANSACTION};
pub use topic_model::{TopicModel, TopicModelData};
