/// This crate is a topic modeling engine based on Additive Regularization of
/// Topic Models (ARTM).
pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod master;
pub mod model;
pub mod regularizer;
pub mod score;
pub mod utils;

/// Master Component
/// The top-level struct of this crate, providing model fitting and inference.
///
/// Internally, it holds:
/// - A pool of processor threads running EM inference on batches
/// - A merger thread folding count increments into topic models
/// - Registries of batches, dictionaries, models, regularizers and scores
/// - A theta cache, optionally spilled to disk
///
/// Supported algorithms:
/// - `fit_offline`: full passes over a collection
/// - `fit_online`: model update every few batches, optionally asynchronous
/// - `transform`: theta inference against a fixed model
///
/// # Thread Safety
/// Every method except `reconfigure` takes `&self`; the component can be
/// shared between threads.
pub use master::MasterComponent;

/// Configuration structures
/// `MasterModelConfig` configures the component as a whole;
/// `ProcessBatchesArgs` is the per-call view used by the processors.
///
/// # Serialization
/// Supported.
pub use config::{MasterModelConfig, ProcessBatchesArgs, RegularizerConfig, ScoreConfig, ThetaMatrixType};

/// Batch of documents
/// A batch interns its tokens once and stores every item as indices into
/// them, with optional multi-token transactions.
///
/// # Serialization
/// Supported. `save_batch` / `load_batch` use CBOR files.
pub use batch::{load_batch, save_batch, Batch, BatchBuilder, BatchSource, Item};

/// Topic model structures
/// - `PhiMatrix`: token × topic weight store with per-token locking
/// - `DensePhiMatrix`: owned backing
/// - `AttachedPhiMatrix`: view over caller memory
/// - `TopicModel`: Nwt counts with the Pwt derived from them
pub use model::{
    AttachedPhiMatrix, DensePhiMatrix, Dictionary, PhiMatrix, Token, TopicModel, TopicModelData,
};

/// Theta matrix
/// Document × topic distributions gathered from the theta cache.
pub use engine::cache_manager::ThetaMatrix;

/// Score values
pub use score::ScoreData;

pub use error::{ArtmError, Result};
