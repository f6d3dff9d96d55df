pub mod csr;
pub mod dense;
pub mod holder;
pub mod queue;

pub use csr::CsrMatrix;
pub use dense::DenseMatrix;
pub use holder::ThreadSafeHolder;
pub use queue::ThreadSafeQueue;
