use indexmap::IndexSet;

use crate::batch::Batch;
use crate::config::ProcessBatchesArgs;
use crate::utils::datastruct::CsrMatrix;

/// Document × token count matrix of a batch.
///
/// One entry per token occurrence, in document order; its value is
/// `token_weight * class_weight * transaction_type_weight`.
pub fn initialize_sparse_ndw(batch: &Batch, args: &ProcessBatchesArgs) -> CsrMatrix<f32> {
    let class_weights = args.class_weights();
    let type_weights = args.transaction_weights();

    let nnz: usize = batch.item.iter().map(|item| item.token_id.len()).sum();
    let mut val = Vec::with_capacity(nnz);
    let mut col_ind = Vec::with_capacity(nnz);
    let mut row_ptr = Vec::with_capacity(batch.item_size() + 1);

    for item in &batch.item {
        row_ptr.push(val.len());
        for transaction in 0..item.num_transactions() {
            let type_weight = type_weights.weight(batch.transaction_type_of(item, transaction));
            for index in item.transaction_range(transaction) {
                let token_id = item.token_id[index];
                let class_weight = class_weights.weight(batch.class_of(token_id));
                val.push(item.token_weight(index) * class_weight * type_weight);
                col_ind.push(token_id);
            }
        }
    }
    row_ptr.push(val.len());

    CsrMatrix::new(batch.token_size(), val, row_ptr, col_ind)
}

/// Document × transaction count matrix together with the distinct
/// transactions of the batch.
#[derive(Debug, Clone)]
pub struct SparseNdx {
    /// columns index `transactions`
    pub ndx: CsrMatrix<f32>,
    /// batch token ids of every distinct transaction, in first-seen order
    pub transactions: Vec<Vec<usize>>,
}

impl SparseNdx {
    /// Largest number of tokens in one transaction.
    pub fn max_arity(&self) -> usize {
        self.transactions.iter().map(|t| t.len()).max().unwrap_or(0)
    }
}

/// Document × transaction matrix. One entry per transaction occurrence whose
/// value is the weight of the transaction's first token times its type weight
/// times the class weight of every member token.
pub fn initialize_sparse_ndx(batch: &Batch, args: &ProcessBatchesArgs) -> SparseNdx {
    let class_weights = args.class_weights();
    let type_weights = args.transaction_weights();

    let mut dictionary: IndexSet<Vec<usize>> = IndexSet::new();
    let mut val = Vec::new();
    let mut col_ind = Vec::new();
    let mut row_ptr = Vec::with_capacity(batch.item_size() + 1);

    for item in &batch.item {
        row_ptr.push(val.len());
        for transaction in 0..item.num_transactions() {
            let range = item.transaction_range(transaction);
            if range.is_empty() {
                continue;
            }
            let token_ids = item.token_id[range.clone()].to_vec();
            let mut weight = item.token_weight(range.start)
                * type_weights.weight(batch.transaction_type_of(item, transaction));
            for &token_id in &token_ids {
                weight *= class_weights.weight(batch.class_of(token_id));
            }
            let (column, _) = dictionary.insert_full(token_ids);
            val.push(weight);
            col_ind.push(column);
        }
    }
    row_ptr.push(val.len());

    let transactions: Vec<Vec<usize>> = dictionary.into_iter().collect();
    SparseNdx {
        ndx: CsrMatrix::new(transactions.len(), val, row_ptr, col_ind),
        transactions,
    }
}
