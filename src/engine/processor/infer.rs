//! EM inner loop of one batch.
//!
//! Every path takes the local phi view of the batch (one row per batch token
//! or transaction), the initial theta (one row per item) and the Ndw / Ndx
//! matrix, and returns the converged theta together with the expected counts
//! per batch token. No path touches shared state.

use crate::batch::ndw::SparseNdx;
use crate::batch::Batch;
use crate::config::ProcessBatchesArgs;
use crate::model::phi_matrix::PhiMatrix;
use crate::regularizer::{PtdwAgentCollection, ThetaAgentCollection};
use crate::utils::datastruct::{CsrMatrix, DenseMatrix};
use crate::utils::math::{axpy, dot, hadamard_assign, is_zero, normalize};

/// Numeric path of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InferencePath {
    /// per-token sparse updates
    Sparse,
    /// per-item dense phi-theta products over the whole batch vocabulary
    Dense,
    /// product of phi over multi-token transactions
    Transaction,
    /// explicit p(t|d,w) matrices, required by ptdw agents and the ptdw cache
    Ptdw,
}

/// Pick the path of a batch, or `None` for an unsupported combination.
pub fn select_path(batch: &Batch, args: &ProcessBatchesArgs, has_ptdw_agents: bool) -> Option<InferencePath> {
    let use_ptdw = has_ptdw_agents || args.cache_ptdw;
    if batch.has_multi_token_transactions() {
        if use_ptdw {
            log::error!("batch {}: ptdw inference does not support multi-token transactions, skipped", batch.id);
            return None;
        }
        if args.opt_for_avx {
            log::error!("batch {}: dense inference does not support multi-token transactions, skipped", batch.id);
            return None;
        }
        return Some(InferencePath::Transaction);
    }
    Some(if use_ptdw {
        InferencePath::Ptdw
    } else if args.opt_for_avx {
        InferencePath::Dense
    } else {
        InferencePath::Sparse
    })
}

/// Pwt rows of the batch tokens.
///
/// # Returns
/// * `(DenseMatrix<f32>, Vec<Option<usize>>)` - local phi (zero rows for
///   tokens missing from `pwt`) and the Pwt index of every batch token
pub fn build_local_phi(batch: &Batch, pwt: &dyn PhiMatrix) -> (DenseMatrix<f32>, Vec<Option<usize>>) {
    let mut phi = DenseMatrix::zeros(batch.token_size(), pwt.topic_size());
    let mut index = Vec::with_capacity(batch.token_size());
    for w in 0..batch.token_size() {
        let pwt_id = pwt.token_index(&batch.token(w));
        if let Some(id) = pwt_id {
            pwt.get_row(id, phi.row_mut(w));
        }
        index.push(pwt_id);
    }
    (phi, index)
}

/// Phi of every transaction: the product of its token rows.
pub fn build_transaction_phi(ndx: &SparseNdx, phi: &DenseMatrix<f32>) -> DenseMatrix<f32> {
    let mut unit_phi = DenseMatrix::filled(ndx.transactions.len(), phi.no_columns(), 1.0);
    for (x, tokens) in ndx.transactions.iter().enumerate() {
        let row = unit_phi.row_mut(x);
        for &w in tokens {
            hadamard_assign(row, phi.row(w));
        }
    }
    unit_phi
}

/// Per-item E-step over a sparse unit matrix (tokens or transactions).
pub fn infer_theta_sparse(
    ndw: &CsrMatrix<f32>,
    phi: &DenseMatrix<f32>,
    theta: &mut DenseMatrix<f32>,
    num_passes: usize,
    agents: &ThetaAgentCollection,
) {
    let topic_size = phi.no_columns();
    let mut helper = vec![0.0f32; topic_size];
    let mut scratch = vec![0.0f32; topic_size];
    for d in 0..ndw.num_rows() {
        let theta_d = theta.row_mut(d);
        for iter in 0..num_passes {
            helper.iter_mut().for_each(|h| *h = 0.0);
            for (w, n_dw) in ndw.row_iter(d) {
                if is_zero(n_dw) {
                    continue;
                }
                let phi_w = phi.row(w);
                let p_dw = dot(phi_w, theta_d);
                if is_zero(p_dw) {
                    continue;
                }
                axpy(n_dw / p_dw, phi_w, &mut helper);
            }
            hadamard_assign(theta_d, &helper);
            agents.apply(d, iter, theta_d, &mut scratch);
        }
    }
}

/// Per-item E-step computing `p = Phi θ` over the whole batch vocabulary.
pub fn infer_theta_dense(
    ndw: &CsrMatrix<f32>,
    phi: &DenseMatrix<f32>,
    theta: &mut DenseMatrix<f32>,
    num_passes: usize,
    agents: &ThetaAgentCollection,
) {
    let token_size = phi.no_rows();
    let topic_size = phi.no_columns();
    let mut n_w = vec![0.0f32; token_size];
    let mut p_w = vec![0.0f32; token_size];
    let mut helper = vec![0.0f32; topic_size];
    let mut scratch = vec![0.0f32; topic_size];
    for d in 0..ndw.num_rows() {
        n_w.iter_mut().for_each(|n| *n = 0.0);
        for (w, n_dw) in ndw.row_iter(d) {
            n_w[w] += n_dw;
        }
        let theta_d = theta.row_mut(d);
        for iter in 0..num_passes {
            for w in 0..token_size {
                p_w[w] = dot(phi.row(w), theta_d);
            }
            helper.iter_mut().for_each(|h| *h = 0.0);
            for w in 0..token_size {
                if is_zero(n_w[w]) || is_zero(p_w[w]) {
                    continue;
                }
                axpy(n_w[w] / p_w[w], phi.row(w), &mut helper);
            }
            hadamard_assign(theta_d, &helper);
            agents.apply(d, iter, theta_d, &mut scratch);
        }
    }
}

/// Expected counts `n_wt = Σ_d n_dw φ_wt θ_td / p_dw`, one unit row at a time
/// over the transposed count matrix.
///
/// `units` maps every unit (column of `ndw`) to the batch tokens it counts
/// for; `None` means unit `w` is token `w`.
pub fn calc_nwt(
    ndw: &CsrMatrix<f32>,
    phi: &DenseMatrix<f32>,
    theta: &DenseMatrix<f32>,
    units: Option<&[Vec<usize>]>,
    token_size: usize,
) -> DenseMatrix<f32> {
    let topic_size = phi.no_columns();
    let ndw_t = ndw.transpose();
    let mut nwt = DenseMatrix::zeros(token_size, topic_size);
    let mut acc = vec![0.0f32; topic_size];
    for unit in 0..ndw_t.num_rows() {
        let phi_w = phi.row(unit);
        acc.iter_mut().for_each(|a| *a = 0.0);
        let mut touched = false;
        for (d, n_dw) in ndw_t.row_iter(unit) {
            if is_zero(n_dw) {
                continue;
            }
            let theta_d = theta.row(d);
            let p_dw = dot(phi_w, theta_d);
            if is_zero(p_dw) {
                continue;
            }
            let scale = n_dw / p_dw;
            for t in 0..topic_size {
                acc[t] += scale * phi_w[t] * theta_d[t];
            }
            touched = true;
        }
        if !touched {
            continue;
        }
        match units {
            None => axpy(1.0, &acc, nwt.row_mut(unit)),
            Some(units) => {
                for &w in &units[unit] {
                    axpy(1.0, &acc, nwt.row_mut(w));
                }
            }
        }
    }
    nwt
}

/// `ptdw[i] = normalize(φ_{w_i} ⊙ θ_d)` for every entry of one item.
fn fill_ptdw(entries: &[(usize, f32)], phi: &DenseMatrix<f32>, theta_d: &[f32], ptdw: &mut DenseMatrix<f32>) {
    for (i, &(w, _)) in entries.iter().enumerate() {
        let row = ptdw.row_mut(i);
        row.copy_from_slice(phi.row(w));
        hadamard_assign(row, theta_d);
        normalize(row);
    }
}

/// Output of the ptdw path.
pub struct PtdwInference {
    pub nwt: DenseMatrix<f32>,
    /// final p(t|d,w) of every item, one row per token occurrence
    pub ptdw: Vec<DenseMatrix<f32>>,
}

/// E-step through explicit per-token posteriors.
///
/// Without ptdw agents the theta update equals the sparse path:
/// `Σ_i n_i φ_{w_i} θ / p_i = θ ⊙ Σ_i n_i φ_{w_i} / p_i`.
pub fn infer_ptdw(
    ndw: &CsrMatrix<f32>,
    phi: &DenseMatrix<f32>,
    theta: &mut DenseMatrix<f32>,
    num_passes: usize,
    theta_agents: &ThetaAgentCollection,
    ptdw_agents: &PtdwAgentCollection,
) -> PtdwInference {
    let topic_size = phi.no_columns();
    let mut nwt = DenseMatrix::zeros(phi.no_rows(), topic_size);
    let mut all_ptdw = Vec::with_capacity(ndw.num_rows());
    let mut scratch = vec![0.0f32; topic_size];

    for d in 0..ndw.num_rows() {
        let entries: Vec<(usize, f32)> = ndw.row_iter(d).collect();
        let mut ptdw = DenseMatrix::zeros(entries.len(), topic_size);
        let theta_d = theta.row_mut(d);
        for iter in 0..num_passes {
            fill_ptdw(&entries, phi, theta_d, &mut ptdw);
            ptdw_agents.apply(d, iter, &mut ptdw);
            theta_d.iter_mut().for_each(|v| *v = 0.0);
            for (i, &(_, n_dw)) in entries.iter().enumerate() {
                if !is_zero(n_dw) {
                    axpy(n_dw, ptdw.row(i), theta_d);
                }
            }
            theta_agents.apply(d, iter, theta_d, &mut scratch);
        }

        fill_ptdw(&entries, phi, theta_d, &mut ptdw);
        ptdw_agents.apply(d, num_passes, &mut ptdw);
        for (i, &(w, n_dw)) in entries.iter().enumerate() {
            if !is_zero(n_dw) {
                axpy(n_dw, ptdw.row(i), nwt.row_mut(w));
            }
        }
        all_ptdw.push(ptdw);
    }
    PtdwInference { nwt, ptdw: all_ptdw }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ndw::{initialize_sparse_ndw, initialize_sparse_ndx};
    use crate::batch::BatchBuilder;
    use crate::model::phi_matrix::DensePhiMatrix;
    use crate::model::token::Token;

    fn fixture() -> (Batch, DensePhiMatrix) {
        let batch = BatchBuilder::new("b")
            .add_item("d1", &[(Token::word("a"), 2.0), (Token::word("b"), 1.0), (Token::word("c"), 1.0)])
            .add_item("d2", &[(Token::word("c"), 3.0), (Token::word("a"), 1.0), (Token::word("zz"), 5.0)])
            .add_item("d3", &[(Token::word("b"), 1.0), (Token::word("b"), 2.0)])
            .build();
        let mut pwt = DensePhiMatrix::new("pwt", vec!["t0".into(), "t1".into()]);
        for (w, row) in [("a", [0.5f32, 0.1]), ("b", [0.3, 0.2]), ("c", [0.2, 0.7])] {
            let id = pwt.add_token(Token::word(w));
            pwt.set_row(id, &row);
        }
        (batch, pwt)
    }

    fn uniform(items: usize, topics: usize) -> DenseMatrix<f32> {
        DenseMatrix::filled(items, topics, 1.0 / topics as f32)
    }

    fn assert_close(a: &DenseMatrix<f32>, b: &DenseMatrix<f32>) {
        assert_eq!(a.no_rows(), b.no_rows());
        for (x, y) in a.as_slice().iter().zip(b.as_slice()) {
            assert!((x - y).abs() < 1e-4, "{} vs {}", x, y);
        }
    }

    #[test]
    fn local_phi_has_zero_rows_for_unknown_tokens() {
        let (batch, pwt) = fixture();
        let (phi, index) = build_local_phi(&batch, &pwt);
        assert_eq!(index, vec![Some(0), Some(1), Some(2), None]);
        assert_eq!(phi.row(3), &[0.0, 0.0]);
        assert_eq!(phi.row(2), &[0.2, 0.7]);
    }

    #[test]
    fn theta_rows_are_distributions() {
        let (batch, pwt) = fixture();
        let args = ProcessBatchesArgs::default();
        let ndw = initialize_sparse_ndw(&batch, &args);
        let (phi, _) = build_local_phi(&batch, &pwt);
        let mut theta = uniform(3, 2);
        infer_theta_sparse(&ndw, &phi, &mut theta, 10, &ThetaAgentCollection::default());
        for d in 0..3 {
            let row = theta.row(d);
            assert!(row.iter().all(|v| *v >= 0.0));
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn every_path_agrees() {
        let (batch, pwt) = fixture();
        let args = ProcessBatchesArgs { opt_for_avx: false, ..ProcessBatchesArgs::default() };
        let ndw = initialize_sparse_ndw(&batch, &args);
        let (phi, _) = build_local_phi(&batch, &pwt);
        let none = ThetaAgentCollection::default();

        let mut sparse = uniform(3, 2);
        infer_theta_sparse(&ndw, &phi, &mut sparse, 8, &none);
        let sparse_nwt = calc_nwt(&ndw, &phi, &sparse, None, batch.token_size());

        let mut dense = uniform(3, 2);
        infer_theta_dense(&ndw, &phi, &mut dense, 8, &none);
        let dense_nwt = calc_nwt(&ndw, &phi, &dense, None, batch.token_size());

        let mut ptdw_theta = uniform(3, 2);
        let ptdw = infer_ptdw(&ndw, &phi, &mut ptdw_theta, 8, &none, &PtdwAgentCollection::default());

        let ndx = initialize_sparse_ndx(&batch, &args);
        let unit_phi = build_transaction_phi(&ndx, &phi);
        let mut tx = uniform(3, 2);
        infer_theta_sparse(&ndx.ndx, &unit_phi, &mut tx, 8, &none);
        let tx_nwt = calc_nwt(&ndx.ndx, &unit_phi, &tx, Some(&ndx.transactions), batch.token_size());

        assert_close(&sparse, &dense);
        assert_close(&sparse, &ptdw_theta);
        assert_close(&sparse, &tx);
        assert_close(&sparse_nwt, &dense_nwt);
        assert_close(&sparse_nwt, &ptdw.nwt);
        assert_close(&sparse_nwt, &tx_nwt);
        // the unknown token contributes nothing
        assert_eq!(sparse_nwt.row(3), &[0.0, 0.0]);
    }

    #[test]
    fn token_order_does_not_change_counts() {
        let (batch, pwt) = fixture();
        let mut reordered = batch.clone();
        reordered.item[0].token_id.reverse();
        reordered.item[0].token_weight.reverse();
        let args = ProcessBatchesArgs::default();
        let none = ThetaAgentCollection::default();
        let (phi, _) = build_local_phi(&batch, &pwt);

        let mut totals = Vec::new();
        for b in [&batch, &reordered] {
            let ndw = initialize_sparse_ndw(b, &args);
            let mut theta = uniform(3, 2);
            infer_theta_sparse(&ndw, &phi, &mut theta, 5, &none);
            totals.push(calc_nwt(&ndw, &phi, &theta, None, b.token_size()));
        }
        assert_close(&totals[0], &totals[1]);
    }

    #[test]
    fn multi_token_transactions_need_the_transaction_path() {
        let batch = BatchBuilder::new("b")
            .add_transaction_item("d", &[("@pair", vec![Token::word("a"), Token::word("b")], 1.0)])
            .build();
        let mut args = ProcessBatchesArgs::default();
        assert_eq!(select_path(&batch, &args, false), None);
        args.opt_for_avx = false;
        assert_eq!(select_path(&batch, &args, false), Some(InferencePath::Transaction));
        assert_eq!(select_path(&batch, &args, true), None);

        let (single, _) = fixture();
        assert_eq!(select_path(&single, &args, false), Some(InferencePath::Sparse));
        assert_eq!(select_path(&single, &args, true), Some(InferencePath::Ptdw));
        args.opt_for_avx = true;
        assert_eq!(select_path(&single, &args, false), Some(InferencePath::Dense));
    }

    #[test]
    fn transaction_probability_is_a_product() {
        let batch = BatchBuilder::new("b")
            .add_transaction_item("d", &[("@pair", vec![Token::word("a"), Token::word("b")], 1.0)])
            .build();
        let mut pwt = DensePhiMatrix::new("pwt", vec!["t0".into(), "t1".into()]);
        pwt.add_token(Token::word("a"));
        pwt.add_token(Token::word("b"));
        pwt.set_row(0, &[0.5, 0.25]);
        pwt.set_row(1, &[0.5, 1.0]);
        let args = ProcessBatchesArgs { opt_for_avx: false, ..ProcessBatchesArgs::default() };
        let ndx = initialize_sparse_ndx(&batch, &args);
        let (phi, _) = build_local_phi(&batch, &pwt);
        let unit_phi = build_transaction_phi(&ndx, &phi);
        assert_eq!(unit_phi.row(0), &[0.25, 0.25]);

        let mut theta = uniform(1, 2);
        infer_theta_sparse(&ndx.ndx, &unit_phi, &mut theta, 3, &ThetaAgentCollection::default());
        let nwt = calc_nwt(&ndx.ndx, &unit_phi, &theta, Some(&ndx.transactions), batch.token_size());
        // both member tokens receive the transaction's counts
        assert_eq!(nwt.row(0), nwt.row(1));
        assert!((nwt.row(0).iter().sum::<f32>() - 1.0).abs() < 1e-5);
    }
}
