use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::batch::Batch;
use crate::config::{ProcessBatchesArgs, ThetaMatrixType};
use crate::engine::cache_manager::ThetaMatrix;
use crate::model::phi_matrix::PhiMatrix;
use crate::utils::datastruct::DenseMatrix;
use crate::utils::math::{normalize, stable_hash};

/// Seed of the random theta of one item.
fn item_seed(batch_id: &str, title: &str, seed: u64) -> u64 {
    stable_hash(&[batch_id.as_bytes(), title.as_bytes()]) ^ seed
}

/// Starting theta of every item of the batch, one row per item.
///
/// Cached rows win when `reuse_theta` is set and the item title is found;
/// then seeded random rows when `use_random_theta`; uniform otherwise.
pub fn initialize_theta(
    batch: &Batch,
    args: &ProcessBatchesArgs,
    topic_size: usize,
    cached: Option<&ThetaMatrix>,
) -> DenseMatrix<f32> {
    let mut theta = DenseMatrix::filled(batch.item_size(), topic_size, 1.0 / topic_size as f32);
    let cached = cached.filter(|c| args.reuse_theta && c.num_topics() == topic_size);
    for (d, item) in batch.item.iter().enumerate() {
        if let Some((c, index)) = cached.and_then(|c| c.item_index(&item.title).map(|i| (c, i))) {
            theta.row_mut(d).copy_from_slice(&c.dense_row(index));
            continue;
        }
        if args.use_random_theta {
            let mut rng = ChaCha8Rng::seed_from_u64(item_seed(&batch.id, &item.title, args.seed));
            let row = theta.row_mut(d);
            row.iter_mut().for_each(|v| *v = rng.gen::<f32>());
            normalize(row);
        }
    }
    theta
}

/// Theta cache entry of a processed batch.
///
/// With `predict_class_id` the columns are the tokens of that class and the
/// values are `p(w|d) = Σ_t φ_wt θ_td`.
pub fn build_theta_entry(batch: &Batch, args: &ProcessBatchesArgs, pwt: &dyn PhiMatrix, theta: &DenseMatrix<f32>) -> ThetaMatrix {
    let eps = args.theta_sparse_eps;
    match &args.predict_class_id {
        None => {
            let mut out = ThetaMatrix::new(pwt.model_name(), pwt.topic_names().to_vec(), args.theta_matrix_type);
            for (d, item) in batch.item.iter().enumerate() {
                out.push_item(item.id, item.title.clone(), theta.row(d), eps);
            }
            out
        }
        Some(class_id) => {
            let tokens: Vec<usize> = (0..pwt.token_size()).filter(|&w| pwt.token(w).class_id == *class_id).collect();
            let names = tokens.iter().map(|&w| pwt.token(w).keyword.clone()).collect();
            let mut out = ThetaMatrix::new(pwt.model_name(), names, args.theta_matrix_type);
            let mut phi_w = vec![0.0f32; pwt.topic_size()];
            let mut p_wd = vec![0.0f32; tokens.len()];
            for (d, item) in batch.item.iter().enumerate() {
                for (i, &w) in tokens.iter().enumerate() {
                    pwt.get_row(w, &mut phi_w);
                    p_wd[i] = phi_w.iter().zip(theta.row(d)).map(|(p, t)| p * t).sum();
                }
                out.push_item(item.id, item.title.clone(), &p_wd, eps);
            }
            out
        }
    }
}

/// Ptdw cache entry: one row per token occurrence, titled by the token.
pub fn build_ptdw_entry(batch: &Batch, pwt: &dyn PhiMatrix, ptdw: &[DenseMatrix<f32>]) -> ThetaMatrix {
    let mut out = ThetaMatrix::new(pwt.model_name(), pwt.topic_names().to_vec(), ThetaMatrixType::Dense);
    for (item, matrix) in batch.item.iter().zip(ptdw) {
        for (i, &w) in item.token_id.iter().enumerate() {
            out.push_item(item.id, batch.token(w).to_string(), matrix.row(i), 0.0);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchBuilder;
    use crate::model::phi_matrix::DensePhiMatrix;
    use crate::model::token::Token;

    fn batch() -> Batch {
        BatchBuilder::new("b")
            .add_item("d1", &[(Token::word("a"), 1.0)])
            .add_item("d2", &[(Token::word("b"), 1.0)])
            .build()
    }

    #[test]
    fn uniform_random_and_cached_starts() {
        let batch = batch();
        let args = ProcessBatchesArgs::default();
        let theta = initialize_theta(&batch, &args, 4, None);
        assert_eq!(theta.row(0), &[0.25; 4]);

        let random = ProcessBatchesArgs { use_random_theta: true, seed: 3, ..ProcessBatchesArgs::default() };
        let a = initialize_theta(&batch, &random, 4, None);
        let b = initialize_theta(&batch, &random, 4, None);
        assert_eq!(a, b);
        assert_ne!(a.row(0), a.row(1));
        assert!((a.row(0).iter().sum::<f32>() - 1.0).abs() < 1e-5);

        let mut cached = ThetaMatrix::new("pwt", vec!["t0".into(), "t1".into(), "t2".into(), "t3".into()], ThetaMatrixType::Dense);
        cached.push_item(1, "d2", &[1.0, 0.0, 0.0, 0.0], 0.0);
        let reuse = ProcessBatchesArgs { reuse_theta: true, ..ProcessBatchesArgs::default() };
        let theta = initialize_theta(&batch, &reuse, 4, Some(&cached));
        assert_eq!(theta.row(0), &[0.25; 4]);
        assert_eq!(theta.row(1), &[1.0, 0.0, 0.0, 0.0]);
        // without reuse_theta the cache is ignored
        assert_eq!(initialize_theta(&batch, &args, 4, Some(&cached)).row(1), &[0.25; 4]);
    }

    #[test]
    fn predict_class_gives_token_probabilities() {
        let batch = batch();
        let mut pwt = DensePhiMatrix::new("pwt", vec!["t0".into(), "t1".into()]);
        pwt.add_token(Token::word("a"));
        pwt.add_token(Token::new("@labels", "x"));
        pwt.add_token(Token::new("@labels", "y"));
        pwt.set_row(1, &[1.0, 0.0]);
        pwt.set_row(2, &[0.0, 1.0]);
        let mut theta = DenseMatrix::zeros(2, 2);
        theta.row_mut(0).copy_from_slice(&[0.75, 0.25]);
        theta.row_mut(1).copy_from_slice(&[0.0, 1.0]);

        let args = ProcessBatchesArgs { predict_class_id: Some("@labels".into()), ..ProcessBatchesArgs::default() };
        let entry = build_theta_entry(&batch, &args, &pwt, &theta);
        assert_eq!(entry.topic_names, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(entry.item_weights[0], vec![0.75, 0.25]);

        let sparse = ProcessBatchesArgs { theta_matrix_type: ThetaMatrixType::Sparse, ..ProcessBatchesArgs::default() };
        let entry = build_theta_entry(&batch, &sparse, &pwt, &theta);
        assert_eq!(entry.topic_indices[1], vec![1]);
    }
}
