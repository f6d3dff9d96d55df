use std::sync::Arc;

use artm_core::{Batch, BatchBuilder, BatchSource, MasterComponent, MasterModelConfig, ThetaMatrixType, Token};
use criterion::{criterion_group, criterion_main, Criterion};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const VOCABULARY: usize = 2_000;
const ITEMS_PER_BATCH: usize = 200;
const TOKENS_PER_ITEM: usize = 60;

// Zipf っぽい分布で合成コーパスを作る
fn synthetic_batches(count: usize, seed: u64) -> Vec<Batch> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..count)
        .map(|b| {
            let mut builder = BatchBuilder::new(format!("batch{}", b));
            for d in 0..ITEMS_PER_BATCH {
                let tokens: Vec<(Token, f32)> = (0..TOKENS_PER_ITEM)
                    .map(|_| {
                        let r: f64 = rng.gen();
                        let w = ((VOCABULARY as f64).powf(r) as usize).min(VOCABULARY - 1);
                        (Token::word(format!("w{}", w)), rng.gen_range(1..4) as f32)
                    })
                    .collect();
                builder.add_item(format!("doc{}_{}", b, d), &tokens);
            }
            builder.build()
        })
        .collect()
}

fn master(num_topics: usize, batches: &[Batch]) -> MasterComponent {
    let mut config = MasterModelConfig::with_topics(num_topics);
    config.num_processors = 4;
    let master = MasterComponent::new(config).expect("valid configuration");
    master.import_batches(batches.iter().cloned()).expect("valid batches");
    master.gather_dictionary("dict", &[]).expect("dictionary");
    master.initialize_model("dict").expect("model");
    master
}

fn fit_and_transform_benchmark(c: &mut Criterion) {
    let batches = synthetic_batches(8, 42);
    let sources: Vec<BatchSource> = batches
        .iter()
        .map(|b| BatchSource::InMemory(Arc::new(b.clone())))
        .collect();

    for num_topics in [16, 64] {
        let master = master(num_topics, &batches);

        c.bench_function(&format!("fit_offline_pass_{}_topics", num_topics), |b| {
            b.iter(|| master.fit_offline(&sources, 1).expect("fit"));
        });

        c.bench_function(&format!("fit_online_{}_topics", num_topics), |b| {
            b.iter(|| master.fit_online(&sources, 2, 64.0, 0.7, true).expect("fit"));
        });

        c.bench_function(&format!("transform_{}_topics", num_topics), |b| {
            b.iter(|| master.transform(&sources, ThetaMatrixType::Sparse, None).expect("transform"));
        });
    }
}

criterion_group!(benches, fit_and_transform_benchmark);
criterion_main!(benches);
