pub mod infer;
pub mod theta;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::batch::ndw::{initialize_sparse_ndw, initialize_sparse_ndx};
use crate::batch::{load_batch, Batch, BatchSource};
use crate::config::ProcessBatchesArgs;
use crate::engine::batch_manager::{BatchManager, TaskId};
use crate::engine::cache_manager::{CacheKey, CacheManager};
use crate::engine::instance::InstanceContext;
use crate::engine::merger::ModelIncrement;
use crate::error::{ArtmError, Result};
use crate::model::phi_matrix::{DensePhiMatrix, PhiMatrix};
use crate::regularizer::{AgentContext, PtdwAgentCollection, ThetaAgentCollection};
use crate::score::{ItemScoreInput, ScoreManager};
use crate::utils::datastruct::{CsrMatrix, DenseMatrix};

use self::infer::InferencePath;

const IDLE_INTERVAL: Duration = Duration::from_millis(1);

/// Where a task writes its expected counts.
#[derive(Debug, Clone)]
pub enum NwtTarget {
    /// inference only
    None,
    /// shared matrix, written in place under per-token locks
    Matrix(Arc<DensePhiMatrix>),
    /// increment pushed to the merger for this model
    Merger { model_name: String },
}

/// One unit of processor work.
#[derive(Debug, Clone)]
pub struct ProcessorInput {
    pub task_id: TaskId,
    pub batch: BatchSource,
    pub batch_weight: f32,
    pub args: Arc<ProcessBatchesArgs>,
    /// model whose Pwt is read
    pub model_name: String,
    pub nwt_target: NwtTarget,
    pub batch_manager: Arc<BatchManager>,
    /// receives the theta of every item when set
    pub theta_cache: Option<Arc<CacheManager>>,
    /// task-local score totals, in addition to the global ones
    pub score_manager: Option<Arc<ScoreManager>>,
}

/// Signals task completion however the task ends.
struct CompletionGuard<'a> {
    batch_manager: &'a BatchManager,
    task_id: TaskId,
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            log::error!("processor panicked while running task {}", self.task_id);
        }
        self.batch_manager.callback(self.task_id);
    }
}

/// Worker thread popping [`ProcessorInput`]s from the shared queue.
#[derive(Debug)]
pub struct Processor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Processor {
    pub fn spawn(index: usize, ctx: Arc<InstanceContext>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(format!("artm-processor-{}", index))
            .spawn(move || {
                log::debug!("processor {} started", index);
                while !flag.load(Ordering::Acquire) {
                    match ctx.processor_queue.try_pop() {
                        Some(input) => {
                            let task_id = input.task_id;
                            // guard は unwind 中に完了を通知済み、thread は生かしておく
                            if panic::catch_unwind(AssertUnwindSafe(|| process_task(&ctx, input))).is_err() {
                                log::error!("processor {} dropped task {} after a panic", index, task_id);
                            }
                        }
                        None => thread::sleep(IDLE_INTERVAL),
                    }
                }
                log::debug!("processor {} stopped", index);
            })
            .map_err(|e| ArtmError::Internal(format!("unable to start processor thread: {}", e)))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Whether the worker thread is still running.
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for Processor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("processor thread terminated by a panic");
            }
        }
    }
}

fn resolve_batch(ctx: &InstanceContext, source: &BatchSource) -> Result<Arc<Batch>> {
    let batch = match source {
        BatchSource::InMemory(batch) => Arc::clone(batch),
        BatchSource::Registered(name) => ctx.batches.get(name.as_str()).ok_or_else(|| ArtmError::not_found("batch", name.clone()))?,
        BatchSource::File(path) => Arc::new(load_batch(path)?),
    };
    batch.validate()?;
    Ok(batch)
}

/// Run one task. Every failure is logged; completion is always signalled.
pub(crate) fn process_task(ctx: &InstanceContext, input: ProcessorInput) {
    let _guard = CompletionGuard {
        batch_manager: &input.batch_manager,
        task_id: input.task_id,
    };

    let batch = match resolve_batch(ctx, &input.batch) {
        Ok(batch) => batch,
        Err(err) => {
            log::error!("batch {} skipped: {}", input.batch.describe(), err);
            return;
        }
    };
    let Some(model) = ctx.models.get(input.model_name.as_str()) else {
        log::error!("batch {} skipped: model '{}' does not exist", batch.id, input.model_name);
        return;
    };
    let pwt: &DensePhiMatrix = model.pwt();
    if batch.token_size() == 0 || pwt.token_size() == 0 {
        log::warn!("batch {} skipped: nothing to infer against model '{}'", batch.id, input.model_name);
        return;
    }

    let args = input.args.as_ref();
    let (phi, pwt_index) = infer::build_local_phi(&batch, pwt);
    if pwt_index.iter().all(|i| i.is_none()) {
        log::warn!("batch {} skipped: no tokens in common with model '{}'", batch.id, input.model_name);
        return;
    }

    let (theta_agents, ptdw_agents) = create_agents(ctx, &batch, args, pwt.topic_names());
    let Some(path) = infer::select_path(&batch, args, !ptdw_agents.is_empty()) else {
        return;
    };

    let cached = if args.reuse_theta {
        ctx.cache_manager
            .find_cache_entry(&CacheKey::new(batch.id.clone(), args.ptd_name.as_deref()))
    } else {
        None
    };
    let mut theta = theta::initialize_theta(&batch, args, pwt.topic_size(), cached.as_deref());

    let passes = args.num_document_passes;
    let ndw = initialize_sparse_ndw(&batch, args);
    let mut ptdw = None;
    let nwt = match path {
        InferencePath::Sparse | InferencePath::Dense => {
            if path == InferencePath::Dense {
                infer::infer_theta_dense(&ndw, &phi, &mut theta, passes, &theta_agents);
            } else {
                infer::infer_theta_sparse(&ndw, &phi, &mut theta, passes, &theta_agents);
            }
            infer::calc_nwt(&ndw, &phi, &theta, None, batch.token_size())
        }
        InferencePath::Transaction => {
            let ndx = initialize_sparse_ndx(&batch, args);
            log::trace!(
                "batch {}: {} distinct transactions, up to {} tokens each",
                batch.id,
                ndx.transactions.len(),
                ndx.max_arity()
            );
            let unit_phi = infer::build_transaction_phi(&ndx, &phi);
            infer::infer_theta_sparse(&ndx.ndx, &unit_phi, &mut theta, passes, &theta_agents);
            infer::calc_nwt(&ndx.ndx, &unit_phi, &theta, Some(&ndx.transactions), batch.token_size())
        }
        InferencePath::Ptdw => {
            let out = infer::infer_ptdw(&ndw, &phi, &mut theta, passes, &theta_agents, &ptdw_agents);
            ptdw = Some(out.ptdw);
            out.nwt
        }
    };
    log::debug!("batch {}: {} items inferred on the {:?} path", batch.id, batch.item_size(), path);

    write_nwt(ctx, &input, &batch, pwt, &pwt_index, &nwt);

    let cache_key = CacheKey::new(batch.id.clone(), args.ptd_name.as_deref());
    if let Some(cache) = &input.theta_cache {
        let entry = theta::build_theta_entry(&batch, args, pwt, &theta);
        if let Err(err) = cache.update_cache_entry(cache_key.clone(), entry) {
            log::error!("batch {}: unable to cache theta: {}", batch.id, err);
        }
    }
    if let (true, Some(ptdw)) = (args.cache_ptdw, &ptdw) {
        let entry = theta::build_ptdw_entry(&batch, pwt, ptdw);
        if let Err(err) = ctx.ptdw_cache.update_cache_entry(cache_key, entry) {
            log::error!("batch {}: unable to cache ptdw: {}", batch.id, err);
        }
    }

    append_scores(ctx, &input, &batch, pwt, &pwt_index, &ndw, &theta);
}

fn create_agents(
    ctx: &InstanceContext,
    batch: &Batch,
    args: &ProcessBatchesArgs,
    topic_names: &[String],
) -> (ThetaAgentCollection, PtdwAgentCollection) {
    let mut theta_agents = ThetaAgentCollection::default();
    let mut ptdw_agents = PtdwAgentCollection::default();
    for (i, name) in args.regularizer_name.iter().enumerate() {
        let Some(regularizer) = ctx.regularizers.get(name.as_str()) else {
            log::error!("batch {}: regularizer '{}' does not exist", batch.id, name);
            continue;
        };
        let tau = args.regularizer_tau.get(i).copied().unwrap_or(1.0);
        let agent_ctx = AgentContext {
            batch,
            args,
            topic_names,
            tau,
        };
        if let Some(agent) = regularizer.create_regularize_theta_agent(&agent_ctx) {
            theta_agents.push(agent);
        }
        if let Some(agent) = regularizer.create_regularize_ptdw_agent(&agent_ctx) {
            ptdw_agents.push(agent);
        }
    }
    (theta_agents, ptdw_agents)
}

/// Add `weight * nwt[w]` to row `index_of(w)` of `target` for every touched token.
fn add_rows(target: &dyn PhiMatrix, nwt: &DenseMatrix<f32>, weight: f32, index_of: impl Fn(usize) -> Option<usize>) {
    let mut row = vec![0.0f32; nwt.no_columns()];
    for w in 0..nwt.no_rows() {
        if nwt.row(w).iter().all(|v| *v == 0.0) {
            continue;
        }
        let Some(target_id) = index_of(w) else {
            continue;
        };
        row.iter_mut().zip(nwt.row(w)).for_each(|(r, v)| *r = weight * v);
        target.increase_row(target_id, &row);
    }
}

fn write_nwt(
    ctx: &InstanceContext,
    input: &ProcessorInput,
    batch: &Batch,
    pwt: &dyn PhiMatrix,
    pwt_index: &[Option<usize>],
    nwt: &DenseMatrix<f32>,
) {
    match &input.nwt_target {
        NwtTarget::None => {}
        NwtTarget::Matrix(target) => {
            if target.topic_size() != nwt.no_columns() {
                log::error!(
                    "batch {}: target '{}' has {} topics, model has {}",
                    batch.id,
                    target.model_name(),
                    target.topic_size(),
                    nwt.no_columns()
                );
                return;
            }
            let target: &DensePhiMatrix = target;
            add_rows(target, nwt, input.batch_weight, |w| target.token_index(&batch.token(w)));
        }
        NwtTarget::Merger { model_name } => {
            // 増分は Pwt にある token だけ持つ
            let mut increment = DensePhiMatrix::new(model_name.clone(), pwt.topic_names().to_vec());
            let mut local_ids = vec![None; batch.token_size()];
            for (w, id) in pwt_index.iter().enumerate() {
                if id.is_some() {
                    local_ids[w] = Some(increment.add_token(batch.token(w)));
                }
            }
            add_rows(&increment, nwt, input.batch_weight, |w| local_ids[w]);
            ctx.increments.push(ModelIncrement {
                model_name: model_name.clone(),
                nwt: increment,
                topic_names: Some(pwt.topic_names().to_vec()),
            });
        }
    }
}

fn append_scores(
    ctx: &InstanceContext,
    input: &ProcessorInput,
    batch: &Batch,
    pwt: &dyn PhiMatrix,
    pwt_index: &[Option<usize>],
    ndw: &CsrMatrix<f32>,
    theta: &DenseMatrix<f32>,
) {
    let args = input.args.as_ref();
    for name in ctx.score_calculators.keys() {
        if !args.score_name.is_empty() && !args.score_name.contains(&name) {
            continue;
        }
        let Some(calculator) = ctx.score_calculators.get(name.as_str()) else {
            continue;
        };
        if !calculator.is_cumulative() {
            continue;
        }
        let mut score = calculator.create_score();
        for d in 0..batch.item_size() {
            let tokens: Vec<(usize, f32)> = ndw.row_iter(d).collect();
            let item_input = ItemScoreInput {
                batch,
                item_index: d,
                tokens: &tokens,
                pwt,
                pwt_index,
                theta: theta.row(d),
            };
            calculator.append_item_score(&item_input, &mut score);
        }
        calculator.append_batch_score(batch, &mut score);
        if let Err(err) = ctx.score_manager.append(calculator.as_ref(), &score) {
            log::warn!("batch {}: {}", batch.id, err);
        }
        if let Some(local) = &input.score_manager {
            if let Err(err) = local.append(calculator.as_ref(), &score) {
                log::warn!("batch {}: {}", batch.id, err);
            }
        }
    }
}
