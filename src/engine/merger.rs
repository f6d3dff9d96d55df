use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::engine::instance::InstanceContext;
use crate::error::{ArtmError, Result};
use crate::model::phi_matrix::{DensePhiMatrix, PhiMatrix};
use crate::model::topic_model::{apply_topic_model_operation, calc_pwt, find_normalizers, normalize, TopicModel};
use crate::regularizer::{PhiContext, Regularizer};
use crate::utils::datastruct::ThreadSafeQueue;
use crate::utils::math::OVERREGULARIZATION_EPS;

const IDLE_INTERVAL: Duration = Duration::from_millis(1);
const LIVENESS_INTERVAL: Duration = Duration::from_millis(50);

/// Nwt increment produced by one processor task.
#[derive(Debug)]
pub struct ModelIncrement {
    pub model_name: String,
    pub nwt: DensePhiMatrix,
    /// topics of `nwt`, matched by name on merge
    pub topic_names: Option<Vec<String>>,
}

/// FIFO of merger work with a count of the elements not yet handled.
///
/// A popped element stays pending until its [`PendingGuard`] is dropped,
/// which also happens when handling it panics.
#[derive(Debug)]
pub struct PendingQueue<T> {
    queue: ThreadSafeQueue<T>,
    in_flight: AtomicUsize,
}

/// Increments waiting for the merger.
pub type IncrementQueue = PendingQueue<ModelIncrement>;

/// Control messages waiting for the merger.
pub type TaskQueue = PendingQueue<MergerTask>;

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        Self {
            queue: ThreadSafeQueue::new(),
            in_flight: AtomicUsize::new(0),
        }
    }
}

impl<T> PendingQueue<T> {
    pub fn push(&self, value: T) {
        // 先に数える: pop 前に idle と見えてはいけない
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.queue.push(value);
    }

    pub fn try_pop(&self) -> Option<(T, PendingGuard<'_>)> {
        let value = self.queue.try_pop()?;
        Some((value, PendingGuard { in_flight: &self.in_flight }))
    }

    /// Nothing is queued or being handled.
    pub fn is_idle(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == 0
    }
}

/// Marks one popped element as handled when dropped.
#[derive(Debug)]
pub struct PendingGuard<'a> {
    in_flight: &'a AtomicUsize,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Parameters of one synchronization:
/// `Nwt' = decay * Nwt + apply * (accumulated increments + increment)`,
/// then Pwt' from Nwt' (regularized when asked).
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub model_name: String,
    pub decay: f32,
    pub apply: f32,
    pub invoke_regularizers: bool,
    /// counts accumulated outside the merger (shared Nwt of an offline pass)
    pub increment: Option<Arc<DensePhiMatrix>>,
}

impl SyncRequest {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            decay: 1.0,
            apply: 1.0,
            invoke_regularizers: true,
            increment: None,
        }
    }
}

/// Control messages of the merger thread. They run before queued increments.
#[derive(Debug)]
pub enum MergerTask {
    DisposeModel(String),
    ForceSynchronize(SyncRequest, mpsc::Sender<Result<()>>),
    ResetScores,
}

/// Background thread folding increments into per-model accumulators and
/// publishing new models on request.
#[derive(Debug)]
pub struct Merger {
    ctx: Arc<InstanceContext>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Merger {
    pub fn spawn(ctx: Arc<InstanceContext>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let thread_ctx = Arc::clone(&ctx);
        let handle = thread::Builder::new()
            .name("artm-merger".to_string())
            .spawn(move || run(&thread_ctx, &flag))
            .map_err(|e| ArtmError::Internal(format!("unable to start merger thread: {}", e)))?;
        Ok(Self {
            ctx,
            stop,
            handle: Some(handle),
        })
    }

    /// Synchronize a model and block until the new model is published.
    pub fn force_synchronize(&self, request: SyncRequest) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        self.ctx.merger_tasks.push(MergerTask::ForceSynchronize(request, tx));
        loop {
            match rx.recv_timeout(LIVENESS_INTERVAL) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) if self.is_alive() => continue,
                Err(_) => return Err(stopped("the synchronization finished")),
            }
        }
    }

    pub fn dispose_model(&self, model_name: impl Into<String>) {
        self.ctx.merger_tasks.push(MergerTask::DisposeModel(model_name.into()));
    }

    pub fn reset_scores(&self) {
        self.ctx.merger_tasks.push(MergerTask::ResetScores);
    }

    /// Whether the merger thread is still running.
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Poll until every queued task and increment is handled. `None` waits
    /// forever.
    ///
    /// # Returns
    /// * `Result<bool>` - false when the timeout elapsed first, an error when
    ///   the merger thread is gone with work left
    pub fn wait_idle(&self, timeout: Option<Duration>) -> Result<bool> {
        let start = Instant::now();
        loop {
            if self.ctx.merger_tasks.is_idle() && self.ctx.increments.is_idle() {
                return Ok(true);
            }
            if !self.is_alive() {
                return Err(stopped("its queues drained"));
            }
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    return Ok(false);
                }
            }
            thread::sleep(IDLE_INTERVAL);
        }
    }
}

fn stopped(what: &str) -> ArtmError {
    ArtmError::Internal(format!("merger stopped before {}", what))
}

impl Drop for Merger {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("merger thread terminated by a panic");
            }
        }
    }
}

fn run(ctx: &InstanceContext, stop: &AtomicBool) {
    log::debug!("merger started");
    let mut accumulators: HashMap<String, DensePhiMatrix> = HashMap::new();
    while !stop.load(Ordering::Acquire) {
        if let Some((task, _pending)) = ctx.merger_tasks.try_pop() {
            // panic した task の reply sender は unwind で drop される
            if panic::catch_unwind(AssertUnwindSafe(|| handle_task(ctx, &mut accumulators, task))).is_err() {
                log::error!("merger task panicked");
            }
            continue;
        }
        if let Some((increment, _pending)) = ctx.increments.try_pop() {
            let model_name = increment.model_name.clone();
            if panic::catch_unwind(AssertUnwindSafe(|| accumulate(&mut accumulators, increment))).is_err() {
                log::error!("increment of '{}' dropped after a panic, accumulator reset", model_name);
                accumulators.remove(&model_name);
            }
            continue;
        }
        thread::sleep(IDLE_INTERVAL);
    }
    log::debug!("merger stopped");
}

fn handle_task(ctx: &InstanceContext, accumulators: &mut HashMap<String, DensePhiMatrix>, task: MergerTask) {
    match task {
        MergerTask::DisposeModel(name) => {
            accumulators.remove(&name);
            ctx.models.erase(name.as_str());
            let n = ctx.cache_manager.erase_model(&name) + ctx.ptdw_cache.erase_model(&name);
            log::debug!("model '{}' disposed ({} cache entries dropped)", name, n);
        }
        MergerTask::ForceSynchronize(request, reply) => {
            let result = synchronize(ctx, accumulators, &request);
            if let Err(err) = &result {
                log::error!("synchronization of '{}' failed: {}", request.model_name, err);
            }
            // 呼び出し側が既にいなくても問題ない
            let _ = reply.send(result);
        }
        MergerTask::ResetScores => ctx.score_manager.clear(),
    }
}

fn accumulate(accumulators: &mut HashMap<String, DensePhiMatrix>, increment: ModelIncrement) {
    let ModelIncrement {
        model_name,
        nwt,
        topic_names,
    } = increment;
    let target = accumulators
        .entry(model_name.clone())
        .or_insert_with(|| DensePhiMatrix::new(model_name, nwt.topic_names().to_vec()));
    apply_topic_model_operation(target, &nwt, 1.0, topic_names.as_deref());
}

/// Build and publish the next version of `request.model_name`.
pub(crate) fn synchronize(
    ctx: &InstanceContext,
    accumulators: &mut HashMap<String, DensePhiMatrix>,
    request: &SyncRequest,
) -> Result<()> {
    let name = request.model_name.as_str();
    let current = ctx
        .models
        .get(name)
        .ok_or_else(|| ArtmError::not_found("model", name))?;

    let mut nwt = current.nwt().duplicate();
    nwt.scale(request.decay);
    let accumulated = accumulators.remove(name);
    // apply 0 では token 集合も変えない
    if request.apply != 0.0 {
        if let Some(acc) = &accumulated {
            apply_topic_model_operation(&mut nwt, acc, request.apply, Some(acc.topic_names()));
        }
        if let Some(increment) = &request.increment {
            apply_topic_model_operation(&mut nwt, &**increment, request.apply, Some(increment.topic_names()));
        }
    }

    let regularizers = if request.invoke_regularizers {
        phi_regularizers(ctx)
    } else {
        Vec::new()
    };
    let pwt = if regularizers.is_empty() {
        calc_pwt(name, &nwt, None)?
    } else {
        let pwt = calc_pwt(name, &nwt, None)?;
        let rwt = calc_rwt(ctx, &nwt, &pwt, &regularizers);
        warn_overregularized(&nwt, &rwt)?;
        normalize(&nwt, Some(&rwt), &pwt)?;
        pwt
    };

    let model = TopicModel::from_parts(name, nwt, pwt)?;
    log::debug!(
        "model '{}' synchronized: {} tokens, decay {}, apply {}",
        name,
        model.token_size(),
        request.decay,
        request.apply
    );
    ctx.models.set(name.to_string(), Arc::new(model));
    Ok(())
}

/// Configured regularizers with their tau, in configuration order.
fn phi_regularizers(ctx: &InstanceContext) -> Vec<(Arc<dyn Regularizer>, f32)> {
    ctx.config()
        .regularizer_config
        .iter()
        .filter_map(|config| match ctx.regularizers.get(config.name.as_str()) {
            Some(regularizer) => Some((regularizer, config.tau)),
            None => {
                log::error!("regularizer '{}' does not exist", config.name);
                None
            }
        })
        .collect()
}

/// `Rwt = Σ tau_r * r(Pwt, Nwt)`.
fn calc_rwt(
    ctx: &InstanceContext,
    nwt: &DensePhiMatrix,
    pwt: &DensePhiMatrix,
    regularizers: &[(Arc<dyn Regularizer>, f32)],
) -> DensePhiMatrix {
    let rwt = DensePhiMatrix::with_shape_of("rwt", nwt);
    let local = DensePhiMatrix::with_shape_of("rwt", nwt);
    let phi_ctx = PhiContext {
        pwt,
        nwt,
        dictionaries: &ctx.dictionaries,
    };
    let mut row = vec![0.0f32; nwt.topic_size()];
    for (regularizer, tau) in regularizers {
        local.clear_values();
        if !regularizer.regularize_phi(&phi_ctx, &local) {
            continue;
        }
        for token_id in 0..local.token_size() {
            local.get_row(token_id, &mut row);
            row.iter_mut().for_each(|v| *v *= tau);
            rwt.increase_row(token_id, &row);
        }
    }
    rwt
}

fn warn_overregularized(nwt: &DensePhiMatrix, rwt: &DensePhiMatrix) -> Result<()> {
    let plain = find_normalizers(nwt, None)?;
    let regularized = find_normalizers(nwt, Some(rwt))?;
    for (class_id, n_t) in &plain {
        let Some(r_t) = regularized.get(class_id) else {
            continue;
        };
        for (topic_id, (n, r)) in n_t.iter().zip(r_t).enumerate() {
            if *n > OVERREGULARIZATION_EPS && *r < OVERREGULARIZATION_EPS {
                log::warn!(
                    "topic '{}' of class '{}' is overregularized and keeps its previous value",
                    nwt.topic_name(topic_id),
                    class_id
                );
            }
        }
    }
    Ok(())
}
