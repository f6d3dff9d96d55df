use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::batch::Batch;
use crate::config::{MasterModelConfig, RegularizerConfig, ScoreConfig};
use crate::engine::batch_manager::BatchManager;
use crate::engine::cache_manager::CacheManager;
use crate::engine::merger::{IncrementQueue, Merger, TaskQueue};
use crate::engine::processor::{Processor, ProcessorInput};
use crate::error::{ArtmError, Result};
use crate::model::dictionary::Dictionary;
use crate::model::topic_model::TopicModel;
use crate::regularizer::{Regularizer, RegularizerFactory};
use crate::score::manager::{ScoreManager, ScoreTracker};
use crate::score::{ScoreCalculator, ScoreFactory};
use crate::utils::datastruct::{ThreadSafeHolder, ThreadSafeQueue};

const LIVENESS_INTERVAL: Duration = Duration::from_millis(50);

/// State shared by the processors, the merger and the master.
///
/// Everything is reached through `&self`: registries are concurrent maps of
/// `Arc` snapshots and the configuration sits behind a `RwLock`.
pub struct InstanceContext {
    config: RwLock<MasterModelConfig>,
    pub processor_queue: ThreadSafeQueue<ProcessorInput>,
    pub merger_tasks: TaskQueue,
    pub increments: IncrementQueue,
    pub models: ThreadSafeHolder<String, TopicModel>,
    pub batches: ThreadSafeHolder<String, Batch>,
    pub dictionaries: ThreadSafeHolder<String, Dictionary>,
    pub regularizers: ThreadSafeHolder<String, dyn Regularizer>,
    pub score_calculators: ThreadSafeHolder<String, dyn ScoreCalculator>,
    pub score_manager: ScoreManager,
    pub score_tracker: ScoreTracker,
    /// theta of processed batches, keyed by batch id
    pub cache_manager: Arc<CacheManager>,
    pub ptdw_cache: CacheManager,
    regularizer_factory: RegularizerFactory,
    score_factory: ScoreFactory,
}

impl fmt::Debug for InstanceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceContext")
            .field("models", &self.models.keys())
            .field("regularizers", &self.regularizers.keys())
            .field("score_calculators", &self.score_calculators.keys())
            .field("queued_tasks", &self.processor_queue.size())
            .finish()
    }
}

impl InstanceContext {
    pub fn new(config: MasterModelConfig) -> Result<Self> {
        config.validate()?;
        let ctx = Self {
            cache_manager: Arc::new(CacheManager::new(config.disk_cache_path.clone())),
            config: RwLock::new(config.clone()),
            processor_queue: ThreadSafeQueue::new(),
            merger_tasks: TaskQueue::default(),
            increments: IncrementQueue::default(),
            models: ThreadSafeHolder::new(),
            batches: ThreadSafeHolder::new(),
            dictionaries: ThreadSafeHolder::new(),
            regularizers: ThreadSafeHolder::new(),
            score_calculators: ThreadSafeHolder::new(),
            score_manager: ScoreManager::new(),
            score_tracker: ScoreTracker::new(),
            ptdw_cache: CacheManager::new(None),
            regularizer_factory: RegularizerFactory::default(),
            score_factory: ScoreFactory::default(),
        };
        ctx.apply_config(config)?;
        Ok(ctx)
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> MasterModelConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Install a new configuration: regularizers and score calculators are
    /// reconfigured in place when their type is unchanged, recreated
    /// otherwise, and dropped when no longer listed.
    pub fn apply_config(&self, config: MasterModelConfig) -> Result<()> {
        config.validate()?;
        for reg in &config.regularizer_config {
            self.install_regularizer(reg)?;
        }
        for score in &config.score_config {
            self.install_score(score)?;
        }

        let reg_names: HashSet<&str> = config.regularizer_config.iter().map(|r| r.name.as_str()).collect();
        for name in self.regularizers.keys() {
            if !reg_names.contains(name.as_str()) {
                self.regularizers.erase(name.as_str());
            }
        }
        let score_names: HashSet<&str> = config.score_config.iter().map(|s| s.name.as_str()).collect();
        for name in self.score_calculators.keys() {
            if !score_names.contains(name.as_str()) {
                self.score_calculators.erase(name.as_str());
                self.forget_score(&name);
            }
        }

        *self.config.write().unwrap_or_else(|e| e.into_inner()) = config;
        Ok(())
    }

    /// Replace or add one regularizer and record it in the configuration.
    pub fn reconfigure_regularizer(&self, reg: RegularizerConfig) -> Result<()> {
        self.install_regularizer(&reg)?;
        let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
        match config.regularizer_config.iter_mut().find(|r| r.name == reg.name) {
            Some(slot) => *slot = reg,
            None => config.regularizer_config.push(reg),
        }
        Ok(())
    }

    fn install_regularizer(&self, reg: &RegularizerConfig) -> Result<()> {
        if let Some(existing) = self.regularizers.get(reg.name.as_str()) {
            if existing.type_name() == reg.type_name {
                return existing.reconfigure(reg);
            }
        }
        let regularizer = self.regularizer_factory.create(reg)?;
        self.regularizers.set(reg.name.clone(), regularizer);
        Ok(())
    }

    fn install_score(&self, score: &ScoreConfig) -> Result<()> {
        // score は状態を持たないので毎回作り直す
        let calculator = self.score_factory.create(score)?;
        let retyped = self
            .score_calculators
            .get(score.name.as_str())
            .is_some_and(|old| old.score_type() != calculator.score_type());
        if retyped {
            log::info!("score '{}' changed type to {}, history dropped", score.name, score.type_name);
            self.forget_score(&score.name);
        }
        self.score_calculators.set(score.name.clone(), calculator);
        Ok(())
    }

    fn forget_score(&self, name: &str) {
        self.score_manager.remove(name);
        self.score_tracker.remove(name);
    }
}

/// Running engine: shared context, processor pool and merger.
#[derive(Debug)]
pub struct Instance {
    // processors first: they must stop before the merger
    processors: Vec<Processor>,
    merger: Merger,
    ctx: Arc<InstanceContext>,
}

impl Instance {
    pub fn new(config: MasterModelConfig) -> Result<Self> {
        let num_processors = config.num_processors;
        let ctx = Arc::new(InstanceContext::new(config)?);
        let merger = Merger::spawn(Arc::clone(&ctx))?;
        let processors = (0..num_processors)
            .map(|i| Processor::spawn(i, Arc::clone(&ctx)))
            .collect::<Result<Vec<_>>>()?;
        log::info!("instance started with {} processors", num_processors);
        Ok(Self { processors, merger, ctx })
    }

    pub fn context(&self) -> &Arc<InstanceContext> {
        &self.ctx
    }

    pub fn merger(&self) -> &Merger {
        &self.merger
    }

    pub fn num_processors(&self) -> usize {
        self.processors.len()
    }

    /// Wait for every task of `manager`.
    ///
    /// # Errors
    /// `Internal` when tasks are left and no processor thread is running.
    pub fn wait_batches(&self, manager: &BatchManager) -> Result<()> {
        while !manager.wait(Some(LIVENESS_INTERVAL)) {
            if !self.processors.iter().any(Processor::is_alive) {
                return Err(ArtmError::Internal(format!(
                    "{} tasks pending but no processor thread is running",
                    manager.in_flight()
                )));
            }
        }
        Ok(())
    }

    /// Apply a new configuration and resize the processor pool.
    pub fn reconfigure(&mut self, config: MasterModelConfig) -> Result<()> {
        let target = config.num_processors;
        self.ctx.apply_config(config)?;
        while self.processors.len() < target {
            let index = self.processors.len();
            self.processors.push(Processor::spawn(index, Arc::clone(&self.ctx))?);
        }
        // 余った processor は drop で join される
        self.processors.truncate(target);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regularizer::smooth_sparse_theta::SmoothSparseThetaConfig;
    use serde_cbor::Value;

    fn smooth(name: &str, tau: f32) -> RegularizerConfig {
        RegularizerConfig::new(name, "SmoothSparseTheta", tau, &SmoothSparseThetaConfig::default()).unwrap()
    }

    #[test]
    fn rejects_invalid_configuration() {
        assert!(InstanceContext::new(MasterModelConfig::default()).is_err());
        let mut config = MasterModelConfig::with_topics(2);
        config.regularizer_config.push(RegularizerConfig {
            name: "r".into(),
            type_name: "NoSuchRegularizer".into(),
            tau: 1.0,
            config: Value::Null,
        });
        assert!(InstanceContext::new(config).is_err());
    }

    #[test]
    fn reconfigure_keeps_same_type_and_drops_stale_entries() {
        let mut config = MasterModelConfig::with_topics(2);
        config.regularizer_config = vec![smooth("a", 1.0), smooth("b", 1.0)];
        let ctx = InstanceContext::new(config.clone()).unwrap();
        let a = ctx.regularizers.get("a").unwrap();

        config.regularizer_config = vec![smooth("a", -0.5)];
        ctx.apply_config(config).unwrap();
        assert!(Arc::ptr_eq(&a, &ctx.regularizers.get("a").unwrap()));
        assert!(ctx.regularizers.get("b").is_none());
        assert_eq!(ctx.config().regularizer_config[0].tau, -0.5);

        ctx.reconfigure_regularizer(smooth("c", 2.0)).unwrap();
        assert_eq!(ctx.config().regularizer_config.len(), 2);
        assert!(ctx.regularizers.has_key("c"));
    }

    #[test]
    fn processor_pool_resizes() {
        let mut config = MasterModelConfig::with_topics(2);
        config.num_processors = 3;
        let mut instance = Instance::new(config.clone()).unwrap();
        assert_eq!(instance.num_processors(), 3);
        config.num_processors = 1;
        instance.reconfigure(config).unwrap();
        assert_eq!(instance.num_processors(), 1);
    }

    #[test]
    fn retyped_score_drops_its_running_value() {
        let mut config = MasterModelConfig::with_topics(2);
        config.score_config = vec![ScoreConfig::new("s", "ItemsProcessed", &Value::Null).unwrap()];
        let ctx = InstanceContext::new(config.clone()).unwrap();
        let calc = ctx.score_calculators.get("s").unwrap();
        ctx.score_manager.append(calc.as_ref(), &calc.create_score()).unwrap();
        ctx.score_tracker.add("s", calc.create_score());

        // same type: the running value survives
        ctx.apply_config(config.clone()).unwrap();
        assert!(ctx.score_manager.get("s").is_some());

        config.score_config = vec![ScoreConfig::new("s", "SparsityTheta", &Value::Null).unwrap()];
        ctx.apply_config(config.clone()).unwrap();
        assert!(ctx.score_manager.get("s").is_none());
        assert!(ctx.score_tracker.history("s").is_empty());

        let calc = ctx.score_calculators.get("s").unwrap();
        ctx.score_manager.append(calc.as_ref(), &calc.create_score()).unwrap();
        config.score_config.clear();
        ctx.apply_config(config).unwrap();
        assert!(ctx.score_manager.get("s").is_none());
    }

    #[test]
    fn waiting_without_processors_fails() {
        let mut instance = Instance::new(MasterModelConfig::with_topics(2)).unwrap();
        let manager = BatchManager::new();
        assert!(instance.wait_batches(&manager).is_ok());

        instance.processors.clear();
        manager.next_task();
        assert!(matches!(instance.wait_batches(&manager), Err(ArtmError::Internal(_))));
    }
}
