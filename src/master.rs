use std::sync::Arc;

use crate::batch::{Batch, BatchSource};
use crate::config::{MasterModelConfig, ProcessBatchesArgs, RegularizerConfig, ThetaMatrixType};
use crate::engine::batch_manager::BatchManager;
use crate::engine::cache_manager::{CacheManager, ThetaMatrix};
use crate::engine::instance::{Instance, InstanceContext};
use crate::engine::merger::SyncRequest;
use crate::engine::processor::{NwtTarget, ProcessorInput};
use crate::error::{ArtmError, Result};
use crate::model::attached::AttachedPhiMatrix;
use crate::model::dictionary::Dictionary;
use crate::model::phi_matrix::{DensePhiMatrix, PhiMatrix};
use crate::model::token::ClassId;
use crate::model::topic_model::{apply_topic_model_operation, TopicModel, TopicModelData};
use crate::score::ScoreData;

/// Entry point of the engine.
///
/// Owns an [`Instance`] (processor pool, merger, registries) and drives the
/// fitting algorithms on top of it. Every model operation works on the model
/// named `pwt_name` in the configuration unless a name is passed explicitly.
///
/// # Examples
/// ```no_run
/// use artm_core::{BatchBuilder, BatchSource, MasterComponent, MasterModelConfig, Token};
///
/// let master = MasterComponent::new(MasterModelConfig::with_topics(4)).unwrap();
/// let batch = BatchBuilder::new("b0")
///     .add_item("doc", &[(Token::word("rust"), 2.0), (Token::word("crate"), 1.0)])
///     .build();
/// master.add_batch(batch).unwrap();
/// master.gather_dictionary("dict", &[]).unwrap();
/// master.initialize_model("dict").unwrap();
/// master.fit_offline(&[BatchSource::Registered("b0".into())], 10).unwrap();
/// ```
#[derive(Debug)]
pub struct MasterComponent {
    instance: Instance,
}

impl MasterComponent {
    pub fn new(config: MasterModelConfig) -> Result<Self> {
        Ok(Self {
            instance: Instance::new(config)?,
        })
    }

    fn ctx(&self) -> &Arc<InstanceContext> {
        self.instance.context()
    }

    pub fn config(&self) -> MasterModelConfig {
        self.ctx().config()
    }

    pub fn reconfigure(&mut self, config: MasterModelConfig) -> Result<()> {
        self.instance.reconfigure(config)
    }

    pub fn reconfigure_regularizer(&self, config: RegularizerConfig) -> Result<()> {
        self.ctx().reconfigure_regularizer(config)
    }

    /// Register a batch under its id.
    pub fn add_batch(&self, batch: Batch) -> Result<()> {
        batch.validate()?;
        self.ctx().batches.set(batch.id.clone(), Arc::new(batch));
        Ok(())
    }

    pub fn import_batches<I: IntoIterator<Item = Batch>>(&self, batches: I) -> Result<()> {
        for batch in batches {
            self.add_batch(batch)?;
        }
        Ok(())
    }

    pub fn add_dictionary(&self, dictionary: Dictionary) {
        self.ctx().dictionaries.set(dictionary.name.clone(), Arc::new(dictionary));
    }

    /// Build a dictionary from registered batches (all of them when
    /// `batch_ids` is empty).
    pub fn gather_dictionary(&self, name: &str, batch_ids: &[String]) -> Result<()> {
        let mut ids = if batch_ids.is_empty() {
            self.ctx().batches.keys()
        } else {
            batch_ids.to_vec()
        };
        ids.sort();
        let batches = ids
            .iter()
            .map(|id| self.ctx().batches.get(id.as_str()).ok_or_else(|| ArtmError::not_found("batch", id.clone())))
            .collect::<Result<Vec<_>>>()?;
        let dictionary = Dictionary::gather(name, batches.iter().map(|b| &**b));
        log::info!("dictionary '{}' gathered: {} tokens, {} items", name, dictionary.size(), dictionary.num_items());
        self.add_dictionary(dictionary);
        Ok(())
    }

    /// Seed the model from a dictionary with token-hashed random counts.
    pub fn initialize_model(&self, dictionary_name: &str) -> Result<()> {
        let config = self.config();
        let dictionary = self
            .ctx()
            .dictionaries
            .get(dictionary_name)
            .ok_or_else(|| ArtmError::not_found("dictionary", dictionary_name))?;
        let model = TopicModel::initialize(&config.pwt_name, &dictionary, &config.topic_name, &config.class_id, config.seed)?;
        log::info!("model '{}' initialized with {} tokens", config.pwt_name, model.token_size());
        self.ctx().models.set(config.pwt_name, Arc::new(model));
        Ok(())
    }

    fn model(&self, name: &str) -> Result<Arc<TopicModel>> {
        self.ctx().models.get(name).ok_or_else(|| ArtmError::not_found("model", name))
    }

    fn fit_args(&self, config: &MasterModelConfig) -> Result<Arc<ProcessBatchesArgs>> {
        let args = config.process_batches_args();
        args.validate()?;
        Ok(Arc::new(args))
    }

    fn theta_target(&self, args: &ProcessBatchesArgs) -> Option<Arc<CacheManager>> {
        (args.cache_theta || args.reuse_theta).then(|| Arc::clone(&self.ctx().cache_manager))
    }

    /// Queue one task per batch and return the manager tracking them.
    fn enqueue(
        &self,
        batches: &[BatchSource],
        args: &Arc<ProcessBatchesArgs>,
        model_name: &str,
        target: &NwtTarget,
        theta_cache: Option<&Arc<CacheManager>>,
    ) -> Arc<BatchManager> {
        let manager = Arc::new(BatchManager::new());
        for batch in batches {
            self.ctx().processor_queue.push(ProcessorInput {
                task_id: manager.next_task(),
                batch: batch.clone(),
                batch_weight: 1.0,
                args: Arc::clone(args),
                model_name: model_name.to_string(),
                nwt_target: target.clone(),
                batch_manager: Arc::clone(&manager),
                theta_cache: theta_cache.cloned(),
                score_manager: None,
            });
        }
        manager
    }

    /// Counts buffer with the token set of the current model.
    fn nwt_buffer(&self, config: &MasterModelConfig) -> Result<Arc<DensePhiMatrix>> {
        let model = self.model(&config.pwt_name)?;
        Ok(Arc::new(DensePhiMatrix::with_shape_of(config.nwt_name.as_str(), &**model.pwt())))
    }

    /// Offline EM: every pass processes all batches against the same Pwt and
    /// replaces Nwt with the counts of that pass.
    pub fn fit_offline(&self, batches: &[BatchSource], num_passes: usize) -> Result<()> {
        let config = self.config();
        let args = self.fit_args(&config)?;
        let theta_cache = self.theta_target(&args);
        for pass in 0..num_passes {
            let nwt = self.nwt_buffer(&config)?;
            self.ctx().score_manager.clear();
            let manager = self.enqueue(batches, &args, &config.pwt_name, &NwtTarget::Matrix(Arc::clone(&nwt)), theta_cache.as_ref());
            self.instance.wait_batches(&manager)?;
            self.instance.merger().force_synchronize(SyncRequest {
                decay: 0.0,
                apply: 1.0,
                increment: Some(nwt),
                ..SyncRequest::new(config.pwt_name.as_str())
            })?;
            self.record_scores();
            log::info!("offline pass {} of {} done over {} batches", pass + 1, num_passes, batches.len());
        }
        Ok(())
    }

    /// Online EM: the model is updated after every `update_every` batches with
    /// `apply = (tau0 + update_count)^-kappa` and `decay = 1 - apply`.
    ///
    /// In async mode the next chunk is processed while the previous one is
    /// being merged, so it reads a model one update behind.
    pub fn fit_online(&self, batches: &[BatchSource], update_every: usize, tau0: f32, kappa: f32, async_mode: bool) -> Result<()> {
        if update_every == 0 {
            return Err(ArtmError::out_of_range("update_every", 0));
        }
        if !(tau0 >= 0.0) {
            return Err(ArtmError::out_of_range("tau0", tau0));
        }
        if !(kappa >= 0.0) {
            return Err(ArtmError::out_of_range("kappa", kappa));
        }
        let config = self.config();
        let args = self.fit_args(&config)?;
        let theta_cache = self.theta_target(&args);
        self.ctx().score_manager.clear();

        let mut update_count = 0usize;
        let mut synchronize = |increment: Option<Arc<DensePhiMatrix>>| -> Result<()> {
            update_count += 1;
            let apply = (tau0 + update_count as f32).powf(-kappa);
            self.instance.merger().force_synchronize(SyncRequest {
                decay: 1.0 - apply,
                apply,
                increment,
                ..SyncRequest::new(config.pwt_name.as_str())
            })?;
            self.record_scores();
            log::debug!("online update {} (apply {})", update_count, apply);
            Ok(())
        };

        if !async_mode {
            let target = NwtTarget::Merger {
                model_name: config.pwt_name.clone(),
            };
            for chunk in batches.chunks(update_every) {
                let manager = self.enqueue(chunk, &args, &config.pwt_name, &target, theta_cache.as_ref());
                self.instance.wait_batches(&manager)?;
                self.instance.merger().wait_idle(None)?;
                synchronize(None)?;
            }
            return Ok(());
        }

        let mut pending: Option<(Arc<BatchManager>, Arc<DensePhiMatrix>)> = None;
        for chunk in batches.chunks(update_every) {
            let nwt = self.nwt_buffer(&config)?;
            let manager = self.enqueue(chunk, &args, &config.pwt_name, &NwtTarget::Matrix(Arc::clone(&nwt)), theta_cache.as_ref());
            if let Some((previous, increment)) = pending.replace((manager, nwt)) {
                self.instance.wait_batches(&previous)?;
                synchronize(Some(increment))?;
            }
        }
        if let Some((previous, increment)) = pending {
            self.instance.wait_batches(&previous)?;
            synchronize(Some(increment))?;
        }
        Ok(())
    }

    /// Infer theta of `batches` against the current model without touching it.
    pub fn transform(
        &self,
        batches: &[BatchSource],
        theta_matrix_type: ThetaMatrixType,
        predict_class_id: Option<ClassId>,
    ) -> Result<ThetaMatrix> {
        let config = self.config();
        let model = self.model(&config.pwt_name)?;
        let args = ProcessBatchesArgs {
            theta_matrix_type,
            predict_class_id,
            cache_theta: true,
            ..config.process_batches_args()
        };
        args.validate()?;
        let args = Arc::new(args);
        let cache = Arc::new(CacheManager::new(None));
        let manager = self.enqueue(batches, &args, &config.pwt_name, &NwtTarget::None, Some(&cache));
        self.instance.wait_batches(&manager)?;
        let theta = cache.request_theta_matrix(args.ptd_name.as_deref())?;
        Ok(theta.unwrap_or_else(|| ThetaMatrix::new(config.pwt_name.as_str(), model.topic_names().to_vec(), theta_matrix_type)))
    }

    /// Current value of a score: the running total of a cumulative score, or
    /// a fresh computation on the current Pwt otherwise.
    pub fn request_score(&self, name: &str) -> Result<ScoreData> {
        let calculator = self
            .ctx()
            .score_calculators
            .get(name)
            .ok_or_else(|| ArtmError::not_found("score", name))?;
        if calculator.is_cumulative() {
            return Ok(self.ctx().score_manager.get(name).unwrap_or_else(|| calculator.create_score()));
        }
        let model = self.model(&self.config().pwt_name)?;
        calculator
            .calculate_score(&**model.pwt())
            .ok_or_else(|| ArtmError::invalid(format!("score '{}' can not be calculated from a model", name)))
    }

    /// Values recorded after every fit pass or online update.
    pub fn request_score_array(&self, name: &str) -> Vec<ScoreData> {
        self.ctx().score_tracker.history(name)
    }

    fn record_scores(&self) {
        for name in self.ctx().score_calculators.keys() {
            match self.request_score(&name) {
                Ok(score) => self.ctx().score_tracker.add(&name, score),
                Err(err) => log::warn!("score '{}' not recorded: {}", name, err),
            }
        }
    }

    /// Clear the running totals of cumulative scores.
    pub fn reset_scores(&self) {
        self.instance.merger().reset_scores();
    }

    /// Theta cached during fitting (`cache_theta`), under the given
    /// `ptd_name` key.
    pub fn request_theta_matrix(&self, ptd_name: Option<&str>) -> Result<Option<ThetaMatrix>> {
        self.ctx().cache_manager.request_theta_matrix(ptd_name)
    }

    /// Ptdw cached by any processing call with `cache_ptdw`: one row per
    /// token occurrence, titled by the token.
    pub fn request_ptdw_matrix(&self, ptd_name: Option<&str>) -> Result<Option<ThetaMatrix>> {
        self.ctx().ptdw_cache.request_theta_matrix(ptd_name)
    }

    pub fn request_topic_model(&self, name: &str) -> Result<TopicModelData> {
        Ok(self.model(name)?.snapshot())
    }

    /// Drop a model with its accumulator and cached theta.
    pub fn dispose_model(&self, name: &str) {
        self.instance.merger().dispose_model(name);
    }

    /// Publish `Σ weight * Nwt(source)` as model `target`.
    ///
    /// Topics are matched by name against `topic_names`, which defaults to
    /// the topics of the first source.
    pub fn merge_models(&self, sources: &[(String, f32)], target: &str, topic_names: Option<&[String]>) -> Result<()> {
        let Some((first, _)) = sources.first() else {
            return Err(ArtmError::invalid("merge_models needs at least one source model"));
        };
        let topics = match topic_names {
            Some(names) => names.to_vec(),
            None => self.model(first)?.topic_names().to_vec(),
        };
        let mut nwt = DensePhiMatrix::new(self.config().nwt_name, topics);
        for (name, weight) in sources {
            let source = self.model(name)?;
            let source_topics = source.topic_names().to_vec();
            apply_topic_model_operation(&mut nwt, &**source.nwt(), *weight, Some(&source_topics));
        }
        if nwt.token_size() == 0 {
            return Err(ArtmError::invalid(format!("merged model '{}' has no tokens", target)));
        }
        let model = TopicModel::from_nwt(target, nwt)?;
        self.ctx().models.set(target.to_string(), Arc::new(model));
        Ok(())
    }

    /// Number of floats `attach_model` needs for this model.
    pub fn model_buffer_size(&self, name: &str) -> Result<usize> {
        let model = self.model(name)?;
        Ok(model.token_size() * model.topic_names().len())
    }

    /// Copy Pwt of a model into `buffer` and return a view over it.
    pub fn attach_model<'a>(&self, name: &str, buffer: &'a mut [f32]) -> Result<AttachedPhiMatrix<'a>> {
        let model = self.model(name)?;
        AttachedPhiMatrix::attach_copy(&**model.pwt(), buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchBuilder;
    use crate::config::ScoreConfig;
    use crate::model::token::Token;
    use crate::score::top_tokens::TopTokensConfig;
    use crate::score::ItemsProcessedScore;
    use serde_cbor::Value;

    fn corpus() -> Vec<Batch> {
        let w = |s: &str| Token::word(s);
        vec![
            BatchBuilder::new("b0")
                .add_item("d0", &[(w("cat"), 3.0), (w("dog"), 2.0)])
                .add_item("d1", &[(w("rust"), 2.0), (w("cargo"), 3.0)])
                .build(),
            BatchBuilder::new("b1")
                .add_item("d2", &[(w("cat"), 1.0), (w("dog"), 4.0), (w("fur"), 1.0)])
                .add_item("d3", &[(w("cargo"), 1.0), (w("rust"), 2.0), (w("crate"), 2.0)])
                .build(),
        ]
    }

    fn master(num_processors: usize) -> MasterComponent {
        let mut config = MasterModelConfig::with_topics(2);
        config.num_processors = num_processors;
        config.cache_theta = true;
        config.score_config = vec![
            ScoreConfig::new("items", "ItemsProcessed", &Value::Null).unwrap(),
            ScoreConfig::new("perplexity", "Perplexity", &Value::Null).unwrap(),
            ScoreConfig::new("top", "TopTokens", &TopTokensConfig { num_tokens: 2, ..TopTokensConfig::default() }).unwrap(),
        ];
        let master = MasterComponent::new(config).unwrap();
        master.import_batches(corpus()).unwrap();
        master.gather_dictionary("dict", &[]).unwrap();
        master.initialize_model("dict").unwrap();
        master
    }

    fn sources() -> Vec<BatchSource> {
        vec![BatchSource::Registered("b0".into()), BatchSource::Registered("b1".into())]
    }

    fn assert_normalized(model: &TopicModelData) {
        for t in 0..model.topic_names.len() {
            let column: f32 = model.pwt.iter().map(|row| row[t]).sum();
            assert!((column - 1.0).abs() < 1e-4, "topic {} sums to {}", t, column);
        }
    }

    #[test]
    fn offline_fit_normalizes_and_records_scores() {
        let master = master(2);
        master.fit_offline(&sources(), 3).unwrap();

        let model = master.request_topic_model("pwt").unwrap();
        assert_eq!(model.tokens.len(), 6);
        assert_normalized(&model);
        // Nwt holds the counts of the last pass only
        let total: f32 = model.nwt.iter().flatten().sum();
        assert!((total - 21.0).abs() < 1e-3, "total mass {}", total);

        let items = master.request_score_array("items");
        assert_eq!(items.len(), 3);
        assert_eq!(items[2], ScoreData::ItemsProcessed(ItemsProcessedScore { num_items: 4, num_batches: 2 }));
        assert!(matches!(master.request_score("top").unwrap(), ScoreData::TopTokens(s) if s.topics.len() == 2));

        let theta = master.request_theta_matrix(None).unwrap().unwrap();
        assert_eq!(theta.num_items(), 4);
    }

    #[test]
    fn online_fit_in_both_modes() {
        for async_mode in [false, true] {
            let master = master(2);
            master.fit_online(&sources(), 1, 1.0, 0.7, async_mode).unwrap();
            assert_eq!(master.request_score_array("perplexity").len(), 2);
            assert_normalized(&master.request_topic_model("pwt").unwrap());
        }
        assert!(master(1).fit_online(&sources(), 0, 1.0, 0.7, false).is_err());
    }

    #[test]
    fn transform_leaves_model_untouched() {
        let master = master(1);
        let before = master.request_topic_model("pwt").unwrap();
        let theta = master.transform(&sources(), ThetaMatrixType::Dense, None).unwrap();
        assert_eq!(theta.num_items(), 4);
        for row in &theta.item_weights {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
        assert_eq!(master.request_topic_model("pwt").unwrap(), before);
    }

    #[test]
    fn skipped_batches_show_in_items_processed() {
        let master = master(1);
        let unknown = BatchBuilder::new("x").add_item("d", &[(Token::word("zebra"), 1.0)]).build();
        master.fit_offline(&[BatchSource::InMemory(Arc::new(unknown))], 1).unwrap();
        assert_eq!(
            master.request_score("items").unwrap(),
            ScoreData::ItemsProcessed(ItemsProcessedScore::default())
        );
    }

    #[test]
    fn merge_attach_and_dispose() {
        let master = master(1);
        master.merge_models(&[("pwt".into(), 1.0), ("pwt".into(), 1.0)], "double", None).unwrap();
        let single = master.request_topic_model("pwt").unwrap();
        let double = master.request_topic_model("double").unwrap();
        assert_eq!(double.tokens, single.tokens);
        assert!((double.nwt[0][0] - 2.0 * single.nwt[0][0]).abs() < 1e-5);

        let mut buffer = vec![0.0f32; master.model_buffer_size("pwt").unwrap()];
        {
            let attached = master.attach_model("pwt", &mut buffer).unwrap();
            assert_eq!(attached.token_size(), single.tokens.len());
            assert_eq!(attached.get(1, 1), single.pwt[1][1]);
        }
        assert_eq!(buffer[1], single.pwt[0][1]);

        master.dispose_model("double");
        // dispose goes through the merger queue
        master.instance.merger().force_synchronize(SyncRequest::new("pwt")).unwrap();
        assert!(matches!(master.request_topic_model("double"), Err(ArtmError::NotFound { .. })));
    }

    #[test]
    fn transform_caches_ptdw_when_asked() {
        let mut master = master(1);
        assert!(master.request_ptdw_matrix(None).unwrap().is_none());
        let mut config = master.config();
        config.cache_ptdw = true;
        master.reconfigure(config).unwrap();

        master.transform(&sources(), ThetaMatrixType::Dense, None).unwrap();
        let ptdw = master.request_ptdw_matrix(None).unwrap().unwrap();
        // one row per token occurrence of the four documents
        assert_eq!(ptdw.num_items(), 10);
        assert_eq!(ptdw.item_title[0], "cat");
        for row in &ptdw.item_weights {
            assert!((row.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn ptd_names_keep_separate_theta_entries() {
        let mut master = master(1);
        let mut config = master.config();
        config.ptd_name = Some("level0".into());
        master.reconfigure(config.clone()).unwrap();
        master.fit_offline(&sources(), 1).unwrap();

        config.ptd_name = Some("level1".into());
        master.reconfigure(config).unwrap();
        master.fit_offline(&sources()[..1], 1).unwrap();
        let transformed = master.transform(&sources(), ThetaMatrixType::Dense, None).unwrap();
        assert_eq!(transformed.num_items(), 4);

        assert_eq!(master.request_theta_matrix(Some("level0")).unwrap().unwrap().num_items(), 4);
        assert_eq!(master.request_theta_matrix(Some("level1")).unwrap().unwrap().num_items(), 2);
        assert!(master.request_theta_matrix(None).unwrap().is_none());
    }

    #[test]
    fn retyped_score_keeps_processors_running() {
        let mut master = master(1);
        master.transform(&sources(), ThetaMatrixType::Dense, None).unwrap();
        let mut config = master.config();
        config.score_config = vec![ScoreConfig::new("items", "SparsityTheta", &Value::Null).unwrap()];
        master.reconfigure(config).unwrap();

        for _ in 0..2 {
            master.transform(&sources(), ThetaMatrixType::Dense, None).unwrap();
        }
        // two transforms of four documents over two topics
        assert!(matches!(master.request_score("items").unwrap(), ScoreData::SparsityTheta(s) if s.total == 16));
    }

    #[test]
    fn reset_scores_clears_running_totals() {
        let master = master(1);
        master.fit_offline(&sources(), 1).unwrap();
        master.reset_scores();
        master.instance.merger().force_synchronize(SyncRequest::new("pwt")).unwrap();
        assert_eq!(
            master.request_score("items").unwrap(),
            ScoreData::ItemsProcessed(ItemsProcessedScore::default())
        );
    }
}
