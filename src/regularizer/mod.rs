pub mod decorrelator_phi;
pub mod smooth_ptdw;
pub mod smooth_sparse_phi;
pub mod smooth_sparse_theta;

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::batch::Batch;
use crate::config::{ProcessBatchesArgs, RegularizerConfig};
use crate::error::{ArtmError, Result};
use crate::model::dictionary::Dictionary;
use crate::model::phi_matrix::{DensePhiMatrix, PhiMatrix};
use crate::utils::datastruct::{DenseMatrix, ThreadSafeHolder};
use crate::utils::math::{normalize, regularize_and_normalize};

pub use decorrelator_phi::DecorrelatorPhi;
pub use smooth_ptdw::SmoothPtdw;
pub use smooth_sparse_phi::SmoothSparsePhi;
pub use smooth_sparse_theta::SmoothSparseTheta;

/// Additive correction of one document's topic distribution.
pub trait RegularizeThetaAgent {
    /// Add the correction for `item_index` at inner pass `inner_iter` into
    /// `r_td`. `theta` holds the unnormalized counts of the current pass.
    fn apply(&self, item_index: usize, inner_iter: usize, theta: &[f32], r_td: &mut [f32]);
}

/// In-place correction of one document's per-token posterior.
///
/// `ptdw` has one row per token occurrence of the item and one column per
/// topic. Rows are renormalized by the collection afterwards.
pub trait RegularizePtdwAgent {
    fn apply(&self, item_index: usize, inner_iter: usize, ptdw: &mut DenseMatrix<f32>);
}

/// What an agent may look at when it is built for a batch.
pub struct AgentContext<'a> {
    pub batch: &'a Batch,
    pub args: &'a ProcessBatchesArgs,
    pub topic_names: &'a [String],
    pub tau: f32,
}

/// What a phi regularizer may look at during synchronization.
pub struct PhiContext<'a> {
    pub pwt: &'a dyn PhiMatrix,
    pub nwt: &'a dyn PhiMatrix,
    pub dictionaries: &'a ThreadSafeHolder<String, Dictionary>,
}

/// Pluggable additive regularizer.
///
/// A regularizer may contribute to any of the three stages; the defaults
/// contribute nothing.
pub trait Regularizer: Send + Sync + fmt::Debug {
    fn type_name(&self) -> &'static str;

    fn create_regularize_theta_agent(&self, _ctx: &AgentContext<'_>) -> Option<Box<dyn RegularizeThetaAgent>> {
        None
    }

    fn create_regularize_ptdw_agent(&self, _ctx: &AgentContext<'_>) -> Option<Box<dyn RegularizePtdwAgent>> {
        None
    }

    /// Write the (tau-free) phi correction into `result`, which has the shape
    /// of `ctx.nwt` and starts at zero. Returns `false` when nothing was
    /// written.
    fn regularize_phi(&self, _ctx: &PhiContext<'_>, _result: &DensePhiMatrix) -> bool {
        false
    }

    /// Replace the parameters in place. The type tag must not change.
    fn reconfigure(&self, config: &RegularizerConfig) -> Result<()>;
}

/// Theta agents of one task, applied in registration order.
#[derive(Default)]
pub struct ThetaAgentCollection {
    agents: Vec<Box<dyn RegularizeThetaAgent>>,
}

impl ThetaAgentCollection {
    pub fn push(&mut self, agent: Box<dyn RegularizeThetaAgent>) {
        self.agents.push(agent);
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Collect every agent's correction, fold it into `theta`, clip and
    /// renormalize. `r_td` is scratch space of the same length.
    pub fn apply(&self, item_index: usize, inner_iter: usize, theta: &mut [f32], r_td: &mut [f32]) {
        r_td.iter_mut().for_each(|r| *r = 0.0);
        for agent in &self.agents {
            agent.apply(item_index, inner_iter, theta, r_td);
        }
        regularize_and_normalize(theta, r_td);
    }
}

/// Ptdw agents of one task.
#[derive(Default)]
pub struct PtdwAgentCollection {
    agents: Vec<Box<dyn RegularizePtdwAgent>>,
}

impl PtdwAgentCollection {
    pub fn push(&mut self, agent: Box<dyn RegularizePtdwAgent>) {
        self.agents.push(agent);
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Run every agent, then clip negatives and renormalize each row.
    pub fn apply(&self, item_index: usize, inner_iter: usize, ptdw: &mut DenseMatrix<f32>) {
        for agent in &self.agents {
            agent.apply(item_index, inner_iter, ptdw);
        }
        for row in 0..ptdw.no_rows() {
            let values = ptdw.row_mut(row);
            values.iter_mut().for_each(|v| *v = v.max(0.0));
            normalize(values);
        }
    }
}

type RegularizerCtor = fn(&RegularizerConfig) -> Result<Arc<dyn Regularizer>>;

/// Type tag → constructor registry.
pub struct RegularizerFactory {
    ctors: IndexMap<&'static str, RegularizerCtor>,
}

impl fmt::Debug for RegularizerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.ctors.keys()).finish()
    }
}

impl Default for RegularizerFactory {
    fn default() -> Self {
        let mut factory = Self { ctors: IndexMap::new() };
        factory.register(SmoothSparseTheta::TYPE_NAME, |c| SmoothSparseTheta::from_config(c).map(|r| Arc::new(r) as Arc<dyn Regularizer>));
        factory.register(SmoothSparsePhi::TYPE_NAME, |c| SmoothSparsePhi::from_config(c).map(|r| Arc::new(r) as Arc<dyn Regularizer>));
        factory.register(DecorrelatorPhi::TYPE_NAME, |c| DecorrelatorPhi::from_config(c).map(|r| Arc::new(r) as Arc<dyn Regularizer>));
        factory.register(SmoothPtdw::TYPE_NAME, |c| SmoothPtdw::from_config(c).map(|r| Arc::new(r) as Arc<dyn Regularizer>));
        factory
    }
}

impl RegularizerFactory {
    pub fn register(&mut self, type_name: &'static str, ctor: RegularizerCtor) {
        self.ctors.insert(type_name, ctor);
    }

    pub fn create(&self, config: &RegularizerConfig) -> Result<Arc<dyn Regularizer>> {
        match self.ctors.get(config.type_name.as_str()) {
            Some(ctor) => ctor(config),
            None => Err(ArtmError::unknown_type("regularizer", config.type_name.clone())),
        }
    }

    pub fn type_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.ctors.keys().copied()
    }
}

/// Reject a reconfigure call that would change the regularizer type.
pub(crate) fn check_type(expected: &'static str, config: &RegularizerConfig) -> Result<()> {
    if config.type_name != expected {
        return Err(ArtmError::invalid(format!(
            "regularizer '{}' is {}, can not reconfigure it as {}",
            config.name, expected, config.type_name
        )));
    }
    Ok(())
}

/// Weight of every topic: 1 for the listed topics (all when the list is
/// empty), 0 for the others.
pub(crate) fn topic_mask(topic_names: &[String], selected: &[String]) -> Vec<f32> {
    topic_names
        .iter()
        .map(|name| if selected.is_empty() || selected.contains(name) { 1.0 } else { 0.0 })
        .collect()
}
