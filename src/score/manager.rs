use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use indexmap::IndexMap;

use crate::error::{ArtmError, Result};
use crate::score::{ScoreCalculator, ScoreData};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Running values of cumulative scores, keyed by score name.
///
/// One instance is shared by every processor; tasks that need their own
/// totals carry a private instance as well.
#[derive(Debug, Default)]
pub struct ScoreManager {
    scores: Mutex<HashMap<String, ScoreData>>,
}

impl ScoreManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `score` into the running value of `calculator`.
    ///
    /// A running value of another score type is replaced by `score` and
    /// reported as an error.
    pub fn append(&self, calculator: &dyn ScoreCalculator, score: &ScoreData) -> Result<()> {
        let mut scores = lock(&self.scores);
        let Some(existing) = scores.get_mut(calculator.name()) else {
            scores.insert(calculator.name().to_string(), score.clone());
            return Ok(());
        };
        if existing.kind() != score.kind() {
            let stale = existing.kind();
            *existing = score.clone();
            return Err(ArtmError::invalid(format!(
                "score '{}' held a {} value, restarted as {}",
                calculator.name(),
                stale,
                score.kind()
            )));
        }
        calculator.append_score(score, existing)
    }

    pub fn get(&self, name: &str) -> Option<ScoreData> {
        lock(&self.scores).get(name).cloned()
    }

    pub fn remove(&self, name: &str) -> Option<ScoreData> {
        lock(&self.scores).remove(name)
    }

    pub fn clear(&self) {
        lock(&self.scores).clear();
    }
}

/// History of score values, one entry per recorded point in time.
#[derive(Debug, Default)]
pub struct ScoreTracker {
    history: Mutex<IndexMap<String, Vec<ScoreData>>>,
}

impl ScoreTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str, score: ScoreData) {
        lock(&self.history).entry(name.to_string()).or_default().push(score);
    }

    pub fn history(&self, name: &str) -> Vec<ScoreData> {
        lock(&self.history).get(name).cloned().unwrap_or_default()
    }

    /// Forget the history of one score.
    pub fn remove(&self, name: &str) {
        lock(&self.history).shift_remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScoreConfig;
    use crate::score::{ItemsProcessed, ItemsProcessedScore, SparsityScore, SparsityTheta};
    use serde_cbor::Value;
    use std::sync::Arc;
    use std::thread;

    fn items(n: u64) -> ScoreData {
        ScoreData::ItemsProcessed(ItemsProcessedScore { num_items: n, num_batches: 1 })
    }

    #[test]
    fn manager_accumulates_across_threads() {
        let calc = Arc::new(
            ItemsProcessed::from_config(&ScoreConfig { name: "items".into(), type_name: "ItemsProcessed".into(), config: Value::Null })
                .unwrap(),
        );
        let manager = Arc::new(ScoreManager::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let calc = Arc::clone(&calc);
                let manager = Arc::clone(&manager);
                thread::spawn(move || manager.append(calc.as_ref(), &items(2)).unwrap())
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(manager.get("items"), Some(ScoreData::ItemsProcessed(ItemsProcessedScore { num_items: 8, num_batches: 4 })));
        manager.clear();
        assert_eq!(manager.get("items"), None);
    }

    #[test]
    fn tracker_keeps_history() {
        let tracker = ScoreTracker::new();
        tracker.add("items", items(1));
        tracker.add("items", items(2));
        assert_eq!(tracker.history("items").len(), 2);
        assert_eq!(tracker.history("items").last(), Some(&items(2)));
        assert!(tracker.history("nope").is_empty());
        tracker.remove("items");
        assert!(tracker.history("items").is_empty());
    }

    #[test]
    fn retyped_value_is_replaced_not_merged() {
        let manager = ScoreManager::new();
        let items_calc =
            ItemsProcessed::from_config(&ScoreConfig { name: "s".into(), type_name: "ItemsProcessed".into(), config: Value::Null })
                .unwrap();
        let sparsity_calc =
            SparsityTheta::from_config(&ScoreConfig { name: "s".into(), type_name: "SparsityTheta".into(), config: Value::Null })
                .unwrap();
        manager.append(&items_calc, &items(3)).unwrap();

        let sparsity = ScoreData::SparsityTheta(SparsityScore::new(1, 2));
        assert!(manager.append(&sparsity_calc, &sparsity).is_err());
        assert_eq!(manager.get("s"), Some(sparsity.clone()));
        // the replaced value accumulates normally afterwards
        manager.append(&sparsity_calc, &sparsity).unwrap();
        assert_eq!(manager.get("s"), Some(ScoreData::SparsityTheta(SparsityScore::new(2, 4))));
        assert!(manager.remove("s").is_some());
        assert_eq!(manager.get("s"), None);
    }
}
