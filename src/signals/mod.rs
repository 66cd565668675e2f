pub mod advice;
pub mod physics;
pub mod rules;
pub mod score;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::warn;

use crate::core::{Reading, RuleResult};
use rules::{RuleError, RuleInput, RuleSpec, RuleThresholds, REGISTRY};

/// The rule engine runs every registered rule against one reading.
pub struct RuleEngine {
    registry: &'static [RuleSpec],
    thresholds: RuleThresholds,
}

impl RuleEngine {
    pub fn new(thresholds: RuleThresholds) -> Self {
        Self {
            registry: &REGISTRY,
            thresholds,
        }
    }

    /// Evaluate all rules. Hits come back sorted by priority, highest first.
    ///
    /// A rule that errors or panics is logged and counted as not triggered.
    pub fn evaluate(
        &self,
        current: &Arc<Reading>,
        previous: Option<&Reading>,
        history: &[Arc<Reading>],
    ) -> Vec<RuleResult> {
        let input = RuleInput {
            current,
            previous,
            history,
            thresholds: &self.thresholds,
        };

        let mut hits: Vec<RuleResult> = self
            .registry
            .iter()
            .filter_map(|spec| match isolate(|| spec.evaluate(&input)) {
                Ok(true) => Some(spec.result_for(Arc::clone(current))),
                Ok(false) => None,
                Err(e) => {
                    warn!(
                        sensor_id = %current.sensor_id,
                        rule = spec.kind.name(),
                        "Rule failed, treating as not triggered: {e}"
                    );
                    None
                }
            })
            .collect();

        // sort_by is stable, so equal priorities keep registry order
        hits.sort_by(|a, b| b.priority.cmp(&a.priority));
        hits
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new(RuleThresholds::default())
    }
}

fn isolate<F>(rule: F) -> Result<bool, RuleError>
where
    F: FnOnce() -> Result<bool, RuleError>,
{
    panic::catch_unwind(AssertUnwindSafe(rule))
        .unwrap_or_else(|payload| Err(RuleError::Panicked(panic_message(payload.as_ref()))))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
