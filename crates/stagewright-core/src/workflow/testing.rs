//! Scripted connector shared by workflow tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use crate::connector::{Connector, ConnectorError, ConnectorOutput};

#[derive(Default)]
struct ScriptState {
    calls: AtomicU32,
    active: AtomicUsize,
    max_active: AtomicUsize,
    transient: Mutex<HashMap<Option<usize>, u32>>,
    permanent: HashSet<Option<usize>>,
    calls_by_batch: Mutex<HashMap<Option<usize>, u32>>,
    delay: Duration,
}

/// A connector whose failures are scripted per batch index (`None` for a
/// non-parallel invocation). Clones share counters.
///
/// Output: the `items` or `input` array from the config, or three fixed rows
/// when neither is present.
#[derive(Clone, Default)]
pub(crate) struct Scripted {
    state: Arc<ScriptState>,
}

impl Scripted {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn state_mut(&mut self) -> &mut ScriptState {
        Arc::get_mut(&mut self.state).expect("configure before cloning")
    }

    /// Fail `times` with a retryable error, then succeed.
    pub(crate) fn fail_times(mut self, batch: Option<usize>, times: u32) -> Self {
        self.state_mut()
            .transient
            .get_mut()
            .unwrap()
            .insert(batch, times);
        self
    }

    /// Always fail with a retryable error.
    pub(crate) fn fail_always(mut self, batch: Option<usize>) -> Self {
        self.state_mut().permanent.insert(batch);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.state_mut().delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> u32 {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn calls_for(&self, batch: Option<usize>) -> u32 {
        self.state
            .calls_by_batch
            .lock()
            .unwrap()
            .get(&batch)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn max_active(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }
}

impl Connector for Scripted {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, config: &Value) -> Result<ConnectorOutput, ConnectorError> {
        let state = &self.state;
        let batch = config
            .get("batch_index")
            .and_then(Value::as_u64)
            .map(|i| i as usize);
        state.calls.fetch_add(1, Ordering::SeqCst);
        *state.calls_by_batch.lock().unwrap().entry(batch).or_default() += 1;

        let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_active.fetch_max(active, Ordering::SeqCst);
        if !state.delay.is_zero() {
            tokio::time::sleep(state.delay).await;
        }
        state.active.fetch_sub(1, Ordering::SeqCst);

        if state.permanent.contains(&batch) {
            return Err(ConnectorError::retryable(format!("batch {batch:?} unavailable")));
        }
        {
            let mut transient = state.transient.lock().unwrap();
            if let Some(remaining) = transient.get_mut(&batch) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ConnectorError::retryable(format!("batch {batch:?} flaked")));
                }
            }
        }

        let data = config
            .get("items")
            .or_else(|| config.get("input"))
            .cloned()
            .unwrap_or_else(|| json!([{"id": 1}, {"id": 2}, {"id": 3}]));
        Ok(ConnectorOutput::new(data))
    }
}

/// Fast retry settings for tests.
pub(crate) fn fast_retry(max_attempts: u32) -> stagewright_types::workflow::RetryConfig {
    stagewright_types::workflow::RetryConfig {
        max_attempts,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
    }
}
