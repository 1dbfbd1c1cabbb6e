use std::sync::Arc;

use crate::error::FlowError;
use crate::error::FlowResult;
use crate::state::StateStore;

pub const DEFAULT_BUFFER_LENGTH: usize = 3;

/// The last few predictions of each camera, kept in the state store under
/// `{prefix}_{camera_id}`.
#[derive(Clone)]
pub struct PredictionBuffer {
    store: Arc<dyn StateStore>,
    prefix: String,
    max_len: usize,
}

impl std::fmt::Debug for PredictionBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionBuffer")
            .field("prefix", &self.prefix)
            .field("max_len", &self.max_len)
            .finish_non_exhaustive()
    }
}

impl PredictionBuffer {
    pub fn new(store: Arc<dyn StateStore>, prefix: impl Into<String>, max_len: usize) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            max_len: max_len.max(1),
        }
    }

    pub fn key(&self, camera_id: &str) -> String {
        format!("{}_{camera_id}", self.prefix)
    }

    /// Records `prediction` and returns the buffer oldest first.
    pub fn push(&self, camera_id: &str, prediction: bool) -> FlowResult<Vec<bool>> {
        let key = self.key(camera_id);
        let values = self
            .store
            .push_bounded(&key, &prediction.to_string(), self.max_len)?;
        decode(&key, values)
    }

    pub fn get(&self, camera_id: &str) -> FlowResult<Vec<bool>> {
        let key = self.key(camera_id);
        decode(&key, self.store.list(&key)?)
    }
}

fn decode(key: &str, values: Vec<String>) -> FlowResult<Vec<bool>> {
    values
        .into_iter()
        .map(|value| match value.as_str() {
            "true" | "True" => Ok(true),
            "false" | "False" => Ok(false),
            _ => Err(FlowError::payload(
                "state store",
                format!("bad prediction `{value}` at {key}"),
            )),
        })
        .collect()
}

/// Most frequent prediction; ties go to the most recent of the tied values.
/// `None` for an empty buffer.
pub fn majority(predictions: &[bool]) -> Option<bool> {
    let last = *predictions.last()?;
    let trues = predictions.iter().filter(|p| **p).count();
    let falses = predictions.len() - trues;
    Some(match trues.cmp(&falses) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => last,
    })
}
