//! Serializable checkpoint snapshot.
//!
//! Binary payloads (operator state and store snapshots, both rkyv) are
//! base64-encoded so the snapshot stays plain JSON.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64_ENGINE;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{CheckpointBarrier, CheckpointError, CheckpointId};
use crate::operator::OperatorState;
use crate::state::StateSnapshot;

/// Serializable form of [`OperatorState`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableOperatorState {
    /// Operator identifier.
    pub operator_id: String,
    /// Base64-encoded state payload.
    pub state_b64: String,
}

impl From<&OperatorState> for SerializableOperatorState {
    fn from(state: &OperatorState) -> Self {
        Self {
            operator_id: state.operator_id.clone(),
            state_b64: BASE64_ENGINE.encode(&state.data),
        }
    }
}

impl SerializableOperatorState {
    /// Decodes back to an [`OperatorState`].
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Serialization`] if the payload is not valid
    /// base64.
    pub fn to_operator_state(&self) -> Result<OperatorState, CheckpointError> {
        let data = BASE64_ENGINE
            .decode(&self.state_b64)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        Ok(OperatorState {
            operator_id: self.operator_id.clone(),
            data,
        })
    }
}

/// A point-in-time snapshot of the whole pipeline.
///
/// Holds each operator's non-keyed state, each operator's store contents and
/// the replay position of each source at the barrier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    /// Unique checkpoint identifier.
    pub checkpoint_id: CheckpointId,
    /// Epoch whose sink output this checkpoint commits.
    pub epoch: u64,
    /// Timestamp when the checkpoint was triggered (millis since epoch).
    pub timestamp: i64,
    /// Operator state, keyed by operator ID.
    pub operator_states: HashMap<String, SerializableOperatorState>,
    /// Base64 rkyv [`StateSnapshot`] per operator store.
    pub store_snapshots: HashMap<String, String>,
    /// Source name to replay position.
    pub source_offsets: HashMap<String, u64>,
}

impl PipelineSnapshot {
    pub(crate) fn from_parts(
        barrier: &CheckpointBarrier,
        operator_states: HashMap<String, OperatorState>,
        store_snapshots: &HashMap<String, StateSnapshot>,
        source_offsets: HashMap<String, u64>,
    ) -> Result<Self, CheckpointError> {
        let store_snapshots = store_snapshots
            .iter()
            .map(|(id, snapshot)| {
                let bytes = snapshot
                    .to_bytes()
                    .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
                Ok((id.clone(), BASE64_ENGINE.encode(bytes.as_slice())))
            })
            .collect::<Result<_, CheckpointError>>()?;
        Ok(Self {
            checkpoint_id: barrier.checkpoint_id,
            epoch: barrier.epoch,
            timestamp: barrier.timestamp,
            operator_states: operator_states
                .values()
                .map(|s| (s.operator_id.clone(), SerializableOperatorState::from(s)))
                .collect(),
            store_snapshots,
            source_offsets,
        })
    }

    /// Returns the state of one operator.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Serialization`] if the payload is corrupt.
    pub fn operator_state(&self, operator_id: &str) -> Result<Option<OperatorState>, CheckpointError> {
        self.operator_states
            .get(operator_id)
            .map(SerializableOperatorState::to_operator_state)
            .transpose()
    }

    /// Returns the store snapshot of one operator.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Serialization`] if the payload is corrupt.
    pub fn store_snapshot(&self, operator_id: &str) -> Result<Option<StateSnapshot>, CheckpointError> {
        let Some(encoded) = self.store_snapshots.get(operator_id) else {
            return Ok(None);
        };
        let bytes = BASE64_ENGINE
            .decode(encoded)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        StateSnapshot::from_bytes(&bytes)
            .map(Some)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))
    }

    /// Serializes to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Serialization`] on failure.
    pub fn to_json(&self) -> Result<String, CheckpointError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses JSON written by [`to_json`](Self::to_json).
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::Serialization`] on malformed input.
    pub fn from_json(json: &str) -> Result<Self, CheckpointError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PipelineSnapshot {
        let barrier = CheckpointBarrier {
            checkpoint_id: 3,
            epoch: 3,
            timestamp: 1_700_000_000_000,
        };
        let mut states = HashMap::new();
        states.insert(
            "join".to_string(),
            OperatorState {
                operator_id: "join".into(),
                data: vec![0, 159, 255],
            },
        );
        let mut stores = HashMap::new();
        stores.insert(
            "join".to_string(),
            StateSnapshot::new(vec![(b"jl\x00".to_vec(), b"row".to_vec())]),
        );
        let mut offsets = HashMap::new();
        offsets.insert("orders".to_string(), 12);
        PipelineSnapshot::from_parts(&barrier, states, &stores, offsets).unwrap()
    }

    #[test]
    fn test_payloads_survive_json() {
        let snapshot = sample();
        let json = snapshot.to_json().unwrap();
        assert!(json.contains("\"orders\": 12"));

        let parsed = PipelineSnapshot::from_json(&json).unwrap();
        assert_eq!(parsed, snapshot);
        assert_eq!(
            parsed.operator_state("join").unwrap().unwrap().data,
            vec![0, 159, 255]
        );
        let store = parsed.store_snapshot("join").unwrap().unwrap();
        assert_eq!(store.data()[0].1, b"row".to_vec());
        assert!(parsed.operator_state("missing").unwrap().is_none());
    }

    #[test]
    fn test_corrupt_payload_is_an_error() {
        let mut snapshot = sample();
        snapshot
            .operator_states
            .get_mut("join")
            .unwrap()
            .state_b64 = "not base64!".into();
        assert!(snapshot.operator_state("join").is_err());

        snapshot.store_snapshots.insert("join".into(), "AAAA".into());
        assert!(snapshot.store_snapshot("join").is_err());
    }
}
