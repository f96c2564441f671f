use std::{collections::HashMap, sync::Arc};

use crate::config::{ConfigError, ControlDataType, ControlKind, ModelConfig};

/// `InputOverride` - a small tensor substituted into a request to carry a
/// sequence control signal to the model. Control tensors always have shape
/// `[1]` since the sequence batcher only admits batch-size 1 requests.
#[derive(Clone, Debug, PartialEq)]
pub struct InputOverride {
    /// Little-endian bytes of the control value
    content: Vec<u8>,
    /// Tensor shape
    dims: Vec<i64>,
    /// Tensor datatype
    datatype: ControlDataType,
}

impl InputOverride {
    /// Constructor
    pub fn new(datatype: ControlDataType, dims: Vec<i64>, content: Vec<u8>) -> Self {
        Self {
            content,
            dims,
            datatype,
        }
    }

    /// Getter for `content`
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Getter for `dims`
    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    /// Getter for `datatype`
    pub fn datatype(&self) -> ControlDataType {
        self.datatype
    }
}

/// Overrides to apply to a request, keyed by tensor name.
pub type OverrideMap = HashMap<String, Arc<InputOverride>>;

/// `ControlOverrides` - the three pre-built override sets shared by every
/// batcher. Immutable once constructed.
///
/// | Set | SEQUENCE_START | SEQUENCE_READY |
/// |---|---|---|
/// | start | true | true |
/// | cont | false | true |
/// | not_ready | false | false |
#[derive(Clone, Debug)]
pub struct ControlOverrides {
    start: Arc<OverrideMap>,
    cont: Arc<OverrideMap>,
    not_ready: Arc<OverrideMap>,
}

impl ControlOverrides {
    /// Builds the three override sets from the model's sequence-batching
    /// configuration. Both the start and ready controls are required.
    pub fn from_config(config: &ModelConfig) -> Result<Self, ConfigError> {
        let sequence_batching =
            config
                .sequence_batching
                .as_ref()
                .ok_or_else(|| ConfigError::MissingSequenceBatching {
                    model: config.name.clone(),
                })?;

        let mut start = OverrideMap::new();
        let mut cont = OverrideMap::new();
        let mut not_ready = OverrideMap::new();

        let props = sequence_batching.control_properties(&config.name, ControlKind::SequenceStart)?;
        let false_override = Arc::new(InputOverride::new(
            props.datatype,
            vec![1],
            props.false_bytes,
        ));
        let true_override = Arc::new(InputOverride::new(props.datatype, vec![1], props.true_bytes));
        start.insert(props.tensor_name.clone(), true_override);
        cont.insert(props.tensor_name.clone(), Arc::clone(&false_override));
        not_ready.insert(props.tensor_name, false_override);

        let props = sequence_batching.control_properties(&config.name, ControlKind::SequenceReady)?;
        let false_override = Arc::new(InputOverride::new(
            props.datatype,
            vec![1],
            props.false_bytes,
        ));
        let true_override = Arc::new(InputOverride::new(props.datatype, vec![1], props.true_bytes));
        start.insert(props.tensor_name.clone(), Arc::clone(&true_override));
        cont.insert(props.tensor_name.clone(), true_override);
        not_ready.insert(props.tensor_name, false_override);

        Ok(Self {
            start: Arc::new(start),
            cont: Arc::new(cont),
            not_ready: Arc::new(not_ready),
        })
    }

    /// Override set for the first request of a sequence
    pub fn start(&self) -> Arc<OverrideMap> {
        Arc::clone(&self.start)
    }

    /// Override set for every subsequent request of a sequence
    pub fn cont(&self) -> Arc<OverrideMap> {
        Arc::clone(&self.cont)
    }

    /// Override set for a padding slot with no request available
    pub fn not_ready(&self) -> Arc<OverrideMap> {
        Arc::clone(&self.not_ready)
    }
}
