use std::{
    collections::HashMap,
    sync::{Arc, PoisonError, RwLock},
};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::control::OverrideMap;

/// Identifies the sequence a request belongs to. Zero is reserved for
/// requests that carry no correlation ID and is rejected by the scheduler.
pub type CorrelationId = u64;

bitflags! {
    /// Flags carried by an inference request header.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RequestFlags: u32 {
        /// First request of a sequence
        const SEQUENCE_START = 1 << 0;
        /// Last request of a sequence
        const SEQUENCE_END = 1 << 1;
    }
}

/// `InputMeta` - shape metadata for one request input tensor.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct InputMeta {
    /// Name of the input tensor
    pub name: String,
    /// Tensor shape
    pub dims: Vec<i64>,
    /// Total byte size of the tensor content
    pub byte_size: usize,
}

/// `RequestHeader` - the request metadata the scheduler routes on.
///
/// All requests of one batcher must share input shapes since they execute
/// together in a batch. The first header into a batcher is cached to build
/// stand-in requests for empty slots.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RequestHeader {
    /// Per-request batch size. Must be 1 for sequence batching.
    pub batch_size: u32,
    /// Sequence this request belongs to
    pub correlation_id: CorrelationId,
    /// Sequence start/end flags
    pub flags: RequestFlags,
    /// Input tensor metadata
    pub inputs: Vec<InputMeta>,
}

/// `RequestProvider` - interface through which the scheduler reads a
/// request's header and attaches control overrides before execution.
pub trait RequestProvider: Send + Sync {
    /// Name of the model the request targets
    fn model_name(&self) -> &str;

    /// The request header
    fn request_header(&self) -> &RequestHeader;

    /// Attaches an override set, replacing any previously attached set.
    fn set_input_override(&self, overrides: Arc<OverrideMap>);

    /// The currently attached override set
    fn input_override(&self) -> Option<Arc<OverrideMap>>;
}

/// `ResponseProvider` - sink for the outputs a runner produces for one
/// request. The scheduler carries it with the payload untouched.
pub trait ResponseProvider: Send + Sync {}

/// `NullRequestProvider` - stand-in provider for a batch slot with no
/// request available. Emits zeroed input tensors shaped per a cached
/// header so the batch keeps a constant shape.
pub struct NullRequestProvider {
    model_name: String,
    header: RequestHeader,
    /// Zeroed content per input tensor
    null_inputs: HashMap<String, Vec<u8>>,
    overrides: RwLock<Option<Arc<OverrideMap>>>,
}

impl NullRequestProvider {
    /// Builds a stand-in provider from the header cached off the first
    /// request into a batcher.
    pub fn new(header: RequestHeader, model_name: String) -> Self {
        let null_inputs = header
            .inputs
            .iter()
            .map(|input| (input.name.clone(), vec![0u8; input.byte_size]))
            .collect();
        Self {
            model_name,
            header,
            null_inputs,
            overrides: RwLock::new(None),
        }
    }

    /// Zeroed content for the named input, sized per the cached header.
    pub fn input_content(&self, name: &str) -> Option<&[u8]> {
        self.null_inputs.get(name).map(Vec::as_slice)
    }
}

impl RequestProvider for NullRequestProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn request_header(&self) -> &RequestHeader {
        &self.header
    }

    fn set_input_override(&self, overrides: Arc<OverrideMap>) {
        let mut guard = self
            .overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *guard = Some(overrides);
    }

    fn input_override(&self) -> Option<Arc<OverrideMap>> {
        let guard = self
            .overrides
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        guard.clone()
    }
}
