use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Datatypes supported for sequence control tensors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ControlDataType {
    Int32,
    Float32,
}

impl fmt::Display for ControlDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int32 => write!(f, "int32"),
            Self::Float32 => write!(f, "fp32"),
        }
    }
}

/// The control signals a sequence-batched model can receive.
///
/// `SequenceStart:` set on the tensor that flags the first request of a sequence.
/// `SequenceReady:` set on the tensor that flags a slot holding a real request,
/// as opposed to a padding slot in a partially filled batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ControlKind {
    SequenceStart,
    SequenceReady,
}

impl fmt::Display for ControlKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SequenceStart => write!(f, "SEQUENCE_START"),
            Self::SequenceReady => write!(f, "SEQUENCE_READY"),
        }
    }
}

/// One control input declared by the model configuration.
///
/// Exactly one of `int32_false_true` / `fp32_false_true` must hold the
/// two-element `[false, true]` value list, consistent with `datatype`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ControlInput {
    /// Name of the input tensor carrying the control signal
    pub name: String,
    /// Which control this tensor carries
    pub kind: ControlKind,
    /// Declared datatype of the control tensor
    pub datatype: ControlDataType,
    /// `[false, true]` values for an int32 control
    #[serde(default)]
    pub int32_false_true: Vec<i32>,
    /// `[false, true]` values for an fp32 control
    #[serde(default)]
    pub fp32_false_true: Vec<f32>,
}

/// `SequenceBatchingConfig` - the sequence-batching section of a model
/// configuration. Declares the control tensors the scheduler substitutes
/// into each request.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct SequenceBatchingConfig {
    /// Declared control inputs
    #[serde(default)]
    pub control_inputs: Vec<ControlInput>,
}

/// Resolved properties of one sequence control: the tensor to override and
/// the byte encodings substituted for its false/true states.
#[derive(Clone, Debug, PartialEq)]
pub struct ControlProperties {
    /// Name of the control tensor
    pub tensor_name: String,
    /// Datatype of the control tensor
    pub datatype: ControlDataType,
    /// Little-endian encoding of the "false" value
    pub false_bytes: Vec<u8>,
    /// Little-endian encoding of the "true" value
    pub true_bytes: Vec<u8>,
}

impl SequenceBatchingConfig {
    /// Resolves the tensor name, datatype and false/true byte encodings for
    /// `kind`. All control tensors are required, so an absent or malformed
    /// declaration is a configuration error.
    pub fn control_properties(
        &self,
        model_name: &str,
        kind: ControlKind,
    ) -> Result<ControlProperties, ConfigError> {
        let mut found: Option<&ControlInput> = None;
        for control in self.control_inputs.iter().filter(|c| c.kind == kind) {
            if found.is_some() {
                return Err(ConfigError::DuplicateControl {
                    model: model_name.to_string(),
                    kind,
                });
            }
            found = Some(control);
        }

        let control = found.ok_or_else(|| ConfigError::MissingControl {
            model: model_name.to_string(),
            kind,
        })?;

        if !control.int32_false_true.is_empty() && !control.fp32_false_true.is_empty() {
            return Err(ConfigError::AmbiguousControlValues {
                model: model_name.to_string(),
                name: control.name.clone(),
            });
        }

        let (false_bytes, true_bytes) = match control.datatype {
            ControlDataType::Int32 => {
                if !control.fp32_false_true.is_empty() {
                    return Err(ConfigError::ControlValueTypeMismatch {
                        model: model_name.to_string(),
                        name: control.name.clone(),
                        datatype: control.datatype,
                    });
                }
                if control.int32_false_true.len() != 2 {
                    return Err(ConfigError::InvalidControlValues {
                        model: model_name.to_string(),
                        name: control.name.clone(),
                        datatype: control.datatype,
                        count: control.int32_false_true.len(),
                    });
                }
                (
                    control.int32_false_true[0].to_le_bytes().to_vec(),
                    control.int32_false_true[1].to_le_bytes().to_vec(),
                )
            }
            ControlDataType::Float32 => {
                if !control.int32_false_true.is_empty() {
                    return Err(ConfigError::ControlValueTypeMismatch {
                        model: model_name.to_string(),
                        name: control.name.clone(),
                        datatype: control.datatype,
                    });
                }
                if control.fp32_false_true.len() != 2 {
                    return Err(ConfigError::InvalidControlValues {
                        model: model_name.to_string(),
                        name: control.name.clone(),
                        datatype: control.datatype,
                        count: control.fp32_false_true.len(),
                    });
                }
                (
                    control.fp32_false_true[0].to_le_bytes().to_vec(),
                    control.fp32_false_true[1].to_le_bytes().to_vec(),
                )
            }
        };

        Ok(ControlProperties {
            tensor_name: control.name.clone(),
            datatype: control.datatype,
            false_bytes,
            true_bytes,
        })
    }
}

/// Scheduling priority of a model, mapped onto the nice level of its
/// batcher threads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
pub enum ModelPriority {
    #[default]
    Default,
    Max,
    Min,
}

impl ModelPriority {
    /// Nice level applied to each batcher thread at startup.
    ///
    /// # Examples
    ///
    /// ```
    /// use sequence_batcher::config::ModelPriority;
    ///
    /// assert_eq!(ModelPriority::Max.nice_level(), 0);
    /// assert_eq!(ModelPriority::Default.nice_level(), 5);
    /// ```
    pub fn nice_level(&self) -> i32 {
        match self {
            Self::Max => 0,
            Self::Default => 5,
            Self::Min => 19,
        }
    }
}

/// `ModelConfig` - the slice of a model's configuration the sequence
/// batcher consumes.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ModelConfig {
    /// Name of the model being served
    pub name: String,
    /// Largest batch the model supports. Zero means the model does not
    /// support batching and is treated as a batch of one.
    #[serde(default)]
    pub max_batch_size: usize,
    /// Scheduling priority of the model
    #[serde(default)]
    pub priority: ModelPriority,
    /// Sequence batching section, required by this scheduler
    pub sequence_batching: Option<SequenceBatchingConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("model '{model}' does not specify sequence batching")]
    MissingSequenceBatching { model: String },
    #[error("sequence batching control '{kind}' is specified multiple times for model '{model}'")]
    DuplicateControl { model: String, kind: ControlKind },
    #[error("sequence batching must specify control '{kind}' for model '{model}'")]
    MissingControl { model: String, kind: ControlKind },
    #[error(
        "sequence batching control '{name}' for model '{model}' specifies both int32 and fp32 false/true values"
    )]
    AmbiguousControlValues { model: String, name: String },
    #[error(
        "sequence batching control '{name}' for model '{model}' must specify exactly 2 {datatype} values, got {count}"
    )]
    InvalidControlValues {
        model: String,
        name: String,
        datatype: ControlDataType,
        count: usize,
    },
    #[error(
        "sequence batching control '{name}' for model '{model}' provides false/true values inconsistent with declared datatype {datatype}"
    )]
    ControlValueTypeMismatch {
        model: String,
        name: String,
        datatype: ControlDataType,
    },
}
