use crate::tensor::Shape;

/// All configuration failures the engine can report.
///
/// Every variant is produced while a network is being assembled (layer
/// setup, dependency resolution) or while configuration files are loaded.
/// Forward, backward and update passes have no error path.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A layer was given the wrong number of input tensors.
    #[error("layer {layer}: expected {expected} input(s), got {got}")]
    InputArity {
        layer: String,
        expected: usize,
        got: usize,
    },

    /// A layer declared the wrong number of output tensors.
    #[error("layer {layer}: expected {expected} output(s), got {got}")]
    OutputArity {
        layer: String,
        expected: usize,
        got: usize,
    },

    /// Two co-dependent inputs (or a borrowed parameter) disagree on shape.
    #[error("layer {layer}: shape mismatch, expected {expected}, got {got}")]
    ShapeMismatch {
        layer: String,
        expected: Shape,
        got: Shape,
    },

    /// Hyperparameters that cannot produce a valid layer.
    #[error("layer {layer}: {reason}")]
    InvalidConfig { layer: String, reason: String },

    /// Dependency resolution stalled: these layers have inputs nobody produces.
    #[error("invalid network definition, unreachable layers: {}", .0.join(", "))]
    UnreachableLayers(Vec<String>),

    /// Two descriptors share a layer name.
    #[error("duplicate layer name: {0}")]
    DuplicateLayer(String),

    /// Two layers declare the same output tensor name.
    #[error("tensor {tensor} produced by more than one layer (second: {layer})")]
    DuplicateTensor { tensor: String, layer: String },

    /// `setup` was called on a layer that is already `Ready`.
    #[error("layer {0} is already configured")]
    AlreadyConfigured(String),

    /// `setup` was called on a layer whose earlier setup failed.
    #[error("layer {0} failed setup and cannot be reused")]
    LayerFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Shorthand for [`Error::InvalidConfig`].
    pub fn invalid(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidConfig {
            layer: layer.into(),
            reason: reason.into(),
        }
    }
}

/// Convenience Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted [`Error::Msg`].
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
