use candle::{DType, Shape};

/// Main library error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    // === Configuration Errors ===
    #[error("unrecognized precision {0:?}, expected one of fp16, bf16, fp32")]
    UnsupportedPrecision(String),

    #[error("unrecognized device {0:?}, expected cpu, cuda[:N] or metal[:N]")]
    UnsupportedDevice(String),

    #[error("invalid strategy {0:?}, expected \"<device> <precision>[i8]\"")]
    InvalidStrategy(String),

    #[error("cannot find required weight {name}")]
    MissingWeight { name: String },

    #[error("{num_heads} heads of size {head_size} do not match embedding width {n_embd}")]
    HeadSizeMismatch {
        num_heads: usize,
        head_size: usize,
        n_embd: usize,
    },

    // === Shape Contract Errors ===
    #[error("shape mismatch in {op}, expected: {expected:?}, got: {got:?}")]
    ShapeMismatch {
        op: &'static str,
        expected: Shape,
        got: Shape,
    },

    #[error("placeholder count mismatch, tokens: {placeholders}, embeddings: {embeddings}")]
    PlaceholderCountMismatch {
        placeholders: usize,
        embeddings: usize,
    },

    #[error("{op}: unsupported operand rank {rank}")]
    UnsupportedRank { op: &'static str, rank: usize },

    #[error("{op}: u8 weights require mx, rx, my and ry")]
    MissingQuantParams { op: &'static str },

    #[error("{op}: empty token sequence")]
    EmptyInput { op: &'static str },

    #[error("layer {layer_id} needs the first layer value but none was provided")]
    MissingVFirst { layer_id: usize },

    // === DType Errors ===
    #[error("unsupported dtype {dtype:?} for op {op}")]
    UnsupportedDType { dtype: DType, op: &'static str },

    #[error("dtype mismatch in {op}, lhs: {lhs:?}, rhs: {rhs:?}")]
    DTypeMismatch {
        lhs: DType,
        rhs: DType,
        op: &'static str,
    },

    #[error(transparent)]
    Candle(#[from] candle::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn shape_mismatch<E: Into<Shape>, G: Into<Shape>>(
        op: &'static str,
        expected: E,
        got: G,
    ) -> Self {
        Self::ShapeMismatch {
            op,
            expected: expected.into(),
            got: got.into(),
        }
    }
}
