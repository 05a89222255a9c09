use thiserror::Error;

/// Errors raised while building, stamping or solving a network.
///
/// Convergence failures are not errors: they are reported through
/// [`PowerFlowResult::converged`](crate::basic::homotopy::PowerFlowResult).
#[derive(Debug, Error)]
pub enum PowerFlowError {
    #[error("linear solve produced NaN at index {index}")]
    NanInSolution { index: usize },

    #[error("row {0} of the assembled matrix is entirely zero")]
    ZeroRow(usize),

    #[error("column {0} of the assembled matrix is entirely zero")]
    ZeroColumn(usize),

    #[error("matrix is not square: {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },

    #[error("symbol `{symbol}` is not declared for equation `{equation}`")]
    UndeclaredSymbol { symbol: String, equation: String },

    #[error("no value bound for constant `{0}`")]
    MissingConstant(String),

    #[error("assign_nodes was already called on this network")]
    NodesAlreadyAssigned,

    #[error("network indices are not assigned yet")]
    NodesNotAssigned,

    #[error("stale triplets: cursor {cursor} below high-water mark {high_water}")]
    StaleEntries { cursor: usize, high_water: usize },

    #[error("invalid stamp ({row}, {col}) = {value} for system of size {size}")]
    InvalidStamp {
        row: usize,
        col: usize,
        value: f64,
        size: usize,
    },

    #[error("linear solver failed: {0}")]
    LinearSolve(&'static str),

    #[error("impedance matrix of line `{0}` is not invertible")]
    SingularLineImpedance(String),

    #[error("`{element}` uses unsupported connection `{connection}`")]
    UnsupportedConnection { element: String, connection: String },

    #[error("`{element}` control mode `{mode}` is not implemented")]
    UnimplementedControl { element: String, mode: String },

    #[error("`{element}` references unknown node `{node}`")]
    UnknownNode { element: String, node: String },

    #[error("`{element}`: {reason}")]
    InvalidPhases { element: String, reason: String },

    #[error("discrete controls did not settle after {0} rounds")]
    DeviceOperationDidNotSettle(usize),

    #[error("expression parse error: {0}")]
    Parse(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PowerFlowError>;
