pub mod error;
pub mod homotopy;
pub mod network;
pub mod newton;
pub mod solver;
pub(crate) mod sparse;
pub mod stamp;
pub mod symbolic;

pub use error::{PowerFlowError, Result};
pub use homotopy::{PowerFlowConfig, PowerFlowResult, run_pf, run_pf_default};
pub use network::Network;
pub use newton::NrStatus;
