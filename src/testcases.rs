//! Bundled cases.

use crate::{basic::error::Result, io::case::CaseFile};

pub const IEEE_FOUR_BUS: &str = include_str!("../cases/ieee_four_bus.json");

/// IEEE 4 node feeder: 12.47 kV source, GrY-GrY 6 MVA step-down to 4.16 kV,
/// unbalanced wye constant-PQ load at node 4.
pub fn ieee_four_bus() -> Result<CaseFile> {
    CaseFile::from_json(IEEE_FOUR_BUS)
}
