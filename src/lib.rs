mod basic;
pub mod io;
pub mod testcases;
pub mod timeseries;

pub mod prelude {
    use crate::basic;
    pub use basic::*;

    pub use crate::io::{BusVoltage, CaseFile, LoadShape, bus_voltages, format_bus_table, write_voltages_csv};
    pub use crate::timeseries::{TimeStep, run_timeseries};
}
