pub mod case;
pub mod loadshape;
pub mod results;

pub use case::CaseFile;
pub use loadshape::LoadShape;
pub use results::{BusVoltage, bus_voltages, format_bus_table, write_voltages_csv};
