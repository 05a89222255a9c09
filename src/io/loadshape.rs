use std::{fs::File, io::Read, path::Path};

use csv::ReaderBuilder;

use crate::basic::{
    error::{PowerFlowError, Result},
    network::Network,
};

/// Columns carrying a label rather than a multiplier.
const LABEL_COLUMNS: [&str; 3] = ["time", "timestamp", "hour"];

/// Per-load multipliers, one row per time step.
///
/// The header names the loads; a leading `time`/`timestamp`/`hour` column is
/// kept as the row label.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadShape {
    pub loads: Vec<String>,
    pub labels: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl LoadShape {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = rdr.headers()?.clone();
        let label_col = headers
            .iter()
            .position(|h| LABEL_COLUMNS.contains(&h.to_ascii_lowercase().as_str()));
        let value_cols: Vec<usize> = (0..headers.len()).filter(|&c| Some(c) != label_col).collect();
        let loads = value_cols.iter().map(|&c| headers[c].to_string()).collect();

        let mut labels = Vec::new();
        let mut rows = Vec::new();
        for (line, record) in rdr.records().enumerate() {
            let record = record?;
            let label = match label_col {
                Some(c) => record.get(c).unwrap_or_default().to_string(),
                None => line.to_string(),
            };
            let row = value_cols
                .iter()
                .map(|&c| {
                    let field = record.get(c).unwrap_or_default();
                    field.parse::<f64>().map_err(|_| {
                        PowerFlowError::Parse(format!(
                            "load shape row {line}, column `{}`: `{field}` is not a number",
                            &headers[c]
                        ))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            labels.push(label);
            rows.push(row);
        }
        Ok(Self { loads, labels, rows })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_reader(File::open(path)?)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Checks every column against the network's loads.
    pub fn validate(&self, net: &Network) -> Result<()> {
        for name in &self.loads {
            if !net.loads.iter().any(|l| &l.name == name) {
                return Err(PowerFlowError::Parse(format!("load shape column `{name}` names no load")));
            }
        }
        Ok(())
    }

    /// Sets the scaling of every listed load from row `row`.
    pub fn apply(&self, row: usize, net: &mut Network) -> Result<()> {
        let values = self
            .rows
            .get(row)
            .ok_or_else(|| PowerFlowError::Parse(format!("load shape has no row {row}")))?;
        for (name, &value) in self.loads.iter().zip(values) {
            let load = net
                .load_mut(name)
                .ok_or_else(|| PowerFlowError::Parse(format!("load shape column `{name}` names no load")))?;
            load.scaling = value;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::basic::network::{Connection, Phase, ZipComponents};
    use num_complex::Complex64;

    #[test]
    fn test_read_with_label_column() {
        let text = "time, house1, house2\n00:00, 0.5, 1.0\n01:00, 0.75, 1.25\n";
        let shape = LoadShape::from_reader(text.as_bytes()).unwrap();
        assert_eq!(shape.loads, vec!["house1", "house2"]);
        assert_eq!(shape.labels, vec!["00:00", "01:00"]);
        assert_eq!(shape.rows[1], vec![0.75, 1.25]);
    }

    #[test]
    fn test_read_without_label_column() {
        let shape = LoadShape::from_reader("a\n1.0\n2.0\n".as_bytes()).unwrap();
        assert_eq!(shape.labels, vec!["0", "1"]);
        assert_eq!(shape.len(), 2);
    }

    #[test]
    fn test_bad_number() {
        let err = LoadShape::from_reader("a\nnope\n".as_bytes()).unwrap_err();
        assert!(matches!(err, PowerFlowError::Parse(_)));
    }

    #[test]
    fn test_apply() {
        let mut net = Network::new(1e6);
        net.add_node("n", &[Phase::A], 1000.0).unwrap();
        net.add_load(
            "house1",
            "n",
            &[Phase::A],
            Connection::Wye,
            vec![ZipComponents::power(Complex64::new(1e3, 0.0))],
        )
        .unwrap();
        let shape = LoadShape::from_reader("house1\n0.5\n".as_bytes()).unwrap();
        shape.validate(&net).unwrap();
        shape.apply(0, &mut net).unwrap();
        assert_eq!(net.loads[0].scaling, 0.5);
        assert!(shape.apply(1, &mut net).is_err());

        let other = LoadShape::from_reader("house9\n0.5\n".as_bytes()).unwrap();
        assert!(other.validate(&net).is_err());
    }
}
