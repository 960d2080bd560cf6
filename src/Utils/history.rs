//! per-iteration trace of the trust region solver, exportable to csv
use csv::Writer;
use std::fs::File;
use std::io;
use std::path::Path;

/// one row of the trace
#[derive(Debug, Clone, PartialEq)]
pub struct IterationRecord {
    pub iter: usize,
    /// ||f|| after the iteration
    pub fnorm: f64,
    /// trust radius after the iteration
    pub delta: f64,
    /// LM damping after the iteration
    pub mu: f64,
    /// ||dx|| of the accepted step
    pub dxnorm: f64,
    pub avratio: f64,
}

#[derive(Debug, Clone, Default)]
pub struct IterationHistory {
    pub records: Vec<IterationRecord>,
}

impl IterationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: IterationRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn headers() -> [&'static str; 6] {
        ["iter", "fnorm", "delta", "mu", "dxnorm", "avratio"]
    }

    pub fn save_to_csv<P: AsRef<Path>>(&self, filename: P) -> io::Result<()> {
        let file = File::create(filename)?;
        let mut writer = Writer::from_writer(file);
        writer.write_record(Self::headers())?;
        for r in &self.records {
            writer.write_record([
                r.iter.to_string(),
                r.fnorm.to_string(),
                r.delta.to_string(),
                r.mu.to_string(),
                r.dxnorm.to_string(),
                r.avratio.to_string(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_history_csv() {
        let mut history = IterationHistory::new();
        history.push(IterationRecord {
            iter: 1,
            fnorm: 0.5,
            delta: 2.0,
            mu: 1e-3,
            dxnorm: 0.25,
            avratio: 0.0,
        });
        history.push(IterationRecord {
            iter: 2,
            fnorm: 0.125,
            delta: 4.0,
            mu: 3e-4,
            dxnorm: 0.1,
            avratio: 0.0,
        });
        let dir = tempdir().unwrap();
        let path = dir.path().join("history.csv");
        history.save_to_csv(&path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "iter,fnorm,delta,mu,dxnorm,avratio");
        assert_eq!(lines[2], "2,0.125,4,0.0003,0.1,0");
    }
}
