//! Persisted step-size tables
//!
//! A calibrated table lives at `<dir>/<name>_<method>_<lower>_<upper>.json`
//! as a JSON object from respaced timestep to step size. The search
//! diagnostics of the run that produced it sit next to it with a
//! `.diagnostics.json` suffix.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use burn_guided_mcmc::{AcceptanceBounds, CalibrationOutcome, McmcMethod, StepSizeTable};

use crate::{Error, Result};

/// Identifies one calibrated table
#[derive(Debug, Clone, PartialEq)]
pub struct StepSizeKey {
    /// Dataset or model name
    pub name: String,
    pub method: McmcMethod,
    pub bounds: AcceptanceBounds,
}

impl StepSizeKey {
    pub fn new(name: impl Into<String>, method: McmcMethod, bounds: AcceptanceBounds) -> Self {
        Self {
            name: name.into(),
            method,
            bounds,
        }
    }
}

impl fmt::Display for StepSizeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.name, self.method, self.bounds.label())
    }
}

/// Directory of step-size tables
#[derive(Debug, Clone)]
pub struct StepSizeStore {
    dir: PathBuf,
}

impl StepSizeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, key: &StepSizeKey) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    fn diagnostics_path(&self, key: &StepSizeKey) -> PathBuf {
        self.dir.join(format!("{key}.diagnostics.json"))
    }

    /// Final step size per timestep
    pub fn load(&self, key: &StepSizeKey) -> Result<StepSizeTable> {
        let path = self.path(key);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::StepSizesNotFound {
                    key: key.to_string(),
                    path,
                });
            }
            Err(err) => return Err(err.into()),
        };
        let table: StepSizeTable = serde_json::from_str(&text)?;
        tracing::info!(key = %key, entries = table.len(), "loaded step sizes");
        Ok(table)
    }

    /// Write the table of a finished calibration run
    pub fn save(&self, key: &StepSizeKey, outcome: &CalibrationOutcome) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(key);
        write_atomic(&self.dir, &path, &serde_json::to_string_pretty(&outcome.table)?)?;
        write_atomic(
            &self.dir,
            &self.diagnostics_path(key),
            &serde_json::to_string_pretty(&outcome.batches)?,
        )?;
        tracing::info!(path = %path.display(), entries = outcome.table.len(), "saved step sizes");
        Ok(path)
    }
}

/// Write through a temporary file in `dir`, removed again if anything fails
fn write_atomic(dir: &Path, path: &Path, contents: &str) -> Result<()> {
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(contents.as_bytes())?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_guided_mcmc::StepSize;

    fn key() -> StepSizeKey {
        StepSizeKey::new("mixture", McmcMethod::Hmc, AcceptanceBounds::default())
    }

    #[test]
    fn test_key_names_file() {
        let store = StepSizeStore::new("/tmp/steps");
        assert_eq!(key().to_string(), "mixture_hmc_0.6_0.8");
        assert_eq!(store.path(&key()), PathBuf::from("/tmp/steps/mixture_hmc_0.6_0.8.json"));
    }

    #[test]
    fn test_missing_table_names_key_and_path() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StepSizeStore::new(tmp.path());
        match store.load(&key()) {
            Err(Error::StepSizesNotFound { key, path }) => {
                assert_eq!(key, "mixture_hmc_0.6_0.8");
                assert_eq!(path, tmp.path().join("mixture_hmc_0.6_0.8.json"));
            }
            other => panic!("expected StepSizesNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_saved_table_loads_back() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StepSizeStore::new(tmp.path().join("nested"));
        let table: StepSizeTable = [
            (3, StepSize::Scalar(0.01)),
            (2, StepSize::Scalar(0.005)),
            (1, StepSize::Elementwise(vec![0.5, 0.25])),
        ]
        .into_iter()
        .collect();
        let outcome = CalibrationOutcome {
            table: table.clone(),
            records: Vec::new(),
            batches: Vec::new(),
        };

        let path = store.save(&key(), &outcome).unwrap();
        assert!(path.exists());
        assert!(tmp.path().join("nested/mixture_hmc_0.6_0.8.diagnostics.json").exists());
        assert_eq!(store.load(&key()).unwrap(), table);

        // saving again replaces both files and leaves no temporaries behind
        store.save(&key(), &outcome).unwrap();
        let mut names: Vec<String> = fs::read_dir(tmp.path().join("nested"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "mixture_hmc_0.6_0.8.diagnostics.json".to_string(),
                "mixture_hmc_0.6_0.8.json".to_string(),
            ]
        );
    }

    #[test]
    fn test_saved_step_sizes_reload_bit_exact() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StepSizeStore::new(tmp.path());
        // values whose shortest decimal form needs the exact float parser
        let table: StepSizeTable = [
            (0, StepSize::Scalar(0.009050966799187815)),
            (1, StepSize::Scalar(0.21574461191587402)),
            (2, StepSize::Scalar(1.0 / 3.0)),
        ]
        .into_iter()
        .collect();
        let outcome = CalibrationOutcome {
            table: table.clone(),
            records: Vec::new(),
            batches: Vec::new(),
        };
        store.save(&key(), &outcome).unwrap();
        let loaded = store.load(&key()).unwrap();
        for (t, step_size) in table.iter() {
            let back = loaded.require(t).unwrap();
            assert_eq!(back.magnitude().to_bits(), step_size.magnitude().to_bits(), "t = {t}");
        }
    }
}
