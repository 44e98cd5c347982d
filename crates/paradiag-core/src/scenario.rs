//! Scenario files: named candidate and background constraints plus the
//! conflict sets that drive the reference [`ConflictOracle`].
//!
//! ```yaml
//! constraints: [a, b, c, d]   # candidates, in preference order
//! background: [root]
//! conflicts:
//!   - [a, b]
//!   - [c, d]
//! latency_ms: 2
//! expected_diagnosis: [a, c]
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use tracing::warn;
use serde::{Deserialize, Serialize};

use crate::constraint::{Catalog, ConstraintSet};
use crate::errors::DiagnosisError;
use crate::oracle::ConflictOracle;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    pub constraints: Vec<String>,
    #[serde(default)]
    pub background: Vec<String>,
    #[serde(default)]
    pub conflicts: Vec<Vec<String>>,
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub expected_diagnosis: Option<Vec<String>>,
}

/// A scenario with every name interned and the oracle built
#[derive(Debug)]
pub struct CompiledScenario {
    pub catalog: Catalog,
    pub candidates: ConstraintSet,
    pub background: ConstraintSet,
    pub oracle: ConflictOracle,
    pub expected: Option<ConstraintSet>,
}

impl Scenario {
    /// Reads JSON when the extension is `.json`, YAML otherwise.
    pub fn from_path(path: &Path) -> Result<Self, DiagnosisError> {
        let raw = fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_yaml_str(&raw),
        }
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, DiagnosisError> {
        serde_yaml::from_str(raw).map_err(|e| DiagnosisError::Scenario(e.to_string()))
    }

    pub fn from_json_str(raw: &str) -> Result<Self, DiagnosisError> {
        serde_json::from_str(raw).map_err(|e| DiagnosisError::Scenario(e.to_string()))
    }

    pub fn compile(&self) -> Result<CompiledScenario, DiagnosisError> {
        if self.constraints.is_empty() {
            return Err(DiagnosisError::Scenario("no candidate constraints".to_string()));
        }
        let mut catalog = Catalog::new();
        let candidates = catalog.set(self.constraints.iter().map(String::as_str));
        let background = catalog.set(self.background.iter().map(String::as_str));
        if candidates.len() != self.constraints.len() {
            warn!("Scenario lists duplicate candidate constraints; duplicates ignored");
        }

        let mut conflicts = Vec::with_capacity(self.conflicts.len());
        for conflict in &self.conflicts {
            if conflict.is_empty() {
                return Err(DiagnosisError::Scenario("empty conflict set".to_string()));
            }
            for name in conflict {
                if catalog.id(name).is_none() {
                    warn!("Conflict mentions undeclared constraint {}", name);
                }
            }
            conflicts.push(catalog.set(conflict.iter().map(String::as_str)));
        }

        let expected = match &self.expected_diagnosis {
            Some(names) => Some(catalog.lookup_set(names.iter().map(String::as_str))?),
            None => None,
        };

        let oracle = ConflictOracle::new(conflicts).with_latency(Duration::from_millis(self.latency_ms));
        Ok(CompiledScenario {
            catalog,
            candidates,
            background,
            oracle,
            expected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
constraints: [a, b, c, d]
background: [root]
conflicts:
  - [a, b]
  - [c, d]
expected_diagnosis: [a, c]
"#;

    #[test]
    fn test_compile_yaml_scenario() {
        let scenario = Scenario::from_yaml_str(SAMPLE).unwrap();
        let compiled = scenario.compile().unwrap();

        assert_eq!(compiled.candidates.len(), 4);
        assert_eq!(compiled.background.len(), 1);
        assert_eq!(compiled.oracle.conflicts().len(), 2);
        assert_eq!(compiled.catalog.render(compiled.expected.as_ref().unwrap()), "{a, c}");
        assert!(!compiled.oracle.evaluate(&compiled.candidates.union(&compiled.background)));
    }

    #[test]
    fn test_json_scenario_and_rejections() {
        let scenario = Scenario::from_json_str(r#"{"constraints": ["x"], "conflicts": [["x"]]}"#).unwrap();
        assert_eq!(scenario.compile().unwrap().candidates.len(), 1);

        let empty = Scenario::default();
        assert!(empty.compile().is_err());

        let bad = Scenario::from_json_str(r#"{"constraints": ["x"], "conflicts": [[]]}"#).unwrap();
        assert!(bad.compile().is_err());
    }
}
