use serde::Deserialize;

/// Optional settings loaded from a YAML file; any field can be omitted.
#[derive(Debug, Deserialize)]
pub struct AppConfig {
  /// Whether to write graphviz/GraphML artifacts next to the metadata
  pub artifacts: Option<bool>,
  /// Seed for the demo input generator
  pub seed: Option<u64>,
}

impl AppConfig {
  // merge configs where the second overwrites the first
  pub fn merge(self, other: Self) -> Self {
    Self {
      artifacts: other.artifacts.or(self.artifacts),
      seed: other.seed.or(self.seed),
    }
  }
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      artifacts: None,
      seed: None,
    }
  }
}
