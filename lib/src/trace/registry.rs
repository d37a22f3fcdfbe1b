use std::collections::HashMap;

use crate::Error;

use super::TraceContext;

/// Translates the active call record into graph nodes and binds the output.
pub type Convert = fn(&mut TraceContext) -> Result<(), Error>;

/// A registered translator. Real translators take the gate when they fire;
/// helper translators (identity-style bookkeeping such as detach) record
/// without locking, so a real operation nested under them still translates.
#[derive(Debug, Clone, Copy)]
pub struct Registration {
  pub convert: Convert,
  pub is_real: bool,
}

#[derive(Debug, Default)]
pub struct Registry {
  entries: HashMap<&'static str, Registration>,
}

impl Registry {
  pub fn new() -> Registry {
    Registry::default()
  }

  pub fn register(&mut self, key: &'static str, convert: Convert) {
    self.entries.insert(
      key,
      Registration {
        convert,
        is_real: true,
      },
    );
  }

  pub fn register_helper(&mut self, key: &'static str, convert: Convert) {
    self.entries.insert(
      key,
      Registration {
        convert,
        is_real: false,
      },
    );
  }

  pub fn get(&self, key: &str) -> Option<&Registration> {
    self.entries.get(key)
  }

  pub fn keys(&self) -> impl Iterator<Item = &'static str> + '_ {
    self.entries.keys().copied()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
