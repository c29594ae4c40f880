//! Register-once keyed maps for definitions, sources, renderers and transformers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::domains::export::source::RowSourceFactory;
use crate::domains::export::transform::TransformerFactory;
use crate::domains::export::writers::Renderer;
use crate::errors::{ExportError, ExportResult};

pub struct Registry<T: Clone> {
    kind: &'static str,
    entries: RwLock<HashMap<String, T>>,
}

pub type RowSourceRegistry = Registry<Arc<dyn RowSourceFactory>>;
pub type RendererRegistry = Registry<Arc<dyn Renderer>>;
pub type TransformerRegistry = Registry<Arc<dyn TransformerFactory>>;

impl<T: Clone> Registry<T> {
    /// `kind` names the entries in error messages ("renderer", "row source", ...).
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> ExportResult<RwLockReadGuard<'_, HashMap<String, T>>> {
        self.entries
            .read()
            .map_err(|_| ExportError::internal(format!("{} registry lock poisoned", self.kind)))
    }

    fn write(&self) -> ExportResult<RwLockWriteGuard<'_, HashMap<String, T>>> {
        self.entries
            .write()
            .map_err(|_| ExportError::internal(format!("{} registry lock poisoned", self.kind)))
    }

    pub fn register(&self, key: impl Into<String>, value: T) -> ExportResult<()> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(ExportError::validation(format!("{} key is required", self.kind)));
        }
        let mut entries = self.write()?;
        if entries.contains_key(&key) {
            return Err(ExportError::validation(format!(
                "{} {} already registered",
                self.kind, key
            )));
        }
        log::debug!(target: "export::registry", "registered {} {}", self.kind, key);
        entries.insert(key, value);
        Ok(())
    }

    pub fn get(&self, key: &str) -> ExportResult<T> {
        self.read()?
            .get(key)
            .cloned()
            .ok_or_else(|| ExportError::not_found(format!("{} {} not found", self.kind, key)))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().map(|e| e.contains_key(key)).unwrap_or(false)
    }

    pub fn keys(&self) -> ExportResult<Vec<String>> {
        let mut keys: Vec<String> = self.read()?.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn register_get_and_duplicate() {
        let registry: Registry<u32> = Registry::new("thing");
        registry.register("a", 1).unwrap();
        assert_eq!(registry.get("a").unwrap(), 1);
        assert!(registry.contains("a"));

        let dup = registry.register("a", 2).unwrap_err();
        assert_eq!(dup.kind(), ErrorKind::Validation);
        assert_eq!(registry.get("a").unwrap(), 1);

        let missing = registry.get("b").unwrap_err();
        assert_eq!(missing.kind(), ErrorKind::NotFound);
        assert_eq!(missing.message(), "thing b not found");
    }

    #[test]
    fn keys_are_sorted() {
        let registry: Registry<u32> = Registry::new("thing");
        registry.register("b", 1).unwrap();
        registry.register("a", 2).unwrap();
        assert_eq!(registry.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert!(registry.register(" ", 3).is_err());
    }
}
