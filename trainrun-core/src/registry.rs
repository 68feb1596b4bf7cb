//! Capability registries.
//!
//! Configuration refers to metrics and models by name. Names resolve
//! through explicit registries populated at startup; there is no dynamic
//! symbol lookup. Registration order does not matter and resolution of an
//! unknown name fails before any component is constructed.

use std::collections::BTreeMap;

use crate::config::ModelConfig;
use crate::error::{Result, RunError};
use crate::metrics::{self, MetricFn};
use crate::model::{LinearModel, Model};

/// Whether a smaller or larger metric value is better. Drives the
/// best-checkpoint marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Minimize,
    Maximize,
}

/// Named metric functions.
pub struct MetricRegistry {
    entries: BTreeMap<String, (MetricFn, Direction)>,
}

impl MetricRegistry {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Registry with the built-in regression metrics.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("mse", metrics::mse, Direction::Minimize);
        registry.register("mae", metrics::mae, Direction::Minimize);
        registry.register("pearson_r", metrics::pearson_r, Direction::Maximize);
        registry
    }

    pub fn register(&mut self, name: &str, f: MetricFn, direction: Direction) {
        self.entries.insert(name.to_string(), (f, direction));
    }

    pub fn resolve(&self, name: &str) -> Result<MetricFn> {
        self.entries
            .get(name)
            .map(|(f, _)| *f)
            .ok_or_else(|| RunError::config(format!("unknown metric '{name}'")))
    }

    pub fn direction(&self, name: &str) -> Result<Direction> {
        self.entries
            .get(name)
            .map(|(_, d)| *d)
            .ok_or_else(|| RunError::config(format!("unknown metric '{name}'")))
    }
}

/// Factory signature for model construction: input shape (sequence length,
/// channels), number of targets, and the model settings.
pub type ModelFactory =
    fn(seq_len: usize, channels: usize, n_targets: usize, config: &ModelConfig) -> Box<dyn Model>;

/// Named model factories.
pub struct ModelRegistry {
    entries: BTreeMap<String, ModelFactory>,
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("linear", |seq_len, channels, n_targets, config| {
            Box::new(LinearModel::new(
                seq_len * channels,
                n_targets,
                config.learning_rate,
            ))
        });
        registry
    }

    pub fn register(&mut self, name: &str, factory: ModelFactory) {
        self.entries.insert(name.to_string(), factory);
    }

    pub fn build(
        &self,
        seq_len: usize,
        channels: usize,
        n_targets: usize,
        config: &ModelConfig,
    ) -> Result<Box<dyn Model>> {
        let factory = self
            .entries
            .get(&config.kind)
            .ok_or_else(|| RunError::config(format!("unknown model kind '{}'", config.kind)))?;
        Ok(factory(seq_len, channels, n_targets, config))
    }
}
