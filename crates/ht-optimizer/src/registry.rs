//! Name lookups for strategies and executors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use ht_types::{config_error, HtError, HtResult};

use crate::search::{AdaptiveSearch, GridSearch, RandomSearch, Strategy};
use crate::space::SearchSpace;
use crate::trial::OptimizationConfig;

/// Builds a strategy from the search space and run configuration.
pub type StrategyBuilder = fn(SearchSpace, &OptimizationConfig) -> HtResult<Strategy>;

fn build_grid(space: SearchSpace, config: &OptimizationConfig) -> HtResult<Strategy> {
    Ok(Strategy::Grid(GridSearch::new(space, &config.grid)?))
}

fn build_random(space: SearchSpace, config: &OptimizationConfig) -> HtResult<Strategy> {
    Ok(Strategy::Random(RandomSearch::new(space, &config.random)?))
}

fn build_adaptive(space: SearchSpace, config: &OptimizationConfig) -> HtResult<Strategy> {
    Ok(Strategy::Adaptive(AdaptiveSearch::new(
        space,
        &config.bayesian,
        config.goal.direction,
    )?))
}

/// Strategy name → constructor.
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    entries: Vec<(&'static str, StrategyBuilder)>,
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self {
            entries: vec![
                ("grid", build_grid as StrategyBuilder),
                ("random", build_random),
                ("bayesian", build_adaptive),
            ],
        }
    }
}

impl StrategyRegistry {
    /// Add or replace an entry.
    pub fn register(&mut self, name: &'static str, builder: StrategyBuilder) {
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = builder,
            None => self.entries.push((name, builder)),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.entries.iter().map(|(n, _)| *n).collect()
    }

    fn lookup(&self, name: &str) -> HtResult<StrategyBuilder> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, builder)| *builder)
            .ok_or_else(|| {
                config_error!(
                    "unknown search strategy '{name}', expected one of: {}",
                    self.names().join(", ")
                )
            })
    }

    pub fn validate(&self, name: &str) -> HtResult<()> {
        self.lookup(name).map(|_| ())
    }

    pub fn build(&self, name: &str, space: SearchSpace, config: &OptimizationConfig) -> HtResult<Strategy> {
        let builder = self.lookup(name)?;
        builder(space, config)
    }
}

/// How trials are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    Serial,
    LocalParallel,
    Distributed,
}

impl Default for ExecutorKind {
    fn default() -> Self {
        Self::Serial
    }
}

impl ExecutorKind {
    pub const ALL: [ExecutorKind; 3] = [Self::Serial, Self::LocalParallel, Self::Distributed];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Serial => "serial",
            Self::LocalParallel => "local-parallel",
            Self::Distributed => "distributed",
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorKind {
    type Err = HtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| {
                config_error!(
                    "unknown executor '{s}', expected one of: serial, local-parallel, distributed"
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchStrategy;

    fn space() -> SearchSpace {
        SearchSpace::new().add_int("combiner.num_fc_layers", 1, 3).unwrap()
    }

    #[test]
    fn default_entries() {
        let registry = StrategyRegistry::default();
        assert_eq!(registry.names(), vec!["grid", "random", "bayesian"]);
        for name in registry.names() {
            let config = OptimizationConfig::new("t", name);
            let strategy = registry.build(name, space(), &config).unwrap();
            assert_eq!(strategy.name(), name);
        }
    }

    #[test]
    fn unknown_strategy_lists_known_keys() {
        let err = StrategyRegistry::default().validate("hyperband").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("hyperband"));
        assert!(text.contains("grid, random, bayesian"));
    }

    #[test]
    fn register_replaces_existing() {
        fn tiny_grid(space: SearchSpace, config: &OptimizationConfig) -> HtResult<Strategy> {
            let mut grid = config.grid.clone();
            grid.default_steps = 1;
            Ok(Strategy::Grid(GridSearch::new(space, &grid)?))
        }

        let mut registry = StrategyRegistry::default();
        registry.register("grid", tiny_grid);
        registry.register("coarse-grid", tiny_grid);
        assert_eq!(registry.names().len(), 4);
        assert!(registry.validate("coarse-grid").is_ok());
    }

    #[test]
    fn executor_kind_parsing() {
        assert_eq!("serial".parse::<ExecutorKind>().unwrap(), ExecutorKind::Serial);
        assert_eq!(
            "local-parallel".parse::<ExecutorKind>().unwrap(),
            ExecutorKind::LocalParallel
        );
        assert_eq!(
            "distributed".parse::<ExecutorKind>().unwrap(),
            ExecutorKind::Distributed
        );
        assert!("ray".parse::<ExecutorKind>().is_err());
        assert_eq!(ExecutorKind::LocalParallel.to_string(), "local-parallel");
    }
}
