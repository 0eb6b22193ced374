//! Device selector evaluation
//!
//! Selectors are boolean predicates over one device. The allocator only needs
//! two capabilities: turn an expression into something callable
//! ([`SelectorEngine::compile`]) and call it ([`DeviceMatcher::matches`]).
//!
//! Compilation is the expensive part and the number of distinct expressions
//! in a cluster is small, so [`SelectorCache`] memoizes compile results by
//! expression text and can be shared by concurrent allocations.

pub mod expression;

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::model::BasicDevice;

pub use expression::ExpressionEngine;

/// Errors raised while compiling or evaluating a selector
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SelectorError {
    #[error("compile error: {0}")]
    Compile(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

/// The device as seen by a selector
#[derive(Debug, Clone, Copy)]
pub struct DeviceView<'a> {
    /// Driver which published the device
    pub driver: &'a str,
    pub device: &'a BasicDevice,
}

/// Result of one successful evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    pub matches: bool,
    /// Engine-defined cost of the evaluation, for tracing
    pub cost: u64,
}

/// A compiled selector
pub trait DeviceMatcher: Send + Sync {
    fn matches(&self, device: &DeviceView<'_>) -> Result<Evaluation, SelectorError>;
}

/// Compiles selector expressions
pub trait SelectorEngine: Send + Sync {
    fn compile(&self, expression: &str) -> Result<Arc<dyn DeviceMatcher>, SelectorError>;
}

type CompileResult = Result<Arc<dyn DeviceMatcher>, SelectorError>;

/// Memoizes compile results (including failures) of another engine
pub struct SelectorCache<E> {
    engine: E,
    compiled: DashMap<String, CompileResult>,
}

impl<E: SelectorEngine> SelectorCache<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            compiled: DashMap::new(),
        }
    }

    /// Number of distinct expressions compiled so far
    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

impl Default for SelectorCache<ExpressionEngine> {
    fn default() -> Self {
        SelectorCache::new(ExpressionEngine)
    }
}

impl<E: SelectorEngine> SelectorEngine for SelectorCache<E> {
    fn compile(&self, expression: &str) -> CompileResult {
        if let Some(hit) = self.compiled.get(expression) {
            return hit.value().clone();
        }
        self.compiled
            .entry(expression.to_string())
            .or_insert_with(|| self.engine.compile(expression))
            .value()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEngine {
        calls: Arc<AtomicUsize>,
    }

    impl SelectorEngine for CountingEngine {
        fn compile(&self, expression: &str) -> CompileResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ExpressionEngine.compile(expression)
        }
    }

    #[test]
    fn test_cache_compiles_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = SelectorCache::new(CountingEngine {
            calls: calls.clone(),
        });

        for _ in 0..3 {
            assert!(cache.compile("device.driver == \"a\"").is_ok());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_cache_remembers_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cache = SelectorCache::new(CountingEngine {
            calls: calls.clone(),
        });

        let first = cache.compile("device.driver ==").err();
        let second = cache.compile("device.driver ==").err();
        assert!(matches!(first, Some(SelectorError::Compile(_))));
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
