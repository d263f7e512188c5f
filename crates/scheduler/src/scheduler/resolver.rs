//! Reference → callable resolution.
//!
//! A reference is a `module:function` string. [`TaskRegistry`] is the
//! in-process implementation; anything able to locate task code can plug in
//! through the [`Resolver`] trait. The scheduler always wraps the resolver
//! in a [`CachedResolver`], so each distinct reference is resolved once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use super::task::{Callable, TaskArgs, TaskResult};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("Malformed task reference '{0}': expected 'module:function'")]
    MalformedReference(String),
    #[error("No task registered under '{0}'")]
    NotFound(String),
    #[error("Task '{0}' is already registered")]
    Duplicate(String),
}

/// Parsed `module:function` reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskReference<'a> {
    pub module: &'a str,
    pub function: &'a str,
}

impl<'a> TaskReference<'a> {
    pub fn parse(reference: &'a str) -> Result<Self, ResolutionError> {
        let mut parts = reference.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(module), Some(function), None)
                if !module.trim().is_empty() && !function.trim().is_empty() =>
            {
                Ok(Self { module, function })
            }
            _ => Err(ResolutionError::MalformedReference(reference.to_string())),
        }
    }
}

/// Maps a reference string to an invocable callable.
pub trait Resolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Result<Callable, ResolutionError>;
}

impl<R: Resolver + ?Sized> Resolver for Arc<R> {
    fn resolve(&self, reference: &str) -> Result<Callable, ResolutionError> {
        (**self).resolve(reference)
    }
}

/// In-process table of named tasks.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, Callable>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callable. Fails on malformed or duplicate references.
    pub fn register(
        &mut self,
        reference: impl Into<String>,
        callable: Callable,
    ) -> Result<(), ResolutionError> {
        let reference = reference.into();
        TaskReference::parse(&reference)?;
        if self.tasks.contains_key(&reference) {
            return Err(ResolutionError::Duplicate(reference));
        }
        info!(reference = %reference, kind = %callable.kind(), "Registered task");
        self.tasks.insert(reference, callable);
        Ok(())
    }

    /// Register a blocking task body.
    pub fn register_sync<F>(
        &mut self,
        reference: impl Into<String>,
        f: F,
    ) -> Result<(), ResolutionError>
    where
        F: Fn(TaskArgs) -> TaskResult + Send + Sync + 'static,
    {
        self.register(reference, Callable::from_fn(f))
    }

    /// Register a suspendable task body.
    pub fn register_async<F, Fut>(
        &mut self,
        reference: impl Into<String>,
        f: F,
    ) -> Result<(), ResolutionError>
    where
        F: Fn(TaskArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        self.register(reference, Callable::from_async_fn(f))
    }

    pub fn references(&self) -> Vec<&str> {
        let mut refs: Vec<&str> = self.tasks.keys().map(|s| s.as_str()).collect();
        refs.sort_unstable();
        refs
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl Resolver for TaskRegistry {
    fn resolve(&self, reference: &str) -> Result<Callable, ResolutionError> {
        TaskReference::parse(reference)?;
        self.tasks
            .get(reference)
            .cloned()
            .ok_or_else(|| ResolutionError::NotFound(reference.to_string()))
    }
}

/// Write-once-per-key cache in front of another resolver.
///
/// Failed lookups are not cached, so a reference that appears later in the
/// inner resolver is picked up on the next call.
pub struct CachedResolver<R> {
    inner: R,
    cache: RwLock<HashMap<String, Callable>>,
}

impl<R: Resolver> CachedResolver<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }
}

impl<R: Resolver> Resolver for CachedResolver<R> {
    fn resolve(&self, reference: &str) -> Result<Callable, ResolutionError> {
        if let Ok(cache) = self.cache.read() {
            if let Some(callable) = cache.get(reference) {
                return Ok(callable.clone());
            }
        }

        let callable = self.inner.resolve(reference)?;
        debug!(reference = %reference, kind = %callable.kind(), "Resolved task reference");

        if let Ok(mut cache) = self.cache.write() {
            // Another thread may have won the race; keep the first entry.
            let entry = cache
                .entry(reference.to_string())
                .or_insert_with(|| callable.clone());
            return Ok(entry.clone());
        }
        Ok(callable)
    }
}
