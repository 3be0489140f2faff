//! Compiler registry and the recursive compile step.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::error::CompileError;
use crate::intent::{Intent, IntentKind};

/// Default bound on nested compilation.
pub const DEFAULT_MAX_DEPTH: usize = 8;

/// Turns a high-level intent into lower-level intents.
///
/// Implementations live outside the engine (path computation, constraint
/// evaluation). A compiler may return intents that still need compiling;
/// the registry keeps going until only installables remain.
#[async_trait]
pub trait IntentCompiler: Send + Sync {
    /// Compiles `intent`, given the installables of the previous attempt.
    ///
    /// # Errors
    ///
    /// Returns [`CompileError`] when the intent cannot be satisfied on the
    /// current topology.
    async fn compile(&self, intent: &Intent, previous: &[Intent])
    -> Result<Vec<Intent>, CompileError>;
}

/// One compiler per intent kind; registering again replaces the previous one.
pub struct CompilerRegistry {
    compilers: DashMap<IntentKind, Arc<dyn IntentCompiler>>,
    max_depth: usize,
}

impl Default for CompilerRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl CompilerRegistry {
    /// Empty registry bounding nested compilation at `max_depth`.
    #[must_use]
    pub fn new(max_depth: usize) -> Self {
        Self {
            compilers: DashMap::new(),
            max_depth: max_depth.max(1),
        }
    }

    /// Registers `compiler` for `kind`, returning the compiler it replaced.
    pub fn register(
        &self,
        kind: IntentKind,
        compiler: Arc<dyn IntentCompiler>,
    ) -> Option<Arc<dyn IntentCompiler>> {
        let previous = self.compilers.insert(kind, compiler);
        if previous.is_some() {
            debug!(kind = %kind, "replaced intent compiler");
        }
        previous
    }

    /// Removes the compiler for `kind`.
    pub fn unregister(&self, kind: IntentKind) -> Option<Arc<dyn IntentCompiler>> {
        self.compilers.remove(&kind).map(|(_, compiler)| compiler)
    }

    /// Compiler registered for `kind`.
    #[must_use]
    pub fn get(&self, kind: IntentKind) -> Option<Arc<dyn IntentCompiler>> {
        self.compilers
            .get(&kind)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Kinds with a registered compiler, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<IntentKind> {
        let mut kinds: Vec<_> = self.compilers.iter().map(|entry| *entry.key()).collect();
        kinds.sort();
        kinds
    }

    /// Compiles `intent` down to installables, in order.
    ///
    /// Installable intents compile to themselves. Non-installable results are
    /// compiled again, depth first, until the configured depth is exhausted.
    ///
    /// # Errors
    ///
    /// The first compiler error, [`CompileError::NoCompiler`] for an
    /// unregistered kind, or [`CompileError::DepthExceeded`].
    pub async fn compile(
        &self,
        intent: &Intent,
        previous: &[Intent],
    ) -> Result<Vec<Intent>, CompileError> {
        let mut installables = Vec::new();
        let mut stack = vec![(intent.clone(), 0_usize)];

        while let Some((next, depth)) = stack.pop() {
            if next.is_installable() {
                installables.push(next);
                continue;
            }
            if depth >= self.max_depth {
                return Err(CompileError::DepthExceeded {
                    key: intent.key().clone(),
                    max_depth: self.max_depth,
                });
            }
            let compiler = self
                .get(next.kind())
                .ok_or(CompileError::NoCompiler { kind: next.kind() })?;
            let children = compiler.compile(&next, previous).await?;
            trace!(
                key = %intent.key(),
                kind = %next.kind(),
                depth,
                produced = children.len(),
                "compiled intent"
            );
            stack.extend(children.into_iter().rev().map(|child| (child, depth + 1)));
        }

        Ok(installables)
    }
}
