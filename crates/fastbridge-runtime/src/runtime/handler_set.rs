//! Versioned, immutable handler sets.
//!
//! A [`HandlerSet`] is the unit of code the reload coordinator publishes: a
//! list of handler script sources plus the routes they register, stamped
//! with a generation number. A published set is never edited; a new version
//! is a new set. Contexts compile the scripts privately (interpreter state
//! cannot be shared), so the set carries sources, not compiled artifacts.

use crate::runtime::script::ScriptContext;
use fastbridge_common::{BridgeError, Result};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// One handler script: a display name (usually the file path) and its
/// source text.
#[derive(Clone)]
pub struct HandlerSource {
    pub name: String,
    pub source: Arc<str>,
}

impl HandlerSource {
    pub fn new(name: impl Into<String>, source: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
        }
    }

    /// Reads a handler script from disk.
    pub fn from_path(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Ok(Self::new(path.display().to_string(), source))
    }
}

impl fmt::Debug for HandlerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSource")
            .field("name", &self.name)
            .field("bytes", &self.source.len())
            .finish()
    }
}

/// An immutable mapping from route identifiers to handler code, versioned
/// by generation.
#[derive(Debug)]
pub struct HandlerSet {
    generation: u64,
    sources: Vec<HandlerSource>,
    routes: Vec<String>,
}

impl HandlerSet {
    /// Compiles `sources` in a scratch context and, if every script
    /// evaluates cleanly, returns the validated set.
    ///
    /// Fails with [`BridgeError::CompileError`] on any syntax error, eval
    /// error, or duplicate route registration; nothing else in the system
    /// is touched in that case.
    pub fn compile(sources: Vec<HandlerSource>, generation: u64) -> Result<Self> {
        if sources.is_empty() {
            return Err(BridgeError::CompileError(
                "handler set contains no scripts".into(),
            ));
        }
        let scratch = ScriptContext::compile(&sources)?;
        let routes = scratch.routes().to_vec();

        tracing::debug!(
            generation,
            routes = routes.len(),
            scripts = sources.len(),
            "handler set validated"
        );
        Ok(Self {
            generation,
            sources,
            routes,
        })
    }

    /// Reads and compiles handler scripts from `paths`.
    pub fn compile_from_paths(paths: &[impl AsRef<Path>], generation: u64) -> Result<Self> {
        let sources = paths
            .iter()
            .map(|p| HandlerSource::from_path(p.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        Self::compile(sources, generation)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn sources(&self) -> &[HandlerSource] {
        &self.sources
    }

    /// Routes registered by this set, in registration order.
    pub fn routes(&self) -> &[String] {
        &self.routes
    }
}
