//! seccomp-policy - syscall filter policies for sandboxed device processes
//!
//! Compiles a small line-oriented policy language into a seccomp BPF
//! program and installs it into the calling process before it runs
//! untrusted code.
//!
//! # Modules
//!
//! - `policy` - parser, include resolver, predicate folding, BPF compiler
//! - `security` - one-shot filter installation
//! - `config` - JSON engine configuration and the `Engine` pipeline
//! - `error` - the `PolicyError` taxonomy
//! - `logging` - tracing subscriber setup
//! - `metrics` - Prometheus metrics for the pipeline
//!
//! # Quick Start
//!
//! ```ignore
//! use seccomp_policy::{Engine, EngineConfig};
//!
//! let engine = Engine::new(EngineConfig::default())?;
//! let filter = engine.build("device.policy")?;
//! // Irreversible. Abort on error, never run untrusted code after a failure.
//! let report = engine.installer().install(filter)?;
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod policy;
pub mod security;

// Re-export commonly used types at crate root for convenience
pub use config::{Engine, EngineConfig};
pub use error::{Location, PolicyError, Result};
pub use policy::{CompiledFilter, ResolvedPolicy, SymbolTable, TargetArch, Verdict};
pub use security::{FilterInstaller, InstallReport, ThreadScope};
