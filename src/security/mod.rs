//! Enforcement of compiled filters
//!
//! # Usage Order
//!
//! Install in the process that will run untrusted code, before it runs:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  1. Engine::build(policy)        parse, resolve, compile        │
//! │  2. FilterInstaller::install     no_new_privs + seccomp(2)      │
//! │  3. exec(untrusted program)      filter is inherited            │
//! │                                                                 │
//! │  step 2 fails ──► abort, never reach step 3                     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod seccomp;

pub use seccomp::{FilterInstaller, FilterLoader, InstallReport, KernelLoader, ThreadScope};
