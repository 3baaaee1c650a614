//! Policy language front end and BPF back end
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────┐   ┌────────────────┐
//! │ policy text  │──►│ parser       │──►│ resolver      │──►│ compiler       │
//! │ (+ includes) │   │ PolicyDoc    │   │ ResolvedPolicy│   │ CompiledFilter │
//! └──────────────┘   └──────────────┘   └───────────────┘   └────────────────┘
//!                          ▲                    ▲                    │
//!                    SymbolTable          PolicySource               ▼
//!                                                          security::seccomp
//! ```
//!
//! Every stage consumes the previous stage's output and produces a new
//! immutable value. Any error aborts the whole pipeline.

pub mod arch;
pub mod ast;
pub mod bpf;
pub mod compiler;
pub mod parser;
pub mod predicate;
pub mod resolver;
pub mod symbols;
pub mod syscalls;

pub use arch::TargetArch;
pub use ast::{Action, Clause, CmpOp, Comparison, PolicyDocument, Predicate, Rule, Verdict};
pub use compiler::{CompiledFilter, FilterCompiler};
pub use parser::{parse_frequency, parse_policy};
pub use predicate::{normalize, Normalized};
pub use resolver::{FsSource, MemorySource, PolicySource, ResolvedPolicy, ResolvedRule, Resolver};
pub use symbols::SymbolTable;
