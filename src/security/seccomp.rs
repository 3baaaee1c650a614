//! Seccomp filter installation
//!
//! # What happens on install?
//!
//! The compiled program is handed to the kernel with `seccomp(2)`. From
//! then on every syscall of the filtered threads runs through it:
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │  ┌──────────┐     ┌─────────────┐     ┌──────────────────┐    │
//! │  │ Syscall  │────►│ BPF Program │────►│ ALLOW / ERRNO /  │    │
//! │  │ nr, args │     │ (in kernel) │     │ KILL / TRAP / LOG│    │
//! │  └──────────┘     └─────────────┘     └──────────────────┘    │
//! │                                                                │
//! │  no_new_privs is set first, so the filter survives execve and  │
//! │  can only ever be narrowed by further filters.                 │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Installing is one-shot: `FilterInstaller::install` consumes both the
//! installer and the filter. An error from it means the process is in an
//! unknown state and must not go on to run untrusted code.

use std::fmt;
use std::str::FromStr;

use seccompiler::sock_filter;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::{PolicyError, Result};
use crate::metrics;
use crate::policy::{CompiledFilter, TargetArch};

// ═══════════════════════════════════════════════════════════════════════════
// ThreadScope
// ═══════════════════════════════════════════════════════════════════════════
// WHAT IT IS:
//   Which threads the filter is attached to.
//
//   CurrentThread: only the calling thread (and anything it later spawns
//                  or execs). Threads that already exist stay unfiltered.
//   AllThreads:    SECCOMP_FILTER_FLAG_TSYNC, every thread of the process
//                  is synchronized onto the filter or install fails.
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadScope {
    #[default]
    CurrentThread,
    AllThreads,
}

impl ThreadScope {
    pub fn as_str(self) -> &'static str {
        match self {
            ThreadScope::CurrentThread => "current_thread",
            ThreadScope::AllThreads => "all_threads",
        }
    }
}

impl fmt::Display for ThreadScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ThreadScope {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "current_thread" | "current-thread" | "thread" => Ok(ThreadScope::CurrentThread),
            "all_threads" | "all-threads" | "tsync" => Ok(ThreadScope::AllThreads),
            other => Err(PolicyError::Config(format!("unknown thread scope '{}'", other))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// FilterLoader
// ═══════════════════════════════════════════════════════════════════════════
// WHAT IT IS:
//   The kernel-facing capability: "attach this program, irrevocably".
//   KernelLoader is the real one; tests substitute a recorder.
// ═══════════════════════════════════════════════════════════════════════════

pub trait FilterLoader {
    fn load(&self, program: &[sock_filter], scope: ThreadScope) -> std::result::Result<(), String>;
}

impl<L: FilterLoader + ?Sized> FilterLoader for &L {
    fn load(&self, program: &[sock_filter], scope: ThreadScope) -> std::result::Result<(), String> {
        (**self).load(program, scope)
    }
}

/// Installs through `seccompiler`, which sets `PR_SET_NO_NEW_PRIVS` before
/// calling `seccomp(SECCOMP_SET_MODE_FILTER, ...)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelLoader;

impl FilterLoader for KernelLoader {
    fn load(&self, program: &[sock_filter], scope: ThreadScope) -> std::result::Result<(), String> {
        let result = match scope {
            ThreadScope::CurrentThread => seccompiler::apply_filter(program),
            ThreadScope::AllThreads => seccompiler::apply_filter_all_threads(program),
        };
        result.map_err(|e| e.to_string())
    }
}

/// What was installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    pub arch: TargetArch,
    pub scope: ThreadScope,
    pub instructions: usize,
    pub syscalls: usize,
}

// ═══════════════════════════════════════════════════════════════════════════
// FilterInstaller
// ═══════════════════════════════════════════════════════════════════════════

pub struct FilterInstaller<L: FilterLoader = KernelLoader> {
    loader: L,
    scope: ThreadScope,
    /// Architecture of the process the filter lands in.
    host: Option<TargetArch>,
}

impl FilterInstaller<KernelLoader> {
    pub fn new(scope: ThreadScope) -> Self {
        Self::with_loader(KernelLoader, scope)
    }
}

impl<L: FilterLoader> FilterInstaller<L> {
    pub fn with_loader(loader: L, scope: ThreadScope) -> Self {
        Self {
            loader,
            scope,
            host: TargetArch::host(),
        }
    }

    /// Override the detected host architecture.
    pub fn for_arch(mut self, arch: TargetArch) -> Self {
        self.host = Some(arch);
        self
    }

    pub fn scope(&self) -> ThreadScope {
        self.scope
    }

    // ═══════════════════════════════════════════════════════════════════════
    // install() - attach the filter
    // ═══════════════════════════════════════════════════════════════════════
    // WHAT IT DOES:
    //   1. Refuses a filter built for another architecture (its arch check
    //      would kill the process on the very next syscall)
    //   2. Hands the program to the loader
    //   3. Reports arch, scope and size of what is now enforced
    //
    // ⚠️ WARNING:
    //   IRREVERSIBLE. On Err the caller must abort rather than continue
    //   into untrusted code.
    //
    // RETURNS:
    //   Result<InstallReport> - PolicyError::Installation on any failure
    // ═══════════════════════════════════════════════════════════════════════
    pub fn install(self, filter: CompiledFilter) -> Result<InstallReport> {
        let result = self.try_install(filter);
        let outcome = if result.is_ok() { "installed" } else { "failed" };
        metrics::FILTER_INSTALLS
            .with_label_values(&[self.scope.as_str(), outcome])
            .inc();

        match &result {
            Ok(report) => info!(
                arch = %report.arch,
                scope = %report.scope,
                instructions = report.instructions,
                syscalls = report.syscalls,
                "seccomp filter installed"
            ),
            Err(e) => error!(scope = %self.scope, error = %e, "seccomp filter installation failed"),
        }
        result
    }

    fn try_install(&self, filter: CompiledFilter) -> Result<InstallReport> {
        let arch = filter.arch();
        match self.host {
            Some(host) if host == arch => {}
            Some(host) => {
                return Err(PolicyError::Installation(format!(
                    "filter targets {} but this process runs on {}",
                    arch, host
                )))
            }
            None => {
                return Err(PolicyError::Installation(format!(
                    "host architecture {} is not supported",
                    std::env::consts::ARCH
                )))
            }
        }

        let report = InstallReport {
            arch,
            scope: self.scope,
            instructions: filter.len(),
            syscalls: filter.syscalls(),
        };
        let program = filter.into_program();
        if program.is_empty() {
            return Err(PolicyError::Installation("empty filter program".to_string()));
        }

        self.loader
            .load(&program, self.scope)
            .map_err(PolicyError::Installation)?;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::policy::{FilterCompiler, MemorySource, Resolver, SymbolTable, Verdict};

    #[derive(Default)]
    struct RecordingLoader {
        calls: Mutex<Vec<(usize, ThreadScope)>>,
        fail_with: Option<String>,
    }

    impl FilterLoader for RecordingLoader {
        fn load(&self, program: &[sock_filter], scope: ThreadScope) -> std::result::Result<(), String> {
            self.calls.lock().unwrap().push((program.len(), scope));
            match &self.fail_with {
                Some(reason) => Err(reason.clone()),
                None => Ok(()),
            }
        }
    }

    fn filter_for(arch: TargetArch) -> CompiledFilter {
        let source = MemorySource::new().with_file("p.policy", "read: 1\nwrite: 1\nexit_group: 1\n");
        let symbols = SymbolTable::new();
        let policy = Resolver::new(&source, &symbols)
            .resolve("p.policy", Verdict::Kill)
            .unwrap();
        FilterCompiler::new(arch).compile(&policy).unwrap()
    }

    #[test]
    fn test_install_reports_what_was_loaded() {
        let loader = RecordingLoader::default();
        let filter = filter_for(TargetArch::X86_64);
        let expected_len = filter.len();

        let report = FilterInstaller::with_loader(&loader, ThreadScope::AllThreads)
            .for_arch(TargetArch::X86_64)
            .install(filter)
            .unwrap();

        assert_eq!(
            report,
            InstallReport {
                arch: TargetArch::X86_64,
                scope: ThreadScope::AllThreads,
                instructions: expected_len,
                syscalls: 3,
            }
        );
        assert_eq!(*loader.calls.lock().unwrap(), vec![(expected_len, ThreadScope::AllThreads)]);
    }

    #[test]
    fn test_arch_mismatch_refused_before_loading() {
        let loader = RecordingLoader::default();
        let err = FilterInstaller::with_loader(&loader, ThreadScope::CurrentThread)
            .for_arch(TargetArch::X86_64)
            .install(filter_for(TargetArch::Aarch64))
            .unwrap_err();

        assert!(err.is_installation());
        assert!(err.to_string().contains("aarch64"));
        assert!(loader.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_loader_failure_is_installation_error() {
        let loader = RecordingLoader {
            fail_with: Some("Operation not permitted".to_string()),
            ..Default::default()
        };
        let err = FilterInstaller::with_loader(&loader, ThreadScope::CurrentThread)
            .for_arch(TargetArch::Riscv64)
            .install(filter_for(TargetArch::Riscv64))
            .unwrap_err();

        assert!(matches!(err, PolicyError::Installation(ref msg) if msg.contains("not permitted")));
    }

    #[test]
    fn test_thread_scope_parsing() {
        assert_eq!("all_threads".parse::<ThreadScope>().unwrap(), ThreadScope::AllThreads);
        assert_eq!("tsync".parse::<ThreadScope>().unwrap(), ThreadScope::AllThreads);
        assert_eq!(
            "current-thread".parse::<ThreadScope>().unwrap(),
            ThreadScope::CurrentThread
        );
        assert!("everything".parse::<ThreadScope>().is_err());
        assert_eq!(ThreadScope::default(), ThreadScope::CurrentThread);
    }
}
