//! Include resolution and policy merging
//!
//! ```text
//!   device.policy ──@include──► common.policy ──@include──► base.policy
//!        │                            ▲
//!        └────────@include────────────┘   (diamond: expanded once)
//!
//!   expansion order: base → common → device
//!   each syscall may be defined by exactly one file
//! ```
//!
//! Included files form the base layer and the including file adds to it.
//! A syscall defined in two different files is rejected rather than
//! resolved by precedence.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use super::ast::{Action, PolicyDocument, Verdict};
use super::parser::{parse_frequency, parse_policy};
use super::symbols::SymbolTable;
use crate::error::{Location, PolicyError, Result};
use crate::metrics;

// ═══════════════════════════════════════════════════════════════════════════
// POLICY SOURCES
// ═══════════════════════════════════════════════════════════════════════════

/// Where policy text comes from.
///
/// `locate` turns a reference as written (`@include base.policy`, or the
/// entry name given to the resolver) into a canonical path; two references
/// to the same file must locate to the same path for cycle and diamond
/// detection to work.
pub trait PolicySource {
    fn locate(&self, reference: &str) -> Result<PathBuf>;
    fn read(&self, path: &Path) -> Result<String>;
}

/// Policy files on disk under a root directory.
#[derive(Debug, Clone)]
pub struct FsSource {
    root: PathBuf,
}

impl FsSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PolicySource for FsSource {
    fn locate(&self, reference: &str) -> Result<PathBuf> {
        let candidate = Path::new(reference);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };
        fs::canonicalize(&joined).map_err(|e| PolicyError::io(joined, e))
    }

    fn read(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|e| PolicyError::io(path, e))
    }
}

/// Policy files held in memory, keyed by normalized relative path.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: BTreeMap<PathBuf, String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: &str, text: impl Into<String>) -> Self {
        self.insert(name, text);
        self
    }

    pub fn insert(&mut self, name: &str, text: impl Into<String>) {
        self.files.insert(normalize_path(Path::new(name)), text.into());
    }
}

impl PolicySource for MemorySource {
    fn locate(&self, reference: &str) -> Result<PathBuf> {
        let path = normalize_path(Path::new(reference));
        if self.files.contains_key(&path) {
            Ok(path)
        } else {
            Err(PolicyError::io(path, io::Error::from(io::ErrorKind::NotFound)))
        }
    }

    fn read(&self, path: &Path) -> Result<String> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| PolicyError::io(path, io::Error::from(io::ErrorKind::NotFound)))
    }
}

/// Lexical normalization: drops `.` and leading `/`, applies `..`.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    out
}

// ═══════════════════════════════════════════════════════════════════════════
// RESOLVED POLICY
// ═══════════════════════════════════════════════════════════════════════════

/// A rule after merging, with the file and line that defined it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedRule {
    #[serde(flatten)]
    pub action: Action,
    #[serde(serialize_with = "serialize_location")]
    pub origin: Location,
}

fn serialize_location<S: serde::Serializer>(loc: &Location, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(&loc.to_string())
}

/// The flattened rule set: one action per syscall name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedPolicy {
    pub rules: BTreeMap<String, ResolvedRule>,
    pub default_action: Verdict,
    /// Summed `@frequency` hints. Only affect emission order.
    pub frequencies: BTreeMap<String, u64>,
    /// Every file that contributed, in expansion order.
    pub files: Vec<PathBuf>,
}

impl ResolvedPolicy {
    pub fn rule(&self, syscall: &str) -> Option<&ResolvedRule> {
        self.rules.get(syscall)
    }

    /// Reference decision for a syscall invocation. Unknown names and
    /// unmentioned syscalls get the default action.
    pub fn decide(&self, syscall: &str, args: &[u64; 6], arch: super::arch::TargetArch) -> Verdict {
        let rule = match self.rules.get(syscall) {
            Some(rule) => rule,
            None => return self.default_action,
        };
        match &rule.action {
            Action::AllowIf { predicate, otherwise } => {
                if predicate.evaluate(args, arch) {
                    Verdict::Allow
                } else {
                    otherwise.unwrap_or(self.default_action)
                }
            }
            action => action.unconditional().unwrap_or(self.default_action),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// RESOLVER
// ═══════════════════════════════════════════════════════════════════════════

/// Expands `@include`s depth-first and merges the documents.
pub struct Resolver<'a, S: PolicySource + ?Sized> {
    source: &'a S,
    symbols: &'a SymbolTable,
}

#[derive(Default)]
struct Expansion {
    /// Files currently being expanded, outermost first.
    stack: Vec<PathBuf>,
    done: BTreeSet<PathBuf>,
    files: Vec<PathBuf>,
    rules: BTreeMap<String, ResolvedRule>,
    default_action: Option<(Verdict, Location)>,
    frequencies: BTreeMap<String, u64>,
}

impl<'a, S: PolicySource + ?Sized> Resolver<'a, S> {
    pub fn new(source: &'a S, symbols: &'a SymbolTable) -> Self {
        Self { source, symbols }
    }

    /// Load `entry` and everything it includes. `fallback` is the default
    /// action when no document sets `@default`.
    pub fn resolve(&self, entry: &str, fallback: Verdict) -> Result<ResolvedPolicy> {
        let path = self.source.locate(entry)?;
        let doc = self.load(&path)?;
        self.resolve_document(doc, fallback)
    }

    /// Resolve an already-parsed document. Its includes are still loaded
    /// through the source. The document's path is located through the
    /// source when it can be, so an include leading back to it is caught
    /// as a cycle.
    pub fn resolve_document(&self, mut doc: PolicyDocument, fallback: Verdict) -> Result<ResolvedPolicy> {
        if let Ok(path) = self.source.locate(&doc.path.to_string_lossy()) {
            doc.path = path;
        }
        let mut state = Expansion::default();
        state.stack.push(doc.path.clone());
        self.expand(doc, &mut state)?;

        let default_action = state.default_action.map_or(fallback, |(v, _)| v);
        if default_action.permits() {
            return Err(PolicyError::Config("default action must not allow".to_string()));
        }

        for rule in state.rules.values() {
            metrics::POLICY_RULES.with_label_values(&[rule.action.kind()]).inc();
        }
        info!(
            files = state.files.len(),
            rules = state.rules.len(),
            default_action = %default_action,
            "resolved policy"
        );

        Ok(ResolvedPolicy {
            rules: state.rules,
            default_action,
            frequencies: state.frequencies,
            files: state.files,
        })
    }

    fn load(&self, path: &Path) -> Result<PolicyDocument> {
        let text = self.source.read(path)?;
        let doc = parse_policy(path, &text, self.symbols)?;
        metrics::POLICY_FILES_LOADED.inc();
        Ok(doc)
    }

    fn expand(&self, doc: PolicyDocument, state: &mut Expansion) -> Result<()> {
        for include in &doc.includes {
            let path = self.source.locate(&include.path)?;
            if let Some(pos) = state.stack.iter().position(|p| *p == path) {
                let mut cycle = state.stack[pos..].to_vec();
                cycle.push(path);
                return Err(PolicyError::IncludeCycle { cycle });
            }
            if state.done.contains(&path) {
                debug!(file = %path.display(), from = %include.location, "include already expanded");
                continue;
            }
            let child = self.load(&path)?;
            state.stack.push(path);
            self.expand(child, state)?;
            state.stack.pop();
        }

        for freq in &doc.frequency_files {
            let path = self.source.locate(&freq.path)?;
            let text = self.source.read(&path)?;
            for (name, count) in parse_frequency(&path, &text)? {
                let total = state.frequencies.entry(name).or_insert(0);
                *total = total.saturating_add(count);
            }
        }

        if let Some((verdict, at)) = doc.default_action {
            match &state.default_action {
                Some((existing, first)) if *existing != verdict => {
                    return Err(PolicyError::ConflictingDefault {
                        first_action: existing.to_string(),
                        first: first.clone(),
                        second_action: verdict.to_string(),
                        second: at,
                    });
                }
                Some(_) => {}
                None => state.default_action = Some((verdict, at)),
            }
        }

        for rule in doc.rules {
            if let Some(existing) = state.rules.get(&rule.syscall) {
                return Err(PolicyError::DuplicateSyscall {
                    syscall: rule.syscall,
                    first: existing.origin.clone(),
                    second: rule.location,
                });
            }
            state.rules.insert(
                rule.syscall,
                ResolvedRule {
                    action: rule.action,
                    origin: rule.location,
                },
            );
        }

        debug!(file = %doc.path.display(), "expanded policy file");
        state.done.insert(doc.path.clone());
        state.files.push(doc.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::arch::TargetArch;
    use crate::policy::ast::Predicate;

    const ARCH: TargetArch = TargetArch::X86_64;

    fn resolve(source: &MemorySource, entry: &str) -> Result<ResolvedPolicy> {
        let symbols = SymbolTable::linux_defaults(ARCH);
        Resolver::new(source, &symbols).resolve(entry, Verdict::Kill)
    }

    #[test]
    fn test_base_and_override_layers() {
        let source = MemorySource::new()
            .with_file("base.policy", "read: 1\nwrite: 1\n")
            .with_file(
                "device.policy",
                "@include base.policy\nopen: return ENOENT\nioctl: arg1 == 0x1234\n",
            );
        let policy = resolve(&source, "device.policy").unwrap();

        assert_eq!(policy.files, vec![PathBuf::from("base.policy"), PathBuf::from("device.policy")]);
        assert_eq!(policy.default_action, Verdict::Kill);
        assert_eq!(policy.rule("read").unwrap().action, Action::Allow);
        assert_eq!(policy.rule("read").unwrap().origin, Location::new("base.policy", 1));
        assert_eq!(
            policy.rule("ioctl").unwrap().action,
            Action::AllowIf {
                predicate: Predicate::arg_eq(1, 0x1234),
                otherwise: None
            }
        );

        let zero = [0u64; 6];
        let mut hit = zero;
        hit[1] = 0x1234;
        assert_eq!(policy.decide("read", &zero, ARCH), Verdict::Allow);
        assert_eq!(policy.decide("write", &zero, ARCH), Verdict::Allow);
        assert_eq!(policy.decide("open", &zero, ARCH), Verdict::Deny(libc::ENOENT as u16));
        assert_eq!(policy.decide("ioctl", &hit, ARCH), Verdict::Allow);
        assert_eq!(policy.decide("ioctl", &zero, ARCH), Verdict::Kill);
        assert_eq!(policy.decide("execve", &zero, ARCH), Verdict::Kill);
    }

    #[test]
    fn test_cross_file_duplicate_names_both_files() {
        let source = MemorySource::new()
            .with_file("base.policy", "read: 1\nopen: 1\n")
            .with_file("device.policy", "@include base.policy\n\nopen: return ENOENT\n");
        match resolve(&source, "device.policy").unwrap_err() {
            PolicyError::DuplicateSyscall { syscall, first, second } => {
                assert_eq!(syscall, "open");
                assert_eq!(first, Location::new("base.policy", 2));
                assert_eq!(second, Location::new("device.policy", 3));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_identical_definitions_in_two_files_still_conflict() {
        let source = MemorySource::new()
            .with_file("a.policy", "read: 1\n")
            .with_file("b.policy", "@include a.policy\nread: 1\n");
        assert!(matches!(
            resolve(&source, "b.policy"),
            Err(PolicyError::DuplicateSyscall { .. })
        ));
    }

    #[test]
    fn test_include_cycle_names_chain() {
        let source = MemorySource::new()
            .with_file("a.policy", "@include b.policy\nread: 1\n")
            .with_file("b.policy", "@include c.policy\n")
            .with_file("c.policy", "@include ./a.policy\n");
        match resolve(&source, "a.policy").unwrap_err() {
            PolicyError::IncludeCycle { cycle } => {
                let names: Vec<_> = cycle.iter().map(|p| p.display().to_string()).collect();
                assert_eq!(names, ["a.policy", "b.policy", "c.policy", "a.policy"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_self_include_is_a_cycle() {
        let source = MemorySource::new().with_file("a.policy", "@include a.policy\n");
        assert!(matches!(
            resolve(&source, "a.policy"),
            Err(PolicyError::IncludeCycle { .. })
        ));
    }

    #[test]
    fn test_diamond_include_expanded_once() {
        let source = MemorySource::new()
            .with_file("base.policy", "read: 1\n")
            .with_file("net.policy", "@include base.policy\nsendmsg: 1\n")
            .with_file("fs.policy", "@include base.policy\nopenat: 1\n")
            .with_file("device.policy", "@include net.policy\n@include fs.policy\n");
        let policy = resolve(&source, "device.policy").unwrap();
        assert_eq!(policy.rules.len(), 3);
        assert_eq!(policy.files.len(), 4);
        assert_eq!(policy.files[0], PathBuf::from("base.policy"));
    }

    #[test]
    fn test_default_action_from_include() {
        let source = MemorySource::new()
            .with_file("base.policy", "@default return EPERM\nread: 1\n")
            .with_file("device.policy", "@include base.policy\n@default return EPERM\n");
        let policy = resolve(&source, "device.policy").unwrap();
        assert_eq!(policy.default_action, Verdict::Deny(libc::EPERM as u16));
        assert_eq!(policy.decide("mount", &[0; 6], ARCH), Verdict::Deny(libc::EPERM as u16));
    }

    #[test]
    fn test_conflicting_defaults_across_files() {
        let source = MemorySource::new()
            .with_file("base.policy", "@default kill\n")
            .with_file("device.policy", "@include base.policy\n@default trap\n");
        assert!(matches!(
            resolve(&source, "device.policy"),
            Err(PolicyError::ConflictingDefault { .. })
        ));
    }

    #[test]
    fn test_fallback_must_not_allow() {
        let source = MemorySource::new().with_file("a.policy", "read: 1\n");
        let symbols = SymbolTable::new();
        let err = Resolver::new(&source, &symbols)
            .resolve("a.policy", Verdict::Allow)
            .unwrap_err();
        assert!(matches!(err, PolicyError::Config(_)));
    }

    #[test]
    fn test_log_default_rejected() {
        let source = MemorySource::new().with_file("a.policy", "read: 1\n");
        let symbols = SymbolTable::new();
        let err = Resolver::new(&source, &symbols)
            .resolve("a.policy", Verdict::Log)
            .unwrap_err();
        assert!(matches!(err, PolicyError::Config(_)));

        let source = MemorySource::new()
            .with_file("base.policy", "@default log\n")
            .with_file("a.policy", "@include base.policy\nread: 1\n");
        assert!(matches!(resolve(&source, "a.policy"), Err(PolicyError::Parse { .. })));
    }

    #[test]
    fn test_document_path_located_for_cycles() {
        let source = MemorySource::new()
            .with_file("a.policy", "@include b.policy\nread: 1\n")
            .with_file("b.policy", "@include a.policy\nwrite: 1\n");
        let symbols = SymbolTable::new();
        let doc = parse_policy("./a.policy", "@include b.policy\nread: 1\n", &symbols).unwrap();

        match Resolver::new(&source, &symbols).resolve_document(doc, Verdict::Kill) {
            Err(PolicyError::IncludeCycle { cycle }) => {
                assert_eq!(
                    cycle,
                    vec![
                        PathBuf::from("a.policy"),
                        PathBuf::from("b.policy"),
                        PathBuf::from("a.policy")
                    ]
                );
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_conditional_fallback_verdict() {
        let source = MemorySource::new()
            .with_file("a.policy", "ioctl: arg1 == FIONREAD; return ENOTTY\n");
        let policy = resolve(&source, "a.policy").unwrap();
        let mut args = [0u64; 6];
        assert_eq!(policy.decide("ioctl", &args, ARCH), Verdict::Deny(libc::ENOTTY as u16));
        args[1] = libc::FIONREAD as u64;
        assert_eq!(policy.decide("ioctl", &args, ARCH), Verdict::Allow);
    }

    #[test]
    fn test_frequencies_summed() {
        let source = MemorySource::new()
            .with_file("hot.frequency", "read: 100\nwrite: 10\n")
            .with_file("more.frequency", "read: 5\n")
            .with_file("base.policy", "@frequency more.frequency\nwrite: 1\n")
            .with_file("a.policy", "@include base.policy\n@frequency hot.frequency\nread: 1\n");
        let policy = resolve(&source, "a.policy").unwrap();
        assert_eq!(policy.frequencies.get("read"), Some(&105));
        assert_eq!(policy.frequencies.get("write"), Some(&10));
    }

    #[test]
    fn test_missing_include_is_io_error() {
        let source = MemorySource::new().with_file("a.policy", "@include gone.policy\n");
        assert!(matches!(resolve(&source, "a.policy"), Err(PolicyError::Io { .. })));
    }

    #[test]
    fn test_parse_error_in_include_propagates() {
        let source = MemorySource::new()
            .with_file("base.policy", "read 1\n")
            .with_file("a.policy", "@include base.policy\n");
        match resolve(&source, "a.policy").unwrap_err() {
            PolicyError::Parse { file, line, .. } => {
                assert_eq!(file, PathBuf::from("base.policy"));
                assert_eq!(line, 1);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_fs_source_resolves_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("common")).unwrap();
        fs::write(dir.path().join("common/base.policy"), "read: 1\n").unwrap();
        fs::write(
            dir.path().join("device.policy"),
            "@include common/base.policy\nwrite: 1\n",
        )
        .unwrap();

        let source = FsSource::new(dir.path());
        let symbols = SymbolTable::new();
        let policy = Resolver::new(&source, &symbols)
            .resolve("device.policy", Verdict::Kill)
            .unwrap();
        assert_eq!(policy.rules.len(), 2);
        assert!(policy.files[0].ends_with("common/base.policy"));
    }
}
