//! Engine configuration and the end-to-end pipeline
//!
//! Configuration is a JSON file; every field is optional:
//!
//! ```json
//! {
//!   "policy_root": "/usr/share/policy",
//!   "target_arch": "x86_64",
//!   "default_action": "kill",
//!   "thread_scope": "all_threads",
//!   "symbols": { "KVM_RUN": 44672 }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PolicyError, Result};
use crate::policy::{
    CompiledFilter, FilterCompiler, FsSource, ResolvedPolicy, Resolver, SymbolTable, TargetArch,
    Verdict,
};
use crate::security::{FilterInstaller, ThreadScope};

/// Settings for building and installing filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Directory `@include` and entry paths are resolved against.
    pub policy_root: PathBuf,
    /// `None` targets the host.
    pub target_arch: Option<TargetArch>,
    /// Used when no policy file sets `@default`.
    pub default_action: Verdict,
    pub thread_scope: ThreadScope,
    /// Extra constants on top of the built-in errno and flag names.
    pub symbols: BTreeMap<String, u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy_root: PathBuf::from("."),
            target_arch: None,
            default_action: Verdict::Kill,
            thread_scope: ThreadScope::CurrentThread,
            symbols: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| PolicyError::io(path, e))?;
        let config: EngineConfig = serde_json::from_str(&text)
            .map_err(|e| PolicyError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        debug!(path = %path.display(), "loaded engine config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_action.permits() {
            return Err(PolicyError::Config("default_action must not allow".to_string()));
        }
        self.arch().map(|_| ())
    }

    /// Configured target, or the host architecture.
    pub fn arch(&self) -> Result<TargetArch> {
        match self.target_arch.or_else(TargetArch::host) {
            Some(arch) => Ok(arch),
            None => Err(PolicyError::Config(format!(
                "host architecture {} is not supported; set target_arch",
                std::env::consts::ARCH
            ))),
        }
    }
}

/// Parse → resolve → compile with one configuration.
#[derive(Debug, Clone)]
pub struct Engine {
    config: EngineConfig,
    arch: TargetArch,
    symbols: SymbolTable,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let arch = config.arch()?;
        let mut symbols = SymbolTable::linux_defaults(arch);
        symbols.extend(config.symbols.iter().map(|(k, v)| (k.clone(), *v)));
        Ok(Self {
            config,
            arch,
            symbols,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn arch(&self) -> TargetArch {
        self.arch
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Load `entry` (relative to the policy root) and all its includes.
    pub fn resolve(&self, entry: &str) -> Result<ResolvedPolicy> {
        let source = FsSource::new(&self.config.policy_root);
        Resolver::new(&source, &self.symbols).resolve(entry, self.config.default_action)
    }

    pub fn compile(&self, policy: &ResolvedPolicy) -> Result<CompiledFilter> {
        FilterCompiler::new(self.arch).compile(policy)
    }

    pub fn build(&self, entry: &str) -> Result<CompiledFilter> {
        let policy = self.resolve(entry)?;
        self.compile(&policy)
    }

    /// Installer for the configured thread scope.
    pub fn installer(&self) -> FilterInstaller {
        FilterInstaller::new(self.config.thread_scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_action, Verdict::Kill);
        assert_eq!(config.thread_scope, ThreadScope::CurrentThread);
        assert_eq!(config.policy_root, PathBuf::from("."));
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(
            &path,
            r#"{
                "policy_root": "/etc/policies",
                "target_arch": "aarch64",
                "default_action": "return 1",
                "thread_scope": "all_threads",
                "symbols": { "KVM_RUN": 44672 }
            }"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.policy_root, PathBuf::from("/etc/policies"));
        assert_eq!(config.target_arch, Some(TargetArch::Aarch64));
        assert_eq!(config.default_action, Verdict::Deny(1));
        assert_eq!(config.thread_scope, ThreadScope::AllThreads);
        assert_eq!(config.symbols.get("KVM_RUN"), Some(&44672));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{ "target_arch": "riscv64" }"#).unwrap();
        assert_eq!(config.target_arch, Some(TargetArch::Riscv64));
        assert_eq!(config.default_action, Verdict::Kill);
    }

    #[test]
    fn test_rejects_allow_default_and_unknown_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{ "default_action": "allow" }"#).unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(PolicyError::Config(_))));

        fs::write(&path, r#"{ "default_action": "log" }"#).unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(PolicyError::Config(_))));

        fs::write(&path, r#"{ "polcy_root": "/tmp" }"#).unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(PolicyError::Config(_))));

        fs::write(&path, r#"{ "target_arch": "sparc" }"#).unwrap();
        assert!(matches!(EngineConfig::load(&path), Err(PolicyError::Config(_))));
    }

    #[test]
    fn test_engine_symbols_and_build() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("kvm.policy"),
            "ioctl: arg1 == KVM_RUN; return ENOTTY\nread: 1\n",
        )
        .unwrap();

        let mut config = EngineConfig {
            policy_root: dir.path().to_path_buf(),
            target_arch: Some(TargetArch::X86_64),
            ..Default::default()
        };
        config.symbols.insert("KVM_RUN".to_string(), 0xae80);

        let engine = Engine::new(config).unwrap();
        let filter = engine.build("kvm.policy").unwrap();
        assert_eq!(filter.arch(), TargetArch::X86_64);
        assert_eq!(filter.syscalls(), 2);
        assert_eq!(
            filter.evaluate_syscall("ioctl", &[0, 0xae80, 0, 0, 0, 0]).unwrap(),
            Verdict::Allow
        );
        assert_eq!(
            filter.evaluate_syscall("ioctl", &[0, 1, 0, 0, 0, 0]).unwrap(),
            Verdict::Deny(libc::ENOTTY as u16)
        );
    }
}
