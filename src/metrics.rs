//! Prometheus metrics for the policy pipeline
//!
//! Populated as policy files are loaded, filters compiled and installed.
//! `render()` produces the text exposition format for scraping or for
//! printing at the end of a CLI run.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

use crate::error::{PolicyError, Result};

lazy_static! {
    // ─────────────────────────────────────────────────────────────────────────────
    // Policy Loading Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Policy files read and parsed, including every `@include`d file.
    pub static ref POLICY_FILES_LOADED: IntCounter = register_int_counter!(
        "seccomp_policy_files_loaded_total",
        "Policy files read and parsed"
    ).expect("failed to register POLICY_FILES_LOADED metric");

    /// Rules in resolved policies, by action kind.
    ///
    /// Labels:
    /// - action: allow, allow_if, deny, kill, kill_thread, trap, log
    pub static ref POLICY_RULES: IntCounterVec = register_int_counter_vec!(
        "seccomp_policy_rules_total",
        "Rules in resolved policies by action kind",
        &["action"]
    ).expect("failed to register POLICY_RULES metric");

    // ─────────────────────────────────────────────────────────────────────────────
    // Filter Metrics
    // ─────────────────────────────────────────────────────────────────────────────

    /// Length of the most recently compiled program.
    pub static ref FILTER_INSTRUCTIONS: IntGauge = register_int_gauge!(
        "seccomp_filter_instructions",
        "BPF instructions in the most recently compiled filter"
    ).expect("failed to register FILTER_INSTRUCTIONS metric");

    /// Install attempts.
    ///
    /// Labels:
    /// - scope: current_thread or all_threads
    /// - outcome: installed or failed
    pub static ref FILTER_INSTALLS: IntCounterVec = register_int_counter_vec!(
        "seccomp_filter_installs_total",
        "Seccomp filter install attempts",
        &["scope", "outcome"]
    ).expect("failed to register FILTER_INSTALLS metric");
}

/// Text exposition of every registered metric.
pub fn render() -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| PolicyError::Config(format!("failed to encode metrics: {}", e)))?;
    String::from_utf8(buffer)
        .map_err(|e| PolicyError::Config(format!("metrics output is not UTF-8: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_registered_metrics() {
        POLICY_FILES_LOADED.inc();
        POLICY_RULES.with_label_values(&["allow"]).inc();
        FILTER_INSTRUCTIONS.set(12);

        let text = render().unwrap();
        assert!(text.contains("seccomp_policy_files_loaded_total"));
        assert!(text.contains("seccomp_policy_rules_total{action=\"allow\"}"));
        assert!(text.contains("seccomp_filter_instructions"));
    }
}
