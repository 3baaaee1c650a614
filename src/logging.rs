//! Structured logging setup
//!
//! Pipeline stages emit `tracing` events (`debug!` per file, `info!` per
//! resolved/compiled/installed filter). This module installs the
//! subscriber that prints them to stderr, either human-readable or as one
//! JSON object per line.
//!
//! ```text
//! parser/resolver/compiler/installer ──events──► EnvFilter ──► fmt (stderr)
//!                                                   ▲
//!                                      RUST_LOG overrides the default
//! ```

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,seccomp_policy=debug";

/// Initialize the global subscriber.
///
/// Returns an error if a global subscriber is already set.
///
/// # Example
/// ```ignore
/// seccomp_policy::logging::init_logging(false)?;
/// ```
pub fn init_logging(json: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()?;
    }

    tracing::debug!(json, "logging initialized");
    Ok(())
}
