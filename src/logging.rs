//! Installs the global `tracing` subscriber.

use tracing_subscriber::EnvFilter;

/// Logs to stderr, filtered by `RUST_LOG` if it is set and by `default_level` otherwise.
///
/// Only binaries should call this. Calling it twice keeps the first subscriber.
pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_harmless() {
        init("debug");
        init("not a valid filter ===");
        tracing::info!("still logging");
    }
}
