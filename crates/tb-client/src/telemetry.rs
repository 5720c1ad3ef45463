//! Tracing setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a global fmt subscriber filtered by `RUST_LOG`, or `default_level`
/// when it is unset.
///
/// Returns `false` if a global subscriber was already installed; the existing
/// one is kept.
pub fn init_tracing(default_level: &str) -> bool {
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}

/// Subscriber writing through the test harness capture
#[cfg(test)]
pub(crate) fn init_test_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;

    #[test]
    fn test_second_install_keeps_first() {
        // Another test may already have installed one.
        let _ = ClientConfig::default().init_tracing();
        assert!(!init_tracing("debug"));
        tracing::info!(check = true, "subscriber installed");
    }
}
