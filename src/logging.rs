use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Default filter when RUST_LOG is not set
pub const DEFAULT_DIRECTIVE: &str = "operator_expenses=info";

/// Initializes console logging for both binaries.
///
/// `RUST_LOG` takes precedence; otherwise the crate logs at info.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    let console_layer = fmt::layer().with_target(false).with_writer(std::io::stdout);

    // try_init so tests and embedding callers can install their own subscriber
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .try_init();
}
