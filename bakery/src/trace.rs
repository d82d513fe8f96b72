//! Logging setup shared by every bakery process.

use tracing::Span;

/// Installs the stderr subscriber. `RUST_LOG` overrides the default
/// `bakery=info` filter. A second call is a no-op.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("bakery=info,bakery_sim=info"));

    let _ = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(fmt::time::uptime()),
        )
        .with(filter)
        .try_init();
}

/// Root span tagging every line a process logs with its role and pid.
pub fn role_span(role: &str) -> Span {
    tracing::info_span!("proc", role, pid = std::process::id())
}
