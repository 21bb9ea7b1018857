use tracing_subscriber::{prelude::*, EnvFilter};

/// Installs the stderr subscriber. `RUST_LOG` wins over the default filter.
pub fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(verbose)
        .with_ansi(false);

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}
