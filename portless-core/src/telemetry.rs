use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Dropping this flushes any buffered log output. Held for the lifetime of `main`.
pub struct LoggingGuard {
	_appender_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

/// Initializes the global tracing subscriber from `RUST_LOG` (default `info`).
///
/// Mirrors the setup used by other binaries in this workspace: a single call near the top of
/// `main` wires human-readable, env-filtered logging for the whole process.
pub fn setup_logging() -> LoggingGuard {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

	let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
	let fmt_layer = tracing_subscriber::fmt::layer()
		.with_writer(writer)
		.with_target(false);

	let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);
	if registry.try_init().is_err() {
		// Already initialized (e.g. in tests); not fatal.
	}

	LoggingGuard {
		_appender_guard: Some(guard),
	}
}
