use thiserror::Error;

/// Domain errors raised across the route store, certificate manager, and daemon lifecycle.
///
/// Request-path failures are caught at the proxy boundary and turned into HTTP responses; they
/// never propagate past `ProxyEngine::handle`. Startup and CLI errors bubble up to `main` as
/// `anyhow::Error` and are printed with a non-zero exit code.
#[derive(Error, Debug)]
pub enum PortlessError {
	#[error("invalid hostname '{0}': {1}")]
	InvalidHostname(String, &'static str),

	#[error("'{hostname}' is already running (pid {incumbent_pid}); pass --force to take it over")]
	RouteConflict { hostname: String, incumbent_pid: i32 },

	#[error("timed out waiting for the route lock")]
	LockTimeout,

	#[error("failed to generate certificate: {0}")]
	CertGeneration(String),

	#[error("port {0} is already in use")]
	PortInUse(u16),

	#[error("permission denied binding port {0}")]
	PermissionDenied(u16),

	#[error("no free backend port available in {0}..{1}")]
	NoFreePort(u16, u16),

	#[error("daemon did not become ready: {0}")]
	DaemonNotReady(String),

	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Json(#[from] serde_json::Error),
}

impl PortlessError {
	/// Exit code used when this error terminates the CLI process.
	pub fn exit_code(&self) -> i32 {
		match self {
			PortlessError::PortInUse(_) | PortlessError::PermissionDenied(_) => 1,
			_ => 1,
		}
	}
}
