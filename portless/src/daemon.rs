//! Daemon lifecycle: discovery, foreground/background start, stop, and the live route cache
//! that the proxy engine reads from on every request.

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use hyper::client::conn::http1;
use hyper::Request;
use hyper_util::rt::TokioIo;
use notify::{RecursiveMode, Watcher};
use portless_core::{drain, signal};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::cert::CertManager;
use crate::config::Config;
use crate::error::PortlessError;
use crate::proxy::engine::{ProxyEngine, RouteLookup};
use crate::proxy::tls_listener;
use crate::route_store::{Route, RouteStore};
use crate::state::StateDir;

const IDENTITY_HEADER_VALUE: &str = "1";
const WATCH_DEBOUNCE: Duration = Duration::from_millis(100);
const WATCH_POLL_FALLBACK: Duration = Duration::from_secs(3);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
const READY_POLL_ATTEMPTS: u32 = 50;
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The daemon's in-memory view of the route table, refreshed by the file watcher. The proxy
/// engine reads this on every request; it never touches disk directly.
pub struct LiveRoutes {
	routes: RwLock<Vec<Route>>,
}

impl LiveRoutes {
	fn new(initial: Vec<Route>) -> Arc<Self> {
		Arc::new(LiveRoutes {
			routes: RwLock::new(initial),
		})
	}

	fn replace(&self, routes: Vec<Route>) {
		*self.routes.write().expect("route cache lock poisoned") = routes;
	}
}

impl RouteLookup for LiveRoutes {
	fn find(&self, hostname: &str) -> Option<Route> {
		self
			.routes
			.read()
			.expect("route cache lock poisoned")
			.iter()
			.find(|r| r.hostname == hostname)
			.cloned()
	}

	fn all(&self) -> Vec<Route> {
		self.routes.read().expect("route cache lock poisoned").clone()
	}
}

/// Where a running daemon (if any) can be found.
#[derive(Debug, Clone)]
pub struct DaemonLocation {
	pub port: u16,
	pub https: bool,
	pub state: StateDir,
}

/// Probes the per-user root then the system root (unless an override is set) for a daemon that
/// actually answers `HEAD /` with `X-Portless: 1`.
pub async fn discover(cfg: &Config) -> Option<DaemonLocation> {
	if cfg.state_dir_override.is_some() {
		let state = StateDir::resolve(cfg);
		return probe(state).await;
	}
	let mut user_cfg = cfg.clone();
	user_cfg.proxy_port = 9000; // ensure is_privileged() is false for siting purposes
	if let Some(loc) = probe(StateDir::resolve(&user_cfg)).await {
		return Some(loc);
	}
	let mut system_cfg = cfg.clone();
	system_cfg.proxy_port = 443; // ensure is_privileged() is true for siting purposes
	probe(StateDir::resolve(&system_cfg)).await
}

async fn probe(state: StateDir) -> Option<DaemonLocation> {
	let port: u16 = std::fs::read_to_string(state.port_file()).ok()?.trim().parse().ok()?;
	let https = state.tls_marker_file().exists();
	if verify_is_portless(port).await {
		Some(DaemonLocation { port, https, state })
	} else {
		None
	}
}

/// Sends an HTTP HEAD to `127.0.0.1:<port>` and checks for the `X-Portless: 1` marker, to
/// distinguish our proxy from any other coincidental listener on that port.
pub async fn verify_is_portless(port: u16) -> bool {
	let addr: SocketAddr = ([127, 0, 0, 1], port).into();
	let Ok(stream) = tokio::time::timeout(Duration::from_millis(500), TcpStream::connect(addr)).await else {
		return false;
	};
	let Ok(stream) = stream else {
		return false;
	};
	let io = TokioIo::new(stream);
	let Ok((mut sender, conn)) = http1::handshake(io).await else {
		return false;
	};
	tokio::spawn(async move {
		let _ = conn.await;
	});
	let req = Request::builder()
		.method("HEAD")
		.uri("/")
		.header("host", "localhost")
		.body(http_body_util::Empty::<Bytes>::new())
		.expect("well-formed request");
	let Ok(resp) = sender.send_request(req).await else {
		return false;
	};
	resp
		.headers()
		.get("x-portless")
		.and_then(|v| v.to_str().ok())
		.map(|v| v == IDENTITY_HEADER_VALUE)
		.unwrap_or(false)
}

/// Polls `discover`-equivalent readiness until the daemon at `port` answers, or gives up.
pub async fn wait_until_ready(port: u16) -> Result<(), PortlessError> {
	for _ in 0..READY_POLL_ATTEMPTS {
		if verify_is_portless(port).await {
			return Ok(());
		}
		tokio::time::sleep(READY_POLL_INTERVAL).await;
	}
	Err(PortlessError::DaemonNotReady(format!(
		"proxy did not start listening on port {port} in time"
	)))
}

/// Runs the daemon in the foreground: binds the listener, writes the pid/port/TLS-marker files,
/// watches the route file, and serves until a shutdown signal arrives.
pub async fn run_foreground(cfg: Config) -> anyhow::Result<()> {
	let state = StateDir::resolve(&cfg);
	state.ensure(cfg.is_privileged())?;

	let listener = bind_listener(cfg.proxy_port).await?;
	let bound_port = listener.local_addr()?.port();

	std::fs::write(state.pid_file(), std::process::id().to_string())?;
	std::fs::write(state.port_file(), bound_port.to_string())?;
	if cfg.https {
		std::fs::write(state.tls_marker_file(), "")?;
	} else {
		let _ = std::fs::remove_file(state.tls_marker_file());
	}

	let cert_manager = if cfg.https {
		Some(CertManager::ensure(&state, cfg.cert_override.as_deref(), cfg.key_override.as_deref())?)
	} else {
		None
	};

	let store = RouteStore::new(&state);
	let live = LiveRoutes::new(store.load_and_gc());
	let engine = Arc::new(ProxyEngine {
		route_lookup: live.clone(),
		https: cfg.https,
		proxy_port: bound_port,
	});

	let shutdown = signal::Shutdown::new();
	let (drain_tx, drain_rx) = drain::new();

	let watcher_handle = spawn_route_watcher(state.clone(), live.clone());

	info!(port = bound_port, https = cfg.https, "proxy listening");
	let serve_drain = drain_rx.clone();
	let serve_task = tokio::spawn(async move {
		let accept = |_drain, _force_shutdown| async move {
			tls_listener::serve(listener, engine, cert_manager).await;
		};
		drain::run_with_drain("proxy listener".to_string(), serve_drain, SHUTDOWN_GRACE, accept).await;
	});

	shutdown.wait().await;
	info!("shutdown requested, draining");
	watcher_handle.abort();
	drain_tx.start_drain_and_wait(drain::DrainMode::Graceful).await;
	serve_task.abort();

	let _ = std::fs::remove_file(state.pid_file());
	let _ = std::fs::remove_file(state.port_file());
	let _ = std::fs::remove_file(state.tls_marker_file());

	Ok(())
}

async fn bind_listener(port: u16) -> Result<TcpListener, PortlessError> {
	let addr: SocketAddr = ([0, 0, 0, 0], port).into();
	TcpListener::bind(addr).await.map_err(|e| match e.kind() {
		std::io::ErrorKind::AddrInUse => PortlessError::PortInUse(port),
		std::io::ErrorKind::PermissionDenied => PortlessError::PermissionDenied(port),
		_ => PortlessError::Io(e),
	})
}

/// Watches the route file for changes (debounced) with a periodic poll as a fallback, and keeps
/// `live` in sync.
fn spawn_route_watcher(state: StateDir, live: Arc<LiveRoutes>) -> tokio::task::JoinHandle<()> {
	tokio::spawn(async move {
		let (tx, mut rx) = tokio::sync::mpsc::channel(16);
		let watch_path = state.routes_file();
		let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
			if res.is_ok() {
				let _ = tx.try_send(());
			}
		});
		let mut watcher = match watcher {
			Ok(w) => Some(w),
			Err(e) => {
				warn!("failed to start route file watcher, falling back to polling only: {e}");
				None
			},
		};
		if let Some(w) = watcher.as_mut() {
			if let Some(parent) = watch_path.parent() {
				if let Err(e) = w.watch(parent, RecursiveMode::NonRecursive) {
					warn!("failed to watch route directory: {e}");
				}
			}
		}

		let store = RouteStore::new(&state);
		loop {
			let refresh = tokio::time::timeout(WATCH_POLL_FALLBACK, rx.recv()).await;
			match refresh {
				Ok(Some(())) => {
					tokio::time::sleep(WATCH_DEBOUNCE).await;
					while rx.try_recv().is_ok() {}
				},
				Ok(None) => break,
				Err(_) => {},
			}
			let routes = store.load_and_gc();
			debug!(count = routes.len(), "reloaded route table");
			live.replace(routes);
		}
	})
}

/// Stops a running daemon by signaling its pid, or removes stale lifecycle files if the pid is
/// dead / the port is no longer serving portless.
pub async fn stop(cfg: &Config) -> anyhow::Result<()> {
	let state = StateDir::resolve(cfg);
	let pid_path = state.pid_file();
	let Ok(pid_str) = std::fs::read_to_string(&pid_path) else {
		info!("no running daemon found");
		return Ok(());
	};
	let Ok(pid) = pid_str.trim().parse::<i32>() else {
		let _ = std::fs::remove_file(&pid_path);
		return Ok(());
	};

	let port: Option<u16> = std::fs::read_to_string(state.port_file()).ok().and_then(|s| s.trim().parse().ok());
	let actually_running = match port {
		Some(p) => verify_is_portless(p).await,
		None => false,
	};

	#[cfg(unix)]
	{
		if actually_running {
			info!(pid, "stopping proxy daemon");
			let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM);
		} else {
			warn!("pid file is stale, removing lifecycle files");
			let _ = std::fs::remove_file(&pid_path);
			let _ = std::fs::remove_file(state.port_file());
			let _ = std::fs::remove_file(state.tls_marker_file());
		}
	}
	Ok(())
}

/// Forks the current executable into foreground mode, detached with stdio redirected to the
/// state directory's log file, then polls until it is ready.
pub async fn start_detached(cfg: &Config) -> anyhow::Result<DaemonLocation> {
	let state = StateDir::resolve(cfg);
	state.ensure(cfg.is_privileged())?;

	let exe = std::env::current_exe()?;
	let log_path = state.log_file();
	let log_file = std::fs::OpenOptions::new().create(true).append(true).open(&log_path)?;
	let log_file_err = log_file.try_clone()?;

	let mut command = std::process::Command::new(exe);
	command.arg("proxy").arg("start").arg("--foreground").arg("--port").arg(cfg.proxy_port.to_string());
	if cfg.https {
		command.arg("--https");
	}
	if let Some(dir) = &cfg.state_dir_override {
		command.arg("--state-dir").arg(dir);
	}
	command.stdin(std::process::Stdio::null());
	command.stdout(log_file);
	command.stderr(log_file_err);

	#[cfg(unix)]
	unsafe {
		use std::os::unix::process::CommandExt;
		command.pre_exec(|| {
			nix::unistd::setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
			Ok(())
		});
	}

	command.spawn().map_err(PortlessError::Io)?;

	wait_until_ready(cfg.proxy_port).await.map_err(|e| {
		anyhow::anyhow!("{e}; see log at {}", log_path.display())
	})?;

	Ok(DaemonLocation {
		port: cfg.proxy_port,
		https: cfg.https,
		state,
	})
}

/// Ensures a daemon is running and reachable, starting one if necessary. Starting on a
/// privileged port when a daemon must be started from scratch goes through `start_privileged`
/// instead of a silent direct start.
pub async fn ensure_running(cfg: &Config) -> anyhow::Result<DaemonLocation> {
	if let Some(loc) = discover(cfg).await {
		return Ok(loc);
	}
	if cfg.is_privileged() {
		return start_privileged(cfg).await;
	}
	info!("no proxy daemon found, starting one");
	start_detached(cfg).await
}

/// Starts the daemon on a privileged port: directly if already root, otherwise prompting for
/// `sudo` on a terminal or failing with a clear message when there is none to prompt on (§4.6).
#[cfg(unix)]
async fn start_privileged(cfg: &Config) -> anyhow::Result<DaemonLocation> {
	if nix::unistd::Uid::effective().is_root() {
		info!("no proxy daemon found, starting one");
		return start_detached(cfg).await;
	}
	if !(std::io::stdin().is_terminal() && std::io::stdout().is_terminal()) {
		anyhow::bail!(
			"port {} is privileged and no proxy daemon is running; re-run as root, or attach a \
			 terminal so portless can prompt for sudo",
			cfg.proxy_port
		);
	}
	info!(port = cfg.proxy_port, "privileged port requires sudo to bind, prompting");
	start_detached_with_sudo(cfg).await
}

#[cfg(not(unix))]
async fn start_privileged(cfg: &Config) -> anyhow::Result<DaemonLocation> {
	anyhow::bail!("starting the proxy on privileged port {} is not supported on this platform", cfg.proxy_port)
}

/// Like `start_detached`, but re-execs under `sudo`, leaving stdin/the controlling terminal
/// attached so `sudo` itself can prompt for a password.
#[cfg(unix)]
async fn start_detached_with_sudo(cfg: &Config) -> anyhow::Result<DaemonLocation> {
	let state = StateDir::resolve(cfg);
	state.ensure(true)?;

	let exe = std::env::current_exe()?;
	let log_path = state.log_file();
	let log_file = std::fs::OpenOptions::new().create(true).append(true).open(&log_path)?;
	let log_file_err = log_file.try_clone()?;

	let mut command = std::process::Command::new("sudo");
	command.arg(&exe).arg("proxy").arg("start").arg("--foreground").arg("--port").arg(cfg.proxy_port.to_string());
	if cfg.https {
		command.arg("--https");
	}
	if let Some(dir) = &cfg.state_dir_override {
		command.arg("--state-dir").arg(dir);
	}
	command.stdout(log_file);
	command.stderr(log_file_err);

	command.spawn().map_err(PortlessError::Io)?;

	wait_until_ready(cfg.proxy_port).await.map_err(|e| anyhow::anyhow!("{e}; see log at {}", log_path.display()))?;

	Ok(DaemonLocation {
		port: cfg.proxy_port,
		https: cfg.https,
		state,
	})
}

pub fn log_path_hint(state: &StateDir) -> String {
	state.log_file().display().to_string()
}
