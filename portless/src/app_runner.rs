//! Allocates a backend port, registers a route, and runs the user's dev command under it,
//! deregistering on exit.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;

use rand::Rng;
use tracing::{info, warn};

use crate::config::Config;
use crate::daemon;
use crate::error::PortlessError;
use crate::hostname;
use crate::route_store::RouteStore;

/// Runs `<name> <cmd> [args...]`: ensures a daemon, allocates a port, registers the route, spawns
/// the command, and deregisters on exit. Returns the child's effective process exit code.
pub async fn run(cfg: &Config, name: &str, command: &[String], force: bool) -> anyhow::Result<i32> {
	let hostname = hostname::normalize(name)?;

	if command.is_empty() {
		anyhow::bail!("no command given to run for '{name}'");
	}

	if crate::config::bypass_requested() {
		info!("BYPASS set, running command directly without portless");
		return exec_passthrough(command).await;
	}

	let location = daemon::ensure_running(cfg).await?;
	daemon::wait_until_ready(location.port).await?;

	let port = allocate_free_port(cfg.backend_port_range)?;
	let pid = std::process::id() as i32;

	let state = location.state.clone();
	let store = RouteStore::new(&state);
	store.add(&hostname, port, pid, force)?;

	info!(
		url = %hostname::display_url(&hostname, location.port, location.https),
		backend_port = port,
		"registered route"
	);

	let result = spawn_and_wait(command, port).await;

	if let Err(e) = store.remove(&hostname) {
		warn!("failed to deregister route for {hostname}: {e}");
	}

	result
}

/// Picks a free port in `range`: tries random candidates first (to narrow the window against a
/// concurrent registrant), then scans sequentially, returning the first that actually binds.
fn allocate_free_port((low, high): (u16, u16)) -> Result<u16, PortlessError> {
	let mut rng = rand::rng();
	let mut tried = HashSet::new();
	for _ in 0..50 {
		let candidate = rng.random_range(low..=high);
		if tried.insert(candidate) && port_is_free(candidate) {
			return Ok(candidate);
		}
	}
	for candidate in low..=high {
		if !tried.contains(&candidate) && port_is_free(candidate) {
			return Ok(candidate);
		}
	}
	Err(PortlessError::NoFreePort(low, high))
}

fn port_is_free(port: u16) -> bool {
	let addr: SocketAddr = ([127, 0, 0, 1], port).into();
	std::net::TcpListener::bind(addr).is_ok()
}

/// Spawns `command` under `/bin/sh -c`, with `node_modules/.bin` directories prepended to
/// `PATH` (nearest-first, walking up from the current directory) and `PORT` exported.
async fn spawn_and_wait(command: &[String], port: u16) -> anyhow::Result<i32> {
	let shell_command = shell_escape_join(command);
	let mut cmd = tokio::process::Command::new("/bin/sh");
	cmd.arg("-c").arg(&shell_command);
	cmd.env("PORT", port.to_string());
	cmd.env("PATH", build_path_with_bin_dirs());
	cmd.kill_on_drop(true);

	let mut child = cmd.spawn()?;

	#[cfg(unix)]
	{
		let child_pid = child.id().map(|p| p as i32);
		let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
		let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
		tokio::select! {
			status = child.wait() => {
				return Ok(exit_code_of(status?));
			}
			_ = sigterm.recv() => {
				if let Some(pid) = child_pid {
					let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGTERM);
				}
			}
			_ = sigint.recv() => {
				if let Some(pid) = child_pid {
					let _ = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::Signal::SIGINT);
				}
			}
		}
	}

	let status = child.wait().await?;
	Ok(exit_code_of(status))
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
	match status.code() {
		Some(code) => code,
		None => status.signal().map(|sig| 128 + sig).unwrap_or(1),
	}
}

async fn exec_passthrough(command: &[String]) -> anyhow::Result<i32> {
	let shell_command = shell_escape_join(command);
	let status = tokio::process::Command::new("/bin/sh").arg("-c").arg(&shell_command).status().await?;
	Ok(exit_code_of(status))
}

fn shell_escape_join(command: &[String]) -> String {
	command.iter().map(|arg| shell_escape(arg)).collect::<Vec<_>>().join(" ")
}

fn shell_escape(arg: &str) -> String {
	if arg.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=')) {
		arg.to_string()
	} else {
		format!("'{}'", arg.replace('\'', "'\\''"))
	}
}

/// Walks up from the current directory collecting every `node_modules/.bin` found, nearest
/// first, and prepends them to the current `PATH`.
fn build_path_with_bin_dirs() -> String {
	let mut bin_dirs: Vec<PathBuf> = Vec::new();
	if let Ok(mut dir) = std::env::current_dir() {
		loop {
			let candidate = dir.join("node_modules").join(".bin");
			if candidate.is_dir() {
				bin_dirs.push(candidate);
			}
			if !dir.pop() {
				break;
			}
		}
	}
	let existing = std::env::var("PATH").unwrap_or_default();
	let mut parts: Vec<String> = bin_dirs.into_iter().map(|p| p.display().to_string()).collect();
	parts.push(existing);
	parts.join(":")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn shell_escape_passes_simple_tokens_through() {
		assert_eq!(shell_escape("npm"), "npm");
		assert_eq!(shell_escape("run"), "run");
		assert_eq!(shell_escape("./script.sh"), "./script.sh");
	}

	#[test]
	fn shell_escape_quotes_special_chars() {
		assert_eq!(shell_escape("hello world"), "'hello world'");
		assert_eq!(shell_escape("it's"), "'it'\\''s'");
	}

	#[test]
	fn allocate_free_port_returns_port_in_range() {
		let port = allocate_free_port((4000, 4999)).unwrap();
		assert!((4000..=4999).contains(&port));
	}

	#[test]
	fn exit_code_of_signal_death_adds_128() {
		let status = std::process::ExitStatus::from_raw(15); // SIGTERM, low byte encodes signal
		assert_eq!(exit_code_of(status), 128 + 15);
	}
}
