//! Shared on-disk route table: `hostname -> {port, pid}`, guarded by a directory-creation mutex
//! so that multiple independent CLI invocations and the daemon can mutate it safely.

use std::path::Path;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PortlessError;
use crate::state::StateDir;

const LOCK_RETRIES: u32 = 20;
const LOCK_BACKOFF: Duration = Duration::from_millis(50);
const LOCK_STALE_AFTER: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Route {
	pub hostname: String,
	pub port: u16,
	pub pid: i32,
}

pub struct RouteStore<'a> {
	state: &'a StateDir,
}

impl<'a> RouteStore<'a> {
	pub fn new(state: &'a StateDir) -> Self {
		RouteStore { state }
	}

	/// Reads the route table without locking. Drops entries that fail schema validation; a
	/// missing or non-array file is treated as an empty table (with a warning for the latter).
	pub fn load(&self) -> Vec<Route> {
		let path = self.state.routes_file();
		let bytes = match std::fs::read(&path) {
			Ok(b) => b,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
			Err(e) => {
				warn!("failed to read route file {path:?}: {e}");
				return Vec::new();
			},
		};
		let value: serde_json::Value = match serde_json::from_slice(&bytes) {
			Ok(v) => v,
			Err(e) => {
				warn!("route file {path:?} is not valid JSON, treating as empty: {e}");
				return Vec::new();
			},
		};
		let Some(entries) = value.as_array() else {
			warn!("route file {path:?} did not contain a JSON array, treating as empty");
			return Vec::new();
		};
		entries
			.iter()
			.filter_map(|entry| match serde_json::from_value::<Route>(entry.clone()) {
				Ok(route) => Some(route),
				Err(e) => {
					warn!("dropping malformed route entry: {e}");
					None
				},
			})
			.collect()
	}

	/// Like `load`, but drops any entry whose owning process is no longer alive. This does not
	/// persist the filtered result; only `add`/`remove` write back to disk, while holding the lock.
	pub fn load_and_gc(&self) -> Vec<Route> {
		self
			.load()
			.into_iter()
			.filter(|r| process_alive(r.pid))
			.collect()
	}

	/// Registers (or replaces) a route under the lock. Fails with `RouteConflict` if a different,
	/// still-live process already owns `hostname` and `force` is false.
	pub fn add(&self, hostname: &str, port: u16, pid: i32, force: bool) -> Result<(), PortlessError> {
		let _guard = RouteLock::acquire(self.state)?;
		let mut routes = self.load_and_gc();
		if let Some(existing) = routes.iter().find(|r| r.hostname == hostname) {
			if existing.pid != pid && !force {
				return Err(PortlessError::RouteConflict {
					hostname: hostname.to_string(),
					incumbent_pid: existing.pid,
				});
			}
		}
		routes.retain(|r| r.hostname != hostname);
		routes.push(Route {
			hostname: hostname.to_string(),
			port,
			pid,
		});
		self.persist(&routes)
	}

	/// Removes a route under the lock. Missing entries are a no-op.
	pub fn remove(&self, hostname: &str) -> Result<(), PortlessError> {
		let _guard = RouteLock::acquire(self.state)?;
		let mut routes = self.load_and_gc();
		routes.retain(|r| r.hostname != hostname);
		self.persist(&routes)
	}

	fn persist(&self, routes: &[Route]) -> Result<(), PortlessError> {
		let path = self.state.routes_file();
		let json = serde_json::to_vec_pretty(routes)?;
		std::fs::write(&path, json)?;
		#[cfg(unix)]
		{
			use std::os::unix::fs::PermissionsExt;
			let mode = if self.state.root().starts_with("/tmp/portless") {
				0o666
			} else {
				0o644
			};
			if let Ok(meta) = std::fs::metadata(&path) {
				let mut perms = meta.permissions();
				perms.set_mode(mode);
				let _ = std::fs::set_permissions(&path, perms);
			}
		}
		Ok(())
	}
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
	nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
	true
}

/// An exclusive, inter-process mutex implemented as atomic directory creation: `mkdir` either
/// succeeds (we hold the lock) or fails with `AlreadyExists` (someone else holds it). Stale
/// locks (older than `LOCK_STALE_AFTER`) are broken before the next retry.
struct RouteLock<'a> {
	path: std::path::PathBuf,
	_marker: std::marker::PhantomData<&'a ()>,
}

impl<'a> RouteLock<'a> {
	fn acquire(state: &'a StateDir) -> Result<Self, PortlessError> {
		let path = state.lock_dir();
		for attempt in 0..LOCK_RETRIES {
			match std::fs::create_dir(&path) {
				Ok(()) => {
					return Ok(RouteLock {
						path,
						_marker: std::marker::PhantomData,
					});
				},
				Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
					break_if_stale(&path);
					if attempt + 1 < LOCK_RETRIES {
						std::thread::sleep(LOCK_BACKOFF);
					}
				},
				Err(e) => return Err(PortlessError::Io(e)),
			}
		}
		Err(PortlessError::LockTimeout)
	}
}

impl<'a> Drop for RouteLock<'a> {
	fn drop(&mut self) {
		let _ = std::fs::remove_dir(&self.path);
	}
}

fn break_if_stale(path: &Path) {
	let Ok(meta) = std::fs::metadata(path) else {
		return;
	};
	let Ok(modified) = meta.modified() else {
		return;
	};
	if let Ok(age) = SystemTime::now().duration_since(modified) {
		if age > LOCK_STALE_AFTER {
			warn!("breaking stale route lock at {path:?} (age {age:?})");
			let _ = std::fs::remove_dir(path);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn state(dir: &tempfile::TempDir) -> StateDir {
		StateDir::from_path(dir.path().to_path_buf())
	}

	#[test]
	fn load_missing_file_is_empty() {
		let dir = tempfile::tempdir().unwrap();
		let state = state(&dir);
		assert!(RouteStore::new(&state).load().is_empty());
	}

	#[test]
	fn load_corrupt_file_is_empty_with_warning() {
		let dir = tempfile::tempdir().unwrap();
		let state = state(&dir);
		std::fs::write(state.routes_file(), b"not json").unwrap();
		assert!(RouteStore::new(&state).load().is_empty());
	}

	#[test]
	fn load_non_array_is_empty() {
		let dir = tempfile::tempdir().unwrap();
		let state = state(&dir);
		std::fs::write(state.routes_file(), b"{\"a\":1}").unwrap();
		assert!(RouteStore::new(&state).load().is_empty());
	}

	#[test]
	fn load_drops_malformed_entries() {
		let dir = tempfile::tempdir().unwrap();
		let state = state(&dir);
		std::fs::write(
			state.routes_file(),
			br#"[{"hostname":"ok.localhost","port":4000,"pid":1},{"bogus":true}]"#,
		)
		.unwrap();
		let routes = RouteStore::new(&state).load();
		assert_eq!(routes.len(), 1);
		assert_eq!(routes[0].hostname, "ok.localhost");
	}

	#[test]
	fn add_then_load_roundtrips() {
		let dir = tempfile::tempdir().unwrap();
		let state = state(&dir);
		let store = RouteStore::new(&state);
		store.add("chat.localhost", 4001, std::process::id() as i32, false).unwrap();
		let routes = store.load();
		assert_eq!(routes.len(), 1);
		assert_eq!(routes[0].hostname, "chat.localhost");
		assert_eq!(routes[0].port, 4001);
	}

	#[test]
	fn add_conflict_without_force_fails() {
		let dir = tempfile::tempdir().unwrap();
		let state = state(&dir);
		let store = RouteStore::new(&state);
		store.add("chat.localhost", 4001, std::process::id() as i32, false).unwrap();
		// A pid that is not our own and (almost certainly) not alive would be GC'd; use our own
		// pid but a different hostname entry to simulate a live incumbent deterministically by
		// forging a second add under the same still-alive pid, expecting it to replace, not
		// conflict, when the pid matches.
		let err = store.add("chat.localhost", 4002, 999_999, false).unwrap_err();
		match err {
			PortlessError::RouteConflict { .. } => {},
			// If pid 999_999 happens to be a dead/nonexistent process (overwhelmingly likely in
			// CI), GC will have removed the old entry before the conflict check runs, in which
			// case the add succeeds instead. Either outcome demonstrates the conflict path is
			// gated on a genuinely live incumbent.
			_ => panic!("unexpected error: {err}"),
		}
	}

	#[test]
	fn add_same_pid_replaces_without_force() {
		let dir = tempfile::tempdir().unwrap();
		let state = state(&dir);
		let store = RouteStore::new(&state);
		let pid = std::process::id() as i32;
		store.add("chat.localhost", 4001, pid, false).unwrap();
		store.add("chat.localhost", 4002, pid, false).unwrap();
		let routes = store.load();
		assert_eq!(routes.len(), 1);
		assert_eq!(routes[0].port, 4002);
	}

	#[test]
	fn remove_drops_entry() {
		let dir = tempfile::tempdir().unwrap();
		let state = state(&dir);
		let store = RouteStore::new(&state);
		let pid = std::process::id() as i32;
		store.add("chat.localhost", 4001, pid, false).unwrap();
		store.remove("chat.localhost").unwrap();
		assert!(store.load().is_empty());
	}

	#[test]
	fn dead_pid_is_garbage_collected() {
		let dir = tempfile::tempdir().unwrap();
		let state = state(&dir);
		let store = RouteStore::new(&state);
		// pid 1 on most systems is init and alive, but a very large, almost-certainly-unused pid
		// simulates a dead process for GC purposes in a CI sandbox.
		store.add("dead.localhost", 4001, 999_999, true).unwrap();
		let live = store.load_and_gc();
		assert!(live.iter().all(|r| r.hostname != "dead.localhost") || process_alive(999_999));
	}

	#[test]
	fn stale_lock_is_broken() {
		let dir = tempfile::tempdir().unwrap();
		let state = state(&dir);
		std::fs::create_dir(state.lock_dir()).unwrap();
		let old = SystemTime::now() - Duration::from_secs(60);
		let old_time = filetime::FileTime::from_system_time(old);
		filetime::set_file_mtime(state.lock_dir(), old_time).unwrap();
		// Acquiring should succeed quickly once the stale lock is broken, rather than exhausting
		// all retries.
		let store = RouteStore::new(&state);
		store.add("chat.localhost", 4001, std::process::id() as i32, false).unwrap();
	}
}
