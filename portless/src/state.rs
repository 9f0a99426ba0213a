use std::path::{Path, PathBuf};

use crate::config::Config;

/// Resolves and owns the filesystem layout for a single proxy instance: the route table, the
/// lock directory, the pid/port/TLS-marker files, the log file, and the certificate tree.
///
/// Siting rule: an explicit override always wins; otherwise privileged ports (< 1024) use a
/// shared system root so both root and non-root processes can reach the route file, and
/// unprivileged ports use a per-user root.
#[derive(Debug, Clone)]
pub struct StateDir {
	root: PathBuf,
}

const SYSTEM_ROOT: &str = "/tmp/portless";

impl StateDir {
	pub fn resolve(cfg: &Config) -> Self {
		let root = if let Some(dir) = &cfg.state_dir_override {
			dir.clone()
		} else if cfg.is_privileged() {
			PathBuf::from(SYSTEM_ROOT)
		} else {
			user_root()
		};
		StateDir { root }
	}

	pub fn from_path(root: PathBuf) -> Self {
		StateDir { root }
	}

	pub fn root(&self) -> &Path {
		&self.root
	}

	pub fn routes_file(&self) -> PathBuf {
		self.root.join("routes.json")
	}

	pub fn lock_dir(&self) -> PathBuf {
		self.root.join("routes.lock")
	}

	pub fn port_file(&self) -> PathBuf {
		self.root.join("proxy.port")
	}

	pub fn pid_file(&self) -> PathBuf {
		self.root.join("proxy.pid")
	}

	pub fn tls_marker_file(&self) -> PathBuf {
		self.root.join("proxy.tls")
	}

	pub fn log_file(&self) -> PathBuf {
		self.root.join("proxy.log")
	}

	pub fn cert_dir(&self) -> PathBuf {
		self.root.join("certs")
	}

	pub fn host_cert_dir(&self) -> PathBuf {
		self.cert_dir().join("host-certs")
	}

	/// Creates the state directory tree, applying the world-writable sticky mode when this is
	/// the shared system root so non-root registrants can write the route file.
	pub fn ensure(&self, system_wide: bool) -> std::io::Result<()> {
		std::fs::create_dir_all(&self.root)?;
		std::fs::create_dir_all(self.host_cert_dir())?;
		#[cfg(unix)]
		if system_wide {
			use std::os::unix::fs::PermissionsExt;
			let mut perms = std::fs::metadata(&self.root)?.permissions();
			perms.set_mode(0o1777);
			std::fs::set_permissions(&self.root, perms)?;
		}
		Ok(())
	}
}

#[cfg(unix)]
fn user_root() -> PathBuf {
	let home = std::env::var_os("HOME")
		.map(PathBuf::from)
		.unwrap_or_else(|| PathBuf::from("/tmp"));
	home.join(".portless")
}

#[cfg(not(unix))]
fn user_root() -> PathBuf {
	std::env::temp_dir().join("portless")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn privileged_port_sites_system_root() {
		let mut cfg = Config::default();
		cfg.proxy_port = 443;
		let dir = StateDir::resolve(&cfg);
		assert_eq!(dir.root(), Path::new(SYSTEM_ROOT));
	}

	#[test]
	fn unprivileged_port_sites_user_root() {
		let mut cfg = Config::default();
		cfg.proxy_port = 9000;
		let dir = StateDir::resolve(&cfg);
		assert_ne!(dir.root(), Path::new(SYSTEM_ROOT));
	}

	#[test]
	fn override_wins_regardless_of_port() {
		let mut cfg = Config::default();
		cfg.proxy_port = 443;
		cfg.state_dir_override = Some(PathBuf::from("/custom/dir"));
		let dir = StateDir::resolve(&cfg);
		assert_eq!(dir.root(), Path::new("/custom/dir"));
	}

	#[test]
	fn derived_paths_are_under_root() {
		let dir = StateDir::from_path(PathBuf::from("/x"));
		assert_eq!(dir.routes_file(), PathBuf::from("/x/routes.json"));
		assert_eq!(dir.lock_dir(), PathBuf::from("/x/routes.lock"));
		assert_eq!(dir.pid_file(), PathBuf::from("/x/proxy.pid"));
	}
}
