use std::path::PathBuf;

/// Default port the proxy listens on when nothing overrides it.
pub const DEFAULT_PROXY_PORT: u16 = 9000;

/// Backend ephemeral port range used by the app runner.
pub const DEFAULT_BACKEND_RANGE: (u16, u16) = (4000, 4999);

/// Ports below this are considered privileged and sited under the system state root.
pub const PRIVILEGED_PORT_THRESHOLD: u16 = 1024;

/// Assembled proxy configuration: CLI flags layered over environment variables, flags win.
#[derive(Debug, Clone)]
pub struct Config {
	pub proxy_port: u16,
	pub https: bool,
	pub cert_override: Option<PathBuf>,
	pub key_override: Option<PathBuf>,
	pub foreground: bool,
	pub state_dir_override: Option<PathBuf>,
	pub backend_port_range: (u16, u16),
}

impl Default for Config {
	fn default() -> Self {
		Config {
			proxy_port: DEFAULT_PROXY_PORT,
			https: false,
			cert_override: None,
			key_override: None,
			foreground: false,
			state_dir_override: None,
			backend_port_range: DEFAULT_BACKEND_RANGE,
		}
	}
}

impl Config {
	/// Applies the environment variables this crate consumes on top of `self`, with any value
	/// already set on `self` (from an explicit flag) taking precedence.
	pub fn apply_env(mut self) -> Self {
		if self.state_dir_override.is_none() {
			if let Ok(dir) = std::env::var("STATE_DIR_OVERRIDE") {
				self.state_dir_override = Some(PathBuf::from(dir));
			}
		}
		if !self.https {
			if let Ok(v) = std::env::var("HTTPS_ENABLE") {
				self.https = v == "1" || v.eq_ignore_ascii_case("true");
			}
		}
		if self.proxy_port == DEFAULT_PROXY_PORT {
			if let Ok(v) = std::env::var("PROXY_PORT_OVERRIDE") {
				if let Ok(port) = v.parse::<u16>() {
					self.proxy_port = port;
				}
			}
		}
		self
	}

	pub fn is_privileged(&self) -> bool {
		self.proxy_port < PRIVILEGED_PORT_THRESHOLD
	}
}

/// `true` if the app-runner path should be bypassed entirely, per the `BYPASS` env var contract.
pub fn bypass_requested() -> bool {
	match std::env::var("BYPASS") {
		Ok(v) => v == "0" || v.eq_ignore_ascii_case("skip"),
		Err(_) => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_config_uses_default_port() {
		let cfg = Config::default();
		assert_eq!(cfg.proxy_port, DEFAULT_PROXY_PORT);
		assert!(!cfg.is_privileged());
	}

	#[test]
	fn privileged_threshold() {
		let mut cfg = Config::default();
		cfg.proxy_port = 443;
		assert!(cfg.is_privileged());
	}
}
