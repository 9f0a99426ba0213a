use std::fmt::{Display, Formatter};
use std::{fmt, string::String};

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(serde::Serialize, Clone, Debug, Default)]
pub struct BuildInfo {
	pub version: String,
}

impl BuildInfo {
	pub fn new() -> Self {
		BuildInfo {
			version: BUILD_VERSION.to_string(),
		}
	}
}

impl Display for BuildInfo {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(f, "portless {}", self.version)
	}
}
