//! Hostname grammar: `label("."label)* ".localhost"`, where `label` is a non-empty lowercase
//! run of `[a-z0-9-]` with no leading or trailing hyphen.

use crate::error::PortlessError;

pub const SUFFIX: &str = ".localhost";

/// Normalizes a bare app name (e.g. `"Chat"`) into a full routable hostname
/// (`"chat.localhost"`), validating every label along the way.
///
/// Accepts either a bare name (`chat`) or an already-suffixed hostname (`chat.localhost`).
pub fn normalize(name: &str) -> Result<String, PortlessError> {
	let lower = name.to_ascii_lowercase();
	let hostname = if lower.ends_with(SUFFIX) {
		lower
	} else {
		format!("{lower}{SUFFIX}")
	};
	validate(&hostname)?;
	Ok(hostname)
}

/// Validates an already-constructed hostname against the full grammar.
pub fn validate(hostname: &str) -> Result<(), PortlessError> {
	if !hostname.ends_with(SUFFIX) {
		return Err(PortlessError::InvalidHostname(
			hostname.to_string(),
			"must end with .localhost",
		));
	}
	let body = &hostname[..hostname.len() - SUFFIX.len()];
	if body.is_empty() {
		return Err(PortlessError::InvalidHostname(
			hostname.to_string(),
			"name must not be empty",
		));
	}
	for label in body.split('.') {
		validate_label(hostname, label)?;
	}
	Ok(())
}

fn validate_label(full: &str, label: &str) -> Result<(), PortlessError> {
	if label.is_empty() {
		return Err(PortlessError::InvalidHostname(
			full.to_string(),
			"labels must not be empty",
		));
	}
	if label.starts_with('-') || label.ends_with('-') {
		return Err(PortlessError::InvalidHostname(
			full.to_string(),
			"labels must not start or end with a hyphen",
		));
	}
	if !label.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-') {
		return Err(PortlessError::InvalidHostname(
			full.to_string(),
			"labels must contain only a-z, 0-9, and -",
		));
	}
	Ok(())
}

/// Number of dot-separated labels, e.g. `"chat.localhost"` -> 2, `"a.b.localhost"` -> 3.
pub fn label_count(hostname: &str) -> usize {
	hostname.split('.').count()
}

/// The "parent" suffix starting at the second label, used as the wildcard SAN for leaf certs:
/// for `"chat.myapp.localhost"` this returns `"myapp.localhost"`.
pub fn parent_suffix(hostname: &str) -> Option<&str> {
	hostname.split_once('.').map(|(_, rest)| rest)
}

/// Builds the display URL for a route, omitting the port when it is the protocol default.
pub fn display_url(hostname: &str, proxy_port: u16, https: bool) -> String {
	let scheme = if https { "https" } else { "http" };
	let default_port = if https { 443 } else { 80 };
	if proxy_port == default_port {
		format!("{scheme}://{hostname}")
	} else {
		format!("{scheme}://{hostname}:{proxy_port}")
	}
}

/// Minimal HTML-escaping for untrusted strings embedded in the 404 route listing page.
pub fn html_escape(input: &str) -> String {
	let mut out = String::with_capacity(input.len());
	for c in input.chars() {
		match c {
			'&' => out.push_str("&amp;"),
			'<' => out.push_str("&lt;"),
			'>' => out.push_str("&gt;"),
			'"' => out.push_str("&quot;"),
			'\'' => out.push_str("&#39;"),
			_ => out.push(c),
		}
	}
	out
}

/// Sanitizes a hostname for use as a filesystem-safe certificate file stem.
pub fn sanitize_for_filename(hostname: &str) -> String {
	hostname
		.chars()
		.map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' { c } else { '_' })
		.collect()
}
