//! Local CA plus on-demand per-hostname leaf certificates.
//!
//! The CA and a default server cert (covering `localhost` and `*.localhost`) are materialized
//! once per state directory. Deeper subdomains (`chat.myapp.localhost`) get their own leaf with
//! a wildcard SAN at the sibling depth, minted lazily on first handshake and cached both on disk
//! and in memory.

use std::collections::HashMap;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use rcgen::{
	BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair, KeyUsagePurpose,
	SanType,
};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::error::PortlessError;
use crate::hostname::{self, SUFFIX};
use crate::state::StateDir;

const CA_VALIDITY_DAYS: i64 = 365 * 10;
const LEAF_VALIDITY_DAYS: i64 = 365;
const RENEW_WITHIN_DAYS: i64 = 7;

struct CaMaterial {
	key: KeyPair,
	cert: rcgen::Certificate,
}

/// Owns the CA and dispatches SNI handshakes to either the default server cert or a lazily
/// minted per-hostname leaf. `ca` is `None` when the operator supplied a fixed `--cert`/`--key`
/// pair, in which case every SNI resolves to that one identity and no local CA is involved.
pub struct CertManager {
	cert_dir: PathBuf,
	ca: Option<CaMaterial>,
	default_key: Arc<CertifiedKey>,
	cache: Mutex<HashMap<String, Arc<CertifiedKey>>>,
	pending: Mutex<HashMap<String, Arc<Notify>>>,
	/// Set when the local CA was (re)generated by this `ensure` call; on-disk leaves signed by a
	/// now-discarded CA key must not be reused even if they haven't individually expired yet.
	ca_regenerated: bool,
}

impl CertManager {
	/// Loads (or generates, if absent or expiring) the CA and default server cert for `state`,
	/// unless `cert_override`/`key_override` are both given, in which case that fixed identity is
	/// used for every connection and no local CA is loaded or generated.
	pub fn ensure(
		state: &StateDir,
		cert_override: Option<&Path>,
		key_override: Option<&Path>,
	) -> Result<Arc<CertManager>, PortlessError> {
		let cert_dir = state.cert_dir();
		std::fs::create_dir_all(state.host_cert_dir())?;

		if let (Some(cert_path), Some(key_path)) = (cert_override, key_override) {
			info!(cert = %cert_path.display(), key = %key_path.display(), "using operator-supplied certificate, local CA disabled");
			let default_key = read_certified_key(cert_path, key_path)?;
			return Ok(Arc::new(CertManager {
				cert_dir,
				ca: None,
				default_key: Arc::new(default_key),
				cache: Mutex::new(HashMap::new()),
				pending: Mutex::new(HashMap::new()),
				ca_regenerated: false,
			}));
		}

		let (ca, ca_regenerated) = load_or_generate_ca(&cert_dir)?;
		let default_key = load_or_generate_default(&cert_dir, &ca, ca_regenerated)?;

		Ok(Arc::new(CertManager {
			cert_dir,
			ca: Some(ca),
			default_key: Arc::new(default_key),
			cache: Mutex::new(HashMap::new()),
			pending: Mutex::new(HashMap::new()),
			ca_regenerated,
		}))
	}

	/// Path to the CA certificate, for `trust` installation and verification.
	pub fn ca_cert_path(&self) -> PathBuf {
		self.cert_dir.join("ca.pem")
	}

	/// Resolves a `CertifiedKey` for the given SNI name, per §4.4's SNI policy: exactly
	/// `localhost` or a single-label `*.localhost` host uses the default cert; anything deeper
	/// gets a per-hostname leaf, minted on demand and deduplicated across concurrent handshakes.
	pub async fn resolve(self: &Arc<Self>, sni: &str) -> Arc<CertifiedKey> {
		let sni = sni.to_ascii_lowercase();
		if self.ca.is_none() {
			// Operator-supplied fixed identity: no CA to mint per-host leaves from.
			return self.default_key.clone();
		}
		if sni == "localhost" || (sni.ends_with(SUFFIX) && hostname::label_count(&sni) <= 2) {
			return self.default_key.clone();
		}
		if let Some(key) = self.cache.lock().await.get(&sni).cloned() {
			return key;
		}
		if let Some(key) = self.load_cached_leaf(&sni) {
			self.cache.lock().await.insert(sni.clone(), key.clone());
			return key;
		}
		self.mint_leaf_deduped(&sni).await
	}

	async fn mint_leaf_deduped(self: &Arc<Self>, sni: &str) -> Arc<CertifiedKey> {
		loop {
			let notify = {
				let mut pending = self.pending.lock().await;
				if let Some(existing) = pending.get(sni) {
					existing.clone()
				} else {
					let notify = Arc::new(Notify::new());
					pending.insert(sni.to_string(), notify.clone());
					drop(pending);
					let key = self.mint_leaf(sni);
					let key = Arc::new(key);
					self.cache.lock().await.insert(sni.to_string(), key.clone());
					self.pending.lock().await.remove(sni);
					notify.notify_waiters();
					return key;
				}
			};
			notify.notified().await;
			if let Some(key) = self.cache.lock().await.get(sni).cloned() {
				return key;
			}
		}
	}

	fn load_cached_leaf(&self, sni: &str) -> Option<Arc<CertifiedKey>> {
		if self.ca_regenerated {
			// Every on-disk leaf was signed by the CA key we just discarded.
			return None;
		}
		let stem = hostname::sanitize_for_filename(sni);
		let cert_path = self.cert_dir.join("host-certs").join(format!("{stem}.pem"));
		let key_path = self.cert_dir.join("host-certs").join(format!("{stem}-key.pem"));
		if !cert_path.exists() || !key_path.exists() {
			return None;
		}
		if cert_needs_renewal(&cert_path, RENEW_WITHIN_DAYS) {
			return None;
		}
		read_certified_key(&cert_path, &key_path).ok().map(Arc::new)
	}

	fn mint_leaf(&self, sni: &str) -> CertifiedKey {
		let ca = self.ca.as_ref().expect("mint_leaf is only reached when a local CA is configured");
		let parent = hostname::parent_suffix(sni).unwrap_or(sni);
		let key = KeyPair::generate().expect("ed25519/ecdsa key generation");
		let mut params = CertificateParams::new(vec![sni.to_string()]).expect("valid SAN list");
		let mut dn = DistinguishedName::new();
		dn.push(DnType::CommonName, sni);
		params.distinguished_name = dn;
		params.subject_alt_names = vec![
			SanType::DnsName(sni.try_into().expect("sni is a valid DNS name")),
			SanType::DnsName(format!("*.{parent}").as_str().try_into().expect("valid wildcard SAN")),
		];
		let now = time::OffsetDateTime::now_utc();
		params.not_before = now;
		params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);
		let cert = params
			.signed_by(&key, &ca.cert, &ca.key)
			.expect("signing leaf with local CA");

		let stem = hostname::sanitize_for_filename(sni);
		let host_dir = self.cert_dir.join("host-certs");
		let cert_path = host_dir.join(format!("{stem}.pem"));
		let key_path = host_dir.join(format!("{stem}-key.pem"));
		if let Err(e) = write_pair(&cert_path, &key_path, &cert.pem(), &key.serialize_pem()) {
			warn!("failed to cache leaf certificate for {sni}: {e}");
		}
		info!(host = sni, "minted certificate");

		certified_key_from_pem(&cert.pem(), &key.serialize_pem()).expect("freshly minted cert parses")
	}
}

/// A `ResolvesServerCert` that always returns one fixed key. Built fresh for each connection
/// after the TLS listener shim has already resolved the right cert for the handshake's SNI
/// (via `CertManager::resolve`), so no blocking/async bridging is needed inside the resolver
/// itself.
pub struct FixedCertResolver(pub Arc<CertifiedKey>);

impl ResolvesServerCert for FixedCertResolver {
	fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
		Some(self.0.clone())
	}
}

/// Returns the CA material and whether it was freshly (re)generated by this call. A freshly
/// (re)generated CA forces regeneration of everything it previously signed.
fn load_or_generate_ca(cert_dir: &Path) -> Result<(CaMaterial, bool), PortlessError> {
	std::fs::create_dir_all(cert_dir)?;
	let ca_cert_path = cert_dir.join("ca.pem");
	let ca_key_path = cert_dir.join("ca-key.pem");

	if ca_cert_path.exists() && ca_key_path.exists() && !cert_needs_renewal(&ca_cert_path, RENEW_WITHIN_DAYS) {
		if let Ok(material) = load_ca_material(&ca_cert_path, &ca_key_path) {
			return Ok((material, false));
		}
	}

	info!("generating local certificate authority");
	let key = KeyPair::generate().map_err(|e| PortlessError::CertGeneration(e.to_string()))?;
	let mut params =
		CertificateParams::new(Vec::<String>::new()).map_err(|e| PortlessError::CertGeneration(e.to_string()))?;
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, "portless local CA");
	dn.push(DnType::OrganizationName, "portless");
	params.distinguished_name = dn;
	params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
	params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
	let now = time::OffsetDateTime::now_utc();
	params.not_before = now;
	params.not_after = now + time::Duration::days(CA_VALIDITY_DAYS);
	let cert = params
		.self_signed(&key)
		.map_err(|e| PortlessError::CertGeneration(e.to_string()))?;

	write_pair(&ca_cert_path, &ca_key_path, &cert.pem(), &key.serialize_pem())?;
	transfer_to_invoking_user(&ca_cert_path);
	transfer_to_invoking_user(&ca_key_path);

	Ok((CaMaterial { key, cert }, true))
}

fn load_ca_material(cert_path: &Path, key_path: &Path) -> Result<CaMaterial, PortlessError> {
	let key_pem = std::fs::read_to_string(key_path)?;
	let key = KeyPair::from_pem(&key_pem).map_err(|e| PortlessError::CertGeneration(e.to_string()))?;
	let cert_pem = std::fs::read_to_string(cert_path)?;
	let params = CertificateParams::from_ca_cert_pem(&cert_pem)
		.map_err(|e| PortlessError::CertGeneration(e.to_string()))?;
	let cert = params
		.self_signed(&key)
		.map_err(|e| PortlessError::CertGeneration(e.to_string()))?;
	Ok(CaMaterial { key, cert })
}

/// Loads the cached default server cert unless `force_regenerate` is set (the CA was just
/// (re)generated this call, so any cached leaf was signed by a now-discarded key) or the cached
/// cert itself needs renewal.
fn load_or_generate_default(cert_dir: &Path, ca: &CaMaterial, force_regenerate: bool) -> Result<CertifiedKey, PortlessError> {
	let cert_path = cert_dir.join("server.pem");
	let key_path = cert_dir.join("server-key.pem");

	if !force_regenerate && cert_path.exists() && key_path.exists() && !cert_needs_renewal(&cert_path, RENEW_WITHIN_DAYS) {
		if let Ok(key) = read_certified_key(&cert_path, &key_path) {
			return Ok(key);
		}
	}

	if force_regenerate {
		info!("local CA was (re)generated, regenerating the default server certificate");
	}
	info!("generating default server certificate for localhost/*.localhost");
	let key = KeyPair::generate().map_err(|e| PortlessError::CertGeneration(e.to_string()))?;
	let mut params = CertificateParams::new(vec!["localhost".to_string()])
		.map_err(|e| PortlessError::CertGeneration(e.to_string()))?;
	let mut dn = DistinguishedName::new();
	dn.push(DnType::CommonName, "localhost");
	params.distinguished_name = dn;
	params.subject_alt_names = vec![
		SanType::DnsName("localhost".try_into().unwrap()),
		SanType::DnsName("*.localhost".try_into().unwrap()),
	];
	let now = time::OffsetDateTime::now_utc();
	params.not_before = now;
	params.not_after = now + time::Duration::days(LEAF_VALIDITY_DAYS);
	let cert = params
		.signed_by(&key, &ca.cert, &ca.key)
		.map_err(|e| PortlessError::CertGeneration(e.to_string()))?;

	write_pair(&cert_path, &key_path, &cert.pem(), &key.serialize_pem())?;
	transfer_to_invoking_user(&cert_path);
	transfer_to_invoking_user(&key_path);

	certified_key_from_pem(&cert.pem(), &key.serialize_pem())
}

fn write_pair(cert_path: &Path, key_path: &Path, cert_pem: &str, key_pem: &str) -> std::io::Result<()> {
	std::fs::write(cert_path, cert_pem)?;
	std::fs::write(key_path, key_pem)?;
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		std::fs::set_permissions(cert_path, std::fs::Permissions::from_mode(0o644))?;
		std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))?;
	}
	Ok(())
}

/// When running elevated (root, for a privileged port), hand ownership of generated certificate
/// material back to the invoking user so later non-root CLI invocations can still read it.
#[cfg(unix)]
fn transfer_to_invoking_user(path: &Path) {
	if !nix::unistd::Uid::effective().is_root() {
		return;
	}
	let (Some(uid), Some(gid)) = (sudo_uid(), sudo_gid()) else {
		return;
	};
	let _ = nix::unistd::chown(path, Some(uid), Some(gid));
}

#[cfg(not(unix))]
fn transfer_to_invoking_user(_path: &Path) {}

#[cfg(unix)]
fn sudo_uid() -> Option<nix::unistd::Uid> {
	std::env::var("SUDO_UID").ok()?.parse::<u32>().ok().map(nix::unistd::Uid::from_raw)
}

#[cfg(unix)]
fn sudo_gid() -> Option<nix::unistd::Gid> {
	std::env::var("SUDO_GID").ok()?.parse::<u32>().ok().map(nix::unistd::Gid::from_raw)
}

/// Signature algorithm OIDs (dotted-decimal) of SHA-1-based schemes, rejected on load per §4.4.
const SHA1_SIGNATURE_OIDS: [&str; 3] = [
	"1.2.840.113549.1.1.5", // sha1WithRSAEncryption
	"1.2.840.10040.4.3",    // dsa-with-sha1
	"1.2.840.10045.4.1",    // ecdsa-with-SHA1
];

/// `true` if a cached certificate must not be reused: either it is within `within_days` of
/// expiry, or it was signed with a SHA-1-based algorithm.
fn cert_needs_renewal(cert_path: &Path, within_days: i64) -> bool {
	let Ok(pem) = std::fs::read_to_string(cert_path) else {
		return true;
	};
	let Ok((_, cert)) = x509_parser::pem::parse_x509_pem(pem.as_bytes()) else {
		return true;
	};
	let Ok(parsed) = cert.parse_x509() else {
		return true;
	};
	if uses_sha1_signature(&parsed) {
		warn!(path = %cert_path.display(), "cached certificate uses a SHA-1 signature, forcing regeneration");
		return true;
	}
	let not_after = parsed.validity().not_after.timestamp();
	let threshold = SystemTime::now()
		.duration_since(SystemTime::UNIX_EPOCH)
		.unwrap_or_default()
		.as_secs() as i64
		+ within_days * 86_400;
	not_after < threshold
}

fn uses_sha1_signature(parsed: &x509_parser::certificate::X509Certificate<'_>) -> bool {
	let oid = parsed.signature_algorithm.algorithm.to_string();
	SHA1_SIGNATURE_OIDS.contains(&oid.as_str())
}

fn read_certified_key(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, PortlessError> {
	let cert_pem = std::fs::read_to_string(cert_path)?;
	let key_pem = std::fs::read_to_string(key_path)?;
	certified_key_from_pem(&cert_pem, &key_pem)
}

fn certified_key_from_pem(cert_pem: &str, key_pem: &str) -> Result<CertifiedKey, PortlessError> {
	let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
		.collect::<Result<Vec<_>, _>>()
		.map_err(|e| PortlessError::CertGeneration(e.to_string()))?;
	let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_bytes()))
		.map_err(|e| PortlessError::CertGeneration(e.to_string()))?
		.ok_or_else(|| PortlessError::CertGeneration("no private key in PEM".to_string()))?;
	let signing_key =
		rustls::crypto::ring::sign::any_supported_type(&key).map_err(|e| PortlessError::CertGeneration(e.to_string()))?;
	debug!(count = certs.len(), "loaded certificate chain");
	Ok(CertifiedKey::new(certs, signing_key))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::config::Config;

	fn temp_state() -> (tempfile::TempDir, StateDir) {
		let dir = tempfile::tempdir().unwrap();
		let state = StateDir::from_path(dir.path().to_path_buf());
		std::fs::create_dir_all(state.host_cert_dir()).unwrap();
		(dir, state)
	}

	#[test]
	fn ensure_generates_ca_and_default_cert_as_valid_pems() {
		let (_dir, state) = temp_state();
		let manager = CertManager::ensure(&state, None, None).unwrap();
		let ca_pem = std::fs::read_to_string(manager.ca_cert_path()).unwrap();
		assert!(ca_pem.contains("BEGIN CERTIFICATE"));
		let server_pem = std::fs::read_to_string(state.cert_dir().join("server.pem")).unwrap();
		assert!(server_pem.contains("BEGIN CERTIFICATE"));
	}

	#[test]
	fn ca_and_default_cert_persist_across_a_second_ensure_call() {
		let (_dir, state) = temp_state();
		CertManager::ensure(&state, None, None).unwrap();
		let ca_pem_first = std::fs::read_to_string(state.cert_dir().join("ca.pem")).unwrap();
		CertManager::ensure(&state, None, None).unwrap();
		let ca_pem_second = std::fs::read_to_string(state.cert_dir().join("ca.pem")).unwrap();
		assert_eq!(ca_pem_first, ca_pem_second, "a fresh CA should not be regenerated");
	}

	#[tokio::test]
	async fn resolve_uses_default_cert_for_localhost_and_one_label_subdomains() {
		let (_dir, state) = temp_state();
		let manager = CertManager::ensure(&state, None, None).unwrap();
		let bare = manager.resolve("localhost").await;
		let sub = manager.resolve("chat.localhost").await;
		assert!(Arc::ptr_eq(&bare, &manager.default_key));
		assert!(Arc::ptr_eq(&sub, &manager.default_key));
	}

	#[tokio::test]
	async fn resolve_mints_and_caches_a_leaf_for_deeper_subdomains() {
		let (_dir, state) = temp_state();
		let manager = CertManager::ensure(&state, None, None).unwrap();
		let first = manager.resolve("chat.myapp.localhost").await;
		assert!(!Arc::ptr_eq(&first, &manager.default_key));
		assert!(state.host_cert_dir().join("chat_myapp_localhost.pem").exists());

		let second = manager.resolve("chat.myapp.localhost").await;
		assert!(Arc::ptr_eq(&first, &second), "second resolve should hit the in-memory cache");
	}

	#[tokio::test]
	async fn concurrent_resolves_of_the_same_sni_mint_only_once() {
		let (_dir, state) = temp_state();
		let manager = CertManager::ensure(&state, None, None).unwrap();
		let (a, b) = tokio::join!(manager.resolve("dup.myapp.localhost"), manager.resolve("dup.myapp.localhost"));
		assert!(Arc::ptr_eq(&a, &b));
	}

	#[test]
	fn cert_needs_renewal_true_for_missing_file() {
		assert!(cert_needs_renewal(Path::new("/nonexistent/ca.pem"), RENEW_WITHIN_DAYS));
	}

	#[test]
	fn state_dir_siting_is_independent_of_cert_manager() {
		let cfg = Config::default();
		let state = StateDir::resolve(&cfg);
		assert_eq!(state.cert_dir(), state.root().join("certs"));
	}

	#[test]
	fn regenerating_the_ca_forces_regeneration_of_the_default_leaf() {
		let (_dir, state) = temp_state();
		let cert_dir = state.cert_dir();
		CertManager::ensure(&state, None, None).unwrap();
		let server_pem_first = std::fs::read_to_string(cert_dir.join("server.pem")).unwrap();

		// Simulate the CA having been deleted/rotated out from under an existing server cert.
		std::fs::remove_file(cert_dir.join("ca.pem")).unwrap();
		std::fs::remove_file(cert_dir.join("ca-key.pem")).unwrap();

		CertManager::ensure(&state, None, None).unwrap();
		let server_pem_second = std::fs::read_to_string(cert_dir.join("server.pem")).unwrap();
		assert_ne!(server_pem_first, server_pem_second, "stale leaf signed by the discarded CA must be replaced");
	}

	#[test]
	fn ensure_with_cert_override_skips_the_local_ca() {
		let (_dir, state) = temp_state();
		let ca = load_or_generate_ca(&state.cert_dir()).unwrap().0;
		let key = KeyPair::generate().unwrap();
		let mut params = CertificateParams::new(vec!["example.test".to_string()]).unwrap();
		let now = time::OffsetDateTime::now_utc();
		params.not_before = now;
		params.not_after = now + time::Duration::days(30);
		let cert = params.signed_by(&key, &ca.cert, &ca.key).unwrap();

		let override_dir = tempfile::tempdir().unwrap();
		let cert_path = override_dir.path().join("override.pem");
		let key_path = override_dir.path().join("override-key.pem");
		std::fs::write(&cert_path, cert.pem()).unwrap();
		std::fs::write(&key_path, key.serialize_pem()).unwrap();

		let manager = CertManager::ensure(&state, Some(&cert_path), Some(&key_path)).unwrap();
		assert!(manager.ca.is_none());
	}
}
