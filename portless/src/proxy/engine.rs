//! Host-routed reverse proxy: matches each request's effective host against the live route
//! table and forwards to `127.0.0.1:<backend_port>` as plain HTTP/1.1, including WebSocket
//! upgrades.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{Request, Response, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::{debug, error, warn};

use crate::hostname;
use crate::route_store::Route;

pub const LOOP_THRESHOLD: u32 = 5;
const HOPS_HEADER: &str = "x-portless-hops";
const IDENTITY_HEADER: &str = "x-portless";

/// Headers stripped from the backend's response before relaying it, mirroring RFC 7230 §6.1
/// hop-by-hop headers plus the non-standard `proxy-connection`.
static HOP_HEADERS: [&str; 6] = [
	"connection",
	"keep-alive",
	"proxy-connection",
	"transfer-encoding",
	"upgrade",
	"te",
];

pub type BoxBytesBody = BoxBody<Bytes, hyper::Error>;

/// Failure that must tear down the connection rather than produce a `Response`.
#[derive(Debug, Error)]
pub enum HandleError {
	#[error("no route registered for websocket upgrade host")]
	NoRouteForUpgrade,
}

/// Looks up routes and carries the proxy's own identity (used for `X-Forwarded-*` construction).
#[derive(Clone)]
pub struct ProxyEngine<L> {
	pub route_lookup: L,
	pub https: bool,
	pub proxy_port: u16,
}

/// Something that can answer "who owns this hostname right now". The daemon's live,
/// file-watched route cache implements this.
pub trait RouteLookup: Send + Sync + 'static {
	fn find(&self, hostname: &str) -> Option<Route>;
	fn all(&self) -> Vec<Route>;
}

impl<T: RouteLookup + ?Sized> RouteLookup for Arc<T> {
	fn find(&self, hostname: &str) -> Option<Route> {
		(**self).find(hostname)
	}
	fn all(&self) -> Vec<Route> {
		(**self).all()
	}
}

impl<L: RouteLookup> ProxyEngine<L> {
	pub async fn handle(
		&self,
		peer: SocketAddr,
		conn_is_tls: bool,
		mut req: Request<Incoming>,
	) -> Result<Response<BoxBytesBody>, HandleError> {
		let host = match effective_host(&req) {
			Some(h) => h,
			None => return Ok(self.plain_text_response(StatusCode::BAD_REQUEST, "Missing Host header")),
		};

		let upgrade = is_upgrade_request(&req);

		let hops = parse_hops(req.headers());
		if hops >= LOOP_THRESHOLD {
			warn!(host = %host, hops, "forwarding loop detected, rejecting request");
			return Ok(self.plain_text_response(
				StatusCode::LOOP_DETECTED,
				"Loop Detected: this dev server appears to be proxying back through portless \
				 without rewriting the Host header. If you are behind a framework dev-server \
				 proxy, set changeOrigin: true.",
			));
		}

		let Some(route) = self.route_lookup.find(&host) else {
			if upgrade {
				warn!(host = %host, "no route for websocket upgrade host, closing socket");
				return Err(HandleError::NoRouteForUpgrade);
			}
			return Ok(self.not_found_response(&host));
		};

		strip_pseudo_headers(req.headers_mut());
		inject_forwarded_headers(req.headers_mut(), &host, peer, self.proxy_port, conn_is_tls);
		req.headers_mut().insert(
			HeaderName::from_static("x-portless-hops"),
			HeaderValue::from_str(&(hops + 1).to_string()).expect("integer formats to valid header value"),
		);

		if upgrade {
			return self.proxy_upgrade(route, req).await;
		}

		self.proxy_http(route, req).await
	}

	async fn proxy_http(
		&self,
		route: Route,
		req: Request<Incoming>,
	) -> Result<Response<BoxBytesBody>, HandleError> {
		let is_http2 = req.version() == http::Version::HTTP_2;
		let addr: SocketAddr = ([127, 0, 0, 1], route.port).into();
		let stream = match TcpStream::connect(addr).await {
			Ok(s) => s,
			Err(e) => {
				warn!(port = route.port, "backend connect failed: {e}");
				let msg = if e.kind() == std::io::ErrorKind::ConnectionRefused {
					"Bad Gateway: the dev server is not responding, it may have crashed"
				} else {
					"Bad Gateway: failed to reach the dev server"
				};
				return Ok(self.plain_text_response(StatusCode::BAD_GATEWAY, msg));
			},
		};
		let io = TokioIo::new(stream);
		let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
			Ok(pair) => pair,
			Err(e) => {
				warn!("backend handshake failed: {e}");
				return Ok(self.plain_text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
			},
		};
		tokio::spawn(async move {
			if let Err(e) = conn.await {
				debug!("backend connection closed: {e}");
			}
		});

		match sender.send_request(req).await {
			Ok(resp) => {
				let (parts, body) = resp.into_parts();
				let mut parts = parts;
				if is_http2 {
					strip_hop_headers(&mut parts.headers);
				}
				let body = body.map_err(|e| e).boxed();
				Ok(Response::from_parts(parts, body))
			},
			Err(e) => {
				warn!("backend request failed: {e}");
				Ok(self.plain_text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
			},
		}
	}

	async fn proxy_upgrade(
		&self,
		route: Route,
		mut req: Request<Incoming>,
	) -> Result<Response<BoxBytesBody>, HandleError> {
		let addr: SocketAddr = ([127, 0, 0, 1], route.port).into();
		let backend_stream = match TcpStream::connect(addr).await {
			Ok(s) => s,
			Err(e) => {
				warn!(port = route.port, "backend connect failed for upgrade: {e}");
				return Ok(self.plain_text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
			},
		};
		let io = TokioIo::new(backend_stream);
		let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
			Ok(pair) => pair,
			Err(e) => {
				warn!("backend handshake failed for upgrade: {e}");
				return Ok(self.plain_text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
			},
		};
		tokio::spawn(async move {
			if let Err(e) = conn.with_upgrades().await {
				debug!("backend upgrade connection closed: {e}");
			}
		});

		let client_on_upgrade = hyper::upgrade::on(&mut req);
		let mut backend_resp = match sender.send_request(req).await {
			Ok(r) => r,
			Err(e) => {
				warn!("backend upgrade request failed: {e}");
				return Ok(self.plain_text_response(StatusCode::BAD_GATEWAY, "Bad Gateway"));
			},
		};

		if backend_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
			// Backend declined the upgrade; relay its response verbatim.
			let (parts, body) = backend_resp.into_parts();
			return Ok(Response::from_parts(parts, body.map_err(|e| e).boxed()));
		}

		let backend_on_upgrade = hyper::upgrade::on(&mut backend_resp);
		let response_parts = backend_resp.into_parts().0;
		tokio::spawn(async move {
			let (client_upgraded, backend_upgraded) =
				match tokio::try_join!(client_on_upgrade, backend_on_upgrade) {
					Ok(pair) => pair,
					Err(e) => {
						error!("upgrade negotiation failed: {e}");
						return;
					},
				};
			pipe_upgraded(client_upgraded, backend_upgraded).await;
		});

		response_parts.status = StatusCode::SWITCHING_PROTOCOLS;
		Ok(Response::from_parts(response_parts, empty_body()))
	}

	fn plain_text_response(&self, status: StatusCode, body: &str) -> Response<BoxBytesBody> {
		Response::builder()
			.status(status)
			.header("content-type", "text/plain; charset=utf-8")
			.header(IDENTITY_HEADER, "1")
			.body(full_body(body.to_string()))
			.expect("status and headers are always valid")
	}

	fn not_found_response(&self, host: &str) -> Response<BoxBytesBody> {
		let mut routes = self.route_lookup.all();
		routes.sort_by(|a, b| a.hostname.cmp(&b.hostname));
		let links: String = routes
			.iter()
			.map(|r| {
				let url = hostname::display_url(&r.hostname, self.proxy_port, self.https);
				format!("<li><a href=\"{}\">{}</a></li>", hostname::html_escape(&url), hostname::html_escape(&r.hostname))
			})
			.collect();
		let body = format!(
			"<!doctype html><html><head><title>portless</title></head><body>\
			 <h1>No app registered for {}</h1>\
			 <p>Currently running:</p><ul>{}</ul></body></html>",
			hostname::html_escape(host),
			links
		);
		Response::builder()
			.status(StatusCode::NOT_FOUND)
			.header("content-type", "text/html; charset=utf-8")
			.header(IDENTITY_HEADER, "1")
			.body(full_body(body))
			.expect("status and headers are always valid")
	}
}

async fn pipe_upgraded(client: Upgraded, backend: Upgraded) {
	let mut client_io = TokioIo::new(client);
	let mut backend_io = TokioIo::new(backend);
	if let Err(e) = tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
		debug!("upgraded connection closed: {e}");
	}
}

fn empty_body() -> BoxBytesBody {
	Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full_body(s: String) -> BoxBytesBody {
	Full::new(Bytes::from(s)).map_err(|never| match never {}).boxed()
}

fn effective_host(req: &Request<Incoming>) -> Option<String> {
	let raw = req
		.uri()
		.authority()
		.map(|a| a.host().to_string())
		.or_else(|| {
			req
				.headers()
				.get(http::header::HOST)
				.and_then(|h| h.to_str().ok())
				.map(|h| h.split(':').next().unwrap_or(h).to_string())
		})?;
	if raw.is_empty() {
		return None;
	}
	Some(raw.to_ascii_lowercase())
}

fn parse_hops(headers: &http::HeaderMap) -> u32 {
	headers
		.get(HOPS_HEADER)
		.and_then(|h| h.to_str().ok())
		.and_then(|s| s.parse::<u32>().ok())
		.unwrap_or(0)
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
	req
		.headers()
		.get(http::header::CONNECTION)
		.and_then(|h| h.to_str().ok())
		.map(|v| v.to_ascii_lowercase().contains("upgrade"))
		.unwrap_or(false)
		&& req.headers().contains_key(http::header::UPGRADE)
}

/// HTTP/2 pseudo-headers (`:authority`, `:path`, ...) never reach `HeaderMap` directly in the
/// `http` crate's model, but defensively strip any header name beginning with `:` in case a
/// future hyper version surfaces them there, since the backend is always HTTP/1.1.
fn strip_pseudo_headers(headers: &mut http::HeaderMap) {
	let pseudo: Vec<HeaderName> = headers
		.keys()
		.filter(|k| k.as_str().starts_with(':'))
		.cloned()
		.collect();
	for key in pseudo {
		headers.remove(key);
	}
}

fn strip_hop_headers(headers: &mut http::HeaderMap) {
	for name in HOP_HEADERS {
		headers.remove(name);
	}
}

fn inject_forwarded_headers(
	headers: &mut http::HeaderMap,
	host: &str,
	peer: SocketAddr,
	proxy_port: u16,
	https: bool,
) {
	let existing_for = headers
		.get("x-forwarded-for")
		.and_then(|h| h.to_str().ok())
		.map(|s| s.to_string());
	let chained = match existing_for {
		Some(prev) => format!("{prev}, {}", peer.ip()),
		None => peer.ip().to_string(),
	};
	if let Ok(v) = HeaderValue::from_str(&chained) {
		headers.insert(HeaderName::from_static("x-forwarded-for"), v);
	}
	headers
		.entry(HeaderName::from_static("x-forwarded-proto"))
		.or_insert_with(|| HeaderValue::from_static(if https { "https" } else { "http" }));
	if let Ok(v) = HeaderValue::from_str(host) {
		headers
			.entry(HeaderName::from_static("x-forwarded-host"))
			.or_insert(v);
	}
	headers
		.entry(HeaderName::from_static("x-forwarded-port"))
		.or_insert_with(|| HeaderValue::from_str(&proxy_port.to_string()).expect("port formats to valid header value"));
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::collections::HashMap;
	use std::sync::Mutex;

	struct MapLookup(Mutex<HashMap<String, Route>>);

	impl RouteLookup for MapLookup {
		fn find(&self, hostname: &str) -> Option<Route> {
			self.0.lock().unwrap().get(hostname).cloned()
		}
		fn all(&self) -> Vec<Route> {
			self.0.lock().unwrap().values().cloned().collect()
		}
	}

	#[test]
	fn parse_hops_defaults_to_zero() {
		let headers = http::HeaderMap::new();
		assert_eq!(parse_hops(&headers), 0);
	}

	#[test]
	fn parse_hops_reads_existing_value() {
		let mut headers = http::HeaderMap::new();
		headers.insert(HOPS_HEADER, HeaderValue::from_static("3"));
		assert_eq!(parse_hops(&headers), 3);
	}

	#[test]
	fn parse_hops_invalid_value_defaults_to_zero() {
		let mut headers = http::HeaderMap::new();
		headers.insert(HOPS_HEADER, HeaderValue::from_static("nope"));
		assert_eq!(parse_hops(&headers), 0);
	}

	#[test]
	fn strip_hop_headers_removes_connection_and_upgrade() {
		let mut headers = http::HeaderMap::new();
		headers.insert(http::header::CONNECTION, HeaderValue::from_static("upgrade"));
		headers.insert(http::header::UPGRADE, HeaderValue::from_static("websocket"));
		headers.insert(http::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
		strip_hop_headers(&mut headers);
		assert!(!headers.contains_key(http::header::CONNECTION));
		assert!(!headers.contains_key(http::header::UPGRADE));
		assert!(headers.contains_key(http::header::CONTENT_TYPE));
	}

	#[test]
	fn inject_forwarded_headers_sets_all_four() {
		let mut headers = http::HeaderMap::new();
		let peer: SocketAddr = "127.0.0.1:5555".parse().unwrap();
		inject_forwarded_headers(&mut headers, "chat.localhost", peer, 9000, false);
		assert_eq!(headers.get("x-forwarded-for").unwrap(), "127.0.0.1");
		assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
		assert_eq!(headers.get("x-forwarded-host").unwrap(), "chat.localhost");
		assert_eq!(headers.get("x-forwarded-port").unwrap(), "9000");
	}

	#[test]
	fn inject_forwarded_headers_chains_existing_for() {
		let mut headers = http::HeaderMap::new();
		headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1"));
		let peer: SocketAddr = "127.0.0.1:5555".parse().unwrap();
		inject_forwarded_headers(&mut headers, "chat.localhost", peer, 9000, false);
		assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.0.0.1, 127.0.0.1");
	}

	#[test]
	fn route_lookup_returns_none_for_unknown_host() {
		let lookup = MapLookup(Mutex::new(HashMap::new()));
		assert!(lookup.find("missing.localhost").is_none());
	}
}
