//! Single-port TLS/plain-HTTP multiplexing: peeks the first byte of each accepted connection to
//! tell a TLS `ClientHello` (`0x16`) apart from plain HTTP, and dispatches to the matching
//! server, both sharing the same request/upgrade handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use hyper_util::rt::TokioExecutor;
use hyper_util::server::conn::auto;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use crate::cert::{CertManager, FixedCertResolver};
use crate::proxy::engine::{ProxyEngine, RouteLookup};

const TLS_CLIENT_HELLO_BYTE: u8 = 0x16;

pub fn auto_server() -> auto::Builder<TokioExecutor> {
	let mut builder = auto::Builder::new(TokioExecutor::new());
	builder.http2().timer(hyper_util::rt::TokioTimer::new());
	builder
}

/// Accepts connections on `listener` and, when `cert_manager` is set, multiplexes TLS and plain
/// HTTP on the same port; otherwise serves plain HTTP/1.1 and HTTP/2 (h2c) only.
pub async fn serve<L: RouteLookup>(
	listener: TcpListener,
	engine: Arc<ProxyEngine<L>>,
	cert_manager: Option<Arc<CertManager>>,
) {
	loop {
		let (stream, peer) = match listener.accept().await {
			Ok(pair) => pair,
			Err(e) => {
				warn!("accept failed: {e}");
				continue;
			},
		};
		let engine = engine.clone();
		let cert_manager = cert_manager.clone();
		tokio::spawn(async move {
			if let Err(e) = handle_connection(stream, peer, engine, cert_manager).await {
				debug!(%peer, "connection ended: {e}");
			}
		});
	}
}

async fn handle_connection<L: RouteLookup>(
	stream: TcpStream,
	peer: SocketAddr,
	engine: Arc<ProxyEngine<L>>,
	cert_manager: Option<Arc<CertManager>>,
) -> anyhow::Result<()> {
	let Some(cert_manager) = cert_manager else {
		return serve_plain(stream, peer, engine).await;
	};

	let mut peek_buf = [0u8; 1];
	loop {
		match stream.peek(&mut peek_buf).await {
			Ok(0) => return Ok(()),
			Ok(_) => break,
			Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
			Err(e) => return Err(e.into()),
		}
	}

	if peek_buf[0] == TLS_CLIENT_HELLO_BYTE {
		serve_tls(stream, peer, engine, cert_manager).await
	} else {
		serve_plain(stream, peer, engine).await
	}
}

async fn serve_plain<L: RouteLookup>(
	stream: TcpStream,
	peer: SocketAddr,
	engine: Arc<ProxyEngine<L>>,
) -> anyhow::Result<()> {
	let io = hyper_util::rt::TokioIo::new(stream);
	let service = hyper::service::service_fn(move |req| {
		let engine = engine.clone();
		async move { engine.handle(peer, false, req).await }
	});
	auto_server()
		.serve_connection_with_upgrades(io, service)
		.await
		.map_err(|e| anyhow::anyhow!("{e}"))
}

async fn serve_tls<L: RouteLookup>(
	stream: TcpStream,
	peer: SocketAddr,
	engine: Arc<ProxyEngine<L>>,
	cert_manager: Arc<CertManager>,
) -> anyhow::Result<()> {
	let acceptor = tokio_rustls::LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
	tokio::pin!(acceptor);
	let start = acceptor.as_mut().await?;
	let sni = start.client_hello().server_name().map(|s| s.to_string()).unwrap_or_default();
	let key = cert_manager.resolve(&sni).await;

	let mut server_config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_cert_resolver(Arc::new(FixedCertResolver(key)));
	server_config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

	let tls_stream = start.into_stream(Arc::new(server_config)).await?;
	let io = hyper_util::rt::TokioIo::new(tls_stream);
	let service = hyper::service::service_fn(move |req| {
		let engine = engine.clone();
		async move { engine.handle(peer, true, req).await }
	});
	auto_server()
		.serve_connection_with_upgrades(io, service)
		.await
		.map_err(|e| anyhow::anyhow!("{e}"))
}
