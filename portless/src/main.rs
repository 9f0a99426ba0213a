use std::path::PathBuf;

use clap::{Parser, Subcommand};
use portless::config::Config;
use portless::{app_runner, daemon, hostname, route_store::RouteStore, state::StateDir};
use portless_core::{telemetry, version};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "portless", about = "Stable localhost URLs for your dev servers", long_about = None)]
#[command(disable_version_flag = true)]
struct Cli {
	#[arg(short = 'V', long = "version")]
	version: bool,

	#[command(subcommand)]
	command: Option<Command>,

	/// Remaining args when invoked as `portless <name> <cmd> [args...]`.
	#[arg(trailing_var_arg = true, allow_hyphen_values = true)]
	trailing: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Manage the proxy daemon.
	Proxy {
		#[command(subcommand)]
		action: ProxyAction,
	},
	/// List currently registered routes.
	List,
	/// Install the local CA into the system/user trust store.
	Trust,
}

#[derive(Subcommand, Debug)]
enum ProxyAction {
	Start {
		#[arg(short, long)]
		port: Option<u16>,
		#[arg(long)]
		https: bool,
		/// Forces HTTPS off, overriding both --https and the HTTPS_ENABLE environment variable.
		#[arg(long)]
		no_tls: bool,
		#[arg(long)]
		cert: Option<PathBuf>,
		#[arg(long)]
		key: Option<PathBuf>,
		#[arg(long)]
		foreground: bool,
		#[arg(long)]
		state_dir: Option<PathBuf>,
	},
	Stop,
}

fn main() -> anyhow::Result<()> {
	let _log_flush = telemetry::setup_logging();
	let cli = Cli::parse();

	if cli.version {
		println!("{}", version::BuildInfo::new());
		return Ok(());
	}

	tokio::runtime::Builder::new_current_thread()
		.enable_all()
		.build()
		.expect("failed to build tokio runtime")
		.block_on(dispatch(cli))
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
	match cli.command {
		Some(Command::Proxy { action }) => match action {
			ProxyAction::Start {
				port,
				https,
				no_tls,
				cert,
				key,
				foreground,
				state_dir,
			} => {
				let mut cfg = Config::default().apply_env();
				if let Some(p) = port {
					cfg.proxy_port = p;
				}
				if https {
					cfg.https = true;
				}
				if no_tls {
					cfg.https = false;
				}
				cfg.cert_override = cert;
				cfg.key_override = key;
				cfg.foreground = foreground;
				if let Some(dir) = state_dir {
					cfg.state_dir_override = Some(dir);
				}

				if foreground {
					daemon::run_foreground(cfg).await
				} else {
					let location = daemon::start_detached(&cfg).await?;
					println!(
						"proxy started on {}",
						hostname::display_url("localhost", location.port, location.https)
					);
					Ok(())
				}
			},
			ProxyAction::Stop => {
				let cfg = Config::default().apply_env();
				daemon::stop(&cfg).await
			},
		},
		Some(Command::List) => {
			let cfg = Config::default().apply_env();
			let Some(location) = daemon::discover(&cfg).await else {
				println!("no proxy daemon is running");
				return Ok(());
			};
			let store = RouteStore::new(&location.state);
			let routes = store.load_and_gc();
			if routes.is_empty() {
				println!("no apps registered");
			}
			for route in routes {
				println!(
					"{}  ->  127.0.0.1:{}  (pid {})",
					hostname::display_url(&route.hostname, location.port, location.https),
					route.port,
					route.pid
				);
			}
			Ok(())
		},
		Some(Command::Trust) => {
			let cfg = Config::default().apply_env();
			let state = StateDir::resolve(&cfg);
			let ca_path = state.cert_dir().join("ca.pem");
			if !ca_path.exists() {
				anyhow::bail!(
					"no local CA found at {}; start the proxy with --https at least once first",
					ca_path.display()
				);
			}
			install_trust(&ca_path)
		},
		None => {
			if cli.trailing.is_empty() {
				anyhow::bail!("usage: portless <name> <cmd> [args...] | portless proxy start|stop | portless list | portless trust");
			}
			let (name, rest) = cli.trailing.split_first().expect("checked non-empty above");
			let mut force = false;
			let command: Vec<String> = rest
				.iter()
				.filter(|a| {
					if *a == "--force" {
						force = true;
						false
					} else {
						true
					}
				})
				.cloned()
				.collect();
			let cfg = Config::default().apply_env();
			let code = app_runner::run(&cfg, name, &command, force).await?;
			info!(exit_code = code, "app exited");
			std::process::exit(code);
		},
	}
}

#[cfg(target_os = "macos")]
fn install_trust(ca_path: &std::path::Path) -> anyhow::Result<()> {
	let status = std::process::Command::new("security")
		.args(["add-trusted-cert", "-d", "-r", "trustRoot", "-k"])
		.arg(login_keychain())
		.arg(ca_path)
		.status()?;
	anyhow::ensure!(status.success(), "security add-trusted-cert failed");
	println!("CA trusted in the login keychain");
	Ok(())
}

#[cfg(target_os = "macos")]
fn login_keychain() -> String {
	std::env::var("HOME").map(|h| format!("{h}/Library/Keychains/login.keychain-db")).unwrap_or_default()
}

#[cfg(target_os = "linux")]
fn install_trust(ca_path: &std::path::Path) -> anyhow::Result<()> {
	let dest = std::path::Path::new("/usr/local/share/ca-certificates/portless-ca.crt");
	std::fs::copy(ca_path, dest).map_err(|e| {
		anyhow::anyhow!("failed to copy CA to {} ({e}); re-run with sudo", dest.display())
	})?;
	let status = std::process::Command::new("update-ca-certificates").status()?;
	anyhow::ensure!(status.success(), "update-ca-certificates failed");
	println!("CA trusted system-wide");
	Ok(())
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn install_trust(_ca_path: &std::path::Path) -> anyhow::Result<()> {
	anyhow::bail!("trust installation is only supported on macOS and Linux")
}
