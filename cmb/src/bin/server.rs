//! `cmb server`: serves one resource over one or more bound UDP endpoints (§6).

use std::net::{IpAddr, SocketAddr};

use anyhow::{bail, Context};
use clap::{Arg, ArgAction, Command};
use log::{info, LevelFilter};
use stakker::{actor, ret_nop};

use protocol::{Sender, SenderStore};

fn command() -> Command {
	Command::new("server")
		.about("Serves a file over the CMB protocol")
		.arg(
			Arg::new("address")
				.short('a')
				.value_name("IP")
				.action(ArgAction::Append)
				.help("Bind address for an endpoint; pairs in order with -p"),
		)
		.arg(
			Arg::new("port")
				.short('p')
				.value_name("PORT")
				.value_parser(clap::value_parser!(u16))
				.action(ArgAction::Append)
				.help("Bind port for an endpoint; pairs in order with -a"),
		)
		.arg(Arg::new("verbose").short('v').action(ArgAction::Count).help("Increase log verbosity"))
		.arg(Arg::new("file").required(true).help("File to serve"))
}

fn parse_binds(matches: &clap::ArgMatches) -> anyhow::Result<Vec<SocketAddr>> {
	let addrs: Vec<&String> = matches.get_many::<String>("address").map(Iterator::collect).unwrap_or_default();
	let ports: Vec<&u16> = matches.get_many::<u16>("port").map(Iterator::collect).unwrap_or_default();

	if addrs.len() != ports.len() {
		bail!("each -a must be paired with a -p");
	}

	if addrs.is_empty() {
		return Ok(vec![SocketAddr::new(IpAddr::from([0, 0, 0, 0]), 0)]);
	}

	addrs
		.into_iter()
		.zip(ports)
		.map(|(ip, &port)| Ok(SocketAddr::new(ip.parse().context("invalid -a address")?, port)))
		.collect()
}

fn main() -> anyhow::Result<()> {
	let matches = command().get_matches();

	let level = match matches.get_count("verbose") {
		0 => LevelFilter::Info,
		1 => LevelFilter::Debug,
		_ => LevelFilter::Trace,
	};
	log::set_boxed_logger(Box::new(runtime::logger::Logger)).expect("logger installed exactly once");
	log::set_max_level(level);

	// Usage errors get exit code 2 (§6), distinct from the 1 a transfer
	// failure or a runtime error maps to via anyhow's default `main` handling.
	let binds = parse_binds(&matches).unwrap_or_else(|err| {
		eprintln!("cmb: {err:#}");
		std::process::exit(2);
	});
	let path = matches.get_one::<String>("file").expect("required");

	let bytes = std::fs::read(path).with_context(|| format!("failed to read {path}"))?;
	let resource_length = bytes.len() as u64;
	let resource_hash = hash_resource(&bytes);

	println!("{resource_hash:032x}{resource_length:016x}");

	let store = SenderStore::new(bytes);

	let mut stakker = runtime::init();
	let s = &mut stakker;

	// Kept alive for the lifetime of the process; dropping it would tear
	// down every listener. If every bind fails, `Sender::init` returns
	// `None` and the actor simply never serves anything.
	let _sender = actor!(s, Sender::init(resource_hash, store, binds.clone()), ret_nop!());

	for addr in &binds {
		info!("Serving {path} on {addr}");
	}

	runtime::exec(&mut stakker, || {}).map_err(|()| anyhow::anyhow!("runtime error"))?;

	Ok(())
}

/// The 128-bit resource identity (§6): the low 16 bytes of a BLAKE3 digest.
fn hash_resource(bytes: &[u8]) -> u128 {
	let digest = blake3::hash(bytes);
	let mut buf = [0u8; 16];
	buf.copy_from_slice(&digest.as_bytes()[..16]);
	u128::from_be_bytes(buf)
}
