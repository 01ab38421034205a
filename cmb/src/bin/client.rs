//! `cmb client`: fetches one resource from one or two server endpoints (§6).

use std::cell::Cell;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::rc::Rc;

use anyhow::{bail, Context};
use clap::{Arg, ArgAction, Command};
use log::{info, LevelFilter};
use stakker::{actor, ret_nop};

use protocol::{Endpoint, Partitioner, ReceiverSink};

/// The default sending rate a connection requests when `-r` isn't given (§4.7).
const DEFAULT_RATE_BPS: u32 = 1_000_000;

fn command() -> Command {
	Command::new("client")
		.about("Fetches a file over the CMB protocol")
		.arg(
			Arg::new("address")
				.short('a')
				.value_name("IP")
				.action(ArgAction::Append)
				.help("Server address for an endpoint; pairs in order with -p"),
		)
		.arg(
			Arg::new("port")
				.short('p')
				.value_name("PORT")
				.value_parser(clap::value_parser!(u16))
				.action(ArgAction::Append)
				.help("Server port for an endpoint; pairs in order with -a"),
		)
		.arg(
			Arg::new("rate")
				.short('r')
				.value_name("RATE_BPS")
				.value_parser(clap::value_parser!(u32))
				.action(ArgAction::Append)
				.help("Requested sending rate for the preceding endpoint, in bits/sec"),
		)
		.arg(Arg::new("verbose").short('v').action(ArgAction::Count).help("Increase log verbosity"))
		.arg(Arg::new("resource_id_hex").required(true).help("Resource hash, optionally followed by a length hint"))
		.arg(Arg::new("output").required(true).help("Output path, '-' for stdout, or /dev/null"))
}

fn parse_endpoints(matches: &clap::ArgMatches) -> anyhow::Result<Vec<Endpoint>> {
	let addrs: Vec<&String> = matches.get_many::<String>("address").map(Iterator::collect).unwrap_or_default();
	let ports: Vec<&u16> = matches.get_many::<u16>("port").map(Iterator::collect).unwrap_or_default();
	let rates: Vec<&u32> = matches.get_many::<u32>("rate").map(Iterator::collect).unwrap_or_default();

	if addrs.is_empty() || addrs.len() != ports.len() {
		bail!("at least one -a/-p pair is required, and each -a must be paired with a -p");
	}
	if addrs.len() > 2 {
		bail!("at most two -a/-p endpoints are supported");
	}
	if rates.len() > addrs.len() {
		bail!("more -r flags than endpoints");
	}

	let mut endpoints = Vec::with_capacity(addrs.len());

	for (i, (ip, &port)) in addrs.into_iter().zip(ports).enumerate() {
		let remote: IpAddr = ip.parse().context("invalid -a address")?;
		let requested_rate_bps = rates.get(i).map(|&&r| r).unwrap_or(DEFAULT_RATE_BPS);
		endpoints.push(Endpoint { local: SocketAddr::new(unspecified_of(remote), 0), remote: SocketAddr::new(remote, port), requested_rate_bps });
	}

	Ok(endpoints)
}

fn unspecified_of(addr: IpAddr) -> IpAddr {
	match addr {
		IpAddr::V4(_) => IpAddr::from([0, 0, 0, 0]),
		IpAddr::V6(_) => IpAddr::from([0u16; 8]),
	}
}

/// Parses `resource_id_hex` (§6): a 32-hex-char hash, optionally followed by
/// a 16-hex-char length hint. The length hint is, in practice, required:
/// there is no packet in this protocol that carries the resource length
/// from sender back to receiver, so without it the client has no way to
/// size its output file or know when the transfer is complete.
fn parse_resource_id(hex: &str) -> anyhow::Result<(u128, u64)> {
	if hex.len() < 32 {
		bail!("resource_id_hex must be at least 32 hex characters (the resource hash)");
	}
	if hex.len() != 48 {
		bail!("resource_id_hex must include the 16-hex-char length hint printed by the server");
	}

	let hash = u128::from_str_radix(&hex[..32], 16).context("invalid resource hash")?;
	let length = u64::from_str_radix(&hex[32..48], 16).context("invalid length hint")?;
	Ok((hash, length))
}

fn open_sink(path: &str, length: u64) -> anyhow::Result<ReceiverSink> {
	if path == "-" {
		Ok(ReceiverSink::stdout())
	} else if path == "/dev/null" {
		Ok(ReceiverSink::null())
	} else {
		ReceiverSink::file(Path::new(path), length).with_context(|| format!("failed to open {path} for writing"))
	}
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

	// Usage errors get exit code 2 (§6), distinct from the 1 a failed or
	// timed-out transfer maps to via `SessionError` below.
	let exit_on_bad_usage = |err: anyhow::Error| -> ! {
		eprintln!("cmb: {err:#}");
		std::process::exit(2);
	};

	let endpoints = parse_endpoints(&matches).unwrap_or_else(exit_on_bad_usage);
	let resource_id_hex = matches.get_one::<String>("resource_id_hex").expect("required");
	let output = matches.get_one::<String>("output").expect("required");

	let (resource_hash, resource_length) = parse_resource_id(resource_id_hex).unwrap_or_else(exit_on_bad_usage);
	let sink = open_sink(output, resource_length)?;

	info!("Fetching resource {resource_hash:032x} ({resource_length} bytes) to {output}");

	let outcome = Rc::new(Cell::new(None));

	let mut stakker = runtime::init();
	let s = &mut stakker;

	let _partitioner = actor!(s, Partitioner::init(endpoints, resource_hash, resource_length, sink, outcome.clone()), ret_nop!());

	runtime::exec(&mut stakker, || {}).map_err(|()| anyhow::anyhow!("runtime error"))?;

	match outcome.get() {
		Some(Ok(())) => {
			info!("Transfer complete");
			Ok(())
		}
		Some(Err(err)) => {
			eprintln!("cmb: {err}");
			std::process::exit(1);
		}
		None => {
			// Ctrl+C before the transfer concluded.
			std::process::exit(1);
		}
	}
}
