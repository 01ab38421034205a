//! The resource store: random-access source blocks on the sender, an
//! out-of-order write sink on the receiver (§4.3).

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Stdout, Write};
use std::sync::Arc;

use log::warn;
use utils::error::Result;

use fec::BLOCK_SIZE;

/// A loaded resource, shared without copying between every connection
/// serving it.
#[derive(Clone)]
pub struct SenderStore {
	bytes: Arc<[u8]>,
}

impl SenderStore {
	pub fn new(bytes: Vec<u8>) -> Self {
		Self { bytes: Arc::from(bytes) }
	}

	pub fn len(&self) -> u64 {
		self.bytes.len() as u64
	}

	/// Number of fixed-size blocks this resource is split into; `0` for an empty resource.
	pub fn block_count(&self) -> u64 {
		self.len().div_ceil(BLOCK_SIZE)
	}

	/// Source bytes for `block_id`, unpadded. `None` if out of range.
	pub fn block(&self, block_id: u64) -> Option<&[u8]> {
		let start = block_id.checked_mul(BLOCK_SIZE)?;
		if start >= self.len() {
			return None;
		}
		let end = (start + BLOCK_SIZE).min(self.len());
		Some(&self.bytes[start as usize..end as usize])
	}
}

/// Where the receiver writes decoded blocks (§4.3): a regular file, stdout,
/// or a no-op sink for `/dev/null`.
pub enum ReceiverSink {
	File { file: File, length: u64 },
	Stdout { stdout: Stdout, next: u64, pending: std::collections::BTreeMap<u64, Vec<u8>> },
	Null,
}

impl ReceiverSink {
	pub fn file(path: &std::path::Path, length: u64) -> io::Result<Self> {
		let file = File::options().write(true).create(true).truncate(true).open(path)?;
		file.set_len(length)?;
		Ok(Self::File { file, length })
	}

	pub fn stdout() -> Self {
		Self::Stdout { stdout: io::stdout(), next: 0, pending: std::collections::BTreeMap::new() }
	}

	pub fn null() -> Self {
		Self::Null
	}

	/// Write a decoded block at its offset (`block_id * BLOCK_SIZE`),
	/// truncating any bytes past the resource's true length.
	pub fn write_block(&mut self, block_id: u64, bytes: &[u8]) -> Result {
		match self {
			ReceiverSink::File { file, length } => {
				let offset = block_id * BLOCK_SIZE;
				if offset >= *length {
					return Ok(());
				}
				let n = ((*length - offset).min(bytes.len() as u64)) as usize;
				file.seek(SeekFrom::Start(offset)).map_err(|err| warn!("Failed to seek output file: {err}"))?;
				file.write_all(&bytes[..n]).map_err(|err| warn!("Failed to write output file: {err}"))?;
				Ok(())
			}
			ReceiverSink::Stdout { stdout, next, pending } => {
				if block_id != *next {
					pending.insert(block_id, bytes.to_vec());
					return Ok(());
				}

				stdout.write_all(bytes).map_err(|err| warn!("Failed to write to stdout: {err}"))?;
				*next += 1;

				while let Some(buf) = pending.remove(next) {
					stdout.write_all(&buf).map_err(|err| warn!("Failed to write to stdout: {err}"))?;
					*next += 1;
				}

				Ok(())
			}
			ReceiverSink::Null => Ok(()),
		}
	}
}
