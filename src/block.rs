//! Splits a byte stream into fixed-size blocks and computes their digests.
//!
//! This is the only piece of the engine with no network or scheduling
//! concerns: `hash_stream` and `rehash_existing_file` are pure functions of
//! their input bytes and the container's block policy (see the
//! determinism property in the engine's testable-properties list).

use std::collections::HashMap as StdHashMap;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Error;

/// Container-level block policy, discovered once per transfer via
/// `RestGateway::container_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPolicy {
	pub blocksize: usize,
	pub blockhash: String,
}

impl ContainerPolicy {
	pub fn validate(&self) -> Result<(), Error> {
		if self.blocksize == 0 {
			return Err(Error::PolicyError(
				"container block size is zero".to_string(),
			));
		}
		if self.blockhash.is_empty() {
			return Err(Error::PolicyError(
				"container block hash algorithm is empty".to_string(),
			));
		}
		if self.blockhash != "sha256" {
			return Err(Error::PolicyError(format!(
				"unsupported block hash algorithm: {}",
				self.blockhash
			)));
		}
		Ok(())
	}
}

/// `{digest -> (offset, length)}` for one local file, in block-index order.
/// `offset`/`length` describe the untrimmed on-disk extent of the block, so
/// a re-upload of that block sends the original bytes, NULs included.
pub type BlockIndex = StdHashMap<String, (u64, u64)>;

/// The ordered list of block digests plus the local index needed to
/// re-read any one of them.
#[derive(Debug, Clone, Default)]
pub struct HashMap {
	pub digests: Vec<String>,
	pub index: BlockIndex,
}

impl HashMap {
	pub fn new(digests: Vec<String>, index: BlockIndex) -> Self {
		Self { digests, index }
	}
}

/// Lowercase hex digest of `block.blockhash` over `data`, after right-trimming
/// NUL bytes from `data`.
fn digest_block(data: &[u8], blockhash: &str) -> Result<String, Error> {
	match blockhash {
		"sha256" => {
			let trimmed = rstrip_nul(data);
			let mut hasher = Sha256::new();
			hasher.update(trimmed);
			Ok(hex::encode(hasher.finalize()))
		}
		other => Err(Error::PolicyError(format!(
			"unsupported block hash algorithm: {}",
			other
		))),
	}
}

fn rstrip_nul(data: &[u8]) -> &[u8] {
	let end = data.iter().rposition(|&b| b != 0).map(|i| i + 1).unwrap_or(0);
	&data[..end]
}

fn nblocks_for(size: u64, blocksize: usize) -> u64 {
	if size == 0 {
		1
	} else {
		(size + blocksize as u64 - 1) / blocksize as u64
	}
}

/// Reads `stream` sequentially in chunks of exactly `policy.blocksize` bytes
/// (the final chunk may be short), hashing each one. The NUL-trim for the
/// digest only applies to the final block; the index always records the
/// untrimmed extent.
pub async fn hash_stream<R: AsyncRead + Unpin>(
	mut stream: R,
	size: u64,
	policy: &ContainerPolicy,
	progress: &mut dyn crate::progress::ProgressReporter,
) -> Result<HashMap, Error> {
	policy.validate()?;

	let nblocks = nblocks_for(size, policy.blocksize);
	let mut digests = Vec::with_capacity(nblocks as usize);
	let mut index = BlockIndex::new();

	progress.init(nblocks);
	for i in 0..nblocks {
		let offset = i * policy.blocksize as u64;
		let this_block_len = if size == 0 {
			0
		} else {
			std::cmp::min(policy.blocksize as u64, size - offset)
		};

		let mut buf = vec![0u8; this_block_len as usize];
		stream.read_exact(&mut buf).await?;

		let digest = digest_block(&buf, &policy.blockhash)?;
		index.insert(digest.clone(), (offset, this_block_len));
		digests.push(digest);
		progress.tick();
	}

	Ok(HashMap::new(digests, index))
}

/// Identical algorithm to `hash_stream`, but reads through an existing local
/// file in place. Used during download resume to decide which remote blocks
/// are already present locally.
pub async fn rehash_existing_file(
	file: &mut File,
	policy: &ContainerPolicy,
	progress: &mut dyn crate::progress::ProgressReporter,
) -> Result<HashMap, Error> {
	let size = file.metadata().await?.len();
	hash_stream(file, size, policy, progress).await
}

#[cfg(test)]
mod test {
	use super::*;
	use std::io::Cursor;

	fn policy(blocksize: usize) -> ContainerPolicy {
		ContainerPolicy {
			blocksize,
			blockhash: "sha256".to_string(),
		}
	}

	fn sha256_hex(data: &[u8]) -> String {
		let mut hasher = Sha256::new();
		hasher.update(data);
		hex::encode(hasher.finalize())
	}

	#[tokio::test]
	async fn splits_full_blocks() {
		let data = b"abcdefgh".to_vec();
		let mut progress = crate::progress::NullProgress;
		let hm = hash_stream(Cursor::new(data), 8, &policy(4), &mut progress)
			.await
			.unwrap();
		assert_eq!(hm.digests.len(), 2);
		assert_eq!(hm.digests[0], sha256_hex(b"abcd"));
		assert_eq!(hm.digests[1], sha256_hex(b"efgh"));
		assert_eq!(hm.index[&hm.digests[0]], (0, 4));
		assert_eq!(hm.index[&hm.digests[1]], (4, 4));
	}

	#[tokio::test]
	async fn trims_trailing_nuls_on_last_block_only() {
		let data = b"abcd\x00\x00".to_vec();
		let mut progress = crate::progress::NullProgress;
		let hm = hash_stream(Cursor::new(data), 6, &policy(4), &mut progress)
			.await
			.unwrap();
		assert_eq!(hm.digests.len(), 2);
		assert_eq!(hm.digests[0], sha256_hex(b"abcd"));
		assert_eq!(hm.digests[1], sha256_hex(b""));
		// the untrimmed extent is still recorded so re-upload sends the NULs
		assert_eq!(hm.index[&hm.digests[1]], (4, 2));
	}

	#[tokio::test]
	async fn empty_stream_is_one_zero_length_block() {
		let mut progress = crate::progress::NullProgress;
		let hm = hash_stream(Cursor::new(Vec::new()), 0, &policy(4), &mut progress)
			.await
			.unwrap();
		assert_eq!(hm.digests.len(), 1);
		assert_eq!(hm.digests[0], sha256_hex(b""));
		assert_eq!(hm.index[&hm.digests[0]], (0, 0));
	}

	#[tokio::test]
	async fn deterministic_across_runs() {
		let data = b"the quick brown fox".to_vec();
		let mut progress = crate::progress::NullProgress;
		let hm1 = hash_stream(Cursor::new(data.clone()), data.len() as u64, &policy(4), &mut progress)
			.await
			.unwrap();
		let hm2 = hash_stream(Cursor::new(data.clone()), data.len() as u64, &policy(4), &mut progress)
			.await
			.unwrap();
		assert_eq!(hm1.digests, hm2.digests);
	}

	#[tokio::test]
	async fn short_stream_is_io_error() {
		let data = b"abc".to_vec();
		let mut progress = crate::progress::NullProgress;
		// claims 8 bytes but the stream only has 3
		let res = hash_stream(Cursor::new(data), 8, &policy(4), &mut progress).await;
		assert!(matches!(res, Err(Error::IOError(_))));
	}

	#[test]
	fn zero_blocksize_is_policy_error() {
		assert!(policy(0).validate().is_err());
	}
}
