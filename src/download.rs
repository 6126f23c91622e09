//! Orchestrates remote-hashmap fetch → optional local-rehash resume →
//! parallel ranged GET into the destination.

use std::collections::HashMap as StdHashMap;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, info, warn};

use crate::block;
use crate::error::Error;
use crate::gateway::{Attrs, RestGateway};
use crate::progress::ProgressReporter;
use crate::scheduler::TransferScheduler;

/// Whether the destination sink supports random-access writes at arbitrary
/// offsets. A seekable regular file does; a pipe/terminal does not, and
/// must be written to sequentially in block-index order.
pub enum Destination<'a> {
	/// A plain, seekable file. May additionally be resumed from.
	File { file: &'a mut File, resume: bool },
	/// A non-seekable sink (pipe, terminal, anything `AsyncWrite`-only).
	Sequential(&'a mut (dyn tokio::io::AsyncWrite + Unpin + Send)),
}

/// An inclusive byte range, as accepted by `object_get_range`/`Range:`.
#[derive(Debug, Clone, Copy)]
pub struct ByteRange {
	pub start: u64,
	pub end: u64,
}

pub struct Downloader<G: RestGateway + ?Sized> {
	gateway: Arc<G>,
	pool_size: usize,
}

impl<G: RestGateway + 'static> Downloader<G> {
	pub fn new(gateway: Arc<G>, pool_size: usize) -> Self {
		Self { gateway, pool_size }
	}

	/// Download an object into `dest`. `range` and `resume` are mutually
	/// exclusive: combining an explicit byte range with resume-by-rehash is
	/// an ambiguity the engine refuses to guess at.
	pub async fn download_object(
		&self,
		obj: &str,
		dest: Destination<'_>,
		range: Option<ByteRange>,
		conds: &Attrs,
		download_progress: &mut dyn ProgressReporter,
	) -> Result<(), Error> {
		let resume = matches!(&dest, Destination::File { resume: true, .. });
		if resume && range.is_some() {
			return Err(Error::PreconditionError(
				"resume cannot be combined with an explicit byte range".to_string(),
			));
		}

		// `None` here means the server answered 304/412: the object exists but
		// the caller's condition wasn't met. That is a distinct outcome from a
		// 404, which `object_get_hashmap` already raises as `Error::NotFound`
		// itself rather than returning `None` for.
		let remote = self.gateway.object_get_hashmap(obj, conds).await?.ok_or_else(|| {
			Error::ConditionalNotMet(obj.to_string())
		})?;
		let policy = remote.policy();
		policy.validate()?;

		let blockids: StdHashMap<String, u64> = remote
			.hashes
			.iter()
			.enumerate()
			.map(|(id, h)| (h.clone(), id as u64))
			.collect();

		debug!(object = obj, blocks = remote.hashes.len(), bytes = remote.bytes, "fetched remote hashmap");

		match dest {
			Destination::Sequential(sink) => {
				let mut pending: Vec<Option<u64>> = (0..remote.hashes.len() as u64).map(Some).collect();
				self.dump_sequential(obj, &remote, &mut pending, sink, conds, download_progress)
					.await
			}
			Destination::File { file, resume: false } => {
				self.dump_parallel(obj, &remote, file, conds, download_progress)
					.await
			}
			Destination::File { file, resume: true } => {
				let mut pending: Vec<Option<u64>> = (0..remote.hashes.len() as u64).map(Some).collect();
				self.resolve_resume(file, &policy, &blockids, &mut pending)
					.await?;
				self.dump_parallel_subset(obj, &remote, file, &pending, conds, download_progress)
					.await
			}
		}
	}

	/// Rehash the existing local file and mark every block whose digest
	/// matches a remote block as already present (`None` in `pending`). A
	/// local digest absent from the remote set means the file is not a
	/// prefix/permutation of the object: fail without touching the file.
	async fn resolve_resume(
		&self,
		file: &mut File,
		policy: &crate::block::ContainerPolicy,
		blockids: &StdHashMap<String, u64>,
		pending: &mut [Option<u64>],
	) -> Result<(), Error> {
		let mut noop = crate::progress::NullProgress;
		let local = block::rehash_existing_file(file, policy, &mut noop).await?;

		for local_digest in &local.digests {
			match blockids.get(local_digest) {
				Some(&blockid) => {
					pending[blockid as usize] = None;
				}
				None => {
					return Err(Error::DivergentLocalFile(format!(
						"local block with digest {} is not present in remote object",
						local_digest
					)));
				}
			}
		}

		let remaining = pending.iter().filter(|b| b.is_some()).count();
		info!(
			resumed_blocks = local.digests.len() - remaining,
			remaining_blocks = remaining,
			"resuming download from local file"
		);
		Ok(())
	}

	async fn dump_sequential(
		&self,
		obj: &str,
		remote: &crate::gateway::RemoteHashmap,
		pending: &mut [Option<u64>],
		sink: &mut (dyn tokio::io::AsyncWrite + Unpin + Send),
		conds: &Attrs,
		progress: &mut dyn ProgressReporter,
	) -> Result<(), Error> {
		let total = pending.iter().filter(|b| b.is_some()).count() as u64;
		progress.init(total);

		for (blockid, slot) in pending.iter().enumerate() {
			if slot.is_none() {
				continue;
			}
			let (start, end) = block_range(blockid as u64, remote.blocksize, remote.bytes);
			let data = self.gateway.object_get_range(obj, start, end, conds).await?;
			sink.write_all(&data).await?;
			sink.flush().await?;
			progress.tick();
		}
		Ok(())
	}

	async fn dump_parallel(
		&self,
		obj: &str,
		remote: &crate::gateway::RemoteHashmap,
		file: &mut File,
		conds: &Attrs,
		progress: &mut dyn ProgressReporter,
	) -> Result<(), Error> {
		let pending: Vec<Option<u64>> = (0..remote.hashes.len() as u64).map(Some).collect();
		self.dump_parallel_subset(obj, remote, file, &pending, conds, progress)
			.await
	}

	/// For each remaining block id, submit a ranged GET through the bounded
	/// scheduler; on completion seek the sink to the block's absolute
	/// offset and write the bytes. After every task completes, truncate the
	/// sink to the object's total size.
	async fn dump_parallel_subset(
		&self,
		obj: &str,
		remote: &crate::gateway::RemoteHashmap,
		file: &mut File,
		pending: &[Option<u64>],
		conds: &Attrs,
		progress: &mut dyn ProgressReporter,
	) -> Result<(), Error> {
		let total = pending.iter().filter(|b| b.is_some()).count() as u64;
		progress.init(total);

		let mut scheduler: TransferScheduler<(u64, bytes::Bytes)> =
			TransferScheduler::new(self.pool_size);
		let mut first_error: Option<Error> = None;

		for (blockid, slot) in pending.iter().enumerate() {
			if slot.is_none() {
				continue;
			}
			if first_error.is_some() {
				break;
			}
			let (start, end) = block_range(blockid as u64, remote.blocksize, remote.bytes);
			let gateway = self.gateway.clone();
			let obj = obj.to_string();
			let conds = conds.clone();
			scheduler
				.submit(async move {
					let data = gateway.object_get_range(&obj, start, end, &conds).await?;
					Ok((start, data))
				})
				.await;

			for result in scheduler.poll_completed() {
				match result {
					Ok((start, data)) => {
						file.seek(SeekFrom::Start(start)).await?;
						file.write_all(&data).await?;
						progress.tick();
					}
					Err(e) => {
						warn!(error = %e, "aborting download after ranged GET failure");
						first_error = Some(e);
						break;
					}
				}
			}
		}

		for result in scheduler.join_all().await {
			if first_error.is_some() {
				continue;
			}
			match result {
				Ok((start, data)) => {
					file.seek(SeekFrom::Start(start)).await?;
					file.write_all(&data).await?;
					progress.tick();
				}
				Err(e) => first_error = Some(e),
			}
		}

		if let Some(e) = first_error {
			return Err(e);
		}

		file.set_len(remote.bytes).await?;
		Ok(())
	}
}

/// Inclusive byte range for block `blockid`, clamped to the object's total
/// size at the final block.
fn block_range(blockid: u64, blocksize: usize, total_size: u64) -> (u64, u64) {
	let start = blockid * blocksize as u64;
	let end = std::cmp::min(start + blocksize as u64, total_size).saturating_sub(1);
	(start, end)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::gateway::{ContainerInfo, HashmapCommitResult, RemoteHashmap};
	use async_trait::async_trait;
	use bytes::Bytes;
	use std::collections::HashMap as StdMap;
	use std::sync::Mutex;

	struct FakeGateway {
		object_bytes: Vec<u8>,
		hashmap: RemoteHashmap,
		get_range_calls: Mutex<Vec<(u64, u64)>>,
		conditional_miss: bool,
	}

	fn sha256_hex(data: &[u8]) -> String {
		use sha2::{Digest, Sha256};
		let mut hasher = Sha256::new();
		hasher.update(data);
		hex::encode(hasher.finalize())
	}

	fn rstrip_nul(data: &[u8]) -> &[u8] {
		let end = data.iter().rposition(|&b| b != 0).map(|i| i + 1).unwrap_or(0);
		&data[..end]
	}

	impl FakeGateway {
		fn new(data: Vec<u8>, blocksize: usize) -> Self {
			let mut hashes = Vec::new();
			let mut offset = 0usize;
			while offset < data.len() || hashes.is_empty() {
				let end = std::cmp::min(offset + blocksize, data.len());
				let chunk = &data[offset..end];
				let is_last = end == data.len();
				let digest = if is_last {
					sha256_hex(rstrip_nul(chunk))
				} else {
					sha256_hex(chunk)
				};
				hashes.push(digest);
				offset = end;
				if offset >= data.len() {
					break;
				}
			}
			let hashmap = RemoteHashmap {
				blocksize,
				blockhash: "sha256".to_string(),
				bytes: data.len() as u64,
				hashes,
			};
			Self {
				object_bytes: data,
				hashmap,
				get_range_calls: Mutex::new(Vec::new()),
				conditional_miss: false,
			}
		}
	}

	#[async_trait]
	impl RestGateway for FakeGateway {
		async fn container_info(&self) -> Result<ContainerInfo, Error> {
			unimplemented!()
		}
		async fn object_put_hashmap(
			&self,
			_obj: &str,
			_bytes: u64,
			_hashes: &[String],
			_attrs: &Attrs,
		) -> Result<HashmapCommitResult, Error> {
			unimplemented!()
		}
		async fn block_post(&self, _data: Bytes) -> Result<String, Error> {
			unimplemented!()
		}
		async fn object_get_hashmap(
			&self,
			_obj: &str,
			_attrs: &Attrs,
		) -> Result<Option<RemoteHashmap>, Error> {
			if self.conditional_miss {
				Ok(None)
			} else {
				Ok(Some(self.hashmap.clone()))
			}
		}
		async fn object_get_range(
			&self,
			_obj: &str,
			start: u64,
			end: u64,
			_attrs: &Attrs,
		) -> Result<Bytes, Error> {
			self.get_range_calls.lock().unwrap().push((start, end));
			Ok(Bytes::copy_from_slice(
				&self.object_bytes[start as usize..=end as usize],
			))
		}
		async fn object_put_simple(&self, _obj: &str, _data: Bytes, _attrs: &Attrs) -> Result<(), Error> {
			unimplemented!()
		}
		async fn object_post_append(&self, _obj: &str, _data: Bytes, _attrs: &Attrs) -> Result<(), Error> {
			unimplemented!()
		}
		async fn object_copy(&self, _src: &str, _dst: &str, _attrs: &Attrs) -> Result<(), Error> {
			unimplemented!()
		}
		async fn object_move(&self, _src: &str, _dst: &str, _attrs: &Attrs) -> Result<(), Error> {
			unimplemented!()
		}
	}

	#[tokio::test]
	async fn parallel_download_fetches_every_block_and_truncates() {
		let data = b"abcdefghij".to_vec(); // 10 bytes, blocksize 4 -> 3 blocks
		let gateway = Arc::new(FakeGateway::new(data.clone(), 4));
		let downloader = Downloader::new(gateway.clone(), 5);

		let mut file = tokio::fs::File::from_std(tempfile::tempfile().unwrap());
		let mut progress = crate::progress::NullProgress;
		downloader
			.download_object(
				"obj",
				Destination::File {
					file: &mut file,
					resume: false,
				},
				None,
				&Attrs::default(),
				&mut progress,
			)
			.await
			.unwrap();

		let mut calls = gateway.get_range_calls.lock().unwrap().clone();
		calls.sort();
		assert_eq!(calls, vec![(0, 3), (4, 7), (8, 9)]);

		file.seek(SeekFrom::Start(0)).await.unwrap();
		let mut out = Vec::new();
		tokio::io::AsyncReadExt::read_to_end(&mut file, &mut out)
			.await
			.unwrap();
		assert_eq!(out, data);
	}

	#[tokio::test]
	async fn resume_only_fetches_suffix_blocks() {
		let data = b"abcdefghij".to_vec();
		let gateway = Arc::new(FakeGateway::new(data.clone(), 4));
		let downloader = Downloader::new(gateway.clone(), 5);

		let mut file = tokio::fs::File::from_std(tempfile::tempfile().unwrap());
		tokio::io::AsyncWriteExt::write_all(&mut file, b"abcd").await.unwrap();
		file.flush().await.unwrap();

		let mut progress = crate::progress::NullProgress;
		downloader
			.download_object(
				"obj",
				Destination::File {
					file: &mut file,
					resume: true,
				},
				None,
				&Attrs::default(),
				&mut progress,
			)
			.await
			.unwrap();

		let calls = gateway.get_range_calls.lock().unwrap().clone();
		assert_eq!(calls.len(), 2);
		assert!(!calls.contains(&(0, 3)));
	}

	#[tokio::test]
	async fn divergent_local_file_is_rejected_without_writing() {
		let data = b"abcdefghij".to_vec();
		let gateway = Arc::new(FakeGateway::new(data.clone(), 4));
		let downloader = Downloader::new(gateway.clone(), 5);

		let mut file = tokio::fs::File::from_std(tempfile::tempfile().unwrap());
		// first block is wrong: does not correspond to any remote digest
		tokio::io::AsyncWriteExt::write_all(&mut file, b"XXXX").await.unwrap();
		file.flush().await.unwrap();

		let mut progress = crate::progress::NullProgress;
		let res = downloader
			.download_object(
				"obj",
				Destination::File {
					file: &mut file,
					resume: true,
				},
				None,
				&Attrs::default(),
				&mut progress,
			)
			.await;

		assert!(matches!(res, Err(Error::DivergentLocalFile(_))));
		assert!(gateway.get_range_calls.lock().unwrap().is_empty());
	}

	#[tokio::test]
	async fn resume_with_range_is_precondition_error() {
		let data = b"abcd".to_vec();
		let gateway = Arc::new(FakeGateway::new(data, 4));
		let downloader = Downloader::new(gateway, 5);

		let mut file = tokio::fs::File::from_std(tempfile::tempfile().unwrap());
		let mut progress = crate::progress::NullProgress;
		let res = downloader
			.download_object(
				"obj",
				Destination::File {
					file: &mut file,
					resume: true,
				},
				Some(ByteRange { start: 0, end: 1 }),
				&Attrs::default(),
				&mut progress,
			)
			.await;
		assert!(matches!(res, Err(Error::PreconditionError(_))));
	}

	#[tokio::test]
	async fn conditional_miss_is_distinct_from_not_found() {
		let mut gateway = FakeGateway::new(b"abcd".to_vec(), 4);
		gateway.conditional_miss = true;
		let gateway = Arc::new(gateway);
		let downloader = Downloader::new(gateway, 5);

		let mut file = tokio::fs::File::from_std(tempfile::tempfile().unwrap());
		let mut progress = crate::progress::NullProgress;
		let res = downloader
			.download_object(
				"obj",
				Destination::File {
					file: &mut file,
					resume: false,
				},
				None,
				&Attrs::default(),
				&mut progress,
			)
			.await;
		assert!(matches!(res, Err(Error::ConditionalNotMet(_))));
		assert!(!matches!(res, Err(Error::NotFound(_))));
	}

	#[test]
	fn block_range_arithmetic() {
		assert_eq!(block_range(0, 4, 10), (0, 3));
		assert_eq!(block_range(1, 4, 10), (4, 7));
		assert_eq!(block_range(2, 4, 10), (8, 9));
	}
}
