//! Narrow, typed interface over the Pithos-compatible HTTP surface.
//!
//! This is the only part of the engine that knows about HTTP verbs, headers
//! and query strings. Everything above it (`Uploader`, `Downloader`) talks
//! to a `RestGateway` trait object so that tests can swap in an in-process
//! fake instead of a real server.

use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use crate::block::ContainerPolicy;
use crate::error::Error;

/// Sharing ACL, as carried by `X-Object-Sharing`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sharing {
	pub read: Vec<String>,
	pub write: Vec<String>,
}

impl Sharing {
	/// Parse `key=value;key=value` pairs. An empty header means no sharing.
	pub fn parse(header: &str) -> Result<Self, Error> {
		let mut sharing = Sharing::default();
		if header.trim().is_empty() {
			return Ok(sharing);
		}
		for pair in header.split(';') {
			let pair = pair.trim();
			if pair.is_empty() {
				continue;
			}
			let (key, val) = pair.split_once('=').ok_or_else(|| {
				Error::FormatError(format!("malformed X-Object-Sharing entry: {}", pair))
			})?;
			match key.trim() {
				"read" => sharing
					.read
					.extend(val.split(',').map(|s| s.trim().to_string())),
				"write" => sharing
					.write
					.extend(val.split(',').map(|s| s.trim().to_string())),
				other => {
					return Err(Error::FormatError(format!(
						"unknown sharing key: {}",
						other
					)))
				}
			}
		}
		Ok(sharing)
	}

	pub fn to_header(&self) -> String {
		let mut parts = Vec::new();
		if !self.read.is_empty() {
			parts.push(format!("read={}", self.read.join(",")));
		}
		if !self.write.is_empty() {
			parts.push(format!("write={}", self.write.join(",")));
		}
		parts.join(";")
	}
}

/// Flat option bag for every per-call attribute the gateway understands.
/// Unrecognized combinations are simply never set; there is no rejection
/// of "unknown" options since the struct is closed.
#[derive(Debug, Clone, Default)]
pub struct Attrs {
	pub etag: Option<String>,
	pub content_type: Option<String>,
	pub content_encoding: Option<String>,
	pub content_disposition: Option<String>,
	pub sharing: Option<Sharing>,
	pub public: bool,
	pub version: Option<String>,
	pub if_match: Option<String>,
	pub if_none_match: Option<String>,
	pub if_modified_since: Option<String>,
	pub if_unmodified_since: Option<String>,
	pub source_version: Option<String>,
	pub delimiter: Option<String>,
	pub manifest: Option<String>,
	/// Byte-range marker for an overwrite chunk, e.g. `bytes 0-3/*`
	pub content_range: Option<String>,
}

/// `{blocksize, blockhash, bytes, hashes[]}`, the server's view of an
/// object's hashmap.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteHashmap {
	#[serde(rename = "block_size")]
	pub blocksize: usize,
	#[serde(rename = "block_hash")]
	pub blockhash: String,
	pub bytes: u64,
	pub hashes: Vec<String>,
}

impl RemoteHashmap {
	pub fn policy(&self) -> ContainerPolicy {
		ContainerPolicy {
			blocksize: self.blocksize,
			blockhash: self.blockhash.clone(),
		}
	}
}

/// Quota/policy snapshot returned by `container_info`.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
	pub blocksize: usize,
	pub blockhash: String,
	pub quota: Option<u64>,
}

impl ContainerInfo {
	pub fn policy(&self) -> ContainerPolicy {
		ContainerPolicy {
			blocksize: self.blocksize,
			blockhash: self.blockhash.clone(),
		}
	}
}

/// Outcome of committing a candidate hashmap: 409 is a normal "tell me what
/// you're missing" reply, not an error, so it is folded into this sum type
/// instead of being raised as an exception.
#[derive(Debug, Clone)]
pub enum HashmapCommitResult {
	Stored,
	Missing(Vec<String>),
}

#[derive(Debug, Serialize)]
struct HashmapBody<'a> {
	bytes: u64,
	hashes: &'a [String],
}

/// The narrow capability set the transfer engine depends on. Each call is a
/// single HTTP request/response; there are no retries inside the gateway —
/// that discipline belongs to the orchestrators above it.
#[async_trait]
pub trait RestGateway: Send + Sync {
	async fn container_info(&self) -> Result<ContainerInfo, Error>;

	async fn object_put_hashmap(
		&self,
		obj: &str,
		bytes: u64,
		hashes: &[String],
		attrs: &Attrs,
	) -> Result<HashmapCommitResult, Error>;

	async fn block_post(&self, data: Bytes) -> Result<String, Error>;

	async fn object_get_hashmap(
		&self,
		obj: &str,
		attrs: &Attrs,
	) -> Result<Option<RemoteHashmap>, Error>;

	async fn object_get_range(
		&self,
		obj: &str,
		start: u64,
		end: u64,
		attrs: &Attrs,
	) -> Result<Bytes, Error>;

	async fn object_put_simple(&self, obj: &str, data: Bytes, attrs: &Attrs) -> Result<(), Error>;

	async fn object_post_append(&self, obj: &str, data: Bytes, attrs: &Attrs) -> Result<(), Error>;

	async fn object_copy(&self, src: &str, dst: &str, attrs: &Attrs) -> Result<(), Error>;

	async fn object_move(&self, src: &str, dst: &str, attrs: &Attrs) -> Result<(), Error>;
}

/// Pure header-parsing for `container_info`, split out so it can be
/// exercised without a live HTTP response.
fn parse_container_headers(headers: &reqwest::header::HeaderMap) -> Result<ContainerInfo, Error> {
	let blocksize = headers
		.get("X-Container-Block-Size")
		.ok_or_else(|| Error::PolicyError("missing X-Container-Block-Size".to_string()))?
		.to_str()
		.map_err(|e| Error::FormatError(e.to_string()))?
		.parse::<usize>()
		.map_err(|e| Error::PolicyError(e.to_string()))?;

	let blockhash = headers
		.get("X-Container-Block-Hash")
		.ok_or_else(|| Error::PolicyError("missing X-Container-Block-Hash".to_string()))?
		.to_str()
		.map_err(|e| Error::FormatError(e.to_string()))?
		.to_string();

	let quota = headers
		.get("X-Container-Policy-Quota")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.parse::<u64>().ok());

	Ok(ContainerInfo {
		blocksize,
		blockhash,
		quota,
	})
}

struct BoundContainer {
	account: String,
	container: String,
}

/// The production `RestGateway`, backed by a single shared `reqwest::Client`.
///
/// Connection pooling lives in the `reqwest::Client`, created once per
/// process; `base_url`/`token` are read-mostly, and the bound
/// `(account, container)` pair may be changed with `set_container` but the
/// caller MUST serialize such changes against any in-flight transfer.
pub struct HttpGateway {
	client: reqwest::Client,
	base_url: String,
	token: String,
	bound: RwLock<Option<BoundContainer>>,
}

impl HttpGateway {
	pub fn new(base_url: String, token: String, timeout: std::time::Duration) -> Result<Self, Error> {
		let client = reqwest::Client::builder()
			.timeout(timeout)
			.build()
			.map_err(Error::NetworkError)?;
		Ok(Self {
			client,
			base_url,
			token,
			bound: RwLock::new(None),
		})
	}

	/// Bind the gateway to an `{account}/{container}` pair. MUST NOT be
	/// called while a transfer using this gateway is in flight.
	pub fn set_container(&self, account: String, container: String) {
		let mut bound = self.bound.write().unwrap();
		*bound = Some(BoundContainer { account, container });
	}

	fn bound_path(&self) -> Result<(String, String), Error> {
		let bound = self.bound.read().unwrap();
		match bound.as_ref() {
			Some(b) => Ok((b.account.clone(), b.container.clone())),
			None => Err(Error::PreconditionError(
				"gateway has no bound account/container".to_string(),
			)),
		}
	}

	fn container_url(&self) -> Result<String, Error> {
		let (account, container) = self.bound_path()?;
		Ok(format!("{}/{}/{}", self.base_url, account, container))
	}

	fn object_url(&self, obj: &str) -> Result<String, Error> {
		Ok(format!("{}/{}", self.container_url()?, obj))
	}

	fn apply_attrs(&self, mut req: reqwest::RequestBuilder, attrs: &Attrs) -> reqwest::RequestBuilder {
		if let Some(etag) = &attrs.etag {
			req = req.header("ETag", etag);
		}
		if let Some(v) = &attrs.content_type {
			req = req.header("Content-Type", v);
		}
		if let Some(v) = &attrs.content_encoding {
			req = req.header("Content-Encoding", v);
		}
		if let Some(v) = &attrs.content_disposition {
			req = req.header("Content-Disposition", v);
		}
		if let Some(sharing) = &attrs.sharing {
			req = req.header("X-Object-Sharing", sharing.to_header());
		}
		if attrs.public {
			req = req.header("X-Object-Public", "true");
		}
		if let Some(v) = &attrs.version {
			req = req.query(&[("version", v)]);
		}
		if let Some(v) = &attrs.if_match {
			req = req.header("If-Match", v);
		}
		if let Some(v) = &attrs.if_none_match {
			req = req.header("If-None-Match", v);
		}
		if let Some(v) = &attrs.if_modified_since {
			req = req.header("If-Modified-Since", v);
		}
		if let Some(v) = &attrs.if_unmodified_since {
			req = req.header("If-Unmodified-Since", v);
		}
		if let Some(v) = &attrs.source_version {
			req = req.header("X-Source-Version", v);
		}
		if let Some(v) = &attrs.delimiter {
			req = req.query(&[("delimiter", v)]);
		}
		if let Some(v) = &attrs.manifest {
			req = req.header("X-Object-Manifest", v);
		}
		if let Some(v) = &attrs.content_range {
			req = req.header("Content-Range", v);
		}
		req
	}

	fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		req.header("X-Auth-Token", &self.token)
	}
}

#[async_trait]
impl RestGateway for HttpGateway {
	async fn container_info(&self) -> Result<ContainerInfo, Error> {
		let url = self.container_url()?;
		let req = self.auth(self.client.request(Method::HEAD, &url));
		let resp = req.send().await?;
		if resp.status() == StatusCode::UNAUTHORIZED {
			return Err(Error::AuthError("container_info".to_string()));
		}
		if resp.status() == StatusCode::NOT_FOUND {
			return Err(Error::NotFound(url));
		}
		parse_container_headers(resp.headers())
	}

	async fn object_put_hashmap(
		&self,
		obj: &str,
		bytes: u64,
		hashes: &[String],
		attrs: &Attrs,
	) -> Result<HashmapCommitResult, Error> {
		let url = format!("{}?hashmap&format=json", self.object_url(obj)?);
		let body = HashmapBody { bytes, hashes };

		let req = self.auth(self.client.put(&url));
		let req = self.apply_attrs(req, attrs).json(&body);
		let resp = req.send().await?;

		match resp.status() {
			StatusCode::CREATED => Ok(HashmapCommitResult::Stored),
			StatusCode::CONFLICT => {
				let missing: Vec<String> = resp.json().await.map_err(Error::NetworkError)?;
				Ok(HashmapCommitResult::Missing(missing))
			}
			StatusCode::UNAUTHORIZED => Err(Error::AuthError(obj.to_string())),
			StatusCode::NOT_FOUND => Err(Error::NotFound(obj.to_string())),
			other => Err(Error::Conflict(format!(
				"unexpected status committing hashmap for {}: {}",
				obj, other
			))),
		}
	}

	async fn block_post(&self, data: Bytes) -> Result<String, Error> {
		let (account, container) = self.bound_path()?;
		let url = format!("{}/{}/{}?update", self.base_url, account, container);

		let req = self
			.auth(self.client.post(&url))
			.header("Content-Type", "application/octet-stream")
			.body(data);
		let resp = req.send().await?;

		if resp.status() != StatusCode::ACCEPTED {
			return Err(Error::Conflict(format!(
				"unexpected status on block_post: {}",
				resp.status()
			)));
		}
		let hashes: Vec<String> = resp.json().await.map_err(Error::NetworkError)?;
		hashes
			.into_iter()
			.next()
			.ok_or_else(|| Error::FormatError("empty block_post response".to_string()))
	}

	async fn object_get_hashmap(
		&self,
		obj: &str,
		attrs: &Attrs,
	) -> Result<Option<RemoteHashmap>, Error> {
		let url = format!("{}?hashmap&format=json", self.object_url(obj)?);
		let req = self.auth(self.client.get(&url));
		let req = self.apply_attrs(req, attrs);
		let resp = req.send().await?;

		match resp.status() {
			StatusCode::OK => {
				let hashmap: RemoteHashmap = resp.json().await.map_err(Error::NetworkError)?;
				Ok(Some(hashmap))
			}
			StatusCode::NOT_MODIFIED | StatusCode::PRECONDITION_FAILED => Ok(None),
			StatusCode::NOT_FOUND => Err(Error::NotFound(obj.to_string())),
			StatusCode::UNAUTHORIZED => Err(Error::AuthError(obj.to_string())),
			other => Err(Error::Conflict(format!(
				"unexpected status fetching hashmap for {}: {}",
				obj, other
			))),
		}
	}

	async fn object_get_range(
		&self,
		obj: &str,
		start: u64,
		end: u64,
		attrs: &Attrs,
	) -> Result<Bytes, Error> {
		let url = self.object_url(obj)?;
		let req = self
			.auth(self.client.get(&url))
			.header("Range", format!("bytes={}-{}", start, end));
		let req = self.apply_attrs(req, attrs);
		let resp = req.send().await?;

		match resp.status() {
			StatusCode::OK | StatusCode::PARTIAL_CONTENT => {
				resp.bytes().await.map_err(Error::NetworkError)
			}
			StatusCode::NOT_FOUND => Err(Error::NotFound(obj.to_string())),
			other => Err(Error::Conflict(format!(
				"unexpected status ranged-GET for {}: {}",
				obj, other
			))),
		}
	}

	async fn object_put_simple(&self, obj: &str, data: Bytes, attrs: &Attrs) -> Result<(), Error> {
		let url = self.object_url(obj)?;
		let req = self.auth(self.client.put(&url));
		let req = self.apply_attrs(req, attrs).body(data);
		let resp = req.send().await?;
		if resp.status() != StatusCode::CREATED {
			return Err(Error::Conflict(format!(
				"unexpected status on simple PUT for {}: {}",
				obj,
				resp.status()
			)));
		}
		Ok(())
	}

	async fn object_post_append(&self, obj: &str, data: Bytes, attrs: &Attrs) -> Result<(), Error> {
		let url = format!("{}?update", self.object_url(obj)?);
		let req = self.auth(self.client.post(&url));
		let req = self.apply_attrs(req, attrs).body(data);
		let resp = req.send().await?;
		if resp.status() != StatusCode::ACCEPTED {
			return Err(Error::Conflict(format!(
				"unexpected status on append POST for {}: {}",
				obj,
				resp.status()
			)));
		}
		Ok(())
	}

	async fn object_copy(&self, src: &str, dst: &str, attrs: &Attrs) -> Result<(), Error> {
		let dst_url = self.object_url(dst)?;
		let src_path = format!("/{}", self.object_url(src)?.trim_start_matches(&self.base_url));
		let req = self
			.auth(self.client.request(Method::PUT, &dst_url))
			.header("X-Copy-From", src_path);
		let req = self.apply_attrs(req, attrs);
		let resp = req.send().await?;
		if resp.status() != StatusCode::CREATED {
			return Err(Error::Conflict(format!(
				"unexpected status on copy {} -> {}: {}",
				src,
				dst,
				resp.status()
			)));
		}
		Ok(())
	}

	async fn object_move(&self, src: &str, dst: &str, attrs: &Attrs) -> Result<(), Error> {
		let dst_url = self.object_url(dst)?;
		let src_path = format!("/{}", self.object_url(src)?.trim_start_matches(&self.base_url));
		let req = self
			.auth(self.client.request(Method::PUT, &dst_url))
			.header("X-Move-From", src_path);
		let req = self.apply_attrs(req, attrs);
		let resp = req.send().await?;
		if resp.status() != StatusCode::CREATED {
			return Err(Error::Conflict(format!(
				"unexpected status on move {} -> {}: {}",
				src,
				dst,
				resp.status()
			)));
		}
		Ok(())
	}
}
