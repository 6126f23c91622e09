//! Crate-wide error type for the transfer engine

use err_derive::Error;

/// All errors that can be produced by the transfer engine.
///
/// Variant names follow the error taxonomy of the engine's design: each
/// represents one outcome an orchestrator or a `RestGateway` call can
/// surface, never a raw transport/parse detail leaking past its boundary.
#[derive(Debug, Error)]
pub enum Error {
	/// Transport failure or a response the gateway could not make sense of
	#[error(display = "Network error: {}", _0)]
	NetworkError(#[error(source)] reqwest::Error),

	/// Server returned 401
	#[error(display = "Authentication error: {}", _0)]
	AuthError(String),

	/// Missing bound account/container, or otherwise invalid arguments,
	/// detected before any I/O was attempted
	#[error(display = "Precondition error: {}", _0)]
	PreconditionError(String),

	/// Container policy (blocksize/blockhash) missing or malformed
	#[error(display = "Policy error: {}", _0)]
	PolicyError(String),

	/// Server-computed block hash does not match the local hash
	#[error(display = "Block corruption: server hash {} != local hash {}", server_hash, local_hash)]
	BlockCorruption {
		server_hash: String,
		local_hash: String,
	},

	/// Final hashmap commit did not return 201 (another writer raced us)
	#[error(display = "Consistency error: {}", _0)]
	ConsistencyError(String),

	/// Resume: a local block's digest is not present in the remote hashmap
	#[error(display = "Local file diverges from remote object: {}", _0)]
	DivergentLocalFile(String),

	/// Malformed JSON body, or a malformed `X-Object-Sharing` header
	#[error(display = "Format error: {}", _0)]
	FormatError(String),

	/// 404 where a resource was required to exist
	#[error(display = "Not found: {}", _0)]
	NotFound(String),

	/// A conditional request (If-Match/If-None-Match/If-Modified-Since/...)
	/// was not satisfied (304/412): distinct from `NotFound`, since the
	/// object exists, it just doesn't match the caller's condition
	#[error(display = "Conditional request not satisfied: {}", _0)]
	ConditionalNotMet(String),

	/// 409 outside of the known "missing blocks" hashmap-commit path
	#[error(display = "Conflict: {}", _0)]
	Conflict(String),

	/// Local file I/O failure: read, seek, write, or truncate
	#[error(display = "I/O error: {}", _0)]
	IOError(#[error(source)] std::io::Error),

	/// Malformed JSON payload from the server
	#[error(display = "JSON error: {}", _0)]
	JsonError(#[error(source)] serde_json::Error),

	/// Malformed configuration file
	#[error(display = "Configuration error: {}", _0)]
	ConfigError(String),
}
