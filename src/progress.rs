//! Tick abstraction driven by the uploader/downloader at per-block granularity.
//!
//! Progress is always best-effort: a missing or panicking reporter must
//! never affect transfer correctness, so the orchestrators only ever call
//! these methods, never propagate anything out of them.

/// Receives progress ticks for one transfer.
///
/// `init` is called exactly once, before the first unit of work starts,
/// with the total number of units (blocks) that will be processed. `tick`
/// is then called once per completed unit.
pub trait ProgressReporter {
	fn init(&mut self, total: u64);
	fn tick(&mut self);
}

/// The default reporter: does nothing. Used whenever a caller does not
/// supply one of its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressReporter for NullProgress {
	fn init(&mut self, _total: u64) {}
	fn tick(&mut self) {}
}
