//! Storage engine seam.
//!
//! The recovery workflow never opens table files itself; it drives the engine
//! through [`StoreEngine`] and releases what it gets back through [`StoreHandle`].
//! [`MockStoreEngine`] is a scripted implementation for tests and dry runs.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::OpenOptions;
use crate::error::EngineError;

/// An open store. Must be closed by whoever holds it.
pub trait StoreHandle {
    /// Releases the store, flushing whatever the engine needs to flush.
    fn close(self) -> Result<(), EngineError>;
}

/// Trait for the storage engine abstraction.
/// Implementations wrap a real engine or a mock for testing.
pub trait StoreEngine {
    /// Handle type returned by a successful open.
    type Handle: StoreHandle;

    /// Opens the store described by `options`.
    ///
    /// With `delete_corrupted_segments` set, the engine removes segments that
    /// fail their checksum from the manifest as part of the open.
    fn open(&self, options: &OpenOptions) -> Result<Self::Handle, EngineError>;
}

/// One scripted response of [`MockStoreEngine::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOpen {
    /// The open succeeds.
    Open,
    /// The open fails with the given error.
    Fail(EngineError),
}

#[derive(Debug, Default)]
struct MockState {
    script: VecDeque<MockOpen>,
    opens: Vec<OpenOptions>,
    closes: u64,
    outstanding: u64,
    close_error: Option<EngineError>,
}

/// In-memory mock engine for testing.
/// Replays a script of open results; an exhausted script opens successfully.
#[derive(Debug, Clone, Default)]
pub struct MockStoreEngine {
    state: Arc<Mutex<MockState>>,
}

impl MockStoreEngine {
    /// Creates a mock engine whose store always opens.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mock engine that replays `script` in order.
    pub fn with_script(script: impl IntoIterator<Item = MockOpen>) -> Self {
        let engine = Self::new();
        engine.state.lock().script.extend(script);
        engine
    }

    /// Appends a response to the script.
    pub fn push(&self, response: MockOpen) {
        self.state.lock().script.push_back(response);
    }

    /// Makes every subsequent close fail with `err`.
    pub fn fail_close_with(&self, err: EngineError) {
        self.state.lock().close_error = Some(err);
    }

    /// Options of every open call, in call order.
    pub fn opens(&self) -> Vec<OpenOptions> {
        self.state.lock().opens.clone()
    }

    /// Number of open calls made so far.
    pub fn open_count(&self) -> usize {
        self.state.lock().opens.len()
    }

    /// Number of handles closed so far.
    pub fn close_count(&self) -> u64 {
        self.state.lock().closes
    }

    /// Handles returned by `open` that have not been closed yet.
    pub fn outstanding_handles(&self) -> u64 {
        self.state.lock().outstanding
    }
}

impl StoreEngine for MockStoreEngine {
    type Handle = MockHandle;

    fn open(&self, options: &OpenOptions) -> Result<MockHandle, EngineError> {
        let mut state = self.state.lock();
        state.opens.push(options.clone());
        let response = state.script.pop_front().unwrap_or(MockOpen::Open);

        debug!(
            dir = %options.dir.display(),
            delete_corrupted = options.delete_corrupted_segments,
            read_only = options.read_only,
            response = ?response,
            "Mock open"
        );

        match response {
            MockOpen::Open => {
                state.outstanding += 1;
                Ok(MockHandle {
                    state: Arc::clone(&self.state),
                })
            }
            MockOpen::Fail(err) => Err(err),
        }
    }
}

/// Handle returned by [`MockStoreEngine`].
#[derive(Debug)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
}

impl StoreHandle for MockHandle {
    fn close(self) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        state.closes += 1;
        state.outstanding = state.outstanding.saturating_sub(1);
        match &state.close_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}
