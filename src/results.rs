//! Per-channel result maps fed by the processing stages.
//!
//! A [`ResultMap`] is a 2-D array of `rows x pullback_frames` `f32` values,
//! stored column-major so that one frame's column is contiguous. Exactly one
//! processing stage writes a given [`ResultMaps`] set, one column per frame.
//! After the column is written for every map in the set, the stage raises
//! [`FrameCompletion`]; readers wait on that signal before touching the
//! column.

use parking_lot::{Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

/// One named map (e.g. `intensity_ch1`).
#[derive(Debug)]
pub struct ResultMap {
    name: String,
    rows: usize,
    columns: usize,
    data: RwLock<Vec<f32>>,
}

impl ResultMap {
    fn new(name: String, rows: usize, columns: usize) -> Self {
        Self {
            name,
            rows,
            columns,
            data: RwLock::new(vec![0.0; rows * columns]),
        }
    }

    /// Map name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rows per column (values per frame).
    #[must_use]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Columns (pullback frames held before wrapping).
    #[must_use]
    pub fn columns(&self) -> usize {
        self.columns
    }

    fn write_column(&self, column: usize, values: &[f32]) {
        let start = column * self.rows;
        self.data.write()[start..start + self.rows].copy_from_slice(values);
    }

    /// Copy of the column holding pullback frame `frame`.
    #[must_use]
    pub fn column(&self, frame: u64) -> Vec<f32> {
        let start = self.column_index(frame) * self.rows;
        self.data.read()[start..start + self.rows].to_vec()
    }

    /// Value at (`row`, frame `frame`); `None` if `row` is out of range.
    #[must_use]
    pub fn value(&self, row: usize, frame: u64) -> Option<f32> {
        if row >= self.rows {
            return None;
        }
        Some(self.data.read()[self.column_index(frame) * self.rows + row])
    }

    fn column_index(&self, frame: u64) -> usize {
        (frame % self.columns as u64) as usize
    }
}

/// Frame-completion counter raised once per fully written column.
#[derive(Debug, Default)]
pub struct FrameCompletion {
    /// Frames completed so far; the latest pullback index is `completed - 1`.
    completed: Mutex<u64>,
    signal: Condvar,
}

impl FrameCompletion {
    fn raise(&self) {
        *self.completed.lock() += 1;
        self.signal.notify_all();
    }

    /// Frames fully written so far.
    #[must_use]
    pub fn completed(&self) -> u64 {
        *self.completed.lock()
    }

    /// Wait until at least `frames` frames are complete.
    ///
    /// Returns `false` on timeout.
    pub fn wait_for(&self, frames: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut completed = self.completed.lock();
        while *completed < frames {
            if self.signal.wait_until(&mut completed, deadline).timed_out() {
                return *completed >= frames;
            }
        }
        true
    }
}

/// All maps produced by one processing engine.
#[derive(Debug)]
pub struct ResultMaps {
    maps: Vec<ResultMap>,
    completion: FrameCompletion,
}

impl ResultMaps {
    /// Allocate zeroed maps named `names`, each `rows x columns`.
    #[must_use]
    pub fn new(names: &[String], rows: usize, columns: usize) -> Self {
        Self {
            maps: names
                .iter()
                .map(|name| ResultMap::new(name.clone(), rows, columns))
                .collect(),
            completion: FrameCompletion::default(),
        }
    }

    /// Map called `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResultMap> {
        self.maps.iter().find(|map| map.name == name)
    }

    /// All maps, in engine output order.
    #[must_use]
    pub fn maps(&self) -> &[ResultMap] {
        &self.maps
    }

    /// Completion signal readers wait on.
    #[must_use]
    pub fn completion(&self) -> &FrameCompletion {
        &self.completion
    }

    /// Rows per column.
    #[must_use]
    pub fn rows(&self) -> usize {
        self.maps.first().map_or(0, ResultMap::rows)
    }

    /// Store one frame's record and raise completion.
    ///
    /// `record` holds every map's column back to back, in map order.
    pub(crate) fn commit_frame(&self, frame: u64, record: &[f32]) {
        let rows = self.rows();
        for (map, column) in self.maps.iter().zip(record.chunks_exact(rows.max(1))) {
            map.write_column(map.column_index(frame), column);
        }
        self.completion.raise();
    }
}
