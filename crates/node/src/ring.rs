// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::collections::VecDeque;

/// Result of reading from an [`OutputRing`] at an absolute byte offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadFrom {
    /// Bytes from the requested offset up to the current end.
    Data(Vec<u8>),
    /// The requested offset has fallen behind the retention window.
    /// Reading should resume at `start`; `dropped` bytes are gone.
    Truncated { start: u64, dropped: u64 },
}

/// Fixed-capacity circular byte store for raw PTY output.
///
/// Offsets are absolute: the ring tracks the total number of bytes ever
/// appended, so consumers address history by global byte offset. When the
/// ring wraps, the oldest bytes are discarded and the retained window
/// advances. A newline index over the retained window supports last-N-line
/// tail reads without rescanning.
#[derive(Debug)]
pub struct OutputRing {
    buf: Vec<u8>,
    capacity: usize,
    write_pos: usize,
    total: u64,
    /// Absolute offsets of line starts within the retained window.
    /// The first entry may equal `oldest()` after truncation pruning.
    line_starts: VecDeque<u64>,
}

impl OutputRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            capacity,
            write_pos: 0,
            total: 0,
            line_starts: VecDeque::new(),
        }
    }

    /// Append bytes, advancing the retained window as needed.
    pub fn append(&mut self, data: &[u8]) {
        for chunk in data.chunks(self.capacity) {
            let base = self.total;
            let start = self.write_pos;
            let end = start + chunk.len();

            if end <= self.capacity {
                self.buf[start..end].copy_from_slice(chunk);
            } else {
                let first = self.capacity - start;
                self.buf[start..self.capacity].copy_from_slice(&chunk[..first]);
                self.buf[..chunk.len() - first].copy_from_slice(&chunk[first..]);
            }

            self.write_pos = end % self.capacity;
            self.total += chunk.len() as u64;

            for (i, byte) in chunk.iter().enumerate() {
                if *byte == b'\n' {
                    self.line_starts.push_back(base + i as u64 + 1);
                }
            }
        }

        // Drop index entries that now point outside the retained window.
        let oldest = self.oldest();
        while let Some(front) = self.line_starts.front() {
            if *front < oldest {
                self.line_starts.pop_front();
            } else {
                break;
            }
        }
    }

    /// Absolute offset of the oldest retained byte.
    pub fn oldest(&self) -> u64 {
        self.total.saturating_sub(self.capacity as u64)
    }

    /// Absolute offset one past the newest byte (the next append position).
    pub fn end(&self) -> u64 {
        self.total
    }

    /// Read everything from `offset` to the end of the retained window.
    pub fn read_from(&self, offset: u64) -> ReadFrom {
        let oldest = self.oldest();
        if offset < oldest {
            return ReadFrom::Truncated { start: oldest, dropped: oldest - offset };
        }
        if offset >= self.total {
            return ReadFrom::Data(Vec::new());
        }

        let available = (self.total - offset) as usize;
        let start = if self.write_pos >= available {
            self.write_pos - available
        } else {
            self.capacity - (available - self.write_pos)
        };

        let mut out = Vec::with_capacity(available);
        if start + available <= self.capacity {
            out.extend_from_slice(&self.buf[start..start + available]);
        } else {
            out.extend_from_slice(&self.buf[start..self.capacity]);
            out.extend_from_slice(&self.buf[..available - (self.capacity - start)]);
        }
        ReadFrom::Data(out)
    }

    /// Absolute offset where the last `lines` retained lines begin.
    ///
    /// A trailing partial line (no final newline yet) counts as one line.
    /// Returns `oldest()` when fewer lines are retained than requested.
    pub fn tail_offset(&self, lines: usize) -> u64 {
        if lines == 0 {
            return self.total;
        }

        // A start exactly at `end()` marks a line that has no bytes yet.
        let mut starts: Vec<u64> =
            self.line_starts.iter().copied().filter(|s| *s < self.total).collect();
        let partial = self.total > self.oldest()
            && self.line_starts.back().map(|s| *s < self.total).unwrap_or(true);

        let mut remaining = lines;
        if partial {
            // The trailing partial line begins at the last recorded start.
            let partial_start = starts.pop().unwrap_or_else(|| self.oldest());
            remaining -= 1;
            if remaining == 0 {
                return partial_start;
            }
        }

        // Complete lines begin at `oldest()` followed by each recorded start.
        if remaining > starts.len() {
            return self.oldest();
        }
        starts[starts.len() - remaining]
    }
}

#[cfg(test)]
#[path = "ring_tests.rs"]
mod tests;
