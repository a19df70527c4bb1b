// ABOUTME: Reads the last lines of the backup log for the `log` command
// ABOUTME: Keeps at most N lines in memory no matter how large the log has grown

use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

pub const DEFAULT_TAIL_LINES: usize = 10;

/// Last `n` lines of the file at `path`, oldest first.
pub fn read_tail(path: &Path, n: usize) -> Result<Vec<String>> {
    let file =
        File::open(path).with_context(|| format!("Failed to open log file {}", path.display()))?;

    if n == 0 {
        return Ok(Vec::new());
    }
    let mut tail = VecDeque::with_capacity(n);
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("Failed to read log file {}", path.display()))?;
        if tail.len() == n {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Ok(tail.into())
}
