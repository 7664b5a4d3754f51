// SPDX-License-Identifier: Apache-2.0

//! Line source: polling file tails.
//!
//! Each configured file gets its own task that polls at the file's interval
//! and emits complete lines. A file that fails mid-tail is dropped from the
//! active set with an error event; when every file is gone the event channel
//! closes, which downstream treats as end-of-input.

use std::fmt;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::select;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bounded_channel::{bounded, BoundedReceiver, BoundedSender};
use crate::config::TailFileConfig;

const EVENT_CHANNEL_SIZE: usize = 1_024;
const READ_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no tailable files ({0} configured, none readable)")]
    NoTailableFiles(usize),
}

/// Failure detail carried on a tail error event.
#[derive(Debug)]
pub struct TailError {
    pub op: &'static str,
    pub code: Option<i32>,
    pub message: String,
}

impl TailError {
    fn new(op: &'static str, err: &std::io::Error) -> Self {
        Self {
            op,
            code: err.raw_os_error(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for TailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} failed ({}): {}", self.op, code, self.message),
            None => write!(f, "{} failed: {}", self.op, self.message),
        }
    }
}

pub enum TailEvent {
    Line { path: Arc<PathBuf>, line: String },
    Error { path: Arc<PathBuf>, error: TailError },
}

/// Start one tail task per readable file. Fails when no configured file is
/// readable at startup.
pub fn start(
    tails: &[TailFileConfig],
    cancel: &CancellationToken,
) -> Result<BoundedReceiver<TailEvent>, Error> {
    let mut ready = Vec::new();
    for tail in tails {
        match std::fs::File::open(&tail.file) {
            Ok(_) => ready.push((Arc::new(tail.file.clone()), tail.poll_interval())),
            Err(err) => {
                warn!(file = ?tail.file, %err, "skipping unreadable tail file");
            }
        }
    }
    if ready.is_empty() {
        return Err(Error::NoTailableFiles(tails.len()));
    }

    let (tx, rx) = bounded(EVENT_CHANNEL_SIZE);
    for (path, interval) in ready {
        info!(file = ?path, ?interval, "tailing file");
        tokio::spawn(tail_file(path, interval, tx.clone(), cancel.clone()));
    }

    Ok(rx)
}

/// Poll a single file, emitting complete lines as they appear. Starts at the
/// current end of file; a shrink below the last offset is treated as
/// truncation and reading restarts from the top.
async fn tail_file(
    path: Arc<PathBuf>,
    interval: Duration,
    tx: BoundedSender<TailEvent>,
    cancel: CancellationToken,
) {
    let mut offset = match tokio::fs::metadata(path.as_ref()).await {
        Ok(meta) => meta.len(),
        Err(err) => {
            let error = TailError::new("stat", &err);
            let _ = tx.send(TailEvent::Error { path, error }).await;
            return;
        }
    };

    // Carries an incomplete trailing line between polls.
    let mut pending = String::new();

    loop {
        select! {
            _ = cancel.cancelled() => {
                debug!(file = ?path, "tail cancelled");
                return;
            }
            _ = sleep(interval) => {}
        }

        let size = match tokio::fs::metadata(path.as_ref()).await {
            Ok(meta) => meta.len(),
            Err(err) => {
                let error = TailError::new("stat", &err);
                let _ = tx.send(TailEvent::Error { path, error }).await;
                return;
            }
        };

        if size < offset {
            warn!(file = ?path, previous = offset, current = size, "file truncated, restarting");
            offset = 0;
            pending.clear();
        }

        while size > offset {
            match read_chunk(&path, offset, size).await {
                Ok(chunk) => {
                    offset += chunk.len() as u64;
                    pending.push_str(&String::from_utf8_lossy(&chunk));
                    while let Some(nl) = pending.find('\n') {
                        let mut line = pending[..nl].to_string();
                        if line.ends_with('\r') {
                            line.pop();
                        }
                        pending.drain(..=nl);
                        let event = TailEvent::Line {
                            path: path.clone(),
                            line,
                        };
                        if tx.send(event).await.is_err() {
                            return; // pipeline gone
                        }
                    }
                }
                Err(err) => {
                    let error = TailError::new("read", &err);
                    let _ = tx.send(TailEvent::Error { path, error }).await;
                    return;
                }
            }
        }
    }
}

async fn read_chunk(path: &PathBuf, offset: u64, size: u64) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let want = ((size - offset) as usize).min(READ_CHUNK_SIZE);
    let mut buf = vec![0u8; want];
    let mut filled = 0;
    while filled < want {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}
