//! Stream pumps: copy one stream into another on a separate task.
//!
//! A child blocked writing to a full stdout pipe never exits, so a caller
//! that waits for exit before reading deadlocks. Each child stream gets its
//! own pump, started before the wait, so every pipe is drained while the
//! caller is suspended on the exit status.
//!
//! The pump hands its streams back when joined. A destination is written
//! only by its pump and read only after `join` returns it.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 8192;

#[derive(Debug, Error)]
pub enum PumpError {
    #[error("{name}: transfer failed: {source}")]
    Transfer { name: String, source: io::Error },
    #[error("{name}: pump task failed: {source}")]
    Task { name: String, source: JoinError },
}

/// What to do with each end once the transfer is over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpOptions {
    /// Drop the source instead of handing it back.
    pub close_source: bool,
    /// Shut down and drop the destination instead of handing it back.
    /// A child's stdin only sees EOF once it is closed.
    pub close_dest: bool,
    /// Make `join` fail on transport errors instead of only recording them.
    pub propagate_errors: bool,
}

impl PumpOptions {
    /// Hand both ends back, swallow errors.
    pub fn capture() -> Self {
        Self::default()
    }

    /// Close the destination when done, swallow errors.
    pub fn feed() -> Self {
        Self {
            close_source: true,
            close_dest: true,
            propagate_errors: false,
        }
    }

    /// Hand the destination back and report transport errors.
    pub fn strict() -> Self {
        Self {
            close_source: true,
            close_dest: false,
            propagate_errors: true,
        }
    }
}

/// Result of one pump's run.
pub struct PumpOutcome<R, W> {
    /// `None` when closed.
    pub source: Option<R>,
    /// `None` when closed.
    pub dest: Option<W>,
    pub bytes_copied: u64,
    /// Transport error that ended the transfer, if any.
    pub error: Option<io::Error>,
    /// The transfer was stopped before reaching end of input.
    pub stopped: bool,
}

impl<R, W> fmt::Debug for PumpOutcome<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PumpOutcome")
            .field("source_open", &self.source.is_some())
            .field("dest_open", &self.dest.is_some())
            .field("bytes_copied", &self.bytes_copied)
            .field("error", &self.error)
            .field("stopped", &self.stopped)
            .finish()
    }
}

/// A running copy from `R` into `W`.
pub struct StreamPump<R, W> {
    name: String,
    options: PumpOptions,
    stop: CancellationToken,
    handle: JoinHandle<PumpOutcome<R, W>>,
}

impl<R, W> fmt::Debug for StreamPump<R, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamPump")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}

impl<R, W> StreamPump<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Start copying `source` into `dest` on a new task.
    ///
    /// `name` identifies the pump in logs, e.g. `"Add.basicAdd stdout"`.
    pub fn spawn(name: impl Into<String>, source: R, dest: W, options: PumpOptions) -> Self {
        let name = name.into();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(run(name.clone(), source, dest, options, stop.clone()));
        Self {
            name,
            options,
            stop,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the transfer to end.
    pub async fn join(self) -> Result<PumpOutcome<R, W>, PumpError> {
        let Self {
            name,
            options,
            handle,
            ..
        } = self;
        let outcome = handle.await.map_err(|source| PumpError::Task {
            name: name.clone(),
            source,
        })?;
        finish(name, options, outcome)
    }

    /// Wait up to `grace` for the transfer to end, then stop it and
    /// collect whatever was copied.
    ///
    /// Covers streams whose write end outlives the process, such as a pipe
    /// inherited by a grandchild.
    pub async fn join_within(mut self, grace: Duration) -> Result<PumpOutcome<R, W>, PumpError> {
        let joined = if let Ok(joined) = tokio::time::timeout(grace, &mut self.handle).await {
            joined
        } else {
            warn!(
                pump = %self.name,
                grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                "stream still open after grace period; stopping pump"
            );
            self.stop.cancel();
            (&mut self.handle).await
        };
        let outcome = joined.map_err(|source| PumpError::Task {
            name: self.name.clone(),
            source,
        })?;
        finish(self.name, self.options, outcome)
    }
}

fn finish<R, W>(
    name: String,
    options: PumpOptions,
    mut outcome: PumpOutcome<R, W>,
) -> Result<PumpOutcome<R, W>, PumpError> {
    if options.propagate_errors {
        if let Some(source) = outcome.error.take() {
            return Err(PumpError::Transfer { name, source });
        }
    }
    Ok(outcome)
}

async fn run<R, W>(
    name: String,
    mut source: R,
    mut dest: W,
    options: PumpOptions,
    stop: CancellationToken,
) -> PumpOutcome<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut bytes_copied = 0u64;
    let mut stopped = false;

    let copied = {
        let copy = copy_chunks(&mut source, &mut dest, &mut bytes_copied);
        tokio::select! {
            biased;
            () = stop.cancelled() => {
                stopped = true;
                Ok(())
            }
            result = copy => result,
        }
    };

    let mut error = copied.err();
    if !stopped {
        if let Err(err) = dest.flush().await {
            error.get_or_insert(err);
        }
    }

    if let Some(err) = &error {
        if err.kind() == io::ErrorKind::BrokenPipe {
            debug!(pump = %name, bytes_copied, "destination closed before end of input");
        } else {
            debug!(pump = %name, bytes_copied, error = %err, "stream transfer failed");
        }
    }

    let dest = if options.close_dest {
        if let Err(err) = dest.shutdown().await {
            debug!(pump = %name, error = %err, "failed to close pump destination");
        }
        None
    } else {
        Some(dest)
    };
    let source = (!options.close_source).then_some(source);

    PumpOutcome {
        source,
        dest,
        bytes_copied,
        error,
        stopped,
    }
}

async fn copy_chunks<R, W>(source: &mut R, dest: &mut W, bytes_copied: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut chunk = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match source.read(&mut chunk).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        dest.write_all(&chunk[..n]).await?;
        *bytes_copied += n as u64;
    }
}
