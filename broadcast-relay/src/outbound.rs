use std::io;

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    select,
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::hub::Line;

/// Writes queued lines to `writer` until the hub closes the queue.
///
/// A failed write, or a write that cannot complete once `closer` has fired,
/// marks the connection broken: the writer is dropped and the remaining lines are
/// drained and discarded. The session notices the dead connection on its read
/// side and leaves, after which the hub closes the queue.
pub async fn run<W>(writer: W, mut queue: mpsc::Receiver<Line>, closer: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    let mut writer = Some(writer);

    while let Some(line) = queue.recv().await {
        let Some(active) = writer.as_mut() else {
            continue;
        };

        let result = select! {
            biased;
            result = write_line(active, &line) => result,
            _ = closer.cancelled() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed",
            )),
        };

        if let Err(error) = result {
            debug!(?error, "failed to deliver line, discarding the rest");
            writer = None;
        }
    }

    if let Some(mut writer) = writer {
        if let Err(error) = writer.shutdown().await {
            debug!(?error, "failed to shut down connection");
        }
    }
}

async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
