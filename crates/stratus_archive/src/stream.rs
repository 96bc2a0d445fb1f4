//! Bridges between the blocking codec and async byte streams.

use crate::format::ArchiveEntry;
use crate::pack::Packer;
use crate::unpack::{UnpackSummary, unpack};

use stratus_core::error::ArchiveError;
use stratus_core::traits::ByteSource;

use futures::{StreamExt, future, stream};
use std::io;
use std::path::PathBuf;
use tokio_util::io::{ReaderStream, StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bytes buffered between the packing thread and the consumer.
const PIPE_CAPACITY: usize = 256 * 1024;

/// Packs on a blocking thread and yields compressed bytes as they are produced.
/// Must be called from within a Tokio runtime.
///
/// Nothing is staged on disk. If packing fails the stream ends with that error, so a
/// consumer never mistakes a partial archive for a complete one.
pub fn pack_stream<F>(packer: Packer, on_entry: F) -> ByteSource
where
    F: FnMut(&ArchiveEntry) + Send + 'static,
{
    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    let bridge = SyncIoBridge::new(writer);
    let packing = tokio::task::spawn_blocking(move || packer.write_to(bridge, on_entry));

    let outcome = stream::once(async move {
        match packing.await {
            Ok(Ok(summary)) => {
                debug!(files = summary.files, bytes = summary.bytes, "Archive stream complete");
                None
            }
            Ok(Err(err)) => Some(Err(io::Error::other(err))),
            Err(join) => Some(Err(io::Error::other(join))),
        }
    })
    .filter_map(future::ready);

    ReaderStream::new(reader).chain(outcome).boxed()
}

/// Unpacks `source` into `target` on a blocking thread.
///
/// Cancelling `cancel` cuts the source off; the unpack then fails as truncated and
/// the file being written at that moment is discarded.
pub async fn unpack_stream<F>(
    source: ByteSource,
    target: PathBuf,
    select: F,
    cancel: CancellationToken,
) -> Result<UnpackSummary, ArchiveError>
where
    F: FnMut(&ArchiveEntry) -> bool + Send + 'static,
{
    let source = source
        .take_until(async move { cancel.cancelled().await })
        .boxed();
    let reader = SyncIoBridge::new(StreamReader::new(source));

    tokio::task::spawn_blocking(move || unpack(reader, &target, select))
        .await
        .map_err(|join| ArchiveError::Io(io::Error::other(join)))?
}
