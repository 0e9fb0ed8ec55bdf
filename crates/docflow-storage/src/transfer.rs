use crate::traits::{ObjectReader, ProgressFn, StorageError, StorageResult};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// Copy `reader` into `writer` chunk by chunk.
///
/// Cancellation is observed before every read and while a read is pending.
/// Returns the number of bytes written.
pub(crate) async fn copy_with_progress<W>(
    key: &str,
    mut reader: ObjectReader,
    writer: &mut W,
    on_progress: &ProgressFn,
    cancel: &CancellationToken,
) -> StorageResult<u64>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut written: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled(key.to_string()));
        }

        let n = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(StorageError::Cancelled(key.to_string()));
            }
            read = reader.read(&mut buf) => read.map_err(|e| {
                StorageError::UploadFailed(format!("Failed to read source for {}: {}", key, e))
            })?,
        };

        if n == 0 {
            break;
        }

        writer.write_all(&buf[..n]).await.map_err(|e| {
            StorageError::UploadFailed(format!("Failed to write {}: {}", key, e))
        })?;
        written += n as u64;
        on_progress(written);
    }

    writer
        .flush()
        .await
        .map_err(|e| StorageError::UploadFailed(format!("Failed to flush {}: {}", key, e)))?;

    Ok(written)
}
