use crate::TransferError;
use crate::types::ChunkRange;

/// Splits a file of `file_size` bytes into chunks of at most `chunk_size`.
///
/// `total = ceil(file_size / chunk_size)`, and only the last chunk may be
/// shorter. An empty file yields a single empty chunk (`total == 1`) so the
/// receiver still sees one chunk and produces an empty artifact.
pub fn slice(file_size: u64, chunk_size: u64) -> Result<Vec<ChunkRange>, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidConfiguration(
            "chunk size must be greater than zero".into(),
        ));
    }

    if file_size == 0 {
        return Ok(vec![ChunkRange {
            index: 0,
            total: 1,
            offset: 0,
            length: 0,
        }]);
    }

    let total = file_size.div_ceil(chunk_size);
    let total = u32::try_from(total).map_err(|_| {
        TransferError::InvalidConfiguration(format!(
            "{file_size} bytes in chunks of {chunk_size} needs {total} chunks (max {})",
            u32::MAX
        ))
    })?;

    Ok((0..total)
        .map(|index| {
            let offset = u64::from(index) * chunk_size;
            ChunkRange {
                index,
                total,
                offset,
                length: chunk_size.min(file_size - offset),
            }
        })
        .collect())
}
