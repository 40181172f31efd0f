//! Static contiguous split of a file list across workers

/// Split `files` into at most `workers` contiguous chunks
///
/// Every chunk but the last holds `max(1, n / workers)` files; whatever is
/// left over is folded into the last chunk. Order is preserved, so
/// concatenating the chunks yields the input.
pub fn partition_files<T: Clone>(files: &[T], workers: usize) -> Vec<Vec<T>> {
    if files.is_empty() || workers == 0 {
        return Vec::new();
    }

    let chunk_size = (files.len() / workers).max(1);
    let mut chunks: Vec<Vec<T>> = files.chunks(chunk_size).map(<[T]>::to_vec).collect();

    while chunks.len() > workers {
        if let Some(extra) = chunks.pop() {
            if let Some(last) = chunks.last_mut() {
                last.extend(extra);
            }
        }
    }
    chunks
}
