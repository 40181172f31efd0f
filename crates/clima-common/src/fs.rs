//! Filesystem helpers

use crate::error::Result;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Write a file by filling a temp file in the same directory and renaming it
/// over `path`. Readers see either the old file or the complete new one.
pub fn write_atomic<F>(path: impl AsRef<Path>, fill: F) -> Result<()>
where
    F: FnOnce(&mut dyn Write) -> Result<()>,
{
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".clima-")
        .suffix(".part")
        .tempfile_in(dir)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        fill(&mut writer)?;
        writer.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested").join("out.jsonl");

        write_atomic(&target, |w| {
            w.write_all(b"first\nsecond\n")?;
            Ok(())
        })
        .unwrap();
        write_atomic(&target, |w| {
            w.write_all(b"third\n")?;
            Ok(())
        })
        .unwrap();

        assert_eq!(std::fs::read_to_string(&target).unwrap(), "third\n");
        let leftovers: Vec<_> = std::fs::read_dir(target.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".part"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_write_atomic_keeps_old_file_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.txt");
        std::fs::write(&target, "original").unwrap();

        let result = write_atomic(&target, |w| {
            w.write_all(b"partial")?;
            Err(crate::ClimaError::manifest_integrity("boom"))
        });

        assert!(result.is_err());
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "original");
    }
}
