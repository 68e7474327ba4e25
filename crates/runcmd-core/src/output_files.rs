//! Bounded readers over the files a managed script writes its output into.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{Context, Result};

/// Returns at most the last `max_len` bytes of `path`. A missing file yields an empty tail,
/// since the script may not have produced any output yet.
pub fn tail_file(path: &Path, max_len: u64) -> Result<Vec<u8>> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => {
            return Err(error).with_context(|| format!("failed to open {}", path.display()))
        }
    };
    let size = file
        .metadata()
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    let start = size.saturating_sub(max_len);
    file.seek(SeekFrom::Start(start))
        .with_context(|| format!("failed to seek {}", path.display()))?;
    let mut tail = Vec::with_capacity(usize::try_from(size - start).unwrap_or_default());
    file.take(max_len)
        .read_to_end(&mut tail)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(tail)
}

/// Returns every byte of `path` from `offset` to the current end of file.
///
/// Offsets at or past the end (including a file that does not exist yet) yield an empty
/// buffer.
pub fn read_from_offset(path: &Path, offset: u64) -> Result<Vec<u8>> {
    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(error) => {
            return Err(error).with_context(|| format!("failed to open {}", path.display()))
        }
    };
    let size = file
        .metadata()
        .with_context(|| format!("failed to stat {}", path.display()))?
        .len();
    if offset >= size {
        return Ok(Vec::new());
    }
    file.seek(SeekFrom::Start(offset))
        .with_context(|| format!("failed to seek {}", path.display()))?;
    let mut buffer = Vec::with_capacity(usize::try_from(size - offset).unwrap_or_default());
    // Bound the read to the size observed above; the script may still be appending.
    file.take(size - offset)
        .read_to_end(&mut buffer)
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{read_from_offset, tail_file};

    #[test]
    fn unit_tail_file_missing_file_is_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tail = tail_file(&temp.path().join("stdout"), 16).expect("tail");
        assert!(tail.is_empty());
    }

    #[test]
    fn functional_tail_file_keeps_only_last_bytes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("stdout");
        std::fs::write(&path, b"0123456789").expect("write");
        assert_eq!(tail_file(&path, 4).expect("tail"), b"6789");
        assert_eq!(tail_file(&path, 64).expect("tail"), b"0123456789");
    }

    #[test]
    fn functional_read_from_offset_returns_only_appended_bytes() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("stderr");
        std::fs::write(&path, b"abc").expect("write");
        assert_eq!(read_from_offset(&path, 0).expect("read"), b"abc");
        assert!(read_from_offset(&path, 3).expect("read").is_empty());

        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open");
        file.write_all(b"defg").expect("append");
        assert_eq!(read_from_offset(&path, 3).expect("read"), b"defg");
        assert!(read_from_offset(&path, 99).expect("read").is_empty());
    }
}
