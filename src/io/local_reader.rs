use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::range_reader::check_range;
use super::RangeReader;
use crate::error::IoError;

/// Local-file implementation of RangeReader.
///
/// Positional reads run on the blocking pool so concurrent chunk fetches
/// never share a file cursor. The file handle is closed when the last clone
/// of the reader is dropped.
#[derive(Clone)]
pub struct LocalRangeReader {
    file: Arc<File>,
    path: PathBuf,
    size: u64,
    identifier: String,
}

impl LocalRangeReader {
    /// Open a file and record its size.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, IoError> {
        let path = path.as_ref().to_path_buf();
        let identifier = format!("file://{}", path.display());

        let opened = {
            let path = path.clone();
            tokio::task::spawn_blocking(move || {
                let file = File::open(&path)?;
                let size = file.metadata()?.len();
                Ok::<_, std::io::Error>((file, size))
            })
            .await
            .map_err(|e| IoError::Local(e.to_string()))?
        };

        let (file, size) = opened.map_err(|e| map_io_error(e, &identifier))?;

        Ok(Self {
            file: Arc::new(file),
            path,
            size,
            identifier,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RangeReader for LocalRangeReader {
    async fn read_exact_at(&self, offset: u64, len: usize) -> Result<Bytes, IoError> {
        check_range(offset, len, self.size)?;

        if len == 0 {
            return Ok(Bytes::new());
        }

        let file = Arc::clone(&self.file);
        let result = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            read_at(&file, &mut buf, offset)?;
            Ok::<_, std::io::Error>(buf)
        })
        .await
        .map_err(|e| IoError::Local(e.to_string()))?;

        result
            .map(Bytes::from)
            .map_err(|e| map_io_error(e, &self.identifier))
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn identifier(&self) -> &str {
        &self.identifier
    }
}

#[cfg(unix)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.seek_read(&mut buf[filled..], offset + filled as u64)?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    Ok(())
}

fn map_io_error(err: std::io::Error, identifier: &str) -> IoError {
    match err.kind() {
        std::io::ErrorKind::NotFound => IoError::NotFound(identifier.to_string()),
        std::io::ErrorKind::UnexpectedEof => {
            IoError::Local(format!("{}: file shrank while reading", identifier))
        }
        _ => IoError::Local(format!("{}: {}", identifier, err)),
    }
}
