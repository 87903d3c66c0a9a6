//! Rotating log file tailer.
//!
//! Only complete (newline-terminated) lines are returned; a partially
//! written last line stays unread until its newline arrives. Rotation is
//! detected via inode change (Unix) or the file shrinking below the
//! read offset.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Per-call cap so a large backlog is drained over several cycles.
const MAX_LINES_PER_READ: usize = 50_000;

pub struct FileTailer {
    path: PathBuf,
    offset: u64,
    inode: u64,
}

impl FileTailer {
    /// Start at the current end of `path`; existing content is skipped.
    pub fn new(path: PathBuf) -> io::Result<Self> {
        let metadata = fs::metadata(&path)?;
        Ok(Self {
            offset: metadata.len(),
            inode: get_inode(&metadata),
            path,
        })
    }

    /// Start at the first byte of `path`.
    pub fn from_start(path: PathBuf) -> io::Result<Self> {
        let metadata = fs::metadata(&path)?;
        Ok(Self {
            offset: 0,
            inode: get_inode(&metadata),
            path,
        })
    }

    /// Complete lines appended since the last call.
    pub fn read_new_lines(&mut self) -> io::Result<Vec<String>> {
        let metadata = match fs::metadata(&self.path) {
            Ok(m) => m,
            // Mid-rotation; try again next cycle.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let inode = get_inode(&metadata);
        let size = metadata.len();
        if inode != self.inode || size < self.offset {
            self.inode = inode;
            self.offset = 0;
        }
        if size <= self.offset {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut reader = BufReader::new(file);

        let mut lines = Vec::new();
        let mut buf = Vec::new();
        while lines.len() < MAX_LINES_PER_READ {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf)?;
            if n == 0 || buf.last() != Some(&b'\n') {
                break;
            }
            self.offset += n as u64;
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            lines.push(String::from_utf8_lossy(&buf).into_owned());
        }

        Ok(lines)
    }

    /// Follow a different file from its start.
    pub fn switch_file(&mut self, new_path: PathBuf) -> io::Result<()> {
        if new_path == self.path {
            return Ok(());
        }
        let metadata = fs::metadata(&new_path)?;
        self.inode = get_inode(&metadata);
        self.offset = 0;
        self.path = new_path;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }
}

#[cfg(unix)]
fn get_inode(metadata: &fs::Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    metadata.ino()
}

/// Size-based rotation detection only.
#[cfg(not(unix))]
fn get_inode(_metadata: &fs::Metadata) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn append(path: &Path, text: &str) {
        let mut f = fs::OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn test_skips_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg.log");
        fs::write(&path, "old 1\nold 2\n").unwrap();

        let mut tailer = FileTailer::new(path.clone()).unwrap();
        assert!(tailer.read_new_lines().unwrap().is_empty());

        append(&path, "new 1\nnew 2\n");
        assert_eq!(tailer.read_new_lines().unwrap(), vec!["new 1", "new 2"]);
        assert!(tailer.read_new_lines().unwrap().is_empty());
    }

    #[test]
    fn test_partial_line_held_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg.log");
        fs::write(&path, "").unwrap();
        let mut tailer = FileTailer::new(path.clone()).unwrap();

        append(&path, "complete\npart");
        assert_eq!(tailer.read_new_lines().unwrap(), vec!["complete"]);
        assert_eq!(tailer.offset(), 9);

        append(&path, "ial\r\n");
        assert_eq!(tailer.read_new_lines().unwrap(), vec!["partial"]);
    }

    #[test]
    fn test_from_start_reads_everything() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg.log");
        fs::write(&path, "a\nb\n").unwrap();
        let mut tailer = FileTailer::from_start(path).unwrap();
        assert_eq!(tailer.read_new_lines().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn test_truncation_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg.log");
        fs::write(&path, "x".repeat(1000)).unwrap();
        let mut tailer = FileTailer::new(path.clone()).unwrap();

        fs::write(&path, "after rotation\n").unwrap();
        assert_eq!(tailer.read_new_lines().unwrap(), vec!["after rotation"]);
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg.log");
        fs::write(&path, "content\n").unwrap();
        let mut tailer = FileTailer::new(path.clone()).unwrap();
        fs::remove_file(&path).unwrap();
        assert!(tailer.read_new_lines().unwrap().is_empty());
    }

    #[test]
    fn test_switch_file() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.log");
        let second = dir.path().join("b.log");
        fs::write(&first, "old\n").unwrap();
        fs::write(&second, "fresh\n").unwrap();

        let mut tailer = FileTailer::new(first).unwrap();
        tailer.switch_file(second.clone()).unwrap();
        assert_eq!(tailer.read_new_lines().unwrap(), vec!["fresh"]);
        assert_eq!(tailer.path(), second);
    }
}
