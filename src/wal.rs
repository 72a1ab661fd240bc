use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Larger length prefixes are treated as corruption.
const MAX_COMMIT_BYTES: usize = 64 * 1024 * 1024;

/// A commit is the unit of atomicity: every event in it is replayed, or none.
pub type Commit = Vec<Event>;

/// Encode a single commit to [len][bincode][crc32] format. Returns the
/// number of bytes written.
fn encode_commit(writer: &mut impl Write, commit: &[Event]) -> io::Result<u64> {
    let payload =
        bincode::serialize(commit).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(8 + payload.len() as u64)
}

fn unusable() -> io::Error {
    io::Error::other("WAL is unusable after a failed rollback")
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: Vec<Event>][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn last entry (crash mid-write) fails the length or CRC check and is
///   discarded whole, so a multi-event commit never replays half-applied.
///
/// Bytes past `synced_len` belong to commits nobody has been told are
/// durable. `rollback` drops them from both the buffer and the file.
pub struct Wal {
    /// `None` once a rollback could not restore the file. Every later
    /// append fails until a compaction swaps in a fresh file.
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    synced_len: u64,
    unsynced_len: u64,
    appends_since_compact: u64,
    unsynced_appends: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let synced_len = file.metadata()?.len();
        Ok(Self {
            writer: Some(BufWriter::new(file)),
            path: path.to_path_buf(),
            synced_len,
            unsynced_len: 0,
            appends_since_compact: 0,
            unsynced_appends: 0,
        })
    }

    /// Append one commit and fsync. Used by tests only; the engine goes
    /// through `append_buffered` + `flush_sync` for group commit.
    #[cfg(test)]
    pub fn append(&mut self, commit: &[Event]) -> io::Result<()> {
        self.append_buffered(commit)?;
        self.flush_sync()
    }

    /// Append a commit to the BufWriter without flushing or syncing.
    pub fn append_buffered(&mut self, commit: &[Event]) -> io::Result<()> {
        let writer = self.writer.as_mut().ok_or_else(unusable)?;
        self.unsynced_len += encode_commit(writer, commit)?;
        self.unsynced_appends += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file. On error the
    /// caller must `rollback` before appending again.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        let writer = self.writer.as_mut().ok_or_else(unusable)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        self.synced_len += self.unsynced_len;
        self.appends_since_compact += self.unsynced_appends;
        self.unsynced_len = 0;
        self.unsynced_appends = 0;
        Ok(())
    }

    /// Forget every commit since the last successful `flush_sync`: the
    /// buffered bytes are discarded unwritten and the file is cut back to
    /// the synced length. If the cut fails the WAL refuses further appends.
    pub fn rollback(&mut self) -> io::Result<()> {
        self.unsynced_len = 0;
        self.unsynced_appends = 0;
        let Some(writer) = self.writer.take() else {
            return Err(unusable());
        };
        let (file, _discarded) = writer.into_parts();
        file.set_len(self.synced_len)?;
        file.sync_all()?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a snapshot to a temp file and fsync. Slow; runs before the swap.
    pub fn write_compact_file(path: &Path, commits: &[Commit]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for commit in commits {
            encode_commit(&mut writer, commit)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.synced_len = file.metadata()?.len();
        self.unsynced_len = 0;
        self.unsynced_appends = 0;
        self.writer = Some(BufWriter::new(file));
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Put the WAL in the state a failed rollback leaves it in.
    #[cfg(test)]
    pub fn disable(&mut self) {
        self.writer = None;
    }

    #[cfg(test)]
    pub fn compact(&mut self, commits: &[Commit]) -> io::Result<()> {
        Self::write_compact_file(&self.path, commits)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid commits in order.
    /// Replay stops at the first truncated or corrupt entry. The file is then
    /// truncated to the last good commit so later appends stay reachable.
    /// Everything after that point is deleted from disk, including valid
    /// commits that follow a corrupt one in the middle of the file.
    pub fn replay(path: &Path) -> io::Result<Vec<Commit>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut commits = Vec::new();
        let mut valid_len: u64 = 0;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_COMMIT_BYTES {
                break;
            }

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Commit>(&payload) {
                Ok(commit) => commits.push(commit),
                Err(_) => break,
            }
            valid_len += 8 + len as u64;
        }

        if valid_len < file_len {
            tracing::warn!(
                "WAL {}: truncating to {} bytes; the {} bytes after the last good commit are deleted",
                path.display(),
                valid_len,
                file_len - valid_len
            );
            OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
        }
        Ok(commits)
    }
}
