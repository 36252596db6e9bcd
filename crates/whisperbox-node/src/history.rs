use anyhow::Result;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use whisperbox_protocol::hash::keccak256;

/// History file for `channel` inside the data directory.
/// `/whisperbox/1/forms/json` maps to `whisperbox-1-forms-json.log`.
pub fn file_name(channel: &str) -> String {
    let stem: String = channel
        .trim_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("{stem}.log")
}

/// Entries an in-memory log keeps before dropping the oldest.
pub const MEMORY_LIMIT: usize = 4096;

/// Append-only log of every envelope seen or published on the channel.
///
/// Each entry is length-prefixed (4-byte LE u32) followed by the raw envelope
/// bytes. Entries are de-duplicated by keccak256 so that redundant network
/// deliveries are stored once. A file-backed log keeps only an offset index
/// in memory and reads payloads back on demand. Without a path the log lives
/// in memory and is capped.
pub struct HistoryLog {
    backing: Backing,
    seen:    HashSet<[u8; 32]>,
}

enum Backing {
    Memory {
        entries: VecDeque<([u8; 32], Vec<u8>)>,
        limit:   usize,
    },
    File {
        path:  PathBuf,
        index: Vec<Slot>,
    },
}

/// Position of one payload inside the log file.
#[derive(Debug, Clone, Copy)]
struct Slot {
    offset: u64,
    len:    u32,
}

impl HistoryLog {
    pub fn in_memory() -> Self {
        Self::bounded(MEMORY_LIMIT)
    }

    /// In-memory log holding at most `limit` entries.
    pub fn bounded(limit: usize) -> Self {
        Self {
            backing: Backing::Memory { entries: VecDeque::new(), limit: limit.max(1) },
            seen:    HashSet::new(),
        }
    }

    /// Open (or create on first append) the log at `path` and index what is
    /// there. A truncated tail is cut off so later appends stay aligned.
    pub fn open(path: PathBuf) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut index = Vec::new();
        if path.exists() {
            let file = std::fs::OpenOptions::new().read(true).write(true).open(&path)?;
            let file_len = file.metadata()?.len();
            let mut reader = BufReader::new(&file);
            let mut pos = 0u64;
            let mut payload = Vec::new();
            loop {
                let mut len_buf = [0u8; 4];
                match reader.read_exact(&mut len_buf) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                }
                let len = u32::from_le_bytes(len_buf);
                if pos + 4 + u64::from(len) > file_len {
                    break;
                }
                payload.resize(len as usize, 0);
                reader.read_exact(&mut payload)?;
                if seen.insert(keccak256(&payload)) {
                    index.push(Slot { offset: pos + 4, len });
                }
                pos += 4 + u64::from(len);
            }
            if pos < file_len {
                tracing::warn!("Truncated history entry at offset {pos} in {:?}", path);
                file.set_len(pos)?;
            }
            tracing::info!("Indexed {} history entries from {:?}", index.len(), path);
        }
        Ok(Self { backing: Backing::File { path, index }, seen })
    }

    /// Record `data`. Returns false if an identical entry is already stored.
    pub fn append(&mut self, data: &[u8]) -> Result<bool> {
        let hash = keccak256(data);
        if self.seen.contains(&hash) {
            return Ok(false);
        }
        match &mut self.backing {
            Backing::Memory { entries, limit } => {
                if entries.len() == *limit {
                    if let Some((evicted, _)) = entries.pop_front() {
                        self.seen.remove(&evicted);
                    }
                }
                entries.push_back((hash, data.to_vec()));
            }
            Backing::File { path, index } => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                let mut file = std::fs::OpenOptions::new().create(true).append(true).open(&*path)?;
                let offset = file.metadata()?.len();
                let mut buf = Vec::with_capacity(4 + data.len());
                buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
                buf.extend_from_slice(data);
                file.write_all(&buf)?;
                index.push(Slot { offset: offset + 4, len: data.len() as u32 });
            }
        }
        self.seen.insert(hash);
        Ok(true)
    }

    /// Every stored entry, oldest first.
    pub fn entries(&self) -> Result<Vec<Vec<u8>>> {
        self.recent(usize::MAX)
    }

    /// Up to the `n` most recent entries, oldest first.
    pub fn recent(&self, n: usize) -> Result<Vec<Vec<u8>>> {
        match &self.backing {
            Backing::Memory { entries, .. } => {
                let skip = entries.len().saturating_sub(n);
                Ok(entries.iter().skip(skip).map(|(_, data)| data.clone()).collect())
            }
            Backing::File { path, index } => {
                read_slots(path, &index[index.len().saturating_sub(n)..])
            }
        }
    }

    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::Memory { entries, .. } => entries.len(),
            Backing::File { index, .. } => index.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read the payloads at `slots` (ascending offsets) with one seek.
fn read_slots(path: &Path, slots: &[Slot]) -> Result<Vec<Vec<u8>>> {
    let (Some(first), Some(last)) = (slots.first(), slots.last()) else {
        return Ok(Vec::new());
    };
    let start = first.offset;
    let end = last.offset + u64::from(last.len);
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let mut span = vec![0u8; (end - start) as usize];
    file.read_exact(&mut span)?;
    Ok(slots
        .iter()
        .map(|slot| {
            let from = (slot.offset - start) as usize;
            span[from..from + slot.len as usize].to_vec()
        })
        .collect())
}

// ============================================================================
// Per-channel store
// ============================================================================

/// One `HistoryLog` per channel, opened on first use.
pub struct HistoryStore {
    dir:  Option<PathBuf>,
    logs: HashMap<String, HistoryLog>,
}

impl HistoryStore {
    pub fn in_memory() -> Self {
        Self { dir: None, logs: HashMap::new() }
    }

    /// Logs live under `dir`, one file per channel.
    pub fn open(dir: PathBuf) -> Self {
        Self { dir: Some(dir), logs: HashMap::new() }
    }

    fn log(&mut self, channel: &str) -> Result<&mut HistoryLog> {
        if !self.logs.contains_key(channel) {
            let log = match &self.dir {
                Some(dir) => HistoryLog::open(dir.join(file_name(channel)))?,
                None => HistoryLog::in_memory(),
            };
            self.logs.insert(channel.to_string(), log);
        }
        self.logs
            .get_mut(channel)
            .ok_or_else(|| anyhow::anyhow!("history log for {channel} missing"))
    }

    pub fn record(&mut self, channel: &str, data: &[u8]) -> Result<bool> {
        self.log(channel)?.append(data)
    }

    pub fn entries(&mut self, channel: &str) -> Result<Vec<Vec<u8>>> {
        self.log(channel)?.entries()
    }

    pub fn recent(&mut self, channel: &str, n: usize) -> Result<Vec<Vec<u8>>> {
        self.log(channel)?.recent(n)
    }
}
