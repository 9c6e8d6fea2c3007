//! File-backed persister
//!
//! Raft state goes to `raft.state`, rewritten on every save. Snapshots go to
//! their own `snapshot-{generation}` files, written only when compacting.
//! `raft.state` names the snapshot generation it belongs to, so renaming it
//! into place is the single commit point for the pair.
//! Reads are served from an in-memory copy loaded at open.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::record::{put_record, take_record};
use super::Persister;
use crate::error::{RaftKvError, Result};

const STATE_FILE: &str = "raft.state";
const SNAPSHOT_PREFIX: &str = "snapshot-";
const TEMP_SUFFIX: &str = ".tmp";

/// Generation 0 means no snapshot has been taken
const NO_SNAPSHOT: u64 = 0;

#[derive(Debug, Default)]
struct Blobs {
    state: Vec<u8>,
    snapshot: Vec<u8>,
    generation: u64,
}

/// Persister writing under `dir`
#[derive(Debug)]
pub struct FilePersister {
    dir: PathBuf,
    blobs: Mutex<Blobs>,
}

impl FilePersister {
    /// Open (or create) the persister rooted at `dir`
    ///
    /// Fails with `CorruptState` if the state file or the snapshot it names
    /// does not check out. Temp files and snapshots of other generations are
    /// saves that never committed or were superseded, and are removed.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;

        let (state, generation) = match fs::read(dir.join(STATE_FILE)) {
            Ok(raw) => decode_state_file(&raw)?,
            Err(e) if e.kind() == ErrorKind::NotFound => (Vec::new(), NO_SNAPSHOT),
            Err(e) => return Err(e.into()),
        };
        let snapshot = if generation == NO_SNAPSHOT {
            Vec::new()
        } else {
            read_snapshot_file(&dir.join(snapshot_name(generation)))?
        };
        discard_leftovers(dir, generation)?;

        tracing::info!(
            dir = %dir.display(),
            state_bytes = state.len(),
            snapshot_bytes = snapshot.len(),
            generation,
            "loaded persisted state"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            blobs: Mutex::new(Blobs {
                state,
                snapshot,
                generation,
            }),
        })
    }

    fn write_state_file(&self, state: &[u8], generation: u64) -> Result<()> {
        let mut out = Vec::new();
        put_record(&mut out, state)?;
        put_record(&mut out, &generation.to_le_bytes())?;
        write_atomic(&self.dir, STATE_FILE, &out)
    }
}

fn snapshot_name(generation: u64) -> String {
    format!("{}{:020}", SNAPSHOT_PREFIX, generation)
}

/// `raft.state` is a state record followed by a generation record
fn decode_state_file(raw: &[u8]) -> Result<(Vec<u8>, u64)> {
    let mut buf = raw;
    let state = take_record(&mut buf)?;
    let generation_bytes = take_record(&mut buf)?;
    let generation = <[u8; 8]>::try_from(generation_bytes.as_slice())
        .map(u64::from_le_bytes)
        .map_err(|_| {
            RaftKvError::CorruptState(format!(
                "snapshot generation record is {} bytes",
                generation_bytes.len()
            ))
        })?;
    if !buf.is_empty() {
        return Err(RaftKvError::CorruptState(format!(
            "{} trailing bytes in {}",
            buf.len(),
            STATE_FILE
        )));
    }
    Ok((state, generation))
}

fn read_snapshot_file(path: &Path) -> Result<Vec<u8>> {
    let raw = fs::read(path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => {
            RaftKvError::CorruptState(format!("snapshot {} is missing", path.display()))
        }
        _ => e.into(),
    })?;
    let mut buf = raw.as_slice();
    let snapshot = take_record(&mut buf)?;
    if !buf.is_empty() {
        return Err(RaftKvError::CorruptState(format!(
            "{} trailing bytes in {}",
            buf.len(),
            path.display()
        )));
    }
    Ok(snapshot)
}

fn discard_leftovers(dir: &Path, generation: u64) -> Result<()> {
    let keep = snapshot_name(generation);
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let stale = name.ends_with(TEMP_SUFFIX) || (name.starts_with(SNAPSHOT_PREFIX) && name != keep);
        if stale {
            tracing::warn!(path = %entry.path().display(), "discarding uncommitted file");
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Write to a temp file, fsync, then rename over `name`
fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let temp = dir.join(format!("{}{}", name, TEMP_SUFFIX));
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp, dir.join(name))?;
    sync_dir(dir)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

impl Persister for FilePersister {
    fn save_state(&self, state: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.lock();
        self.write_state_file(state, blobs.generation)?;
        blobs.state = state.to_vec();
        Ok(())
    }

    fn read_state(&self) -> Result<Vec<u8>> {
        Ok(self.blobs.lock().state.clone())
    }

    fn save_state_and_snapshot(&self, state: &[u8], snapshot: &[u8]) -> Result<()> {
        let mut blobs = self.blobs.lock();
        let generation = blobs.generation + 1;

        let mut out = Vec::new();
        put_record(&mut out, snapshot)?;
        write_atomic(&self.dir, &snapshot_name(generation), &out)?;
        self.write_state_file(state, generation)?;

        let previous = blobs.generation;
        blobs.state = state.to_vec();
        blobs.snapshot = snapshot.to_vec();
        blobs.generation = generation;

        if previous != NO_SNAPSHOT {
            let old = self.dir.join(snapshot_name(previous));
            if let Err(e) = fs::remove_file(&old) {
                tracing::warn!(path = %old.display(), error = %e, "could not remove old snapshot");
            }
        }
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Vec<u8>> {
        Ok(self.blobs.lock().snapshot.clone())
    }

    fn state_size(&self) -> usize {
        self.blobs.lock().state.len()
    }
}
