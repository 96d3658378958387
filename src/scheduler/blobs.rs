//! File-backed storage for job payloads and results.
//!
//! Each blob is a file named after the job id. Writes go to a hidden
//! temporary sibling first and are renamed into place, so a reader sees
//! either the previous file or the complete new one.

use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

const PAYLOAD_DIR: &str = "payloads";
const RESULT_DIR: &str = "results";

#[derive(Debug, Clone)]
pub(crate) struct BlobStore {
    payloads: PathBuf,
    results: PathBuf,
}

impl BlobStore {
    pub(crate) fn open(root: &Path) -> io::Result<Self> {
        let payloads = root.join(PAYLOAD_DIR);
        let results = root.join(RESULT_DIR);
        fs::create_dir_all(&payloads)?;
        fs::create_dir_all(&results)?;
        Ok(Self { payloads, results })
    }

    pub(crate) fn write_payload(&self, id: &str, bytes: &[u8]) -> io::Result<()> {
        write_atomic(&self.payloads, id, bytes)
    }

    pub(crate) fn read_payload(&self, id: &str) -> io::Result<Vec<u8>> {
        fs::read(self.payloads.join(id))
    }

    pub(crate) fn write_result(&self, id: &str, bytes: &[u8]) -> io::Result<()> {
        write_atomic(&self.results, id, bytes)
    }

    pub(crate) fn read_result(&self, id: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.results.join(id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn remove_result(&self, id: &str) -> io::Result<()> {
        remove_if_present(&self.results.join(id))
    }

    /// Remove both blobs of a job. Missing files are not an error.
    pub(crate) fn remove(&self, id: &str) -> io::Result<()> {
        remove_if_present(&self.payloads.join(id))?;
        remove_if_present(&self.results.join(id))
    }
}

fn write_atomic(dir: &Path, id: &str, bytes: &[u8]) -> io::Result<()> {
    let tmp = dir.join(format!(".{}.tmp", id));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, dir.join(id))
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
