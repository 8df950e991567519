//! File-backed `MalformedScriptSink`: one file per process run under
//! `invalid_chain_vouts/`, appended to as malformed scripts are seen.
//! Mirrors the optional diagnostic dump named in the config's
//! `write_bad_vouts_to_file` flag.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use mewc_index_core::advance::MalformedScriptSink;
use spin::Mutex;

pub struct FileMalformedScriptSink {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl FileMalformedScriptSink {
    pub fn open(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join("invalid_chain_vouts.log");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(FileMalformedScriptSink { path, file: Mutex::new(file) })
    }
}

impl MalformedScriptSink for FileMalformedScriptSink {
    fn record(&self, height: u32, tag: &str, script: &[u8]) {
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{height} {tag} {}", hex::encode(script)) {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to write malformed-script record");
        }
    }
}
