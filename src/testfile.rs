// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::{Context, Result};
use log::{debug, info};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::util::parse_size;

const WRITE_BLOCK_SIZE: usize = 1 << 20;

/// Conventional backing-file path for a size token. Same token, same
/// file, so workloads sharing a size share the provisioning work.
pub fn testfile_path(dir: &Path, size_str: &str) -> PathBuf {
    dir.join(format!("test_file_{}", size_str))
}

/// Make sure a backing file of at least `size_str` bytes exists at
/// `path`. An adequately sized existing file is reused as-is.
pub fn setup_testfile<P: AsRef<Path>>(size_str: &str, path: P) -> Result<()> {
    let path = path.as_ref();
    let size = parse_size(size_str)
        .with_context(|| format!("invalid test file size {:?}", size_str))?;

    if let Ok(md) = path.metadata() {
        if md.is_file() && md.len() >= size {
            debug!(
                "testfile: using existing {} file {:?}",
                size_str, path
            );
            return Ok(());
        }
    }

    info!("testfile: creating {} test file {:?}", size_str, path);

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("failed to create test file {:?}", path))?;

    let block = vec![0u8; WRITE_BLOCK_SIZE];
    let mut left = size;
    while left > 0 {
        let len = left.min(WRITE_BLOCK_SIZE as u64) as usize;
        f.write_all(&block[..len])?;
        left -= len as u64;
    }
    f.sync_all()?;

    info!("testfile: created {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test_file_4K");

        setup_testfile("4K", &path).unwrap();
        assert_eq!(path.metadata().unwrap().len(), 4096);

        // growing reprovisions
        setup_testfile("8K", &path).unwrap();
        assert_eq!(path.metadata().unwrap().len(), 8192);

        // an adequately sized file is left untouched
        let mtime = path.metadata().unwrap().modified().unwrap();
        setup_testfile("4K", &path).unwrap();
        assert_eq!(path.metadata().unwrap().len(), 8192);
        assert_eq!(path.metadata().unwrap().modified().unwrap(), mtime);
    }

    #[test]
    fn test_bad_size_token() {
        let dir = tempfile::tempdir().unwrap();
        assert!(setup_testfile("1X", dir.path().join("f")).is_err());
    }
}
