//! Directory helpers shared by the journal and the entry log.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

/// File name for a numbered log file: `{id:016x}.{extension}`.
pub fn numbered_file(dir: &Path, id: u64, extension: &str) -> PathBuf {
    dir.join(format!("{:016x}.{}", id, extension))
}

/// Ids of all `{hex}.{extension}` files in `dir`, ascending.
pub fn list_numbered(dir: &Path, extension: &str) -> io::Result<Vec<u64>> {
    let mut ids = Vec::new();
    if !dir.exists() {
        return Ok(ids);
    }
    for item in fs::read_dir(dir)? {
        let path = item?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(extension) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        if let Ok(id) = u64::from_str_radix(stem, 16) {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Make a newly created or removed directory entry durable.
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Read until `buf` is full or EOF, returning the number of bytes read.
pub fn read_up_to(reader: &mut impl io::Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_list_numbered_skips_foreign_files() {
        let temp = TempDir::new().unwrap();
        fs::write(numbered_file(temp.path(), 2, "txn"), b"").unwrap();
        fs::write(numbered_file(temp.path(), 0x1f, "txn"), b"").unwrap();
        fs::write(temp.path().join("COOKIE"), b"").unwrap();
        fs::write(temp.path().join("zz.txn"), b"").unwrap();
        fs::write(numbered_file(temp.path(), 3, "log"), b"").unwrap();

        assert_eq!(list_numbered(temp.path(), "txn").unwrap(), vec![2, 0x1f]);
        assert!(list_numbered(&temp.path().join("missing"), "txn")
            .unwrap()
            .is_empty());
    }
}
