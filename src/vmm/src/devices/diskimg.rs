// SPDX-License-Identifier: Apache-2.0

//! File-backed disk image with positional sector I/O.

use std::fs::{File, OpenOptions};
use std::io::Result;
use std::os::unix::fs::FileExt;
use std::path::Path;

pub struct DiskImg {
    file: File,
    size: u64,
}

impl DiskImg {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let size = file.metadata()?.len();
        Ok(DiskImg { file, size })
    }

    /// Image size in bytes, as reported by the backing file at open time.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn read_at(&self, data: &mut [u8], offset: u64) -> Result<usize> {
        self.file.read_at(data, offset)
    }

    pub fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        self.file.write_at(data, offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use vmm_sys_util::tempfile::TempFile;

    #[test]
    fn positional_read_write_roundtrip() {
        let tmp = TempFile::new().unwrap();
        tmp.as_file().write_all(&[0u8; 1024]).unwrap();

        let disk = DiskImg::open(tmp.as_path()).unwrap();
        assert_eq!(disk.size(), 1024);

        disk.write_at(b"sector-one", 512).unwrap();
        let mut buf = [0u8; 10];
        disk.read_at(&mut buf, 512).unwrap();
        assert_eq!(&buf, b"sector-one");

        // Reads at other offsets are unaffected.
        let mut head = [0u8; 4];
        disk.read_at(&mut head, 0).unwrap();
        assert_eq!(head, [0u8; 4]);
    }
}
