use {
    crate::{
        error::{CaecodError, Result},
        types::{HEADER_LEN, MAGIC_TAIL, PartHeader, checksum},
    },
    memmap2::{Advice, Mmap, MmapMut},
    nix::fcntl::{FallocateFlags, fallocate},
    std::{
        fs::{File, OpenOptions},
        io::ErrorKind,
        path::{Path, PathBuf},
    },
    uuid::Uuid,
};

/// a sealed part file opened read-only
///
/// `open` refuses anything that is not a regular file carrying a well-formed
/// header whose payload hash verifies. the mapping gets random-access
/// advisory hints since lookups jump anywhere in the payload.
#[derive(Debug)]
pub struct MappedFile {
    map: Mmap,
    header: PartHeader,
    path: PathBuf,
}

impl MappedFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let meta = std::fs::metadata(&path).map_err(|_| CaecodError::NotAFile(path.clone()))?;
        if !meta.is_file() {
            return Err(CaecodError::NotAFile(path));
        }
        if meta.len() < HEADER_LEN as u64 {
            return Err(CaecodError::TooSmall(path));
        }

        let file = File::open(&path)?;
        let map = unsafe { Mmap::map(&file) }.map_err(|_| CaecodError::MapFailed)?;

        let header =
            PartHeader::from_bytes(&map[..HEADER_LEN]).ok_or_else(|| CaecodError::TooSmall(path.clone()))?;
        if header.magic & 0x00FF_FFFF != MAGIC_TAIL {
            return Err(CaecodError::BadMagic(path));
        }
        if header.size.checked_add(HEADER_LEN as u64) != Some(map.len() as u64) {
            return Err(CaecodError::SizeMismatch);
        }
        if checksum(&map[HEADER_LEN..]) != header.hash {
            return Err(CaecodError::BadHash(path));
        }

        map.advise(Advice::Random)?;
        map.advise(Advice::WillNeed)?;

        Ok(Self { map, header, path })
    }

    pub const fn header(&self) -> &PartHeader {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// the verified bytes following the header
    pub fn payload(&self) -> &[u8] {
        &self.map[HEADER_LEN..]
    }
}

/// a part file under construction, mapped read-write at its final size
///
/// the caller fills the payload, then `seal` hashes it, stamps the header in
/// place and shrinks the file if less than the pre-allocated capacity was
/// actually used.
#[derive(Debug)]
pub struct MappedFileMut {
    file: File,
    map: MmapMut,
    path: PathBuf,
}

impl MappedFileMut {
    /// pre-allocate `capacity` payload bytes at `path`, failing if it exists
    pub fn create<P: AsRef<Path>>(path: P, capacity: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => CaecodError::AlreadyExists(path.clone()),
                _ => CaecodError::Io(e),
            })?;

        let total = HEADER_LEN as u64 + capacity;
        fallocate(&file, FallocateFlags::empty(), 0, total as i64).map_err(|_| CaecodError::DiskSpace)?;

        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|_| CaecodError::MapFailed)?;

        Ok(Self { file, map, path })
    }

    /// the writable payload region
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.map[HEADER_LEN..]
    }

    /// hash the first `payload_len` payload bytes, write the header and flush
    ///
    /// truncates the file when the payload came in under capacity, which
    /// happens when deduplication collapsed records.
    pub fn seal(self, magic: u32, uuid: &Uuid, records: u32, created: u64, payload_len: u64) -> Result<()> {
        let Self { file, mut map, path: _ } = self;

        let end = HEADER_LEN + payload_len as usize;
        if end > map.len() {
            return Err(CaecodError::SizeMismatch);
        }
        let hash = checksum(&map[HEADER_LEN..end]);
        let header = PartHeader::single(magic, uuid, records, created, payload_len, hash);
        map[..HEADER_LEN].copy_from_slice(&header.to_bytes());
        map.flush()?;

        let total = end as u64;
        drop(map);
        if file.metadata()?.len() > total {
            file.set_len(total)?;
        }
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use {super::*, assert2::check as assert, crate::types::MAGIC_DATA, std::io::Write, tempfile::tempdir};

    #[test]
    fn test_create_seal_open_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.part0");
        let uuid = Uuid::new_v4();

        let mut out = MappedFileMut::create(&path, 11).unwrap();
        out.payload_mut().copy_from_slice(b"hello world");
        out.seal(MAGIC_DATA, &uuid, 1, 1_700_000_000, 11).unwrap();

        let back = MappedFile::open(&path).unwrap();
        assert!(back.payload() == b"hello world");
        assert!(back.header().magic == MAGIC_DATA);
        assert!(back.header().records == 1);
        assert!(back.header().uuid() == uuid);
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.part0");
        std::fs::write(&path, b"occupied").unwrap();

        let result = MappedFileMut::create(&path, 16);
        assert!(matches!(result.unwrap_err(), CaecodError::AlreadyExists(_)));
    }

    #[test]
    fn test_seal_truncates_unused_capacity() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.part0");

        let mut out = MappedFileMut::create(&path, 1024).unwrap();
        out.payload_mut()[..3].copy_from_slice(b"abc");
        out.seal(MAGIC_DATA, &Uuid::new_v4(), 1, 0, 3).unwrap();

        assert!(std::fs::metadata(&path).unwrap().len() == HEADER_LEN as u64 + 3);
        assert!(MappedFile::open(&path).unwrap().payload() == b"abc");
    }

    #[test]
    fn test_open_rejects_directory() {
        let dir = tempdir().unwrap();
        let result = MappedFile::open(dir.path());
        assert!(matches!(result.unwrap_err(), CaecodError::NotAFile(_)));
    }

    #[test]
    fn test_open_rejects_short_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stub");
        std::fs::write(&path, &[0u8; HEADER_LEN - 1]).unwrap();

        let result = MappedFile::open(&path);
        assert!(matches!(result.unwrap_err(), CaecodError::TooSmall(_)));
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad");
        std::fs::write(&path, &[0xAAu8; HEADER_LEN]).unwrap();

        let result = MappedFile::open(&path);
        assert!(matches!(result.unwrap_err(), CaecodError::BadMagic(_)));
    }

    #[test]
    fn test_open_rejects_tampered_payload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.part0");

        let mut out = MappedFileMut::create(&path, 5).unwrap();
        out.payload_mut().copy_from_slice(b"12345");
        out.seal(MAGIC_DATA, &Uuid::new_v4(), 1, 0, 5).unwrap();

        let mut raw = std::fs::read(&path).unwrap();
        raw[HEADER_LEN + 2] ^= 0x01;
        let mut f = OpenOptions::new().write(true).open(&path).unwrap();
        f.write_all(&raw).unwrap();
        drop(f);

        let result = MappedFile::open(&path);
        assert!(matches!(result.unwrap_err(), CaecodError::BadHash(_)));
    }

    #[test]
    fn test_empty_payload_is_valid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("names.part0");

        let out = MappedFileMut::create(&path, 0).unwrap();
        out.seal(crate::types::MAGIC_NAMES, &Uuid::new_v4(), 0, 0, 0).unwrap();

        let back = MappedFile::open(&path).unwrap();
        assert!(back.payload().is_empty());
        assert!(back.header().records == 0);
    }
}
