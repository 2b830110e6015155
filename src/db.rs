use {
    crate::{
        error::{CaecodError, Result},
        mapped::MappedFile,
        phash::PathIndex,
        types::{
            FILE_DATA, FILE_HASH, FILE_INDEX, FILE_NAMES, IdxRecord, MAGIC_DATA,
            MAGIC_HASH, MAGIC_INDEX, MAGIC_NAMES, PartHeader, RECORD_LEN, checksum,
        },
    },
    rayon::prelude::*,
    std::{
        fs::OpenOptions,
        io::{ErrorKind, Write},
        path::{Path, PathBuf},
    },
    tracing::info,
    uuid::Uuid,
};

/// an open dataset: three memory-mapped part files plus the heap-resident
/// perfect hash deserialized out of the fourth
///
/// the mappings are read-only and shared freely across threads; `get` is a
/// hash evaluation plus two dereferences into the mapped regions.
#[derive(Debug)]
pub struct Database {
    idx: MappedFile,
    data: MappedFile,
    names: MappedFile,
    index: PathIndex,
    records: u32,
}

/// one index slot surfaced for diagnostics and tests
#[derive(Debug, Clone, Copy)]
pub struct Entry<'a> {
    pub name: &'a [u8],
    pub payload: &'a [u8],
    pub off: u64,
    pub len: u32,
}

impl Database {
    /// open and cross-check the four part files of `dir`
    ///
    /// each file's own magic, size and payload hash are verified by the
    /// mapping layer; this layer pins the per-file magics and requires one
    /// uuid, one record count and in-bounds index slots across the set.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();

        let idx = MappedFile::open(dir.join(FILE_INDEX))?;
        let data = MappedFile::open(dir.join(FILE_DATA))?;
        let names = MappedFile::open(dir.join(FILE_NAMES))?;
        let hash = MappedFile::open(dir.join(FILE_HASH))?;

        let uuid = idx.header().uuid;
        let records = idx.header().records;
        info!(uuid = %idx.header().uuid(), records, "opening database");

        for (file, magic) in [
            (&idx, MAGIC_INDEX),
            (&data, MAGIC_DATA),
            (&names, MAGIC_NAMES),
            (&hash, MAGIC_HASH),
        ] {
            let h = file.header();
            if h.magic != magic {
                return Err(CaecodError::BadMagic(file.path().to_path_buf()));
            }
            if h.uuid != uuid {
                return Err(CaecodError::UuidMismatch);
            }
            if h.records != records {
                return Err(CaecodError::RecordCountMismatch);
            }
        }

        if idx.payload().len() != records as usize * RECORD_LEN {
            return Err(CaecodError::SizeMismatch);
        }

        // the hash part is read once into the heap, not kept mapped
        let index = PathIndex::from_bytes(hash.payload())?;
        drop(hash);

        let db = Self {
            idx,
            data,
            names,
            index,
            records,
        };

        let data_size = db.data.header().size;
        let names_size = db.names.header().size;
        for slot in 0..records as usize {
            let rec = db.record(slot);
            let data_end = rec.off.checked_add(rec.len as u64);
            let names_end = rec.noff.checked_add(rec.nlen as u64);
            match (data_end, names_end) {
                (Some(d), Some(n)) if d <= data_size && n <= names_size => {}
                _ => return Err(CaecodError::SizeMismatch),
            }
        }

        Ok(db)
    }

    fn record(&self, slot: usize) -> IdxRecord {
        IdxRecord::read(self.idx.payload(), slot)
    }

    /// O(1) lookup: hash, then confirm against the canonical name
    ///
    /// the perfect hash returns garbage slots for keys outside the build set,
    /// so both the length and the byte comparison are load-bearing.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        if key.is_empty() {
            return None;
        }

        let slot = self.index.lookup(key)?;
        if slot >= self.records as u64 {
            return None;
        }

        let rec = self.record(slot as usize);
        if rec.nlen as usize != key.len() + 1 {
            return None;
        }
        let noff = rec.noff as usize;
        if &self.names.payload()[noff..noff + key.len()] != key {
            return None;
        }

        let off = rec.off as usize;
        Some(&self.data.payload()[off..off + rec.len as usize])
    }

    pub const fn records(&self) -> u32 {
        self.records
    }

    pub fn uuid(&self) -> Uuid {
        self.idx.header().uuid()
    }

    pub const fn created(&self) -> u64 {
        self.idx.header().created
    }

    pub const fn data_size(&self) -> u64 {
        self.data.header().size
    }

    /// linear walk over all slots, for diagnostics
    pub fn entries(&self) -> impl Iterator<Item = Entry<'_>> {
        (0..self.records as usize).map(move |slot| {
            let rec = self.record(slot);
            Entry {
                name: &self.names.payload()[rec.noff as usize..(rec.noff + rec.nlen as u64) as usize],
                payload: &self.data.payload()[rec.off as usize..(rec.off + rec.len as u64) as usize],
                off: rec.off,
                len: rec.len,
            }
        })
    }

    /// confirm that every slot's canonical name is NUL-terminated and maps
    /// back onto its own slot through the perfect hash
    pub fn verify_deep(&self) -> Result<()> {
        let bad = (0..self.records as usize).into_par_iter().find_first(|&slot| {
            let rec = self.record(slot);
            let name = &self.names.payload()[rec.noff as usize..(rec.noff + rec.nlen as u64) as usize];
            match name.split_last() {
                Some((0, key)) => self.index.lookup(key) != Some(slot as u64),
                _ => true,
            }
        });

        match bad {
            Some(slot) => Err(CaecodError::MphfLoad(format!(
                "slot {slot} fails name confirmation"
            ))),
            None => Ok(()),
        }
    }
}

/// write the sealed hash part in one shot; it is never mapped at build time
pub(crate) fn write_hash_part(
    dir: &Path,
    uuid: &Uuid,
    records: u32,
    created: u64,
    payload: &[u8],
) -> Result<PathBuf> {
    let path = dir.join(FILE_HASH);
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| match e.kind() {
            ErrorKind::AlreadyExists => CaecodError::AlreadyExists(path.clone()),
            _ => CaecodError::Io(e),
        })?;

    let header = PartHeader::single(
        MAGIC_HASH,
        uuid,
        records,
        created,
        payload.len() as u64,
        checksum(payload),
    );
    file.write_all(&header.to_bytes())?;
    file.write_all(payload)?;
    file.sync_all()?;
    Ok(path)
}
