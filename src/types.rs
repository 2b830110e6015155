use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64_with_seed;

/// magic for `idx.part0`
pub const MAGIC_INDEX: u32 = 0xF0CA_EC0D;
/// magic for `data.part0`
pub const MAGIC_DATA: u32 = 0xFECA_EC0D;
/// magic for `names.part0`
pub const MAGIC_NAMES: u32 = 0xFCCA_EC0D;
/// magic for `hash.part0`
pub const MAGIC_HASH: u32 = 0xFDCA_EC0D;

/// low 24 bits shared by all four magics
pub const MAGIC_TAIL: u32 = 0x00CA_EC0D;

/// seed for every XXH3-64 computed over part payloads, dedup candidates and tile blobs
pub const HASH_SEED: u64 = 0xDEAD_C0DE;

pub const FILE_INDEX: &str = "idx.part0";
pub const FILE_DATA: &str = "data.part0";
pub const FILE_NAMES: &str = "names.part0";
pub const FILE_HASH: &str = "hash.part0";

/// byte offset of a payload inside `data`, or of a name inside `names`
pub type RecOff = u64;
/// payload length; caps a single record at `u32::MAX` bytes
pub type RecLen = u32;
/// canonical name length including the trailing NUL; caps a key at 65534 bytes
pub type RecNameLen = u16;

/// serialized size of one index record
pub const RECORD_LEN: usize = 22;

/// serialized size of the part header preceding every payload
pub const HEADER_LEN: usize = 52;

/// XXH3-64 with the fixed dataset seed
pub fn checksum(data: &[u8]) -> u64 {
    xxh3_64_with_seed(data, HASH_SEED)
}

/// fixed header shared by the four files of a dataset
///
/// every multi-byte field is little-endian on disk. `size` counts the payload
/// bytes following the header and `hash` seals exactly those bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartHeader {
    pub magic: u32,
    pub uuid: [u8; 16],
    pub parts: u16,
    pub part: u16,
    pub records: u32,
    pub created: u64,
    pub size: u64,
    pub hash: u64,
}

impl PartHeader {
    /// header for part 0 of a single-part dataset
    pub fn single(magic: u32, uuid: &Uuid, records: u32, created: u64, size: u64, hash: u64) -> Self {
        Self {
            magic,
            uuid: *uuid.as_bytes(),
            parts: 1,
            part: 0,
            records,
            created,
            size,
            hash,
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_LEN {
            return None;
        }

        let magic = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let uuid = bytes[4..20].try_into().ok()?;
        let parts = u16::from_le_bytes(bytes[20..22].try_into().ok()?);
        let part = u16::from_le_bytes(bytes[22..24].try_into().ok()?);
        let records = u32::from_le_bytes(bytes[24..28].try_into().ok()?);
        let created = u64::from_le_bytes(bytes[28..36].try_into().ok()?);
        let size = u64::from_le_bytes(bytes[36..44].try_into().ok()?);
        let hash = u64::from_le_bytes(bytes[44..52].try_into().ok()?);

        Some(Self {
            magic,
            uuid,
            parts,
            part,
            records,
            created,
            size,
            hash,
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut bytes = [0u8; HEADER_LEN];
        bytes[0..4].copy_from_slice(&self.magic.to_le_bytes());
        bytes[4..20].copy_from_slice(&self.uuid);
        bytes[20..22].copy_from_slice(&self.parts.to_le_bytes());
        bytes[22..24].copy_from_slice(&self.part.to_le_bytes());
        bytes[24..28].copy_from_slice(&self.records.to_le_bytes());
        bytes[28..36].copy_from_slice(&self.created.to_le_bytes());
        bytes[36..44].copy_from_slice(&self.size.to_le_bytes());
        bytes[44..52].copy_from_slice(&self.hash.to_le_bytes());
        bytes
    }

    pub const fn uuid(&self) -> Uuid {
        Uuid::from_bytes(self.uuid)
    }
}

/// one slot of the `idx` payload
///
/// `off`/`len` locate the payload inside `data`, `noff`/`nlen` the canonical
/// NUL-terminated name inside `names`. `nlen` counts the NUL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdxRecord {
    pub off: RecOff,
    pub noff: RecOff,
    pub len: RecLen,
    pub nlen: RecNameLen,
}

impl IdxRecord {
    /// decode the record at `slot` out of an idx payload
    pub fn read(payload: &[u8], slot: usize) -> Self {
        let b = &payload[slot * RECORD_LEN..(slot + 1) * RECORD_LEN];
        Self {
            off: u64::from_le_bytes(b[0..8].try_into().unwrap()),
            noff: u64::from_le_bytes(b[8..16].try_into().unwrap()),
            len: u32::from_le_bytes(b[16..20].try_into().unwrap()),
            nlen: u16::from_le_bytes(b[20..22].try_into().unwrap()),
        }
    }

    /// encode this record into the slot of an idx payload
    pub fn write(&self, payload: &mut [u8], slot: usize) {
        let b = &mut payload[slot * RECORD_LEN..(slot + 1) * RECORD_LEN];
        b[0..8].copy_from_slice(&self.off.to_le_bytes());
        b[8..16].copy_from_slice(&self.noff.to_le_bytes());
        b[16..20].copy_from_slice(&self.len.to_le_bytes());
        b[20..22].copy_from_slice(&self.nlen.to_le_bytes());
    }
}
