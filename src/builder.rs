use {
    crate::{
        config::BuildConfig,
        db::write_hash_part,
        error::{CaecodError, Result},
        mapped::MappedFileMut,
        phash::PathIndex,
        types::{
            FILE_DATA, FILE_INDEX, FILE_NAMES, IdxRecord, MAGIC_DATA, MAGIC_INDEX, MAGIC_NAMES,
            RECORD_LEN, RecLen, RecNameLen, checksum,
        },
    },
    hashbrown::HashMap,
    std::{
        fs,
        fs::File,
        io::{BufRead, BufReader, Read},
        path::PathBuf,
        time::{Instant, SystemTime, UNIX_EPOCH},
    },
    tracing::info,
    uuid::Uuid,
};

/// one parsed manifest line: key, body file, extra response header lines
struct ManifestLine {
    name: String,
    file: PathBuf,
    headers: Vec<String>,
}

impl ManifestLine {
    fn parse(line: &str, lineno: usize) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut fields = line.split('\t');

        let name = fields
            .next()
            .filter(|s| !s.is_empty())
            .ok_or(CaecodError::SourceFormat { line: lineno })?;
        let file = fields
            .next()
            .filter(|s| !s.is_empty())
            .ok_or(CaecodError::SourceFormat { line: lineno })?;

        Ok(Self {
            name: name.to_string(),
            file: PathBuf::from(file),
            headers: fields.map(str::to_string).collect(),
        })
    }

    /// resolve the body file, insisting on a regular file
    fn body(&self) -> Result<(PathBuf, u64)> {
        let real = fs::canonicalize(&self.file)
            .map_err(|_| CaecodError::SourceMissing(self.file.clone()))?;
        let meta = fs::metadata(&real).map_err(|_| CaecodError::SourceMissing(self.file.clone()))?;
        if !meta.is_file() {
            return Err(CaecodError::SourceMissing(self.file.clone()));
        }
        Ok((real, meta.len()))
    }

    /// header-block bytes this record contributes, the terminating CRLF included
    fn header_bytes(&self) -> u64 {
        self.headers.iter().map(|h| h.len() as u64 + 2).sum::<u64>() + 2
    }
}

struct SourceTotals {
    records: u64,
    names: u64,
    headers: u64,
    bodies: u64,
}

/// two-pass database build out of a tab-separated manifest
///
/// the first pass discovers exact output sizes and collects the key set; the
/// second emits payloads, names and index slots into pre-allocated mappings.
pub fn build(cfg: &BuildConfig) -> Result<()> {
    let t0 = Instant::now();
    let uuid = Uuid::new_v4();
    let created = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    info!(db = %cfg.db.display(), src = %cfg.src.display(), %uuid, dedup = cfg.dedup, "creating database");

    let src = File::open(&cfg.src).map_err(|_| CaecodError::SourceMissing(cfg.src.clone()))?;

    let mut totals = SourceTotals {
        records: 0,
        names: 0,
        headers: 0,
        bodies: 0,
    };
    let mut keys: Vec<Vec<u8>> = Vec::new();

    for (lineno, line) in BufReader::new(src).lines().enumerate() {
        let parsed = ManifestLine::parse(&line?, lineno + 1)?;
        let (_, body_len) = parsed.body()?;

        if parsed.name.len() + 1 > RecNameLen::MAX as usize {
            return Err(CaecodError::RecordTooLarge(parsed.name));
        }

        totals.records += 1;
        totals.names += parsed.name.len() as u64 + 1;
        totals.headers += parsed.header_bytes();
        totals.bodies += body_len;
        keys.push(parsed.name.into_bytes());
    }

    if totals.records > u32::MAX as u64 {
        return Err(CaecodError::RecordTooLarge(format!("{} records", totals.records)));
    }
    let records = totals.records as u32;

    info!(
        records,
        names = totals.names,
        headers = totals.headers,
        bodies = totals.bodies,
        "manifest scanned"
    );

    let index = PathIndex::build(keys)?;

    fs::create_dir_all(&cfg.db)?;
    write_hash_part(&cfg.db, &uuid, records, created, &index.to_bytes()?)?;

    let data_cap = totals.headers + totals.bodies;
    let mut fidx = MappedFileMut::create(cfg.db.join(FILE_INDEX), records as u64 * RECORD_LEN as u64)?;
    let mut fdata = MappedFileMut::create(cfg.db.join(FILE_DATA), data_cap)?;
    let mut fnames = MappedFileMut::create(cfg.db.join(FILE_NAMES), totals.names)?;

    let src = File::open(&cfg.src).map_err(|_| CaecodError::SourceMissing(cfg.src.clone()))?;
    let mut off: u64 = 0;
    let mut noff: u64 = 0;
    let mut seen: HashMap<u64, (u64, RecLen)> = HashMap::new();

    for (lineno, line) in BufReader::new(src).lines().enumerate() {
        let parsed = ManifestLine::parse(&line?, lineno + 1)?;
        let (real, body_len) = parsed.body()?;

        let payload_len = parsed.header_bytes() + body_len;
        if payload_len > RecLen::MAX as u64 {
            return Err(CaecodError::RecordTooLarge(parsed.name));
        }
        // a source mutated between the passes can no longer fit
        if off + payload_len > data_cap || noff + parsed.name.len() as u64 + 1 > totals.names {
            return Err(CaecodError::SizeMismatch);
        }

        let slot = index
            .lookup(parsed.name.as_bytes())
            .filter(|&s| s < records as u64)
            .ok_or(CaecodError::MphfBuild)?;

        let data = fdata.payload_mut();
        let mut cur = off as usize;
        for h in &parsed.headers {
            data[cur..cur + h.len()].copy_from_slice(h.as_bytes());
            data[cur + h.len()..cur + h.len() + 2].copy_from_slice(b"\r\n");
            cur += h.len() + 2;
        }
        data[cur..cur + 2].copy_from_slice(b"\r\n");
        cur += 2;
        File::open(&real)?.read_exact(&mut data[cur..cur + body_len as usize])?;

        let nstart = noff as usize;
        let names = fnames.payload_mut();
        names[nstart..nstart + parsed.name.len()].copy_from_slice(parsed.name.as_bytes());
        names[nstart + parsed.name.len()] = 0;

        let (rec_off, rec_len) = if cfg.dedup {
            let digest = checksum(&fdata.payload_mut()[off as usize..(off + payload_len) as usize]);
            match seen.get(&digest) {
                Some(&(prev_off, prev_len)) => (prev_off, prev_len),
                None => {
                    seen.insert(digest, (off, payload_len as RecLen));
                    let at = off;
                    off += payload_len;
                    (at, payload_len as RecLen)
                }
            }
        } else {
            let at = off;
            off += payload_len;
            (at, payload_len as RecLen)
        };

        IdxRecord {
            off: rec_off,
            noff,
            len: rec_len,
            nlen: (parsed.name.len() + 1) as RecNameLen,
        }
        .write(fidx.payload_mut(), slot as usize);

        noff += parsed.name.len() as u64 + 1;
    }

    fidx.seal(MAGIC_INDEX, &uuid, records, created, records as u64 * RECORD_LEN as u64)?;
    fdata.seal(MAGIC_DATA, &uuid, records, created, off)?;
    fnames.seal(MAGIC_NAMES, &uuid, records, created, totals.names)?;

    info!(elapsed = ?t0.elapsed(), data_bytes = off, "build done");
    Ok(())
}
