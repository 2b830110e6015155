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
    rusqlite::{Connection, OpenFlags},
    std::{
        fs,
        time::{Instant, SystemTime, UNIX_EPOCH},
    },
    tracing::info,
    uuid::Uuid,
};

/// per-blob response header template; the stored payload is this block
/// followed by the raw blob bytes
fn blob_header(len: usize, digest: u64) -> String {
    format!("Content-Length: {len}\r\nETag: mvt-{digest:016x}\r\n\r\n")
}

/// exact length `blob_header` will produce for a blob of `len` bytes
fn blob_header_len(len: u64) -> u64 {
    const FIXED: u64 = ("Content-Length: ".len() + "\r\nETag: mvt-".len() + 16 + 4) as u64;
    FIXED + decimal_digits(len)
}

fn decimal_digits(n: u64) -> u64 {
    if n == 0 { 1 } else { n.ilog10() as u64 + 1 }
}

/// request path for one tile; the row axis is flipped from TMS to XYZ
fn tile_key(zoom: i64, col: i64, row: i64) -> Result<String> {
    if !(0..=62).contains(&zoom) {
        return Err(CaecodError::RecordTooLarge(format!("zoom level {zoom}")));
    }
    let y = (1i64 << zoom) - 1 - row;
    Ok(format!("/{zoom}/{col}/{y}.mvt"))
}

/// database build out of an MBTiles-shaped store
///
/// the shallow table fans many tile addresses out onto shared blobs, so
/// deduplication is structural here: one payload is emitted per blob and
/// every shallow row referencing it records the same range.
pub fn build(cfg: &BuildConfig) -> Result<()> {
    let t0 = Instant::now();
    let uuid = Uuid::new_v4();
    let created = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    info!(db = %cfg.db.display(), src = %cfg.src.display(), %uuid, "creating database from tiles");

    let conn = Connection::open_with_flags(
        &cfg.src,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|_| CaecodError::SourceMissing(cfg.src.clone()))?;
    conn.execute_batch(
        "PRAGMA query_only=ON;
         PRAGMA temp_store=MEMORY;
         PRAGMA cache_size=-200000;
         PRAGMA mmap_size=1073741824;",
    )?;

    let items: u64 =
        conn.query_row("select count(*) from tiles_shallow", [], |r| r.get::<_, i64>(0))? as u64;
    let blobs: u64 =
        conn.query_row("select count(*) from tiles_data", [], |r| r.get::<_, i64>(0))? as u64;
    let bodies: u64 = conn.query_row(
        "select coalesce(sum(length(tile_data)), 0) from tiles_data",
        [],
        |r| r.get::<_, i64>(0),
    )? as u64;

    let mut headers: u64 = 0;
    {
        let mut stmt = conn.prepare("select length(tile_data) from tiles_data")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            headers += blob_header_len(row.get::<_, i64>(0)? as u64);
        }
    }

    if items > u32::MAX as u64 {
        return Err(CaecodError::RecordTooLarge(format!("{items} records")));
    }
    let records = items as u32;

    let mut names: u64 = 0;
    let mut keys: Vec<Vec<u8>> = Vec::with_capacity(records as usize);
    {
        let mut stmt =
            conn.prepare("select zoom_level, tile_column, tile_row from tiles_shallow")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let key = tile_key(row.get(0)?, row.get(1)?, row.get(2)?)?;
            names += key.len() as u64 + 1;
            keys.push(key.into_bytes());
        }
    }

    info!(records, names, headers, bodies, tiles = blobs, "tile source scanned");

    let index = PathIndex::build(keys)?;

    fs::create_dir_all(&cfg.db)?;
    write_hash_part(&cfg.db, &uuid, records, created, &index.to_bytes()?)?;

    let data_cap = headers + bodies;
    let mut fidx = MappedFileMut::create(cfg.db.join(FILE_INDEX), records as u64 * RECORD_LEN as u64)?;
    let mut fdata = MappedFileMut::create(cfg.db.join(FILE_DATA), data_cap)?;
    let mut fnames = MappedFileMut::create(cfg.db.join(FILE_NAMES), names)?;

    let mut off: u64 = 0;
    let mut noff: u64 = 0;
    // range of the most recently emitted blob; rows sharing its id reuse it
    let mut last: Option<(i64, u64, RecLen)> = None;

    {
        let mut stmt = conn.prepare(
            "select s.tile_data_id, s.zoom_level, s.tile_column, s.tile_row, d.tile_data
             from tiles_shallow s
             join tiles_data d on s.tile_data_id = d.tile_data_id
             order by s.tile_data_id",
        )?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let key = tile_key(row.get(1)?, row.get(2)?, row.get(3)?)?;
            let blob = row.get_ref(4)?.as_blob().map_err(rusqlite::Error::from)?;

            let slot = index
                .lookup(key.as_bytes())
                .filter(|&s| s < records as u64)
                .ok_or(CaecodError::MphfBuild)?;

            let (rec_off, rec_len) = match last {
                Some((prev_id, prev_off, prev_len)) if prev_id == id => (prev_off, prev_len),
                _ => {
                    let digest = checksum(blob);
                    let hdr = blob_header(blob.len(), digest);
                    let payload_len = hdr.len() as u64 + blob.len() as u64;
                    if payload_len > RecLen::MAX as u64 {
                        return Err(CaecodError::RecordTooLarge(key));
                    }
                    if off + payload_len > data_cap {
                        return Err(CaecodError::SizeMismatch);
                    }

                    let data = fdata.payload_mut();
                    let at = off as usize;
                    data[at..at + hdr.len()].copy_from_slice(hdr.as_bytes());
                    data[at + hdr.len()..at + hdr.len() + blob.len()].copy_from_slice(blob);

                    let emitted = (off, payload_len as RecLen);
                    off += payload_len;
                    emitted
                }
            };
            last = Some((id, rec_off, rec_len));

            if noff + key.len() as u64 + 1 > names {
                return Err(CaecodError::SizeMismatch);
            }
            let nstart = noff as usize;
            let out = fnames.payload_mut();
            out[nstart..nstart + key.len()].copy_from_slice(key.as_bytes());
            out[nstart + key.len()] = 0;

            IdxRecord {
                off: rec_off,
                noff,
                len: rec_len,
                nlen: (key.len() + 1) as RecNameLen,
            }
            .write(fidx.payload_mut(), slot as usize);

            noff += key.len() as u64 + 1;
        }
    }

    fidx.seal(MAGIC_INDEX, &uuid, records, created, records as u64 * RECORD_LEN as u64)?;
    fdata.seal(MAGIC_DATA, &uuid, records, created, off)?;
    fnames.seal(MAGIC_NAMES, &uuid, records, created, names)?;

    info!(elapsed = ?t0.elapsed(), data_bytes = off, "build done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::db::Database,
        assert2::check as assert,
        tempfile::{TempDir, tempdir},
    };

    /// stage an MBTiles-shaped store; blobs keyed by data id, shallow rows
    /// given as (zoom, col, row, data_id)
    fn stage(blobs: &[(i64, &[u8])], shallow: &[(i64, i64, i64, i64)]) -> (TempDir, BuildConfig) {
        let dir = tempdir().unwrap();
        let src = dir.path().join("tiles.mbtiles");

        let conn = Connection::open(&src).unwrap();
        conn.execute_batch(
            "create table tiles_shallow (
                 zoom_level integer, tile_column integer, tile_row integer, tile_data_id integer
             );
             create table tiles_data (tile_data_id integer primary key, tile_data blob);",
        )
        .unwrap();

        for (id, blob) in blobs {
            conn.execute(
                "insert into tiles_data (tile_data_id, tile_data) values (?1, ?2)",
                rusqlite::params![id, blob],
            )
            .unwrap();
        }
        for (zoom, col, row, id) in shallow {
            conn.execute(
                "insert into tiles_shallow (zoom_level, tile_column, tile_row, tile_data_id)
                 values (?1, ?2, ?3, ?4)",
                rusqlite::params![zoom, col, row, id],
            )
            .unwrap();
        }
        drop(conn);

        let cfg = BuildConfig {
            src,
            db: dir.path().join("out"),
            dedup: false,
        };
        (dir, cfg)
    }

    #[test]
    fn test_shared_blob_fans_out_to_one_range() {
        let blob = b"gzipped-vector-tile-bytes";
        let (_dir, cfg) = stage(
            &[(1, blob), (2, b"other-tile")],
            &[(3, 0, 0, 1), (3, 1, 0, 1), (3, 0, 1, 1), (3, 1, 1, 2)],
        );
        build(&cfg).unwrap();

        let db = Database::open(&cfg.db).unwrap();
        assert!(db.records() == 4);

        let shared_len = blob_header(blob.len(), checksum(blob)).len() + blob.len();
        let other_len = blob_header(10, checksum(b"other-tile")).len() + b"other-tile".len();
        assert!(db.data_size() == (shared_len + other_len) as u64);

        let ranges: Vec<(u64, u32)> = db
            .entries()
            .filter(|e| e.payload.ends_with(blob))
            .map(|e| (e.off, e.len))
            .collect();
        assert!(ranges.len() == 3);
        assert!(ranges.iter().all(|&r| r == ranges[0]));

        db.verify_deep().unwrap();
    }

    #[test]
    fn test_row_axis_flip() {
        let (_dir, cfg) = stage(&[(7, b"tile")], &[(2, 1, 1, 7)]);
        build(&cfg).unwrap();

        let db = Database::open(&cfg.db).unwrap();
        // zoom 2 has rows 0..4, so TMS row 1 serves as XYZ y = 2
        assert!(db.get(b"/2/1/2.mvt").is_some());
        assert!(db.get(b"/2/1/1.mvt").is_none());
    }

    #[test]
    fn test_payload_shape() {
        let blob = b"\x1f\x8b-binary-tile";
        let (_dir, cfg) = stage(&[(1, blob)], &[(0, 0, 0, 1)]);
        build(&cfg).unwrap();

        let db = Database::open(&cfg.db).unwrap();
        let payload = db.get(b"/0/0/0.mvt").unwrap();

        let expected_prefix = format!(
            "Content-Length: {}\r\nETag: mvt-{:016x}\r\n\r\n",
            blob.len(),
            checksum(blob)
        );
        assert!(payload.starts_with(expected_prefix.as_bytes()));
        assert!(payload.ends_with(blob));
        assert!(payload.len() == expected_prefix.len() + blob.len());
    }

    #[test]
    fn test_empty_store() {
        let (_dir, cfg) = stage(&[], &[]);
        build(&cfg).unwrap();

        let db = Database::open(&cfg.db).unwrap();
        assert!(db.records() == 0);
        assert!(db.get(b"/0/0/0.mvt").is_none());
    }

    #[test]
    fn test_duplicate_tile_addresses_rejected() {
        let (_dir, cfg) = stage(&[(1, b"t")], &[(1, 0, 0, 1), (1, 0, 0, 1)]);
        assert!(matches!(build(&cfg).unwrap_err(), CaecodError::DuplicateKey(_)));
    }

    #[test]
    fn test_header_length_is_digit_exact() {
        for len in [0u64, 1, 9, 10, 99, 100, 4096, 10_000_000] {
            let rendered = blob_header(len as usize, 0xABCD).len() as u64;
            assert!(blob_header_len(len) == rendered);
        }
    }
}
