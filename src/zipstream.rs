use crate::config::STREAM_BUF_SIZE;
use bytes::Bytes;
use chrono::{Datelike, Timelike, Utc};
use futures::channel::mpsc;
use futures::{SinkExt, Stream};
use std::io;
use std::path::PathBuf;
use tokio::io::AsyncReadExt;
use tracing::debug;

const LOCAL_HEADER_SIG: u32 = 0x04034b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x08074b50;
const CENTRAL_HEADER_SIG: u32 = 0x02014b50;
const EOCD_SIG: u32 = 0x06054b50;

// General purpose flags: bit 3 (sizes in trailing data descriptor) lets us
// emit each entry's header before its content has been read, bit 11 marks
// UTF-8 names.
const FLAGS: u16 = 0x0008 | 0x0800;
const VERSION: u16 = 20;

/// One file to be placed in the archive, addressed by its archive-relative
/// name. Entries above 4 GiB would need zip64 records and are not produced
/// by the pipeline outputs this serves.
#[derive(Debug, Clone)]
pub struct ZipEntry {
    pub name: String,
    pub path: PathBuf,
}

struct CentralRecord {
    name: String,
    crc: u32,
    size: u32,
    offset: u32,
    dos_time: u16,
    dos_date: u16,
}

// Plain zip32 records only: sizes and offsets are 32-bit and the entry
// count is 16-bit. Anything past those limits must fail loudly instead of
// truncating into a silently corrupt archive.
fn ensure_zip32(size: u64, offset: u64) -> io::Result<()> {
    if size > u64::from(u32::MAX) {
        return Err(io::Error::other(
            "archive entry exceeds 4 GiB; zip64 records are not produced",
        ));
    }
    if offset > u64::from(u32::MAX) {
        return Err(io::Error::other(
            "archive exceeds 4 GiB; zip64 records are not produced",
        ));
    }
    Ok(())
}

fn dos_datetime() -> (u16, u16) {
    let now = Utc::now();
    let time = ((now.hour() as u16) << 11)
        | ((now.minute() as u16) << 5)
        | ((now.second() as u16) / 2);
    let year = (now.year().max(1980) - 1980) as u16;
    let date = (year << 9) | ((now.month() as u16) << 5) | (now.day() as u16);
    (time, date)
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn local_header(name: &str, dos_time: u16, dos_date: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(30 + name.len());
    put_u32(&mut buf, LOCAL_HEADER_SIG);
    put_u16(&mut buf, VERSION);
    put_u16(&mut buf, FLAGS);
    put_u16(&mut buf, 0); // stored
    put_u16(&mut buf, dos_time);
    put_u16(&mut buf, dos_date);
    put_u32(&mut buf, 0); // crc, in the descriptor
    put_u32(&mut buf, 0); // compressed size
    put_u32(&mut buf, 0); // uncompressed size
    put_u16(&mut buf, name.len() as u16);
    put_u16(&mut buf, 0); // extra
    buf.extend_from_slice(name.as_bytes());
    buf
}

fn data_descriptor(crc: u32, size: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    put_u32(&mut buf, DATA_DESCRIPTOR_SIG);
    put_u32(&mut buf, crc);
    put_u32(&mut buf, size); // stored: compressed == uncompressed
    put_u32(&mut buf, size);
    buf
}

fn central_directory(records: &[CentralRecord], cd_offset: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    for rec in records {
        put_u32(&mut buf, CENTRAL_HEADER_SIG);
        put_u16(&mut buf, VERSION); // made by
        put_u16(&mut buf, VERSION); // needed
        put_u16(&mut buf, FLAGS);
        put_u16(&mut buf, 0); // stored
        put_u16(&mut buf, rec.dos_time);
        put_u16(&mut buf, rec.dos_date);
        put_u32(&mut buf, rec.crc);
        put_u32(&mut buf, rec.size);
        put_u32(&mut buf, rec.size);
        put_u16(&mut buf, rec.name.len() as u16);
        put_u16(&mut buf, 0); // extra
        put_u16(&mut buf, 0); // comment
        put_u16(&mut buf, 0); // disk
        put_u16(&mut buf, 0); // internal attrs
        put_u32(&mut buf, 0); // external attrs
        put_u32(&mut buf, rec.offset);
        buf.extend_from_slice(rec.name.as_bytes());
    }
    let cd_size = buf.len() as u32;
    put_u32(&mut buf, EOCD_SIG);
    put_u16(&mut buf, 0);
    put_u16(&mut buf, 0);
    put_u16(&mut buf, records.len() as u16);
    put_u16(&mut buf, records.len() as u16);
    put_u32(&mut buf, cd_size);
    put_u32(&mut buf, cd_offset);
    put_u16(&mut buf, 0); // comment
    buf
}

/// Lazily composes a stored-method zip over `entries`.
///
/// Each entry's header streams out before its content is read, so the
/// response starts immediately and memory stays bounded by the read buffer
/// regardless of archive size. The writer task stops as soon as the client
/// hangs up and drops the receiving half.
pub fn stream(entries: Vec<ZipEntry>) -> impl Stream<Item = io::Result<Bytes>> + Send {
    let (mut tx, rx) = mpsc::channel::<io::Result<Bytes>>(8);

    tokio::spawn(async move {
        if entries.len() > usize::from(u16::MAX) {
            let _ = tx
                .send(Err(io::Error::other(
                    "too many archive entries for a zip32 central directory",
                )))
                .await;
            return;
        }

        let mut offset: u64 = 0;
        let mut records: Vec<CentralRecord> = Vec::with_capacity(entries.len());
        let (dos_time, dos_date) = dos_datetime();

        for entry in entries {
            let header_offset = offset;
            let header = local_header(&entry.name, dos_time, dos_date);
            offset += header.len() as u64;
            if tx.send(Ok(Bytes::from(header))).await.is_err() {
                return;
            }

            let mut file = match tokio::fs::File::open(&entry.path).await {
                Ok(f) => f,
                Err(e) => {
                    debug!("archive entry {} unreadable: {}", entry.path.display(), e);
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            let mut crc = flate2::Crc::new();
            let mut size: u64 = 0;
            let mut buf = vec![0u8; STREAM_BUF_SIZE];
            loop {
                let n = match file.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                crc.update(&buf[..n]);
                size += n as u64;
                if tx
                    .send(Ok(Bytes::copy_from_slice(&buf[..n])))
                    .await
                    .is_err()
                {
                    return;
                }
            }

            if let Err(e) = ensure_zip32(size, header_offset) {
                let _ = tx.send(Err(e)).await;
                return;
            }

            let descriptor = data_descriptor(crc.sum(), size as u32);
            offset += size + descriptor.len() as u64;
            if tx.send(Ok(Bytes::from(descriptor))).await.is_err() {
                return;
            }

            records.push(CentralRecord {
                name: entry.name,
                crc: crc.sum(),
                size: size as u32,
                offset: header_offset as u32,
                dos_time,
                dos_date,
            });
        }

        if let Err(e) = ensure_zip32(0, offset) {
            let _ = tx.send(Err(e)).await;
            return;
        }
        let tail = central_directory(&records, offset as u32);
        let _ = tx.send(Ok(Bytes::from(tail))).await;
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    async fn collect(entries: Vec<ZipEntry>) -> Vec<u8> {
        let mut out = Vec::new();
        let mut s = Box::pin(stream(entries));
        while let Some(chunk) = s.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn empty_archive_is_just_an_eocd() {
        let bytes = collect(Vec::new()).await;
        assert_eq!(&bytes[..4], &EOCD_SIG.to_le_bytes());
        assert_eq!(bytes.len(), 22);
    }

    #[tokio::test]
    async fn archive_contains_entries_and_central_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"bravo bravo").unwrap();

        let bytes = collect(vec![
            ZipEntry {
                name: "a.txt".into(),
                path: dir.path().join("a.txt"),
            },
            ZipEntry {
                name: "sub/b.txt".into(),
                path: dir.path().join("b.txt"),
            },
        ])
        .await;

        assert_eq!(&bytes[..4], &LOCAL_HEADER_SIG.to_le_bytes());
        let hay = bytes.as_slice();
        assert!(hay.windows(5).any(|w| w == b"alpha"));
        assert!(hay.windows(9).any(|w| w == b"sub/b.txt"));
        // EOCD sits in the final 22 bytes and reports both entries.
        let eocd = &bytes[bytes.len() - 22..];
        assert_eq!(&eocd[..4], &EOCD_SIG.to_le_bytes());
        assert_eq!(u16::from_le_bytes([eocd[10], eocd[11]]), 2);
    }

    #[test]
    fn zip32_limits_are_enforced_not_truncated() {
        assert!(ensure_zip32(0, 0).is_ok());
        assert!(ensure_zip32(u64::from(u32::MAX), u64::from(u32::MAX)).is_ok());
        assert!(ensure_zip32(u64::from(u32::MAX) + 1, 0).is_err());
        assert!(ensure_zip32(0, u64::from(u32::MAX) + 1).is_err());
        assert!(ensure_zip32(5 * 1024 * 1024 * 1024, 0).is_err());
    }

    #[tokio::test]
    async fn oversized_entry_count_errors_before_any_output() {
        let entries = (0..=u16::MAX as usize + 1)
            .map(|i| ZipEntry {
                name: format!("f{}", i),
                path: PathBuf::from("/nonexistent"),
            })
            .collect();
        let mut s = Box::pin(stream(entries));
        let first = s.next().await.unwrap();
        assert!(first.is_err());
        assert!(s.next().await.is_none());
    }

    #[tokio::test]
    async fn crc_matches_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("c.bin"), b"0123456789").unwrap();
        let bytes = collect(vec![ZipEntry {
            name: "c.bin".into(),
            path: dir.path().join("c.bin"),
        }])
        .await;

        let mut crc = flate2::Crc::new();
        crc.update(b"0123456789");
        let expected = crc.sum().to_le_bytes();
        assert!(bytes.windows(4).any(|w| w == expected));
    }
}
