//! ZIP archive writer.
//!
//! Entries are appended in call order as Local File Header + payload; the
//! Central Directory is accumulated in memory and emitted by
//! [`ZipWriter::finish`], followed by ZIP64 records when any count, size or
//! offset overflows the classic fields, and finally the EOCD.
//!
//! Nothing written depends on wall-clock time or map iteration order, so the
//! same sequence of entries always produces the same bytes.

use std::io;
use std::time::SystemTime;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::codec;
use super::structures::*;

/// An entry whose payload has already been compressed and checksummed.
#[derive(Debug, Clone)]
pub struct PreparedEntry {
    /// Archive name; directories end with `/`.
    pub name: String,
    pub kind: EntryKind,
    pub method: CompressionMethod,
    pub crc32: u32,
    pub uncompressed_size: u64,
    /// Payload as stored in the archive.
    pub data: Vec<u8>,
    pub modified: Option<SystemTime>,
    /// Permission bits (no file type bits).
    pub permissions: u32,
}

impl PreparedEntry {
    pub fn directory(name: String, modified: Option<SystemTime>, permissions: u32) -> Self {
        Self {
            name,
            kind: EntryKind::Directory,
            method: CompressionMethod::Stored,
            crc32: 0,
            uncompressed_size: 0,
            data: Vec::new(),
            modified,
            permissions,
        }
    }

    pub fn file(
        name: String,
        contents: &[u8],
        level: u32,
        modified: Option<SystemTime>,
        permissions: u32,
    ) -> io::Result<Self> {
        let (method, data) = codec::compress(contents, level)?;
        Ok(Self {
            name,
            kind: EntryKind::File,
            method,
            crc32: crc32fast::hash(contents),
            uncompressed_size: contents.len() as u64,
            data,
            modified,
            permissions,
        })
    }

    pub fn symlink(name: String, target: &str, modified: Option<SystemTime>) -> Self {
        Self {
            name,
            kind: EntryKind::Symlink,
            method: CompressionMethod::Stored,
            crc32: crc32fast::hash(target.as_bytes()),
            uncompressed_size: target.len() as u64,
            data: target.as_bytes().to_vec(),
            modified,
            permissions: 0o777,
        }
    }

    fn external_attrs(&self) -> u32 {
        let perms = self.permissions & 0o7777;
        match self.kind {
            EntryKind::Directory => ((S_IFDIR | perms) << 16) | DOS_DIRECTORY,
            EntryKind::File => (S_IFREG | perms) << 16,
            EntryKind::Symlink => (S_IFLNK | perms) << 16,
        }
    }
}

/// Streaming ZIP writer over any async byte sink.
pub struct ZipWriter<W> {
    inner: W,
    /// Bytes written so far; the offset of the next Local File Header.
    offset: u64,
    central: Vec<u8>,
    entries: u64,
}

impl<W: AsyncWrite + Unpin> ZipWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            offset: 0,
            central: Vec::new(),
            entries: 0,
        }
    }

    /// Append one entry: its Local File Header and payload go to the sink,
    /// its Central Directory record is kept for [`finish`](Self::finish).
    pub async fn write_entry(&mut self, entry: &PreparedEntry) -> io::Result<()> {
        let header_offset = self.offset;
        let compressed_size = entry.data.len() as u64;
        let big_sizes = entry.uncompressed_size >= ZIP64_U32 as u64
            || compressed_size >= ZIP64_U32 as u64;
        let big_offset = header_offset >= ZIP64_U32 as u64;

        let (dos_time, dos_date) = entry
            .modified
            .map(dos_datetime)
            .unwrap_or((0, (1 << 5) | 1));
        let timestamp = entry
            .modified
            .and_then(unix_mtime)
            .map(|mtime| [&[0x01u8][..], &mtime.to_le_bytes()[..]].concat());

        // Local header: the ZIP64 record, when present, must carry both sizes.
        let mut local_extra = Vec::new();
        if big_sizes {
            let body = [entry.uncompressed_size.to_le_bytes(), compressed_size.to_le_bytes()];
            push_extra(&mut local_extra, EXTRA_ZIP64, &body.concat())?;
        }
        if let Some(body) = &timestamp {
            push_extra(&mut local_extra, EXTRA_EXTENDED_TIMESTAMP, body)?;
        }

        // Central record: only saturated fields appear in the ZIP64 record,
        // in the fixed order uncompressed, compressed, offset.
        let mut zip64 = Vec::new();
        if entry.uncompressed_size >= ZIP64_U32 as u64 {
            zip64.extend_from_slice(&entry.uncompressed_size.to_le_bytes());
        }
        if compressed_size >= ZIP64_U32 as u64 {
            zip64.extend_from_slice(&compressed_size.to_le_bytes());
        }
        if big_offset {
            zip64.extend_from_slice(&header_offset.to_le_bytes());
        }
        let mut central_extra = Vec::new();
        if !zip64.is_empty() {
            push_extra(&mut central_extra, EXTRA_ZIP64, &zip64)?;
        }
        if let Some(body) = &timestamp {
            push_extra(&mut central_extra, EXTRA_EXTENDED_TIMESTAMP, body)?;
        }

        let mut header = FileHeader {
            version_needed: if big_sizes || big_offset {
                VERSION_NEEDED_ZIP64
            } else {
                VERSION_NEEDED_DEFAULT
            },
            flags: if entry.name.is_ascii() { 0 } else { FLAG_UTF8 },
            method: entry.method,
            dos_time,
            dos_date,
            crc32: entry.crc32,
            compressed_size: if big_sizes { ZIP64_U32 } else { compressed_size as u32 },
            uncompressed_size: if big_sizes {
                ZIP64_U32
            } else {
                entry.uncompressed_size as u32
            },
            name: entry.name.as_bytes(),
            extra: &local_extra,
        };
        let local = header.local_bytes()?;

        header.compressed_size = saturate_u32(compressed_size);
        header.uncompressed_size = saturate_u32(entry.uncompressed_size);
        header.extra = &central_extra;
        let central = header.central_bytes(entry.external_attrs(), saturate_u32(header_offset))?;

        self.inner.write_all(&local).await?;
        self.inner.write_all(&entry.data).await?;
        self.offset += local.len() as u64 + compressed_size;
        self.central.extend_from_slice(&central);
        self.entries += 1;
        Ok(())
    }

    /// Write the Central Directory and end records, flush, and hand back
    /// the sink.
    pub async fn finish(mut self) -> io::Result<W> {
        let cd_offset = self.offset;
        let cd_size = self.central.len() as u64;
        self.inner.write_all(&self.central).await?;

        let eocd = EndOfCentralDirectory::for_directory(self.entries, cd_size, cd_offset);
        if eocd.is_zip64() {
            let eocd64_offset = cd_offset + cd_size;
            let record = Zip64EOCD::for_directory(self.entries, cd_size, cd_offset).to_bytes()?;
            let locator = Zip64EOCDLocator {
                disk_with_eocd64: 0,
                eocd64_offset,
                total_disks: 1,
            }
            .to_bytes()?;
            self.inner.write_all(&record).await?;
            self.inner.write_all(&locator).await?;
        }
        self.inner.write_all(&eocd.to_bytes()?).await?;
        self.inner.flush().await?;

        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zip::ZipExtractor;
    use std::sync::Arc;
    use std::time::Duration;

    async fn archive_of(entries: &[PreparedEntry]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Vec::new());
        for entry in entries {
            writer.write_entry(entry).await.unwrap();
        }
        writer.finish().await.unwrap()
    }

    #[tokio::test]
    async fn written_entries_parse_back() {
        let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        let contents = b"this is a text file".repeat(10);
        let bytes = archive_of(&[
            PreparedEntry::directory("docs/".into(), Some(modified), 0o755),
            PreparedEntry::file("docs/file.txt".into(), &contents, 9, Some(modified), 0o640)
                .unwrap(),
            PreparedEntry::symlink("docs/link".into(), "file.txt", None),
        ])
        .await;

        let extractor = ZipExtractor::new(Arc::new(bytes));
        let entries = extractor.list_files().await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.file_name.as_str()).collect();
        assert_eq!(names, ["docs/", "docs/file.txt", "docs/link"]);

        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[0].unix_mode, Some(0o755));

        let file = &entries[1];
        assert_eq!(file.kind, EntryKind::File);
        assert_eq!(file.compression_method, CompressionMethod::Deflate);
        assert_eq!(file.uncompressed_size, contents.len() as u64);
        assert_eq!(file.unix_mode, Some(0o640));
        assert_eq!(file.modified(), Some(modified));
        assert_eq!(extractor.extract_to_memory(file).await.unwrap(), contents);

        let link = &entries[2];
        assert_eq!(link.kind, EntryKind::Symlink);
        assert_eq!(extractor.extract_to_memory(link).await.unwrap(), b"file.txt");
    }

    #[tokio::test]
    async fn empty_archive_is_just_the_end_record() {
        let bytes = archive_of(&[]).await;
        assert_eq!(bytes.len(), EndOfCentralDirectory::SIZE);
        assert_eq!(&bytes[..4], EndOfCentralDirectory::SIGNATURE);
    }

    #[tokio::test]
    async fn non_ascii_names_set_the_utf8_flag() {
        let bytes = archive_of(&[PreparedEntry::directory("données/".into(), None, 0o755)]).await;
        let flags = u16::from_le_bytes([bytes[6], bytes[7]]);
        assert_eq!(flags & FLAG_UTF8, FLAG_UTF8);

        let entries = ZipExtractor::new(Arc::new(bytes)).list_files().await.unwrap();
        assert_eq!(entries[0].file_name, "données/");
    }

    #[tokio::test]
    async fn overlong_name_is_refused_before_anything_is_written() {
        let mut writer = ZipWriter::new(Vec::new());
        let entry = PreparedEntry::directory(format!("{}/", "a".repeat(70_000)), None, 0o755);
        let err = writer.write_entry(&entry).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(writer.finish().await.unwrap().len(), EndOfCentralDirectory::SIZE);
    }

    #[tokio::test]
    async fn too_many_entries_switch_to_zip64() {
        let entries: Vec<_> = (0..65_536u32)
            .map(|i| PreparedEntry::directory(format!("{i:05x}/"), None, 0o755))
            .collect();
        let bytes = archive_of(&entries).await;

        let tail = &bytes[bytes.len() - EndOfCentralDirectory::SIZE..];
        assert!(EndOfCentralDirectory::from_bytes(tail).unwrap().is_zip64());

        let listed = ZipExtractor::new(Arc::new(bytes)).list_files().await.unwrap();
        assert_eq!(listed.len(), 65_536);
        assert_eq!(listed[65_535].file_name, "0ffff/");
    }
}
