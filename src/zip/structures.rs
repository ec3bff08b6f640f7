use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use std::io::Cursor;
use std::time::SystemTime;

use anyhow::{Result, bail};

/// ZIP compression methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    Stored,
    Deflate,
    Unknown(u16),
}

impl CompressionMethod {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0 => CompressionMethod::Stored,
            8 => CompressionMethod::Deflate,
            _ => CompressionMethod::Unknown(value),
        }
    }

    pub fn as_u16(&self) -> u16 {
        match self {
            CompressionMethod::Stored => 0,
            CompressionMethod::Deflate => 8,
            CompressionMethod::Unknown(v) => *v,
        }
    }
}

/// What an archive entry represents once extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directory,
    File,
    /// Entry data is the link target.
    Symlink,
}

/// Unix file type bits stored in the high half of the external attributes.
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// MS-DOS directory attribute.
pub const DOS_DIRECTORY: u32 = 0x10;

/// "Version made by" host byte for Unix.
pub const HOST_UNIX: u16 = 3;
/// Made by Unix, APPNOTE version 3.0.
pub const VERSION_MADE_BY: u16 = (HOST_UNIX << 8) | 30;
pub const VERSION_NEEDED_DEFAULT: u16 = 20;
pub const VERSION_NEEDED_ZIP64: u16 = 45;

/// General purpose flag bit 11: name is UTF-8.
pub const FLAG_UTF8: u16 = 1 << 11;

pub const EXTRA_ZIP64: u16 = 0x0001;
pub const EXTRA_EXTENDED_TIMESTAMP: u16 = 0x5455;

/// Marker values signalling that the real value lives in a ZIP64 record.
pub const ZIP64_U16: u16 = 0xFFFF;
pub const ZIP64_U32: u32 = 0xFFFF_FFFF;

/// End of Central Directory (EOCD) - 22 bytes minimum
pub struct EndOfCentralDirectory {
    pub disk_number: u16,
    pub disk_with_cd: u16,
    pub disk_entries: u16,
    pub total_entries: u16,
    pub cd_size: u32,
    pub cd_offset: u32,
    pub comment_len: u16,
}

impl EndOfCentralDirectory {
    pub const SIGNATURE: &'static [u8] = b"PK\x05\x06";
    pub const SIZE: usize = 22;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("Invalid End of Central Directory");
        }

        // Verify signature
        if &data[0..4] != Self::SIGNATURE {
            bail!("Invalid End of Central Directory");
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_number: cursor.read_u16::<LittleEndian>()?,
            disk_with_cd: cursor.read_u16::<LittleEndian>()?,
            disk_entries: cursor.read_u16::<LittleEndian>()?,
            total_entries: cursor.read_u16::<LittleEndian>()?,
            cd_size: cursor.read_u32::<LittleEndian>()?,
            cd_offset: cursor.read_u32::<LittleEndian>()?,
            comment_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    /// Build the record for a single-disk archive, saturating any field
    /// that needs a ZIP64 record.
    pub fn for_directory(total_entries: u64, cd_size: u64, cd_offset: u64) -> Self {
        let entries = u16::try_from(total_entries)
            .ok()
            .filter(|n| *n < ZIP64_U16)
            .unwrap_or(ZIP64_U16);
        Self {
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: entries,
            total_entries: entries,
            cd_size: saturate_u32(cd_size),
            cd_offset: saturate_u32(cd_offset),
            comment_len: 0,
        }
    }

    pub fn to_bytes(&self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(Self::SIGNATURE);
        buf.write_u16::<LittleEndian>(self.disk_number)?;
        buf.write_u16::<LittleEndian>(self.disk_with_cd)?;
        buf.write_u16::<LittleEndian>(self.disk_entries)?;
        buf.write_u16::<LittleEndian>(self.total_entries)?;
        buf.write_u32::<LittleEndian>(self.cd_size)?;
        buf.write_u32::<LittleEndian>(self.cd_offset)?;
        buf.write_u16::<LittleEndian>(self.comment_len)?;
        Ok(buf)
    }

    pub fn is_zip64(&self) -> bool {
        self.disk_entries == ZIP64_U16
            || self.total_entries == ZIP64_U16
            || self.cd_size == ZIP64_U32
            || self.cd_offset == ZIP64_U32
    }
}

/// ZIP64 End of Central Directory Locator - 20 bytes
pub struct Zip64EOCDLocator {
    pub disk_with_eocd64: u32,
    pub eocd64_offset: u64,
    pub total_disks: u32,
}

impl Zip64EOCDLocator {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x07";
    pub const SIZE: usize = 20;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            bail!("Invalid ZIP64 format");
        }

        if &data[0..4] != Self::SIGNATURE {
            bail!("Invalid ZIP64 format");
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            disk_with_eocd64: cursor.read_u32::<LittleEndian>()?,
            eocd64_offset: cursor.read_u64::<LittleEndian>()?,
            total_disks: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.extend_from_slice(Self::SIGNATURE);
        buf.write_u32::<LittleEndian>(self.disk_with_eocd64)?;
        buf.write_u64::<LittleEndian>(self.eocd64_offset)?;
        buf.write_u32::<LittleEndian>(self.total_disks)?;
        Ok(buf)
    }
}

/// ZIP64 End of Central Directory - 56 bytes minimum
pub struct Zip64EOCD {
    pub eocd64_size: u64,
    pub version_made_by: u16,
    pub version_needed: u16,
    pub disk_number: u32,
    pub disk_with_cd: u32,
    pub disk_entries: u64,
    pub total_entries: u64,
    pub cd_size: u64,
    pub cd_offset: u64,
}

impl Zip64EOCD {
    pub const SIGNATURE: &'static [u8] = b"PK\x06\x06";
    pub const MIN_SIZE: usize = 56;

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::MIN_SIZE {
            bail!("Invalid ZIP64 format");
        }

        if &data[0..4] != Self::SIGNATURE {
            bail!("Invalid ZIP64 format");
        }

        let mut cursor = Cursor::new(&data[4..]);

        Ok(Self {
            eocd64_size: cursor.read_u64::<LittleEndian>()?,
            version_made_by: cursor.read_u16::<LittleEndian>()?,
            version_needed: cursor.read_u16::<LittleEndian>()?,
            disk_number: cursor.read_u32::<LittleEndian>()?,
            disk_with_cd: cursor.read_u32::<LittleEndian>()?,
            disk_entries: cursor.read_u64::<LittleEndian>()?,
            total_entries: cursor.read_u64::<LittleEndian>()?,
            cd_size: cursor.read_u64::<LittleEndian>()?,
            cd_offset: cursor.read_u64::<LittleEndian>()?,
        })
    }

    pub fn for_directory(total_entries: u64, cd_size: u64, cd_offset: u64) -> Self {
        Self {
            // Size of the remaining record, excluding signature and this field.
            eocd64_size: (Self::MIN_SIZE - 12) as u64,
            version_made_by: VERSION_MADE_BY,
            version_needed: VERSION_NEEDED_ZIP64,
            disk_number: 0,
            disk_with_cd: 0,
            disk_entries: total_entries,
            total_entries,
            cd_size,
            cd_offset,
        }
    }

    pub fn to_bytes(&self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::MIN_SIZE);
        buf.extend_from_slice(Self::SIGNATURE);
        buf.write_u64::<LittleEndian>(self.eocd64_size)?;
        buf.write_u16::<LittleEndian>(self.version_made_by)?;
        buf.write_u16::<LittleEndian>(self.version_needed)?;
        buf.write_u32::<LittleEndian>(self.disk_number)?;
        buf.write_u32::<LittleEndian>(self.disk_with_cd)?;
        buf.write_u64::<LittleEndian>(self.disk_entries)?;
        buf.write_u64::<LittleEndian>(self.total_entries)?;
        buf.write_u64::<LittleEndian>(self.cd_size)?;
        buf.write_u64::<LittleEndian>(self.cd_offset)?;
        Ok(buf)
    }
}

/// Central Directory File Header (CDFH) - 46 bytes minimum
pub const CDFH_SIGNATURE: &[u8] = b"PK\x01\x02";
pub const CDFH_MIN_SIZE: usize = 46;

/// Local File Header (LFH) - 30 bytes
pub const LFH_SIGNATURE: &[u8] = b"PK\x03\x04";
pub const LFH_SIZE: usize = 30;

/// Fields common to a Local File Header and its Central Directory record.
///
/// Sizes are the values written to the fixed fields; callers saturate them
/// and carry the real values in a ZIP64 extra field.
pub struct FileHeader<'a> {
    pub version_needed: u16,
    pub flags: u16,
    pub method: CompressionMethod,
    pub dos_time: u16,
    pub dos_date: u16,
    pub crc32: u32,
    pub compressed_size: u32,
    pub uncompressed_size: u32,
    pub name: &'a [u8],
    pub extra: &'a [u8],
}

impl FileHeader<'_> {
    pub fn local_bytes(&self) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(LFH_SIZE + self.name.len() + self.extra.len());
        buf.extend_from_slice(LFH_SIGNATURE);
        buf.write_u16::<LittleEndian>(self.version_needed)?;
        self.write_common(&mut buf)?;
        buf.extend_from_slice(self.name);
        buf.extend_from_slice(self.extra);
        Ok(buf)
    }

    pub fn central_bytes(&self, external_attrs: u32, lfh_offset: u32) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(CDFH_MIN_SIZE + self.name.len() + self.extra.len());
        buf.extend_from_slice(CDFH_SIGNATURE);
        buf.write_u16::<LittleEndian>(VERSION_MADE_BY)?;
        buf.write_u16::<LittleEndian>(self.version_needed)?;
        self.write_common(&mut buf)?;
        buf.write_u16::<LittleEndian>(0)?; // comment length
        buf.write_u16::<LittleEndian>(0)?; // disk number start
        buf.write_u16::<LittleEndian>(0)?; // internal attributes
        buf.write_u32::<LittleEndian>(external_attrs)?;
        buf.write_u32::<LittleEndian>(lfh_offset)?;
        buf.extend_from_slice(self.name);
        buf.extend_from_slice(self.extra);
        Ok(buf)
    }

    fn write_common(&self, buf: &mut Vec<u8>) -> std::io::Result<()> {
        buf.write_u16::<LittleEndian>(self.flags)?;
        buf.write_u16::<LittleEndian>(self.method.as_u16())?;
        buf.write_u16::<LittleEndian>(self.dos_time)?;
        buf.write_u16::<LittleEndian>(self.dos_date)?;
        buf.write_u32::<LittleEndian>(self.crc32)?;
        buf.write_u32::<LittleEndian>(self.compressed_size)?;
        buf.write_u32::<LittleEndian>(self.uncompressed_size)?;
        buf.write_u16::<LittleEndian>(field_len(self.name.len(), "entry name")?)?;
        buf.write_u16::<LittleEndian>(field_len(self.extra.len(), "extra field")?)?;
        Ok(())
    }
}

/// Append one extra field record: id, body length, body.
pub fn push_extra(extra: &mut Vec<u8>, id: u16, body: &[u8]) -> std::io::Result<()> {
    extra.write_u16::<LittleEndian>(id)?;
    extra.write_u16::<LittleEndian>(field_len(body.len(), "extra field")?)?;
    extra.extend_from_slice(body);
    Ok(())
}

fn field_len(len: usize, what: &str) -> std::io::Result<u16> {
    u16::try_from(len).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{what} too long: {len} bytes"),
        )
    })
}

/// Parsed ZIP file entry information
#[derive(Debug, Clone)]
pub struct ZipFileEntry {
    pub file_name: String,
    pub kind: EntryKind,
    pub compression_method: CompressionMethod,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub lfh_offset: u64,
    pub last_mod_time: u16,
    pub last_mod_date: u16,
    /// Seconds since the Unix epoch, from the extended timestamp field.
    pub unix_mtime: Option<i64>,
    /// Permission bits, when the archive was made on a Unix host.
    pub unix_mode: Option<u32>,
}

impl ZipFileEntry {
    /// Parse modification date to (year, month, day)
    pub fn mod_date(&self) -> (u16, u8, u8) {
        let day = (self.last_mod_date & 0x1F) as u8;
        let month = ((self.last_mod_date >> 5) & 0x0F) as u8;
        let year = ((self.last_mod_date >> 9) & 0x7F) + 1980;
        (year, month, day)
    }

    /// Parse modification time to (hour, minute, second)
    pub fn mod_time(&self) -> (u8, u8, u8) {
        let second = ((self.last_mod_time & 0x1F) * 2) as u8;
        let minute = ((self.last_mod_time >> 5) & 0x3F) as u8;
        let hour = ((self.last_mod_time >> 11) & 0x1F) as u8;
        (hour, minute, second)
    }

    /// Best known modification time: the extended timestamp if present,
    /// otherwise the DOS fields interpreted as UTC.
    pub fn modified(&self) -> Option<SystemTime> {
        if let Some(secs) = self.unix_mtime {
            return DateTime::<Utc>::from_timestamp(secs, 0).map(SystemTime::from);
        }
        let (year, month, day) = self.mod_date();
        let (hour, minute, second) = self.mod_time();
        NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32)
            .and_then(|d| d.and_hms_opt(hour as u32, minute as u32, second as u32))
            .map(|dt| SystemTime::from(dt.and_utc()))
    }
}

/// Encode a timestamp as MS-DOS (time, date), UTC, clamped to the
/// representable range 1980-01-01 .. 2107-12-31.
pub fn dos_datetime(time: SystemTime) -> (u16, u16) {
    let dt = DateTime::<Utc>::from(time);
    if dt.year() < 1980 {
        return (0, (1 << 5) | 1);
    }
    if dt.year() > 2107 {
        return ((23 << 11) | (59 << 5) | 29, (127 << 9) | (12 << 5) | 31);
    }
    let dos_time = ((dt.hour() as u16) << 11) | ((dt.minute() as u16) << 5) | (dt.second() as u16 / 2);
    let dos_date =
        (((dt.year() - 1980) as u16) << 9) | ((dt.month() as u16) << 5) | dt.day() as u16;
    (dos_time, dos_date)
}

/// Unix mtime in whole seconds, if it fits the signed 32-bit field of the
/// extended timestamp record.
pub fn unix_mtime(time: SystemTime) -> Option<i32> {
    i32::try_from(DateTime::<Utc>::from(time).timestamp()).ok()
}

pub fn saturate_u32(value: u64) -> u32 {
    u32::try_from(value)
        .ok()
        .filter(|v| *v < ZIP64_U32)
        .unwrap_or(ZIP64_U32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn dos_datetime_matches_parsed_fields() {
        // 2020-01-02 03:04:06 UTC
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(1_577_934_246);
        let (dos_time, dos_date) = dos_datetime(time);
        let entry = entry_with_dos(dos_time, dos_date);
        assert_eq!(entry.mod_date(), (2020, 1, 2));
        assert_eq!(entry.mod_time(), (3, 4, 6));
        assert_eq!(entry.modified(), Some(time));
    }

    #[test]
    fn dos_datetime_clamps_before_1980() {
        let (dos_time, dos_date) = dos_datetime(SystemTime::UNIX_EPOCH);
        let entry = entry_with_dos(dos_time, dos_date);
        assert_eq!(entry.mod_date(), (1980, 1, 1));
        assert_eq!(entry.mod_time(), (0, 0, 0));
    }

    #[test]
    fn extended_timestamp_wins_over_dos_fields() {
        let mut entry = entry_with_dos(0, (1 << 5) | 1);
        entry.unix_mtime = Some(1_000_000_001);
        assert_eq!(
            entry.modified(),
            Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000_001))
        );
    }

    #[test]
    fn eocd_saturates_overflowing_fields() {
        let eocd = EndOfCentralDirectory::for_directory(70_000, 10, 5_000_000_000);
        assert!(eocd.is_zip64());
        assert_eq!(eocd.total_entries, ZIP64_U16);
        assert_eq!(eocd.cd_size, 10);
        assert_eq!(eocd.cd_offset, ZIP64_U32);

        let small = EndOfCentralDirectory::for_directory(3, 10, 20);
        assert!(!small.is_zip64());
        let bytes = small.to_bytes().unwrap();
        assert_eq!(bytes.len(), EndOfCentralDirectory::SIZE);
        let parsed = EndOfCentralDirectory::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.total_entries, 3);
        assert_eq!(parsed.cd_offset, 20);
    }

    #[test]
    fn zip64_eocd_record_is_min_size() {
        let record = Zip64EOCD::for_directory(1, 2, 3).to_bytes().unwrap();
        assert_eq!(record.len(), Zip64EOCD::MIN_SIZE);
        let locator = Zip64EOCDLocator {
            disk_with_eocd64: 0,
            eocd64_offset: 99,
            total_disks: 1,
        }
        .to_bytes()
        .unwrap();
        assert_eq!(Zip64EOCDLocator::from_bytes(&locator).unwrap().eocd64_offset, 99);
    }

    #[test]
    fn local_and_central_headers_share_fields() {
        let header = FileHeader {
            version_needed: VERSION_NEEDED_DEFAULT,
            flags: 0,
            method: CompressionMethod::Deflate,
            dos_time: 1,
            dos_date: 2,
            crc32: 0xDEAD_BEEF,
            compressed_size: 3,
            uncompressed_size: 4,
            name: b"a.txt",
            extra: &[],
        };
        let local = header.local_bytes().unwrap();
        assert_eq!(local.len(), LFH_SIZE + 5);
        assert_eq!(&local[..4], LFH_SIGNATURE);
        assert_eq!(&local[14..18], &0xDEAD_BEEFu32.to_le_bytes());

        let central = header.central_bytes(0o644 << 16, 7).unwrap();
        assert_eq!(central.len(), CDFH_MIN_SIZE + 5);
        assert_eq!(&central[..4], CDFH_SIGNATURE);
        assert_eq!(&central[16..20], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&central[42..46], &7u32.to_le_bytes());
    }

    #[test]
    fn oversized_extra_body_is_refused() {
        let mut extra = Vec::new();
        assert!(push_extra(&mut extra, EXTRA_ZIP64, &vec![0; 70_000]).is_err());
        push_extra(&mut extra, EXTRA_EXTENDED_TIMESTAMP, &[1, 2]).unwrap();
        assert_eq!(extra, [0x55, 0x54, 2, 0, 1, 2]);
    }

    fn entry_with_dos(last_mod_time: u16, last_mod_date: u16) -> ZipFileEntry {
        ZipFileEntry {
            file_name: "a".into(),
            kind: EntryKind::File,
            compression_method: CompressionMethod::Stored,
            compressed_size: 0,
            uncompressed_size: 0,
            crc32: 0,
            lfh_offset: 0,
            last_mod_time,
            last_mod_date,
            unix_mtime: None,
            unix_mode: None,
        }
    }
}
