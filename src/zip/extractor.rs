use std::sync::Arc;

use crate::io::ReadAt;
use anyhow::{Result, bail};

use super::codec;
use super::parser::ZipParser;
use super::structures::ZipFileEntry;

/// ZIP entry extractor with integrity checks.
pub struct ZipExtractor<R: ReadAt> {
    parser: ZipParser<R>,
}

impl<R: ReadAt> ZipExtractor<R> {
    pub fn new(reader: Arc<R>) -> Self {
        Self {
            parser: ZipParser::new(reader),
        }
    }

    /// List all files in the archive
    pub async fn list_files(&self) -> Result<Vec<ZipFileEntry>> {
        self.parser.list_files().await
    }

    /// Extract entry data to memory.
    ///
    /// The decompressed length must equal the declared size and the CRC-32
    /// must match; either mismatch is an error.
    pub async fn extract_to_memory(&self, entry: &ZipFileEntry) -> Result<Vec<u8>> {
        let data_offset = self.parser.get_data_offset(entry).await?;

        let mut compressed = vec![0u8; entry.compressed_size as usize];
        self.parser
            .reader()
            .read_exact_at(data_offset, &mut compressed)
            .await?;

        let data = codec::decompress(
            entry.compression_method,
            &compressed,
            entry.uncompressed_size,
        )?;

        if data.len() as u64 != entry.uncompressed_size {
            bail!(
                "Size mismatch for '{}': declared {} bytes, found {}",
                entry.file_name,
                entry.uncompressed_size,
                data.len()
            );
        }
        let crc = crc32fast::hash(&data);
        if crc != entry.crc32 {
            bail!(
                "CRC-32 mismatch for '{}': declared {:08x}, computed {:08x}",
                entry.file_name,
                entry.crc32,
                crc
            );
        }

        Ok(data)
    }
}
