//! TSM segment file format.
//!
//! A TSM file is an immutable segment holding the values of a sorted set of
//! composite keys. The schema scan only needs the key index and the
//! timestamps, but values are kept so the file is a complete segment.
//!
//! ## File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  File Header (32 bytes)                                      │
//! │  - Magic: "ATSM" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - Reserved: 2 bytes                                         │
//! │  - Min Timestamp: i64 (8 bytes)                              │
//! │  - Max Timestamp: i64 (8 bytes)                              │
//! │  - Key Count: u32 (4 bytes)                                  │
//! │  - Reserved: 4 bytes                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Data Blocks (one per key, in key order)                     │
//! │  - count, min/max ts, timestamps, values, block CRC          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Key Index (sorted by key)                                   │
//! │  - key, block offset/size, count, min/max ts                 │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Footer (32 bytes)                                           │
//! │  - Index offset/size, point count, CRC, reverse magic        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. The footer CRC covers the data blocks, the
//! index and the final header, which is rewritten after the rest is known.

use crate::error::{Result, TsmError};
use crate::stats::ScanStats;
use crate::tsm::segment::{Segment, SegmentCursor};
use crate::tsm::{TimeRange, Timestamp};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for TSM file header: "ATSM"
pub const TSM_MAGIC: [u8; 4] = *b"ATSM";

/// Reverse magic bytes for TSM file footer: "MSTA"
pub const TSM_MAGIC_REVERSE: [u8; 4] = *b"MSTA";

/// Current TSM file format version.
pub const TSM_VERSION: u16 = 1;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 32;

/// Footer size in bytes.
pub const FOOTER_SIZE: usize = 32;

/// Longest key storable in the index.
pub const MAX_KEY_SIZE: usize = u16::MAX as usize;

/// Fixed part of a data block: count, min ts, max ts and CRC.
const BLOCK_OVERHEAD: usize = 4 + 8 + 8 + 4;

/// TSM file header (32 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsmHeader {
    /// Magic bytes: "ATSM"
    pub magic: [u8; 4],
    /// File format version.
    pub version: u16,
    /// Minimum timestamp in the file.
    pub min_timestamp: i64,
    /// Maximum timestamp in the file.
    pub max_timestamp: i64,
    /// Number of keys in the file.
    pub key_count: u32,
}

impl Default for TsmHeader {
    fn default() -> Self {
        Self {
            magic: TSM_MAGIC,
            version: TSM_VERSION,
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
            key_count: 0,
        }
    }
}

impl TsmHeader {
    /// Writes the header.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.magic)?;
        writer.write_all(&self.version.to_le_bytes())?;
        writer.write_all(&[0u8; 2])?;
        writer.write_all(&self.min_timestamp.to_le_bytes())?;
        writer.write_all(&self.max_timestamp.to_le_bytes())?;
        writer.write_all(&self.key_count.to_le_bytes())?;
        writer.write_all(&[0u8; 4])?;
        Ok(())
    }

    /// Reads and validates a header.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::InvalidMagic` if the magic bytes don't match.
    /// Returns `TsmError::UnsupportedVersion` if the version is newer than
    /// this reader.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut buf)?;

        let magic = array4(&buf[0..4]);
        if magic != TSM_MAGIC {
            return Err(TsmError::InvalidMagic(magic));
        }
        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version == 0 || version > TSM_VERSION {
            return Err(TsmError::UnsupportedVersion(version));
        }

        Ok(Self {
            magic,
            version,
            min_timestamp: i64::from_le_bytes(array8(&buf[8..16])),
            max_timestamp: i64::from_le_bytes(array8(&buf[16..24])),
            key_count: u32::from_le_bytes(array4(&buf[24..28])),
        })
    }
}

/// TSM file footer (32 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsmFooter {
    /// Offset of the key index from file start.
    pub index_offset: u64,
    /// Size of the key index in bytes.
    pub index_size: u64,
    /// Total number of values in the file.
    pub total_point_count: u64,
    /// CRC32 of the data blocks, the key index and the final header.
    pub file_crc32: u32,
    /// Reverse magic bytes: "MSTA"
    pub magic_reverse: [u8; 4],
}

impl TsmFooter {
    /// Writes the footer.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.index_offset.to_le_bytes())?;
        writer.write_all(&self.index_size.to_le_bytes())?;
        writer.write_all(&self.total_point_count.to_le_bytes())?;
        writer.write_all(&self.file_crc32.to_le_bytes())?;
        writer.write_all(&self.magic_reverse)?;
        Ok(())
    }

    /// Reads and validates a footer.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; FOOTER_SIZE];
        reader.read_exact(&mut buf)?;

        let magic_reverse = array4(&buf[28..32]);
        if magic_reverse != TSM_MAGIC_REVERSE {
            return Err(TsmError::InvalidMagic(magic_reverse));
        }

        Ok(Self {
            index_offset: u64::from_le_bytes(array8(&buf[0..8])),
            index_size: u64::from_le_bytes(array8(&buf[8..16])),
            total_point_count: u64::from_le_bytes(array8(&buf[16..24])),
            file_crc32: u32::from_le_bytes(array4(&buf[24..28])),
            magic_reverse,
        })
    }
}

/// Index entry locating the data block of one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    /// Composite key.
    pub key: Vec<u8>,
    /// Offset of the data block from file start.
    pub block_offset: u64,
    /// Size of the data block in bytes.
    pub block_size: u32,
    /// Number of values in the block.
    pub point_count: u32,
    /// Minimum timestamp in the block.
    pub min_ts: Timestamp,
    /// Maximum timestamp in the block.
    pub max_ts: Timestamp,
}

impl IndexEntry {
    /// Writes the entry.
    ///
    /// Format: key_len u16, key, block_offset u64, block_size u32,
    /// point_count u32, min_ts i64, max_ts i64.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&(self.key.len() as u16).to_le_bytes())?;
        writer.write_all(&self.key)?;
        writer.write_all(&self.block_offset.to_le_bytes())?;
        writer.write_all(&self.block_size.to_le_bytes())?;
        writer.write_all(&self.point_count.to_le_bytes())?;
        writer.write_all(&self.min_ts.to_le_bytes())?;
        writer.write_all(&self.max_ts.to_le_bytes())?;
        Ok(())
    }

    /// Reads an entry.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf2 = [0u8; 2];
        let mut buf4 = [0u8; 4];
        let mut buf8 = [0u8; 8];

        reader.read_exact(&mut buf2)?;
        let mut key = vec![0u8; u16::from_le_bytes(buf2) as usize];
        reader.read_exact(&mut key)?;

        reader.read_exact(&mut buf8)?;
        let block_offset = u64::from_le_bytes(buf8);
        reader.read_exact(&mut buf4)?;
        let block_size = u32::from_le_bytes(buf4);
        reader.read_exact(&mut buf4)?;
        let point_count = u32::from_le_bytes(buf4);
        reader.read_exact(&mut buf8)?;
        let min_ts = i64::from_le_bytes(buf8);
        reader.read_exact(&mut buf8)?;
        let max_ts = i64::from_le_bytes(buf8);

        Ok(Self {
            key,
            block_offset,
            block_size,
            point_count,
            min_ts,
            max_ts,
        })
    }
}

/// Data block holding the values of one key.
#[derive(Debug, Clone, PartialEq)]
pub struct DataBlock {
    /// Timestamps in ascending order.
    pub timestamps: Vec<Timestamp>,
    /// Values, parallel to `timestamps`.
    pub values: Vec<f64>,
}

impl DataBlock {
    /// Encodes the block, appending its CRC.
    fn encode(points: &BTreeMap<Timestamp, f64>) -> Vec<u8> {
        let count = points.len();
        let mut buf = Vec::with_capacity(BLOCK_OVERHEAD + count * 16);
        let min_ts = points.keys().next().copied().unwrap_or(i64::MAX);
        let max_ts = points.keys().next_back().copied().unwrap_or(i64::MIN);

        buf.extend_from_slice(&(count as u32).to_le_bytes());
        buf.extend_from_slice(&min_ts.to_le_bytes());
        buf.extend_from_slice(&max_ts.to_le_bytes());
        for ts in points.keys() {
            buf.extend_from_slice(&ts.to_le_bytes());
        }
        for value in points.values() {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes and verifies an encoded block.
    fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BLOCK_OVERHEAD {
            return Err(TsmError::CorruptIndex(format!(
                "block of {} bytes is shorter than its header",
                buf.len()
            )));
        }
        let (body, crc_bytes) = buf.split_at(buf.len() - 4);
        let expected = u32::from_le_bytes(array4(crc_bytes));
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(TsmError::ChecksumMismatch { expected, actual });
        }

        let count = u32::from_le_bytes(array4(&body[0..4])) as usize;
        if body.len() != BLOCK_OVERHEAD - 4 + count * 16 {
            return Err(TsmError::CorruptIndex(format!(
                "block size {} does not match {} values",
                buf.len(),
                count
            )));
        }

        let ts_start = 20;
        let val_start = ts_start + count * 8;
        let timestamps = body[ts_start..val_start]
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes(array8(c)))
            .collect();
        let values = body[val_start..]
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes(array8(c)))
            .collect();

        Ok(Self { timestamps, values })
    }
}

/// Handle to a finished TSM file.
#[derive(Debug, Clone)]
pub struct TsmFileHandle {
    /// Path to the TSM file.
    pub path: PathBuf,
    /// The header of the file.
    pub header: TsmHeader,
    /// The footer of the file.
    pub footer: TsmFooter,
}

/// TSM file writer.
///
/// Keys must be written in strictly ascending byte order, once each.
pub struct TsmWriter {
    writer: BufWriter<File>,
    path: PathBuf,
    position: u64,
    hasher: crc32fast::Hasher,
    entries: Vec<IndexEntry>,
    min_timestamp: i64,
    max_timestamp: i64,
    total_point_count: u64,
}

impl TsmWriter {
    /// Creates a new TSM file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn new(path: &Path) -> Result<Self> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        TsmHeader::default().write_to(&mut writer)?;

        Ok(Self {
            writer,
            path: path.to_path_buf(),
            position: HEADER_SIZE as u64,
            hasher: crc32fast::Hasher::new(),
            entries: Vec::new(),
            min_timestamp: i64::MAX,
            max_timestamp: i64::MIN,
            total_point_count: 0,
        })
    }

    /// Writes the values of one key.
    ///
    /// Empty point sets are ignored.
    ///
    /// # Errors
    ///
    /// Returns `TsmError::KeyOutOfOrder` if `key` does not sort after the
    /// previous key, `TsmError::KeyTooLong` if it exceeds [`MAX_KEY_SIZE`].
    pub fn write(&mut self, key: &[u8], points: &BTreeMap<Timestamp, f64>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        if key.len() > MAX_KEY_SIZE {
            return Err(TsmError::KeyTooLong(key.len()));
        }
        if let Some(last) = self.entries.last() {
            if key <= last.key.as_slice() {
                return Err(TsmError::KeyOutOfOrder {
                    previous: last.key.clone(),
                    key: key.to_vec(),
                });
            }
        }

        let min_ts = *points.keys().next().unwrap_or(&i64::MAX);
        let max_ts = *points.keys().next_back().unwrap_or(&i64::MIN);
        let block = DataBlock::encode(points);

        self.writer.write_all(&block)?;
        self.hasher.update(&block);
        self.entries.push(IndexEntry {
            key: key.to_vec(),
            block_offset: self.position,
            block_size: block.len() as u32,
            point_count: points.len() as u32,
            min_ts,
            max_ts,
        });

        self.position += block.len() as u64;
        self.min_timestamp = self.min_timestamp.min(min_ts);
        self.max_timestamp = self.max_timestamp.max(max_ts);
        self.total_point_count += points.len() as u64;
        Ok(())
    }

    /// Writes the index, footer and final header, then syncs the file.
    pub fn finish(mut self) -> Result<TsmFileHandle> {
        let index_offset = self.position;
        let mut index_buf = Vec::new();
        for entry in &self.entries {
            entry.write_to(&mut index_buf)?;
        }
        self.writer.write_all(&index_buf)?;
        self.hasher.update(&index_buf);

        let header = TsmHeader {
            min_timestamp: self.min_timestamp,
            max_timestamp: self.max_timestamp,
            key_count: self.entries.len() as u32,
            ..TsmHeader::default()
        };
        let mut header_buf = Vec::with_capacity(HEADER_SIZE);
        header.write_to(&mut header_buf)?;
        self.hasher.update(&header_buf);

        let footer = TsmFooter {
            index_offset,
            index_size: index_buf.len() as u64,
            total_point_count: self.total_point_count,
            file_crc32: self.hasher.clone().finalize(),
            magic_reverse: TSM_MAGIC_REVERSE,
        };
        footer.write_to(&mut self.writer)?;

        self.writer.seek(SeekFrom::Start(0))?;
        self.writer.write_all(&header_buf)?;
        self.writer.flush()?;

        let file = self
            .writer
            .into_inner()
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        file.sync_all()?;

        Ok(TsmFileHandle {
            path: self.path,
            header,
            footer,
        })
    }
}

/// TSM file reader.
///
/// Holds the file open for its whole lifetime, so the data stays readable
/// even if the path is unlinked by compaction while a scan still references
/// this reader.
pub struct TsmReader {
    path: PathBuf,
    header: TsmHeader,
    footer: TsmFooter,
    index: Vec<IndexEntry>,
    file: Mutex<File>,
}

impl TsmReader {
    /// Opens a TSM file, verifying its checksum and loading the key index.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, the magic bytes or
    /// version are invalid, the CRC does not match, or the index is corrupt.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        if file_size < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(TsmError::CorruptIndex(format!(
                "{} is only {} bytes",
                path.display(),
                file_size
            )));
        }

        let mut reader = BufReader::new(file);
        let mut header_buf = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_buf)?;
        let header = TsmHeader::read_from(&mut header_buf.as_slice())?;
        reader.seek(SeekFrom::End(-(FOOTER_SIZE as i64)))?;
        let footer = TsmFooter::read_from(&mut reader)?;

        let body_end = file_size - FOOTER_SIZE as u64;
        if footer.index_offset < HEADER_SIZE as u64
            || footer.index_offset.checked_add(footer.index_size) != Some(body_end)
        {
            return Err(TsmError::CorruptIndex(format!(
                "index at {}+{} does not end at {}",
                footer.index_offset, footer.index_size, body_end
            )));
        }

        // CRC over data blocks, index and header; the index bytes are kept for decoding.
        reader.seek(SeekFrom::Start(HEADER_SIZE as u64))?;
        let mut hasher = crc32fast::Hasher::new();
        let mut buffer = [0u8; 8192];
        let mut remaining = footer.index_offset - HEADER_SIZE as u64;
        while remaining > 0 {
            let to_read = remaining.min(buffer.len() as u64) as usize;
            reader.read_exact(&mut buffer[..to_read])?;
            hasher.update(&buffer[..to_read]);
            remaining -= to_read as u64;
        }
        let mut index_buf = vec![0u8; footer.index_size as usize];
        reader.read_exact(&mut index_buf)?;
        hasher.update(&index_buf);
        hasher.update(&header_buf);

        let actual = hasher.finalize();
        if actual != footer.file_crc32 {
            return Err(TsmError::ChecksumMismatch {
                expected: footer.file_crc32,
                actual,
            });
        }

        let mut cursor = Cursor::new(index_buf.as_slice());
        let mut index = Vec::new();
        while (cursor.position() as usize) < index_buf.len() {
            let entry = IndexEntry::read_from(&mut cursor).map_err(|_| {
                TsmError::CorruptIndex(format!(
                    "truncated index entry at byte {} of {}",
                    cursor.position(),
                    path.display()
                ))
            })?;
            index.push(entry);
        }
        validate_index(&header, &footer, &index)
            .map_err(|msg| TsmError::CorruptIndex(format!("{}: {}", path.display(), msg)))?;

        Ok(Self {
            path: path.to_path_buf(),
            header,
            footer,
            index,
            file: Mutex::new(reader.into_inner()),
        })
    }

    /// Returns the path this reader was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the file header.
    pub fn header(&self) -> &TsmHeader {
        &self.header
    }

    /// Returns the file footer.
    pub fn footer(&self) -> &TsmFooter {
        &self.footer
    }

    /// Returns the sorted key index.
    pub fn index(&self) -> &[IndexEntry] {
        &self.index
    }

    /// Number of keys in the file.
    pub fn key_count(&self) -> usize {
        self.index.len()
    }

    /// Returns the smallest and largest key, if the file has any.
    pub fn key_range(&self) -> Option<(&[u8], &[u8])> {
        let first = self.index.first()?;
        let last = self.index.last()?;
        Some((&first.key, &last.key))
    }

    /// Reads the values of `key`, or `None` if the file does not hold it.
    pub fn read_key(&self, key: &[u8]) -> Result<Option<Vec<(Timestamp, f64)>>> {
        let entry = match self.index.binary_search_by(|e| e.key.as_slice().cmp(key)) {
            Ok(pos) => &self.index[pos],
            Err(_) => return Ok(None),
        };
        let block = self.read_block(entry)?;
        Ok(Some(block.timestamps.into_iter().zip(block.values).collect()))
    }

    /// Position of the first index entry whose key is `>= prefix`.
    fn seek(&self, prefix: &[u8]) -> usize {
        self.index.partition_point(|e| e.key.as_slice() < prefix)
    }

    fn read_block(&self, entry: &IndexEntry) -> Result<DataBlock> {
        let mut buf = vec![0u8; entry.block_size as usize];
        {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(entry.block_offset))?;
            file.read_exact(&mut buf)?;
        }
        DataBlock::decode(&buf)
    }
}

impl Segment for TsmReader {
    fn overlaps_time_range(&self, start: i64, end: i64) -> bool {
        TimeRange::new(start, end).overlaps(self.header.min_timestamp, self.header.max_timestamp)
    }

    fn overlaps_key_prefix_range(&self, min: &[u8], max: &[u8]) -> bool {
        let Some((first, last)) = self.key_range() else {
            return false;
        };
        let first = &first[..first.len().min(min.len())];
        let last = &last[..last.len().min(max.len())];
        first <= max && last >= min
    }

    fn time_range_cursor<'a>(
        &'a self,
        prefix: &[u8],
        start: i64,
        end: i64,
    ) -> Box<dyn SegmentCursor + 'a> {
        Box::new(TimeRangeCursor {
            reader: self,
            range: TimeRange::new(start, end),
            next: self.seek(prefix),
            current: None,
            stats: ScanStats::default(),
            err: None,
        })
    }

    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Cursor over the keys of a [`TsmReader`] answering time-window presence.
///
/// Presence is decided from the index when a block lies entirely inside or
/// outside the window. Only blocks straddling a bound are decoded, and only
/// those are charged to the stats.
pub struct TimeRangeCursor<'a> {
    reader: &'a TsmReader,
    range: TimeRange,
    next: usize,
    current: Option<&'a IndexEntry>,
    stats: ScanStats,
    err: Option<TsmError>,
}

impl SegmentCursor for TimeRangeCursor<'_> {
    fn advance(&mut self) -> bool {
        if self.err.is_some() {
            self.current = None;
            return false;
        }
        self.current = self.reader.index.get(self.next);
        if self.current.is_some() {
            self.next += 1;
        }
        self.current.is_some()
    }

    fn key(&self) -> &[u8] {
        self.current.map(|e| e.key.as_slice()).unwrap_or_default()
    }

    fn has_data(&mut self) -> bool {
        let Some(entry) = self.current else {
            return false;
        };
        if !self.range.overlaps(entry.min_ts, entry.max_ts) {
            return false;
        }
        if self.range.covers(entry.min_ts, entry.max_ts) {
            return true;
        }

        match self.reader.read_block(entry) {
            Ok(block) => {
                self.stats += ScanStats::for_timestamps(block.timestamps.len() as u64);
                block.timestamps.iter().any(|&ts| self.range.contains(ts))
            }
            Err(e) => {
                self.err = Some(e);
                false
            }
        }
    }

    fn stats(&self) -> ScanStats {
        self.stats
    }

    fn error(&self) -> Option<&TsmError> {
        self.err.as_ref()
    }
}

/// Cross-checks the decoded index against the header and footer.
fn validate_index(
    header: &TsmHeader,
    footer: &TsmFooter,
    index: &[IndexEntry],
) -> std::result::Result<(), String> {
    if index.len() != header.key_count as usize {
        return Err(format!(
            "header counts {} keys, index holds {}",
            header.key_count,
            index.len()
        ));
    }
    if index.windows(2).any(|w| w[0].key >= w[1].key) {
        return Err("keys are not sorted".to_string());
    }

    let mut min_ts = i64::MAX;
    let mut max_ts = i64::MIN;
    let mut points = 0u64;
    for entry in index {
        let block_end = entry.block_offset.checked_add(u64::from(entry.block_size));
        if entry.block_offset < HEADER_SIZE as u64
            || block_end.map_or(true, |end| end > footer.index_offset)
        {
            return Err(format!(
                "block at {}+{} lies outside the data section",
                entry.block_offset, entry.block_size
            ));
        }
        if entry.point_count == 0 || entry.min_ts > entry.max_ts {
            return Err(format!(
                "block at {} has {} values in [{}, {}]",
                entry.block_offset, entry.point_count, entry.min_ts, entry.max_ts
            ));
        }
        min_ts = min_ts.min(entry.min_ts);
        max_ts = max_ts.max(entry.max_ts);
        points += u64::from(entry.point_count);
    }

    if points != footer.total_point_count {
        return Err(format!(
            "footer counts {} values, index holds {}",
            footer.total_point_count, points
        ));
    }
    if !index.is_empty() && (header.min_timestamp != min_ts || header.max_timestamp != max_ts) {
        return Err(format!(
            "header range [{}, {}] does not match index range [{}, {}]",
            header.min_timestamp, header.max_timestamp, min_ts, max_ts
        ));
    }
    Ok(())
}

fn array4(bytes: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&bytes[..4]);
    out
}

fn array8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[..8]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn points(ts: &[i64]) -> BTreeMap<Timestamp, f64> {
        ts.iter().map(|&t| (t, t as f64 * 0.5)).collect()
    }

    fn write_file(dir: &TempDir, name: &str, keys: &[(&str, Vec<i64>)]) -> PathBuf {
        let path = dir.path().join(name);
        let mut writer = TsmWriter::new(&path).unwrap();
        for (key, ts) in keys {
            writer.write(key.as_bytes(), &points(ts)).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn test_header_roundtrip() {
        let header = TsmHeader {
            min_timestamp: -5,
            max_timestamp: 99,
            key_count: 7,
            ..TsmHeader::default()
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);

        let read = TsmHeader::read_from(&mut Cursor::new(buf)).unwrap();
        assert_eq!(read, header);
    }

    #[test]
    fn test_header_invalid_magic() {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(b"XXXX");
        let result = TsmHeader::read_from(&mut Cursor::new(buf));
        assert!(matches!(result, Err(TsmError::InvalidMagic(_))));
    }

    #[test]
    fn test_footer_size() {
        let footer = TsmFooter {
            index_offset: 1,
            index_size: 2,
            total_point_count: 3,
            file_crc32: 4,
            magic_reverse: TSM_MAGIC_REVERSE,
        };
        let mut buf = Vec::new();
        footer.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), FOOTER_SIZE);
        assert_eq!(TsmFooter::read_from(&mut Cursor::new(buf)).unwrap(), footer);
    }

    #[test]
    fn test_write_read_key() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "a.tsm", &[("a", vec![1, 2, 3]), ("b", vec![10])]);

        let reader = TsmReader::open(&path).unwrap();
        assert_eq!(reader.key_count(), 2);
        assert_eq!(reader.header().min_timestamp, 1);
        assert_eq!(reader.header().max_timestamp, 10);
        assert_eq!(reader.footer().total_point_count, 4);
        assert_eq!(
            reader.read_key(b"a").unwrap().unwrap(),
            vec![(1, 0.5), (2, 1.0), (3, 1.5)]
        );
        assert!(reader.read_key(b"zz").unwrap().is_none());
    }

    #[test]
    fn test_writer_rejects_unsorted_keys() {
        let dir = TempDir::new().unwrap();
        let mut writer = TsmWriter::new(&dir.path().join("bad.tsm")).unwrap();
        writer.write(b"b", &points(&[1])).unwrap();
        let err = writer.write(b"a", &points(&[1])).unwrap_err();
        assert!(matches!(err, TsmError::KeyOutOfOrder { .. }));
        let err = writer.write(b"b", &points(&[1])).unwrap_err();
        assert!(matches!(err, TsmError::KeyOutOfOrder { .. }));
    }

    #[test]
    fn test_corruption_detected_on_open() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "c.tsm", &[("a", vec![1, 2, 3])]);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 24] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        let result = TsmReader::open(&path);
        assert!(matches!(result, Err(TsmError::ChecksumMismatch { .. })));
    }

    /// Recomputes the footer CRC so only the structural checks can fail.
    fn reseal(bytes: &mut [u8]) {
        let len = bytes.len();
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[HEADER_SIZE..len - FOOTER_SIZE]);
        hasher.update(&bytes[..HEADER_SIZE]);
        let crc = hasher.finalize();
        bytes[len - FOOTER_SIZE + 24..len - FOOTER_SIZE + 28].copy_from_slice(&crc.to_le_bytes());
    }

    #[test]
    fn test_header_must_match_index() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "h.tsm", &[("cpu", vec![1, 5]), ("mem", vec![5])]);
        let original = std::fs::read(&path).unwrap();
        assert!(TsmReader::open(&path).is_ok());

        let tamperings: [(usize, &[u8]); 3] = [
            (24, &u32::MAX.to_le_bytes()),
            (24, &1u32.to_le_bytes()),
            (16, &0i64.to_le_bytes()),
        ];
        for (offset, patch) in tamperings {
            let mut bytes = original.clone();
            bytes[offset..offset + patch.len()].copy_from_slice(patch);
            reseal(&mut bytes);
            std::fs::write(&path, &bytes).unwrap();

            let result = TsmReader::open(&path);
            assert!(
                matches!(result, Err(TsmError::CorruptIndex(_))),
                "patch at {} was accepted",
                offset
            );
        }
    }

    #[test]
    fn test_truncated_index_entry_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "i.tsm", &[("cpu", vec![1])]);
        let mut bytes = std::fs::read(&path).unwrap();

        // Grow the key length so the only entry runs past the index.
        let index_offset = HEADER_SIZE + BLOCK_OVERHEAD + 16;
        bytes[index_offset..index_offset + 2].copy_from_slice(&200u16.to_le_bytes());
        reseal(&mut bytes);
        std::fs::write(&path, &bytes).unwrap();

        let result = TsmReader::open(&path);
        assert!(matches!(result, Err(TsmError::CorruptIndex(_))));
    }

    #[test]
    fn test_time_overlap() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "t.tsm", &[("a", vec![0, 10])]);
        let reader = TsmReader::open(&path).unwrap();

        assert!(reader.overlaps_time_range(0, 20));
        assert!(reader.overlaps_time_range(-5, 0));
        assert!(!reader.overlaps_time_range(10, 20));
        assert!(!reader.overlaps_time_range(20, 30));
    }

    #[test]
    fn test_key_prefix_overlap_truncates_keys() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "k.tsm", &[("bbb1", vec![1]), ("ddd9", vec![1])]);
        let reader = TsmReader::open(&path).unwrap();

        assert!(reader.overlaps_key_prefix_range(b"bbb", b"bbb"));
        assert!(reader.overlaps_key_prefix_range(b"ccc", b"ccc"));
        assert!(reader.overlaps_key_prefix_range(b"ddd", b"ddd"));
        assert!(!reader.overlaps_key_prefix_range(b"aaa", b"aaa"));
        assert!(!reader.overlaps_key_prefix_range(b"eee", b"eee"));
    }

    #[test]
    fn test_cursor_has_data_and_stats() {
        let dir = TempDir::new().unwrap();
        let path = write_file(
            &dir,
            "cur.tsm",
            &[
                ("p1", vec![5, 6]),     // covered: no decode
                ("p2", vec![0, 30]),    // straddles, no point inside
                ("p3", vec![0, 15, 30]), // straddles, one point inside
                ("p4", vec![40]),       // outside
                ("q1", vec![5]),
            ],
        );
        let reader = TsmReader::open(&path).unwrap();
        let mut cursor = reader.time_range_cursor(b"p", 0, 20);

        let mut seen = Vec::new();
        while cursor.advance() {
            if !cursor.key().starts_with(b"p") {
                break;
            }
            seen.push((cursor.key().to_vec(), cursor.has_data()));
        }

        assert_eq!(
            seen,
            vec![
                (b"p1".to_vec(), true),
                (b"p2".to_vec(), false),
                (b"p3".to_vec(), true),
                (b"p4".to_vec(), false),
            ]
        );
        assert_eq!(cursor.stats(), ScanStats::new(5, 40));
        assert!(cursor.error().is_none());
    }

    #[test]
    fn test_cursor_starts_at_prefix() {
        let dir = TempDir::new().unwrap();
        let path = write_file(&dir, "s.tsm", &[("a", vec![1]), ("b", vec![1]), ("c", vec![1])]);
        let reader = TsmReader::open(&path).unwrap();

        let mut cursor = reader.time_range_cursor(b"b", 0, 10);
        assert!(cursor.advance());
        assert_eq!(cursor.key(), b"b");
        assert!(cursor.advance());
        assert_eq!(cursor.key(), b"c");
        assert!(!cursor.advance());
    }
}
