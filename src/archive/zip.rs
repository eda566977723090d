// Streaming ZIP container. Entries are deflate-compressed straight into the
// output sink using the data-descriptor layout (general purpose bit 3), so
// nothing is ever seeked or rewritten and bytes reach the client while the
// tree is still being read. The central directory and the archive comment go
// out at the end. Sizes and offsets past 4 GiB switch to ZIP64 records.

use std::io::{self, Read, Write};
use std::time::SystemTime;

use chrono::{Datelike, Timelike};
use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const EOCD_SIG: u32 = 0x0605_4b50;
const ZIP64_EOCD_SIG: u32 = 0x0606_4b50;
const ZIP64_LOCATOR_SIG: u32 = 0x0706_4b50;

const VERSION_DEFLATE: u16 = 20;
const VERSION_ZIP64: u16 = 45;
const MADE_BY_UNIX: u16 = 3 << 8;

// Bit 3: sizes in the data descriptor. Bit 11: UTF-8 names.
const FLAGS_STREAMED: u16 = 0x0008 | 0x0800;
const FLAGS_STORED: u16 = 0x0800;

const METHOD_STORE: u16 = 0;
const METHOD_DEFLATE: u16 = 8;

const U32_MAX: u64 = u32::MAX as u64;
const COPY_BUF_BYTES: usize = 64 * 1024;

struct CentralRecord {
    name: String,
    crc: u32,
    compressed: u64,
    uncompressed: u64,
    offset: u64,
    dos_time: u16,
    dos_date: u16,
    mode: u32,
    directory: bool,
}

impl CentralRecord {
    fn needs_zip64(&self) -> bool {
        self.compressed >= U32_MAX || self.uncompressed >= U32_MAX || self.offset >= U32_MAX
    }
}

struct CountWriter<W: Write> {
    inner: W,
    offset: u64,
}

impl<W: Write> Write for CountWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.offset += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Write-only ZIP producer over any byte sink.
pub struct ZipStreamWriter<W: Write> {
    out: CountWriter<W>,
    comment: String,
    entries: Vec<CentralRecord>,
}

impl<W: Write> ZipStreamWriter<W> {
    pub fn new(out: W, comment: String) -> Self {
        Self {
            out: CountWriter { inner: out, offset: 0 },
            comment,
            entries: Vec::new(),
        }
    }

    /// Adds a directory entry (name gains a trailing slash).
    pub fn add_directory(&mut self, name: &str, mode: u32, mtime: SystemTime) -> io::Result<()> {
        let name = format!("{}/", name.trim_end_matches('/'));
        let (dos_time, dos_date) = dos_datetime(mtime);
        let offset = self.out.offset;

        let mut header = Vec::with_capacity(30 + name.len());
        put_u32(&mut header, LOCAL_HEADER_SIG);
        put_u16(&mut header, VERSION_DEFLATE);
        put_u16(&mut header, FLAGS_STORED);
        put_u16(&mut header, METHOD_STORE);
        put_u16(&mut header, dos_time);
        put_u16(&mut header, dos_date);
        put_u32(&mut header, 0); // crc
        put_u32(&mut header, 0); // compressed size
        put_u32(&mut header, 0); // uncompressed size
        put_u16(&mut header, name.len() as u16);
        put_u16(&mut header, 0); // extra length
        header.extend_from_slice(name.as_bytes());
        self.out.write_all(&header)?;

        self.entries.push(CentralRecord {
            name,
            crc: 0,
            compressed: 0,
            uncompressed: 0,
            offset,
            dos_time,
            dos_date,
            mode,
            directory: true,
        });
        Ok(())
    }

    /// Compresses `reader` into one entry, returning the uncompressed size.
    /// `size_hint` is the expected uncompressed size; entries that may cross
    /// 4 GiB get a ZIP64 extra in the local header so streaming readers know
    /// to expect the wide data descriptor.
    pub fn add_file<R: Read>(
        &mut self,
        name: &str,
        mode: u32,
        mtime: SystemTime,
        size_hint: u64,
        reader: &mut R,
    ) -> io::Result<u64> {
        let (dos_time, dos_date) = dos_datetime(mtime);
        let offset = self.out.offset;
        let zip64 = may_need_zip64(size_hint);

        let mut extra = Vec::new();
        if zip64 {
            // Sizes are unknown until the descriptor; the zeroed fields only
            // announce the 8-byte descriptor layout.
            put_u16(&mut extra, 0x0001);
            put_u16(&mut extra, 16);
            put_u64(&mut extra, 0); // uncompressed size
            put_u64(&mut extra, 0); // compressed size
        }

        let mut header = Vec::with_capacity(30 + name.len() + extra.len());
        put_u32(&mut header, LOCAL_HEADER_SIG);
        put_u16(&mut header, if zip64 { VERSION_ZIP64 } else { VERSION_DEFLATE });
        put_u16(&mut header, FLAGS_STREAMED);
        put_u16(&mut header, METHOD_DEFLATE);
        put_u16(&mut header, dos_time);
        put_u16(&mut header, dos_date);
        put_u32(&mut header, 0); // crc in the descriptor
        put_u32(&mut header, 0); // compressed size in the descriptor
        put_u32(&mut header, 0); // uncompressed size in the descriptor
        put_u16(&mut header, name.len() as u16);
        put_u16(&mut header, extra.len() as u16);
        header.extend_from_slice(name.as_bytes());
        header.extend_from_slice(&extra);
        self.out.write_all(&header)?;

        let data_start = self.out.offset;
        let mut crc = Crc::new();
        let mut uncompressed = 0u64;
        {
            let mut encoder = DeflateEncoder::new(&mut self.out, Compression::default());
            let mut buf = vec![0u8; COPY_BUF_BYTES];
            loop {
                let n = reader.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                crc.update(&buf[..n]);
                uncompressed += n as u64;
                encoder.write_all(&buf[..n])?;
            }
            encoder.finish()?;
        }
        let compressed = self.out.offset - data_start;
        let crc = crc.sum();

        // The descriptor width was committed in the local header; a file that
        // grew past the hint mid-read cannot be represented any more.
        if !zip64 && (compressed >= U32_MAX || uncompressed >= U32_MAX) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("entry {} crossed 4 GiB after the header was written", name),
            ));
        }
        let mut descriptor = Vec::with_capacity(24);
        put_u32(&mut descriptor, DATA_DESCRIPTOR_SIG);
        put_u32(&mut descriptor, crc);
        if zip64 {
            put_u64(&mut descriptor, compressed);
            put_u64(&mut descriptor, uncompressed);
        } else {
            put_u32(&mut descriptor, compressed as u32);
            put_u32(&mut descriptor, uncompressed as u32);
        }
        self.out.write_all(&descriptor)?;

        self.entries.push(CentralRecord {
            name: name.to_string(),
            crc,
            compressed,
            uncompressed,
            offset,
            dos_time,
            dos_date,
            mode,
            directory: false,
        });
        Ok(uncompressed)
    }

    /// Writes the central directory, ZIP64 records when required, and the
    /// end-of-central-directory record carrying the archive comment.
    pub fn finish(mut self) -> io::Result<W> {
        let cd_start = self.out.offset;
        for entry in &self.entries {
            let record = central_header(entry);
            self.out.write_all(&record)?;
        }
        let cd_size = self.out.offset - cd_start;
        let count = self.entries.len() as u64;

        let overflow = count > 0xFFFF || cd_size >= U32_MAX || cd_start >= U32_MAX;
        if overflow {
            let zip64_eocd_offset = self.out.offset;
            let mut rec = Vec::with_capacity(56);
            put_u32(&mut rec, ZIP64_EOCD_SIG);
            put_u64(&mut rec, 44); // remaining record size
            put_u16(&mut rec, MADE_BY_UNIX | VERSION_ZIP64);
            put_u16(&mut rec, VERSION_ZIP64);
            put_u32(&mut rec, 0); // this disk
            put_u32(&mut rec, 0); // central directory disk
            put_u64(&mut rec, count);
            put_u64(&mut rec, count);
            put_u64(&mut rec, cd_size);
            put_u64(&mut rec, cd_start);
            put_u32(&mut rec, ZIP64_LOCATOR_SIG);
            put_u32(&mut rec, 0); // disk holding the zip64 eocd
            put_u64(&mut rec, zip64_eocd_offset);
            put_u32(&mut rec, 1); // total disks
            self.out.write_all(&rec)?;
        }

        let mut eocd = Vec::with_capacity(22 + self.comment.len());
        put_u32(&mut eocd, EOCD_SIG);
        put_u16(&mut eocd, 0);
        put_u16(&mut eocd, 0);
        put_u16(&mut eocd, count.min(0xFFFF) as u16);
        put_u16(&mut eocd, count.min(0xFFFF) as u16);
        put_u32(&mut eocd, cd_size.min(U32_MAX) as u32);
        put_u32(&mut eocd, cd_start.min(U32_MAX) as u32);
        put_u16(&mut eocd, self.comment.len() as u16);
        eocd.extend_from_slice(self.comment.as_bytes());
        self.out.write_all(&eocd)?;

        self.out.flush()?;
        Ok(self.out.inner)
    }
}

fn central_header(entry: &CentralRecord) -> Vec<u8> {
    let zip64 = entry.needs_zip64();
    let mut extra = Vec::new();
    if zip64 {
        let mut fields = Vec::with_capacity(24);
        if entry.uncompressed >= U32_MAX {
            put_u64(&mut fields, entry.uncompressed);
        }
        if entry.compressed >= U32_MAX {
            put_u64(&mut fields, entry.compressed);
        }
        if entry.offset >= U32_MAX {
            put_u64(&mut fields, entry.offset);
        }
        put_u16(&mut extra, 0x0001); // zip64 extended information
        put_u16(&mut extra, fields.len() as u16);
        extra.extend_from_slice(&fields);
    }

    let version = if zip64 { VERSION_ZIP64 } else { VERSION_DEFLATE };
    let (flags, method) = if entry.directory {
        (FLAGS_STORED, METHOD_STORE)
    } else {
        (FLAGS_STREAMED, METHOD_DEFLATE)
    };
    // Unix mode (type bits included) lives in the high half; bit 4 of the
    // low byte marks directories for DOS-minded extractors.
    let file_type = if entry.directory { 0o4_0000 } else { 0o10_0000 };
    let mut external = (file_type | entry.mode) << 16;
    if entry.directory {
        external |= 0x10;
    }

    let mut record = Vec::with_capacity(46 + entry.name.len() + extra.len());
    put_u32(&mut record, CENTRAL_HEADER_SIG);
    put_u16(&mut record, MADE_BY_UNIX | version);
    put_u16(&mut record, version);
    put_u16(&mut record, flags);
    put_u16(&mut record, method);
    put_u16(&mut record, entry.dos_time);
    put_u16(&mut record, entry.dos_date);
    put_u32(&mut record, entry.crc);
    put_u32(&mut record, entry.compressed.min(U32_MAX) as u32);
    put_u32(&mut record, entry.uncompressed.min(U32_MAX) as u32);
    put_u16(&mut record, entry.name.len() as u16);
    put_u16(&mut record, extra.len() as u16);
    put_u16(&mut record, 0); // comment length
    put_u16(&mut record, 0); // disk number
    put_u16(&mut record, 0); // internal attributes
    put_u32(&mut record, external);
    put_u32(&mut record, entry.offset.min(U32_MAX) as u32);
    record.extend_from_slice(entry.name.as_bytes());
    record.extend_from_slice(&extra);
    record
}

/// Whether an entry of `size_hint` uncompressed bytes could need 8-byte
/// descriptor fields. Deflate can expand incompressible input by about five
/// bytes per 16 KiB block, so sizes just under the 4 GiB line count too.
fn may_need_zip64(size_hint: u64) -> bool {
    let worst_case = size_hint + size_hint / 16_384 * 5 + 64;
    worst_case >= U32_MAX
}

fn put_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// MS-DOS timestamp pair (time, date) in local time. The format cannot
/// express years before 1980 and has two-second resolution.
fn dos_datetime(mtime: SystemTime) -> (u16, u16) {
    let local: chrono::DateTime<chrono::Local> = mtime.into();
    let year = local.year().clamp(1980, 2107) as u16;
    let date = ((year - 1980) << 9) | ((local.month() as u16) << 5) | local.day() as u16;
    let time =
        ((local.hour() as u16) << 11) | ((local.minute() as u16) << 5) | (local.second() as u16 / 2);
    (time, date)
}
