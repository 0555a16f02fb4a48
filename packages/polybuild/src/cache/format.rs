//! On-disk framed binary format for the cache's durable log.
//!
//! Layout: a fixed header (`[B][L][D][R]` magic, `ver: u16`, `flags: u16`)
//! followed by a sequence of records, each `varint length | payload |
//! crc32c: u32`. A record that is fully framed (length, payload, and CRC
//! all present) but fails its checksum is corrupt but self-contained: the
//! reader has already consumed exactly that record's bytes, so it can
//! resync and keep reading. Only a record whose length or payload runs off
//! the end of the file — a torn write at the tail, from a crash mid-append —
//! actually ends the log (matching the teacher's "never panic, report via
//! color_eyre" failure posture).

use std::io::{self, Read, Write};

use color_eyre::{Result, eyre::Context};

pub const MAGIC: [u8; 4] = *b"BLDR";
pub const VERSION: u16 = 1;

/// Unknown flag bits must round-trip untouched, so a newer writer's flags
/// survive a read-modify-write by an older build.
#[derive(Copy, Clone, Debug, Default)]
pub struct Header {
    pub version: u16,
    pub flags: u16,
}

pub fn write_header(w: &mut impl Write, header: &Header) -> Result<()> {
    w.write_all(&MAGIC).context("write magic")?;
    w.write_all(&header.version.to_le_bytes())
        .context("write version")?;
    w.write_all(&header.flags.to_le_bytes())
        .context("write flags")?;
    Ok(())
}

/// Parse the header, returning `None` (rather than erroring) if the magic
/// doesn't match — the caller treats that as "start empty".
pub fn read_header(r: &mut impl Read) -> Result<Option<Header>> {
    let mut magic = [0u8; 4];
    if let Err(err) = r.read_exact(&mut magic) {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err).context("read magic");
    }
    if magic != MAGIC {
        return Ok(None);
    }

    let mut version = [0u8; 2];
    r.read_exact(&mut version).context("read version")?;
    let mut flags = [0u8; 2];
    r.read_exact(&mut flags).context("read flags")?;

    Ok(Some(Header {
        version: u16::from_le_bytes(version),
        flags: u16::from_le_bytes(flags),
    }))
}

/// Append one record: `varint(len) | payload | crc32c(payload)`.
pub fn write_record(w: &mut impl Write, payload: &[u8]) -> Result<()> {
    let mut len_buf = Vec::new();
    leb128::write::unsigned(&mut len_buf, payload.len() as u64).context("encode record length")?;
    w.write_all(&len_buf).context("write record length")?;
    w.write_all(payload).context("write record payload")?;

    let crc = crc32fast::hash(payload);
    w.write_all(&crc.to_le_bytes()).context("write record crc")?;
    Ok(())
}

/// Outcome of reading a single record from the log.
#[derive(Debug)]
pub enum RecordOutcome {
    /// A well-formed, checksum-valid record.
    Record(Vec<u8>),
    /// Clean end of the log, or a record whose length/payload/crc framing
    /// ran off the end of the file (a torn write). Reading stops here.
    Eof,
    /// A fully framed record whose CRC didn't match. The reader has already
    /// consumed exactly this record's bytes and can resync on the next one.
    CorruptRecord,
}

/// Read one record.
pub fn read_record(r: &mut impl Read) -> Result<RecordOutcome> {
    let len = match leb128::read::unsigned(&mut ByteReader(r)) {
        Ok(len) => len,
        Err(leb128::read::Error::IoError(err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
            return Ok(RecordOutcome::Eof);
        }
        Err(err) => return Err(err).context("decode record length"),
    };

    let mut payload = vec![0u8; len as usize];
    if r.read_exact(&mut payload).is_err() {
        return Ok(RecordOutcome::Eof);
    }

    let mut crc_buf = [0u8; 4];
    if r.read_exact(&mut crc_buf).is_err() {
        return Ok(RecordOutcome::Eof);
    }
    let expected_crc = u32::from_le_bytes(crc_buf);
    let actual_crc = crc32fast::hash(&payload);
    if actual_crc != expected_crc {
        return Ok(RecordOutcome::CorruptRecord);
    }

    Ok(RecordOutcome::Record(payload))
}

/// Adapter so `leb128::read::unsigned`, which wants `io::Read`, can borrow a
/// `&mut impl Read` directly.
struct ByteReader<'a, R: Read>(&'a mut R);

impl<R: Read> Read for ByteReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_header_and_records() {
        let mut buf = Vec::new();
        write_header(
            &mut buf,
            &Header {
                version: VERSION,
                flags: 0,
            },
        )
        .unwrap();
        write_record(&mut buf, b"hello").unwrap();
        write_record(&mut buf, b"world").unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let header = read_header(&mut cursor).unwrap().unwrap();
        assert_eq!(header.version, VERSION);
        assert!(matches!(
            read_record(&mut cursor).unwrap(),
            RecordOutcome::Record(payload) if payload == b"hello"
        ));
        assert!(matches!(
            read_record(&mut cursor).unwrap(),
            RecordOutcome::Record(payload) if payload == b"world"
        ));
        assert!(matches!(read_record(&mut cursor).unwrap(), RecordOutcome::Eof));
    }

    #[test]
    fn corrupt_record_is_dropped_not_fatal() {
        let mut buf = Vec::new();
        write_header(
            &mut buf,
            &Header {
                version: VERSION,
                flags: 0,
            },
        )
        .unwrap();
        write_record(&mut buf, b"good").unwrap();
        // Flip a byte in the CRC of the only record.
        let last = buf.len() - 1;
        buf[last] ^= 0xFF;

        let mut cursor = std::io::Cursor::new(buf);
        read_header(&mut cursor).unwrap().unwrap();
        assert!(matches!(
            read_record(&mut cursor).unwrap(),
            RecordOutcome::CorruptRecord
        ));
        assert!(matches!(read_record(&mut cursor).unwrap(), RecordOutcome::Eof));
    }

    #[test]
    fn corrupt_record_does_not_swallow_the_record_after_it() {
        let mut buf = Vec::new();
        write_header(
            &mut buf,
            &Header {
                version: VERSION,
                flags: 0,
            },
        )
        .unwrap();
        let corrupt_record_start = {
            write_record(&mut buf, b"bad").unwrap();
            let start = buf.len();
            write_record(&mut buf, b"good").unwrap();
            start
        };
        // Flip a byte in the CRC of the first record only; the second
        // record, written afterward, is untouched.
        let crc_byte = corrupt_record_start - 1;
        buf[crc_byte] ^= 0xFF;

        let mut cursor = std::io::Cursor::new(buf);
        read_header(&mut cursor).unwrap().unwrap();
        assert!(matches!(
            read_record(&mut cursor).unwrap(),
            RecordOutcome::CorruptRecord
        ));
        assert!(matches!(
            read_record(&mut cursor).unwrap(),
            RecordOutcome::Record(payload) if payload == b"good"
        ));
        assert!(matches!(read_record(&mut cursor).unwrap(), RecordOutcome::Eof));
    }

    #[test]
    fn non_matching_magic_yields_none_header() {
        let mut cursor = std::io::Cursor::new(b"nope".to_vec());
        assert!(read_header(&mut cursor).unwrap().is_none());
    }
}
