// vim: tw=80
//! Encoding and decoding of REPORT ZONES response buffers
//!
//! The buffer is a 64-byte header followed by 64-byte zone descriptors.  All
//! multi-byte fields are big-endian, and sector fields are in units of the
//! device's logical block size.
//!
//! Header:
//!
//! ```text
//! 0..4    Zone list length in bytes, excluding the header
//! 4       Low nibble: SAME field
//! 8..16   Maximum LBA
//! ```
//!
//! Record:
//!
//! ```text
//! 0       Low nibble: zone type
//! 1       High nibble: zone condition
//! 8..16   Zone length
//! 16..24  Zone start
//! 24..32  Write pointer
//! ```

use byteorder::{BigEndian, ByteOrder};
use tracing::warn;

use crate::{
    types::*,
    zone::*
};

pub const HEADER_LEN: usize = 64;
pub const RECORD_LEN: usize = 64;

/// The SAME field of the report header
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Same {
    /// Zone types and lengths may all differ
    Different = 0,
    /// Every zone has the same type and length
    AllSame = 1,
    /// Like `AllSame`, but the last zone's length may differ
    LastDiffers = 2,
    /// Lengths are equal, but types may differ
    SameLenDiffTypes = 3,
}

impl Same {
    fn from_nibble(nibble: u8) -> Result<Self> {
        match nibble {
            0 => Ok(Same::Different),
            1 => Ok(Same::AllSame),
            2 => Ok(Same::LastDiffers),
            3 => Ok(Same::SameLenDiffTypes),
            _ => Err(Error::DecodeError)
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReportHeader {
    /// Length in bytes of all records the device has to report, even the ones
    /// that didn't fit in the buffer.
    pub list_len: u32,
    pub same: Same,
}

/// A decoded report
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Report {
    pub zones: Vec<ZoneDescriptor>,
    /// Start of the first zone whose length broke uniformity, if any.  That
    /// zone is not included in `zones`.
    pub irregular: Option<SectorT>,
    /// The sector following the last record consumed, if any were.
    pub next: Option<SectorT>,
}

pub fn decode_header(buf: &[u8]) -> Result<ReportHeader> {
    if buf.len() < HEADER_LEN + RECORD_LEN {
        return Err(Error::DecodeError);
    }
    let list_len = BigEndian::read_u32(&buf[0..4]);
    if list_len as usize % RECORD_LEN != 0 {
        return Err(Error::DecodeError);
    }
    let same = Same::from_nibble(buf[4] & 0xf)?;
    Ok(ReportHeader { list_len, same })
}

/// Read the zone length out of the first record, without any validation.
///
/// Used to learn the expected zone length of a drive whose zones vary.
pub fn first_zone_len(buf: &[u8], scale: u32) -> Result<SectorT> {
    decode_header(buf)?;
    let rec = &buf[HEADER_LEN..HEADER_LEN + RECORD_LEN];
    scaled(BigEndian::read_u64(&rec[8..16]), u64::from(scale))
}

/// Scale a sector field read from the device into 512-byte sectors
fn scaled(raw: u64, scale: u64) -> Result<SectorT> {
    raw.checked_mul(scale).ok_or(Error::DecodeError)
}

fn decode_record(rec: &[u8], scale: u32) -> Result<ZoneDescriptor> {
    let scale = u64::from(scale);
    let zone_type = ZoneType::from_nibble(rec[0] & 0xf)
        .ok_or(Error::DecodeError)?;
    let cond = ZoneCondition::from_nibble((rec[1] >> 4) & 0xf);
    let len = scaled(BigEndian::read_u64(&rec[8..16]), scale)?;
    let start = scaled(BigEndian::read_u64(&rec[16..24]), scale)?;
    let end = start.checked_add(len).ok_or(Error::DecodeError)?;
    let wp = if zone_type == ZoneType::Conventional {
        None
    } else {
        let raw = BigEndian::read_u64(&rec[24..32]);
        let wp = raw.checked_mul(scale);
        Some(match cond {
            // The write pointer is undefined.  Whatever is there may be read.
            ZoneCondition::ReadOnly | ZoneCondition::Offline => end,
            ZoneCondition::Empty if wp != Some(start) => {
                warn!(start, wp = raw, "Quirk: EMPTY zone with wp != start");
                start
            }
            ZoneCondition::Full if wp != Some(end) => {
                warn!(start, wp = raw, "Quirk: FULL zone with wp != end");
                end
            }
            _ => match wp {
                Some(wp) if (start..=end).contains(&wp) => wp,
                _ => {
                    warn!(start, len, wp = raw, "write pointer outside its zone");
                    return Err(Error::DecodeError);
                }
            }
        })
    };
    Ok(ZoneDescriptor { start, len, zone_type, cond, wp })
}

/// Decode a REPORT ZONES response.
///
/// # Arguments
///
/// - `buf`:            The raw response buffer
/// - `scale`:          Number of 512-byte sectors per device logical block
/// - `expected_len`:   Uniform zone length in sectors.  Only consulted when
///                     the header doesn't assert that lengths are equal.
pub fn decode(buf: &[u8], scale: u32, expected_len: Option<SectorT>)
    -> Result<Report>
{
    let header = decode_header(buf)?;
    let end = buf.len().min(header.list_len as usize + HEADER_LEN);
    let mut report = Report::default();
    for rec in buf[HEADER_LEN..end].chunks_exact(RECORD_LEN) {
        let desc = decode_record(rec, scale)?;
        report.next = Some(desc.end());
        if header.same == Same::Different &&
            expected_len.is_some_and(|zlen| zlen != desc.len)
        {
            warn!(start = desc.start, len = desc.len,
                  "zone length breaks uniformity");
            report.irregular = Some(desc.start);
            break;
        }
        report.zones.push(desc);
    }
    Ok(report)
}

/// Write a REPORT ZONES header
pub fn encode_header(buf: &mut [u8], list_len: u32, same: Same) {
    buf[0..HEADER_LEN].fill(0);
    BigEndian::write_u32(&mut buf[0..4], list_len);
    buf[4] = same as u8;
}

/// Write a single zone record.  The inverse of decoding, except that quirk
/// fixups are not reversed.
pub fn encode_record(rec: &mut [u8], desc: &ZoneDescriptor, scale: u32) {
    let scale = u64::from(scale);
    rec[0..RECORD_LEN].fill(0);
    rec[0] = desc.zone_type as u8;
    rec[1] = desc.cond.to_nibble() << 4;
    BigEndian::write_u64(&mut rec[8..16], desc.len / scale);
    BigEndian::write_u64(&mut rec[16..24], desc.start / scale);
    let wp = desc.wp.map(|wp| wp / scale).unwrap_or(u64::MAX);
    BigEndian::write_u64(&mut rec[24..32], wp);
}

// LCOV_EXCL_STOP
