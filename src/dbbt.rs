//! The Discovered Bad Block Table: the factory-scan results the flashing
//! tool left next to the FCB, telling the firmware streamer which erase
//! blocks to skip.
//!
//! The table is optional. A device with no DBBT (or a disabled one) simply
//! streams every block, so every failure here degrades to "no table"
//! rather than aborting the boot.
//!
//! On flash the DBBT is two ECC-protected pages: a header page carrying
//! the fingerprint and a big-endian version word, and an entries page four
//! pages later holding the bad-block numbers.

use deku::prelude::*;
use log::{debug, info};

use crate::fcb::Fcb;
use crate::nand::ecc::EccLayout;
use crate::nand::{BootNand, ReadMode};
use crate::{Error, Result};

/// "DBBT" in little-endian byte order.
pub const DBBT_FINGERPRINT: u32 = 0x5442_4244;

/// Offset, in pages, of the entries page from the header page.
pub const DBBT_DATA_PAGE_OFFSET: u32 = 4;

/// Number of candidate positions searched in the DBBT area.
const DBBT_CANDIDATES: u32 = 4;

/// Serialized header size.
const DBBT_HEADER_SIZE: usize = 20;

/// The DBBT header page. Everything is little-endian except the version
/// word, which the flashing tools write big-endian.
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct DbbtHeader {
    pub checksum: u32,
    pub fingerprint: u32,
    #[deku(endian = "big")]
    pub version: u32,
    pub reserved: u32,
    /// Number of pages of bad-block data; 0 means an empty table.
    pub dbbt_pages: u32,
}

impl DbbtHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < DBBT_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                needed: DBBT_HEADER_SIZE,
                have: buf.len(),
            });
        }
        let (_, header) =
            DbbtHeader::from_bytes((buf, 0)).map_err(|_| Error::MalformedRecord("DBBT header"))?;
        if header.fingerprint != DBBT_FINGERPRINT {
            return Err(Error::InvalidFingerprint(header.fingerprint));
        }
        Ok(header)
    }
}

/// The decoded table of factory-marked bad erase blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BadBlockTable {
    blocks: Vec<u32>,
}

impl BadBlockTable {
    pub fn contains(&self, block: u32) -> bool {
        self.blocks.contains(&block)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Decode the entries page: a reserved word, an entry count, then that
    /// many little-endian block numbers.
    fn parse_entries(buf: &[u8]) -> Result<Self> {
        if buf.len() < 8 {
            return Err(Error::MalformedRecord("DBBT entries page"));
        }
        let count = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
        let entries = buf[8..]
            .chunks_exact(4)
            .take(count)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect::<Vec<u32>>();
        if entries.len() < count {
            return Err(Error::MalformedRecord("DBBT entry count exceeds page"));
        }
        Ok(BadBlockTable { blocks: entries })
    }
}

/// Search the DBBT area named by the FCB.
///
/// Candidates sit at `dbbt_search_area_start_address + i * sectors_per_block`
/// for `i` in 0..4. A candidate whose header fails to read or validate is
/// skipped; a valid header with version 0 or no data pages means the table
/// is deliberately absent, while any version >= 1 is honored. `Ok(None)` in
/// every non-hardware failure case: a missing DBBT never stops the boot.
pub fn locate<N: BootNand>(nand: &mut N, fcb: &Fcb, buf: &mut [u8]) -> Result<Option<BadBlockTable>> {
    let layout = EccLayout::from_fcb(fcb);
    nand.set_ecc_layout(&layout)?;

    for i in 0..DBBT_CANDIDATES {
        let page = fcb.dbbt_search_area_start_address + i * fcb.sectors_per_block;

        let header = match read_checked(nand, &layout, page, buf).and_then(DbbtHeader::parse) {
            Ok(header) => header,
            Err(e) => {
                debug!("DBBT candidate at page {page} rejected: {e}");
                continue;
            }
        };

        if header.version < 1 || header.dbbt_pages == 0 {
            debug!(
                "DBBT at page {page} disabled (version {}, {} data pages)",
                header.version, header.dbbt_pages
            );
            return Ok(None);
        }

        match read_checked(nand, &layout, page + DBBT_DATA_PAGE_OFFSET, buf)
            .and_then(BadBlockTable::parse_entries)
        {
            Ok(table) => {
                info!("DBBT at page {page}: {} bad block(s)", table.len());
                return Ok(Some(table));
            }
            Err(e) => debug!("DBBT entries at page {page} rejected: {e}"),
        }
    }

    debug!("no DBBT found; treating all blocks as good");
    Ok(None)
}

fn read_checked<'a, N: BootNand>(
    nand: &mut N,
    layout: &EccLayout,
    page: u32,
    buf: &'a mut [u8],
) -> Result<&'a [u8]> {
    let len = layout.buffer_len();
    let have = buf.len();
    let buf = buf
        .get_mut(..len)
        .ok_or(Error::BufferTooSmall { needed: len, have })?;
    nand.read_page(page, ReadMode::Ecc { randomizer: false }, buf)?;
    layout.check_status(buf)?;
    Ok(buf)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::fcb::tests::{test_fcb, test_geometry};
    use crate::nand::sim::{PageHealth, SimNand};

    pub(crate) fn header_bytes(version: u32, dbbt_pages: u32) -> Vec<u8> {
        DbbtHeader {
            checksum: 0,
            fingerprint: DBBT_FINGERPRINT,
            version,
            reserved: 0,
            dbbt_pages,
        }
        .to_bytes()
        .unwrap()
    }

    pub(crate) fn entries_bytes(blocks: &[u32]) -> Vec<u8> {
        let mut out = vec![0u8; 8];
        out[4..8].copy_from_slice(&(blocks.len() as u32).to_le_bytes());
        for block in blocks {
            out.extend_from_slice(&block.to_le_bytes());
        }
        out
    }

    fn scratch() -> Vec<u8> {
        vec![0u8; EccLayout::from_fcb(&test_fcb()).buffer_len()]
    }

    #[test]
    fn test_absent_table_is_not_an_error() {
        let mut nand = SimNand::new(test_geometry());
        let table = locate(&mut nand, &test_fcb(), &mut scratch()).unwrap();
        assert_eq!(table, None);
    }

    #[test]
    fn test_present_table() {
        let fcb = test_fcb();
        let mut nand = SimNand::new(test_geometry());
        nand.program_page(128, &header_bytes(1, 1), &[]);
        nand.program_page(132, &entries_bytes(&[9, 42]), &[]);

        let table = locate(&mut nand, &fcb, &mut scratch()).unwrap().unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.contains(9));
        assert!(table.contains(42));
        assert!(!table.contains(1));
    }

    #[test]
    fn test_forward_versioned_table_still_honored() {
        let fcb = test_fcb();
        let mut nand = SimNand::new(test_geometry());
        nand.program_page(128, &header_bytes(2, 1), &[]);
        nand.program_page(132, &entries_bytes(&[9]), &[]);

        let table = locate(&mut nand, &fcb, &mut scratch()).unwrap().unwrap();
        assert!(table.contains(9));
    }

    #[test]
    fn test_version_zero_means_disabled() {
        let fcb = test_fcb();
        let mut nand = SimNand::new(test_geometry());
        nand.program_page(128, &header_bytes(0, 1), &[]);
        nand.program_page(132, &entries_bytes(&[9]), &[]);

        assert_eq!(locate(&mut nand, &fcb, &mut scratch()).unwrap(), None);
    }

    #[test]
    fn test_unreadable_candidate_falls_through() {
        let fcb = test_fcb();
        let mut nand = SimNand::new(test_geometry());
        // Candidate 0's header is unreadable; candidate 1 (one erase block
        // later) is valid.
        nand.program_page(128, &header_bytes(1, 1), &[]);
        nand.set_page_health(128, PageHealth::Uncorrectable);
        nand.program_page(192, &header_bytes(1, 1), &[]);
        nand.program_page(196, &entries_bytes(&[7]), &[]);

        let table = locate(&mut nand, &fcb, &mut scratch()).unwrap().unwrap();
        assert!(table.contains(7));
    }

    #[test]
    fn test_version_is_big_endian_on_the_wire() {
        let bytes = header_bytes(1, 1);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 1]);
    }
}
