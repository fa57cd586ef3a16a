//! The Firmware Configuration Block: the record the boot ROM (and we)
//! search the first erase blocks for, describing the ECC layout and where
//! the two firmware copies live.
//!
//! Two on-flash encodings exist. On i.MX6 the FCB page is read raw — the
//! record's own ones'-complement checksum is the integrity check. On
//! i.MX7 the page is written through the 62-bit BCH layout with the
//! randomizer enabled, so candidates are read through the ECC pipeline and
//! judged by their chunk status first. Which encoding applies is a
//! property of the target SoC, never auto-detected.

use deku::prelude::*;
use log::{debug, warn};

use crate::gpmi::PAGE_BUF_LEN;
use crate::nand::ecc::EccLayout;
use crate::nand::{BootNand, NandGeometry, ReadMode};
use crate::{Error, Result};

/// "FCB " in little-endian byte order.
pub const FCB_FINGERPRINT: u32 = 0x2042_4346;

/// Serialized size of the record; the checksum covers bytes 4..this.
pub const FCB_SIZE: usize = 256;

/// Number of candidate erase blocks searched, on both SoCs.
const FCB_CANDIDATE_BLOCKS: u32 = 4;

/// The FCB record, fixed little-endian layout.
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Fcb {
    /// Ones'-complement byte sum of everything after this field.
    pub checksum: u32,
    pub fingerprint: u32,
    pub version: u32,

    // NAND timing parameters, applied by the ROM; carried but unused here.
    pub data_setup: u8,
    pub data_hold: u8,
    pub address_setup: u8,
    pub dsample_time: u8,
    pub nand_timing_state: u8,
    pub rea: u8,
    pub rloh: u8,
    pub rhoh: u8,

    pub page_data_size: u32,
    pub total_page_size: u32,
    pub sectors_per_block: u32,
    pub number_of_nands: u32,
    pub total_internal_die: u32,
    pub cell_type: u32,
    pub ecc_block_n_ecc_type: u32,
    pub ecc_block_0_size: u32,
    pub ecc_block_n_size: u32,
    pub ecc_block_0_ecc_type: u32,
    pub metadata_bytes: u32,
    pub num_ecc_blocks_per_page: u32,
    pub ecc_block_n_ecc_level_sdk: u32,
    pub ecc_block_0_size_sdk: u32,
    pub ecc_block_n_size_sdk: u32,
    pub ecc_block_0_ecc_level_sdk: u32,
    pub num_ecc_blocks_per_page_sdk: u32,
    pub metadata_bytes_sdk: u32,
    pub erase_threshold: u32,
    pub boot_patch: u32,
    pub patch_sectors: u32,
    pub firmware1_starting_page: u32,
    pub firmware2_starting_page: u32,
    pub pages_in_firmware1: u32,
    pub pages_in_firmware2: u32,
    pub dbbt_search_area_start_address: u32,
    pub bad_block_marker_byte: u32,
    pub bad_block_marker_start_bit: u32,
    pub bb_marker_physical_offset: u32,
    pub bch_type: u32,
    pub reserved: [u8; 116],
}

impl Default for Fcb {
    fn default() -> Self {
        Fcb {
            checksum: 0,
            fingerprint: FCB_FINGERPRINT,
            version: 1,
            data_setup: 0,
            data_hold: 0,
            address_setup: 0,
            dsample_time: 0,
            nand_timing_state: 0,
            rea: 0,
            rloh: 0,
            rhoh: 0,
            page_data_size: 0,
            total_page_size: 0,
            sectors_per_block: 0,
            number_of_nands: 0,
            total_internal_die: 0,
            cell_type: 0,
            ecc_block_n_ecc_type: 0,
            ecc_block_0_size: 0,
            ecc_block_n_size: 0,
            ecc_block_0_ecc_type: 0,
            metadata_bytes: 0,
            num_ecc_blocks_per_page: 0,
            ecc_block_n_ecc_level_sdk: 0,
            ecc_block_0_size_sdk: 0,
            ecc_block_n_size_sdk: 0,
            ecc_block_0_ecc_level_sdk: 0,
            num_ecc_blocks_per_page_sdk: 0,
            metadata_bytes_sdk: 0,
            erase_threshold: 0,
            boot_patch: 0,
            patch_sectors: 0,
            firmware1_starting_page: 0,
            firmware2_starting_page: 0,
            pages_in_firmware1: 0,
            pages_in_firmware2: 0,
            dbbt_search_area_start_address: 0,
            bad_block_marker_byte: 0,
            bad_block_marker_start_bit: 0,
            bb_marker_physical_offset: 0,
            bch_type: 0,
            reserved: [0; 116],
        }
    }
}

/// Ones'-complement of the unsigned byte sum.
pub fn ones_complement_checksum(bytes: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for &b in bytes {
        sum = sum.wrapping_add(u32::from(b));
    }
    !sum
}

impl Fcb {
    /// Decode and validate a candidate page: fingerprint first, then the
    /// checksum over bytes 4..[`FCB_SIZE`].
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < FCB_SIZE {
            return Err(Error::BufferTooSmall {
                needed: FCB_SIZE,
                have: buf.len(),
            });
        }

        let (_, fcb) =
            Fcb::from_bytes((buf, 0)).map_err(|_| Error::MalformedRecord("FCB"))?;

        if fcb.fingerprint != FCB_FINGERPRINT {
            return Err(Error::InvalidFingerprint(fcb.fingerprint));
        }

        let computed = ones_complement_checksum(&buf[4..FCB_SIZE]);
        if computed != fcb.checksum {
            return Err(Error::ChecksumMismatch {
                stored: fcb.checksum,
                computed,
            });
        }

        fcb.check_geometry()?;
        Ok(fcb)
    }

    /// Reject geometry a checksum-valid record can still get wrong: a zero
    /// block size would divide-by-zero the streamer, a data/page size
    /// mismatch would overrun the streaming scratch buffer, and an
    /// oversized ECC layout would overrun the controller's page buffer.
    fn check_geometry(&self) -> Result<()> {
        let u16_max = u32::from(u16::MAX);
        if self.sectors_per_block == 0
            || self.page_data_size == 0
            || self.num_ecc_blocks_per_page > 254
            || self.metadata_bytes > u16_max
            || self.ecc_block_0_size > u16_max
            || self.ecc_block_n_size > u16_max
        {
            return Err(Error::MalformedRecord("FCB geometry"));
        }

        let layout = EccLayout::from_fcb(self);
        if layout.data_len() != self.page_data_size as usize
            || layout.buffer_len() > PAGE_BUF_LEN
        {
            return Err(Error::MalformedRecord("FCB ECC layout"));
        }
        Ok(())
    }

    /// Serialize with a correct checksum. Used by fixtures and tooling;
    /// the boot path itself never writes flash.
    pub fn to_page_bytes(&self) -> Vec<u8> {
        let mut bytes = self.to_bytes().expect("FCB serialization is infallible");
        debug_assert_eq!(bytes.len(), FCB_SIZE);
        let checksum = ones_complement_checksum(&bytes[4..]);
        bytes[..4].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }
}

/// Which on-flash FCB encoding the target SoC uses.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FcbStrategy {
    /// Raw page reads; the FCB checksum is the only integrity check.
    Imx6,
    /// 62-bit BCH with the per-page randomizer; chunk status decides.
    Imx7,
}

/// Search erase blocks 0..=3 for a valid FCB.
///
/// Every per-candidate failure — read error, uncorrectable ECC,
/// fingerprint or checksum mismatch — moves on to the next candidate;
/// only exhausting all of them raises [`Error::FcbNotFound`].
pub fn locate<N: BootNand>(
    nand: &mut N,
    strategy: FcbStrategy,
    geometry: &NandGeometry,
    buf: &mut [u8],
) -> Result<Fcb> {
    if strategy == FcbStrategy::Imx7 {
        // Fixed layout for all FCB candidates; programmed once.
        nand.set_ecc_layout(&EccLayout::imx7_fcb())?;
    }

    for block in 0..FCB_CANDIDATE_BLOCKS {
        let page = block * geometry.pages_per_block;

        let candidate = match strategy {
            FcbStrategy::Imx6 => read_candidate_imx6(nand, geometry, page, buf),
            FcbStrategy::Imx7 => read_candidate_imx7(nand, page, buf),
        };

        match candidate {
            Ok(fcb) => {
                debug!("FCB found in block {block} (page {page})");
                return Ok(fcb);
            }
            Err(e) => {
                debug!("FCB candidate block {block} rejected: {e}");
            }
        }
    }

    warn!("no valid FCB in the first {FCB_CANDIDATE_BLOCKS} blocks");
    Err(Error::FcbNotFound)
}

fn read_candidate_imx6<N: BootNand>(
    nand: &mut N,
    geometry: &NandGeometry,
    page: u32,
    buf: &mut [u8],
) -> Result<Fcb> {
    let len = (geometry.page_size + geometry.oob_size) as usize;
    let have = buf.len();
    let buf = buf
        .get_mut(..len)
        .ok_or(Error::BufferTooSmall { needed: len, have })?;
    nand.read_page(page, ReadMode::Raw, buf)?;
    Fcb::parse(buf)
}

fn read_candidate_imx7<N: BootNand>(nand: &mut N, page: u32, buf: &mut [u8]) -> Result<Fcb> {
    let layout = EccLayout::imx7_fcb();
    let len = layout.buffer_len();
    let have = buf.len();
    let buf = buf
        .get_mut(..len)
        .ok_or(Error::BufferTooSmall { needed: len, have })?;
    nand.read_page(page, ReadMode::Ecc { randomizer: true }, buf)?;
    layout.check_status_randomized(buf)?;
    Fcb::parse(buf)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::nand::ecc::CHUNK_DATA_SIZE;
    use crate::nand::sim::{PageHealth, SimNand};

    pub(crate) fn test_geometry() -> NandGeometry {
        NandGeometry {
            page_size: 2048,
            oob_size: 64,
            pages_per_block: 64,
            blocks_per_lun: 1024,
            luns: 1,
            bits_per_cell: 1,
            planes: 1,
            total_size: 2048 * 64 * 1024,
        }
    }

    pub(crate) fn test_fcb() -> Fcb {
        Fcb {
            page_data_size: 2048,
            total_page_size: 2048 + 64,
            sectors_per_block: 64,
            ecc_block_0_size: CHUNK_DATA_SIZE,
            ecc_block_n_size: CHUNK_DATA_SIZE,
            ecc_block_0_ecc_type: 4,
            ecc_block_n_ecc_type: 4,
            metadata_bytes: 10,
            num_ecc_blocks_per_page: 3,
            firmware1_starting_page: 256,
            firmware2_starting_page: 512,
            pages_in_firmware1: 3,
            pages_in_firmware2: 3,
            dbbt_search_area_start_address: 128,
            bad_block_marker_byte: 2000,
            ..Fcb::default()
        }
    }

    #[test]
    fn test_ones_complement_property() {
        let buf: Vec<u8> = (0..=255u8).cycle().take(700).collect();
        let sum: u32 = buf.iter().map(|&b| u32::from(b)).sum();
        assert_eq!(ones_complement_checksum(&buf), !sum);
        assert_eq!(ones_complement_checksum(&[]), 0xFFFF_FFFF);
    }

    #[test]
    fn test_checksum_roundtrip_and_flip_rejection() {
        let bytes = test_fcb().to_page_bytes();
        assert!(Fcb::parse(&bytes).is_ok());

        // Flipping any byte of the checksummed region must be rejected.
        for i in 4..FCB_SIZE {
            let mut mutated = bytes.clone();
            mutated[i] ^= 0x01;
            assert!(
                Fcb::parse(&mutated).is_err(),
                "byte flip at offset {i} was accepted"
            );
        }
    }

    #[test]
    fn test_zero_sectors_per_block_rejected() {
        // Checksum-valid, geometry-hostile: must fail parse, not panic a
        // later division.
        let fcb = Fcb {
            sectors_per_block: 0,
            ..test_fcb()
        };
        assert!(matches!(
            Fcb::parse(&fcb.to_page_bytes()),
            Err(Error::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_oversized_ecc_layout_rejected() {
        // 21 chunks of 512 bytes exceeds the controller's page buffer.
        let fcb = Fcb {
            page_data_size: 21 * 512,
            num_ecc_blocks_per_page: 20,
            ..test_fcb()
        };
        assert!(matches!(
            Fcb::parse(&fcb.to_page_bytes()),
            Err(Error::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_data_page_size_mismatch_rejected() {
        let fcb = Fcb {
            ecc_block_0_size: 0,
            ..test_fcb()
        };
        assert!(matches!(
            Fcb::parse(&fcb.to_page_bytes()),
            Err(Error::MalformedRecord(_))
        ));
    }

    #[test]
    fn test_locate_skips_geometry_hostile_candidate() {
        let geometry = test_geometry();
        let mut nand = SimNand::new(geometry);

        // Block 0 holds a checksum-valid record with zero-sized blocks;
        // block 1 holds the good one.
        let hostile = Fcb {
            sectors_per_block: 0,
            ..test_fcb()
        };
        nand.program_page(0, &hostile.to_page_bytes(), &[]);
        let good = test_fcb();
        nand.program_page(geometry.pages_per_block, &good.to_page_bytes(), &[]);
        let good = Fcb::parse(&good.to_page_bytes()).unwrap();

        let mut buf = vec![0u8; (geometry.page_size + geometry.oob_size) as usize];
        let found = locate(&mut nand, FcbStrategy::Imx6, &geometry, &mut buf).unwrap();
        assert_eq!(found, good);
    }

    #[test]
    fn test_fingerprint_checked_before_checksum() {
        let mut bytes = test_fcb().to_page_bytes();
        bytes[4..8].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        assert!(matches!(
            Fcb::parse(&bytes),
            Err(Error::InvalidFingerprint(0xDEAD_BEEF))
        ));
    }

    #[test]
    fn test_locate_imx6_falls_through_candidates() {
        let geometry = test_geometry();
        let mut nand = SimNand::new(geometry);

        // Blocks 0..=2 hold garbage; block 3 holds the valid record.
        for block in 0..3u32 {
            let junk = vec![0xA5u8; 64];
            nand.program_page(block * geometry.pages_per_block, &junk, &[]);
        }
        let fcb = test_fcb();
        nand.program_page(3 * geometry.pages_per_block, &fcb.to_page_bytes(), &[]);
        let fcb = Fcb::parse(&fcb.to_page_bytes()).unwrap();

        let mut buf = vec![0u8; (geometry.page_size + geometry.oob_size) as usize];
        let found = locate(&mut nand, FcbStrategy::Imx6, &geometry, &mut buf).unwrap();
        assert_eq!(found, fcb);
    }

    #[test]
    fn test_locate_imx6_not_found() {
        let geometry = test_geometry();
        let mut nand = SimNand::new(geometry);
        let mut buf = vec![0u8; (geometry.page_size + geometry.oob_size) as usize];
        assert!(matches!(
            locate(&mut nand, FcbStrategy::Imx6, &geometry, &mut buf),
            Err(Error::FcbNotFound)
        ));
    }

    #[test]
    fn test_locate_imx7_skips_uncorrectable_candidates() {
        let geometry = NandGeometry {
            page_size: 4096,
            oob_size: 64,
            pages_per_block: 64,
            blocks_per_lun: 1024,
            luns: 1,
            bits_per_cell: 1,
            planes: 1,
            total_size: 4096 * 64 * 1024,
        };
        let mut nand = SimNand::new(geometry);
        let fcb = test_fcb();
        for block in 0..3u32 {
            nand.program_page(block * geometry.pages_per_block, &fcb.to_page_bytes(), &[]);
        }
        // Candidates 0 and 1 fail ECC; candidate 2 is clean.
        nand.set_page_health(0, PageHealth::Uncorrectable);
        nand.set_page_health(64, PageHealth::Uncorrectable);
        let fcb = Fcb::parse(&fcb.to_page_bytes()).unwrap();

        let layout = EccLayout::imx7_fcb();
        let mut buf = vec![0u8; layout.buffer_len()];
        let found = locate(&mut nand, FcbStrategy::Imx7, &geometry, &mut buf).unwrap();
        assert_eq!(found, fcb);
    }
}
