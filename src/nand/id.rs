//! Device identification: ONFI parameter page first, generic READ ID
//! decode as the fallback.
//!
//! This is the only place both identification paths are tried; callers
//! receive a populated [`NandGeometry`] and never need to know which path
//! succeeded.

use crc::{Algorithm, Crc};
use deku::prelude::*;
use log::{debug, warn};
use retry::{delay::Fixed, retry};

use super::{BootNand, NandGeometry};
use crate::{Error, Result};

/// The ONFI integrity CRC: CRC-16 with polynomial 0x8005 and initial value
/// 0x4F4E ("ON"), no reflection, no final XOR, computed over the first 254
/// bytes of the parameter page.
pub const ONFI_CRC: Crc<u16> = Crc::<u16>::new(&Algorithm {
    width: 16,
    poly: 0x8005,
    init: 0x4F4E,
    refin: false,
    refout: false,
    xorout: 0x0000,
    check: 0x0000,
    residue: 0x0000,
});

/// Size of the ONFI parameter page structure.
pub const ONFI_PARAM_PAGE_SIZE: usize = 256;

/// Bytes covered by the parameter page CRC.
const ONFI_CRC_LEN: usize = 254;

/// The standard 256-byte ONFI parameter page. All multi-byte fields are
/// little-endian on the wire.
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct OnfiParamPage {
    pub signature: [u8; 4],
    pub revision: u16,
    pub features: u16,
    pub optional_commands: u16,
    pub reserved0: [u8; 22],
    pub manufacturer: [u8; 12],
    pub model: [u8; 20],
    pub jedec_manufacturer: u8,
    pub date_code: u16,
    pub reserved1: [u8; 13],
    pub data_bytes_per_page: u32,
    pub spare_bytes_per_page: u16,
    pub data_bytes_per_partial_page: u32,
    pub spare_bytes_per_partial_page: u16,
    pub pages_per_block: u32,
    pub blocks_per_lun: u32,
    pub luns_per_target: u8,
    pub address_cycles: u8,
    pub bits_per_cell: u8,
    pub max_bad_blocks_per_lun: u16,
    pub block_endurance: u16,
    pub guaranteed_valid_blocks: u8,
    pub guaranteed_block_endurance: u16,
    pub programs_per_page: u8,
    pub partial_programming_attrs: u8,
    pub ecc_correctability: u8,
    pub interleaved_address_bits: u8,
    pub interleaved_op_attrs: u8,
    pub reserved2: [u8; 13],
    pub timing_and_vendor: [u8; 126],
    pub crc: u16,
}

impl OnfiParamPage {
    /// Decode and CRC-check a parameter page buffer.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < ONFI_PARAM_PAGE_SIZE {
            return Err(Error::BufferTooSmall {
                needed: ONFI_PARAM_PAGE_SIZE,
                have: buf.len(),
            });
        }

        let (_, page) = OnfiParamPage::from_bytes((buf, 0))
            .map_err(|_| Error::MalformedRecord("ONFI parameter page"))?;

        let computed = ONFI_CRC.checksum(&buf[..ONFI_CRC_LEN]);
        if computed != page.crc {
            return Err(Error::ChecksumMismatch {
                stored: u32::from(page.crc),
                computed: u32::from(computed),
            });
        }

        Ok(page)
    }

    /// Derive device geometry from the parameter page fields.
    pub fn geometry(&self) -> NandGeometry {
        let page_size = self.data_bytes_per_page;
        let pages_per_block = self.pages_per_block;
        let blocks_per_lun = self.blocks_per_lun;
        let luns = u32::from(self.luns_per_target);

        NandGeometry {
            page_size,
            oob_size: u32::from(self.spare_bytes_per_page),
            pages_per_block,
            blocks_per_lun,
            luns,
            bits_per_cell: self.bits_per_cell,
            planes: 1 << self.interleaved_address_bits,
            total_size: u64::from(page_size)
                * u64::from(pages_per_block)
                * u64::from(blocks_per_lun)
                * u64::from(luns),
        }
    }
}

/// Probe the ONFI signature: READ ID at sub-address 0x20 must answer the
/// literal ASCII "ONFI". `Ok(false)` is "device present but not ONFI";
/// hardware failures propagate.
pub fn check_onfi<N: BootNand>(nand: &mut N) -> Result<bool> {
    let mut sig = [0u8; 4];
    nand.read_id(0x20, &mut sig)?;
    Ok(&sig == b"ONFI")
}

/// Decode geometry from the generic 5-byte READ ID response.
///
/// Bytes 2..=4 are bit-packed per the conventional extended-ID scheme:
/// cell type in byte 2, page/OOB/block sizes in byte 3, plane count and
/// density in byte 4.
pub fn decode_generic_id(id: &[u8; 5]) -> Result<NandGeometry> {
    // 0xFF anywhere is the floating-bus "no device" signature.
    if id.contains(&0xFF) {
        return Err(Error::InvalidDeviceResponse);
    }

    let bits_per_cell = ((id[2] >> 2) & 0x3) + 1;

    let page_size: u32 = 1024 << (id[3] & 0x3);
    // OOB scales with page density: 8 or 16 bytes per 512 bytes of page.
    let oob_size = (8 << ((id[3] >> 2) & 0x1)) * (page_size / 512);
    let block_size: u32 = (64 * 1024) << ((id[3] >> 4) & 0x3);

    let planes: u32 = 1 << ((id[4] >> 2) & 0x3);
    // Device density in MiB from byte 4's size field.
    let chip_mib: u32 = 8 << ((id[4] >> 4) & 0x7);
    let total_size = u64::from(chip_mib) * 1024 * 1024;

    let pages_per_block = block_size / page_size;
    let blocks_per_lun = (total_size / u64::from(block_size)) as u32;

    Ok(NandGeometry {
        page_size,
        oob_size,
        pages_per_block,
        blocks_per_lun,
        luns: 1,
        bits_per_cell,
        planes,
        total_size,
    })
}

/// Read and validate the ONFI parameter page, deriving geometry.
fn read_onfi_geometry<N: BootNand>(nand: &mut N) -> Result<NandGeometry> {
    let mut buf = [0u8; ONFI_PARAM_PAGE_SIZE];
    nand.read_parameter_page(&mut buf)?;
    let page = OnfiParamPage::parse(&buf)?;
    Ok(page.geometry())
}

/// Identify the NAND device and populate its geometry.
///
/// Resets the device, probes for ONFI, and reads the parameter page with
/// up to 3 attempts (some parts return garbage on the first read and need
/// a fresh reset in between). Falls back to the generic READ ID decode for
/// non-ONFI parts. Fails with [`Error::UnsupportedDevice`] when neither
/// path succeeds.
pub fn discover<N: BootNand>(nand: &mut N) -> Result<NandGeometry> {
    nand.reset()?;

    let geometry = if check_onfi(nand)? {
        retry(Fixed::from_millis(0).take(2), || {
            read_onfi_geometry(nand).map_err(|e| {
                debug!("ONFI parameter page attempt failed: {e}");
                // Some parts need a fresh reset before the retry.
                let _ = nand.reset();
                e
            })
        })
        .map_err(|e| {
            warn!("ONFI device, but parameter page never validated: {e:?}");
            Error::UnsupportedDevice
        })?
    } else {
        let mut id = [0u8; 5];
        nand.read_id(0x00, &mut id)?;
        decode_generic_id(&id).map_err(|e| {
            warn!("generic READ ID decode failed: {e}");
            Error::UnsupportedDevice
        })?
    };

    debug!(
        "NAND geometry: {}B pages + {}B OOB, {} pages/block, {} blocks/LUN, {} LUN(s), {}B total",
        geometry.page_size,
        geometry.oob_size,
        geometry.pages_per_block,
        geometry.blocks_per_lun,
        geometry.luns,
        geometry.total_size,
    );

    nand.configure_geometry(&geometry);
    Ok(geometry)
}
