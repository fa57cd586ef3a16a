//! In-memory NAND device for tests: a [`BootNand`] backend with scriptable
//! page contents and per-page ECC health.
//!
//! Pages are stored sparsely; anything never programmed reads back erased
//! (all 0xFF, and all-0xFF chunk status under ECC). The simulator does not
//! model the randomizer's scrambling itself, only its status semantics, so
//! randomized and plain ECC reads return the same bytes.

use std::collections::HashMap;

use deku::DekuContainerWrite;

use super::ecc::{EccLayout, STATUS_ERASED, STATUS_UNCORRECTABLE};
use super::id::{OnfiParamPage, ONFI_CRC, ONFI_PARAM_PAGE_SIZE};
use super::{BootNand, NandGeometry, ReadMode};
use crate::{Error, Result};

/// Bytes covered by the ONFI parameter page CRC.
const ONFI_CRC_LEN: usize = 254;

/// Scripted ECC outcome for one page.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PageHealth {
    /// All chunks decode clean.
    Clean,
    /// Chunk 0 reports this many corrected bitflips.
    Corrected(u8),
    /// Every chunk reports erased; the transferred data is garbage, as the
    /// randomizer would leave it.
    Erased,
    /// Chunk 0 is uncorrectable.
    Uncorrectable,
    /// The read never completes.
    ReadTimeout,
}

/// In-memory NAND device.
pub struct SimNand {
    geometry: NandGeometry,
    pages: HashMap<u32, Vec<u8>>,
    health: HashMap<u32, PageHealth>,
    id: [u8; 5],
    onfi_param: Option<[u8; ONFI_PARAM_PAGE_SIZE]>,
    layout: Option<EccLayout>,
    resets: u32,
}

impl SimNand {
    /// A blank, fully erased device answering READ ID with zeros.
    pub fn new(geometry: NandGeometry) -> Self {
        SimNand {
            geometry,
            pages: HashMap::new(),
            health: HashMap::new(),
            id: [0; 5],
            onfi_param: None,
            layout: None,
            resets: 0,
        }
    }

    /// A blank ONFI device: the signature probe answers "ONFI" and the
    /// parameter page describes `geometry`.
    pub fn with_onfi(geometry: NandGeometry) -> Self {
        let mut sim = SimNand::new(geometry);
        sim.onfi_param = Some(Self::onfi_param_bytes(&geometry));
        sim
    }

    /// Serialize a CRC-valid ONFI parameter page describing `geometry`.
    pub fn onfi_param_bytes(geometry: &NandGeometry) -> [u8; ONFI_PARAM_PAGE_SIZE] {
        let page = OnfiParamPage {
            signature: *b"ONFI",
            revision: 1 << 1,
            features: 0,
            optional_commands: 0,
            reserved0: [0; 22],
            manufacturer: *b"SIMULATED   ",
            model: *b"SIMNAND             ",
            jedec_manufacturer: 0,
            date_code: 0,
            reserved1: [0; 13],
            data_bytes_per_page: geometry.page_size,
            spare_bytes_per_page: geometry.oob_size as u16,
            data_bytes_per_partial_page: geometry.page_size / 4,
            spare_bytes_per_partial_page: (geometry.oob_size / 4) as u16,
            pages_per_block: geometry.pages_per_block,
            blocks_per_lun: geometry.blocks_per_lun,
            luns_per_target: geometry.luns as u8,
            address_cycles: 0x23,
            bits_per_cell: geometry.bits_per_cell,
            max_bad_blocks_per_lun: 0,
            block_endurance: 0,
            guaranteed_valid_blocks: 1,
            guaranteed_block_endurance: 0,
            programs_per_page: 1,
            partial_programming_attrs: 0,
            ecc_correctability: 8,
            interleaved_address_bits: geometry.planes.trailing_zeros() as u8,
            interleaved_op_attrs: 0,
            reserved2: [0; 13],
            timing_and_vendor: [0; 126],
            crc: 0,
        };

        let bytes = page.to_bytes().expect("parameter page serialization");
        let mut out = [0u8; ONFI_PARAM_PAGE_SIZE];
        out.copy_from_slice(&bytes);
        let crc = ONFI_CRC.checksum(&out[..ONFI_CRC_LEN]);
        out[ONFI_CRC_LEN..].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Override the 5-byte generic READ ID response.
    pub fn set_id(&mut self, id: [u8; 5]) {
        self.id = id;
    }

    /// Script the ECC outcome for one page.
    pub fn set_page_health(&mut self, page: u32, health: PageHealth) {
        self.health.insert(page, health);
    }

    /// Program a page: `data` lands at the start of the data area, `oob` at
    /// the start of the spare area, everything else stays erased.
    pub fn program_page(&mut self, page: u32, data: &[u8], oob: &[u8]) {
        let page_size = self.geometry.page_size as usize;
        let total = page_size + self.geometry.oob_size as usize;
        assert!(data.len() <= page_size && oob.len() <= total - page_size);

        let stored = self
            .pages
            .entry(page)
            .or_insert_with(|| vec![0xFF; total]);
        stored[..data.len()].copy_from_slice(data);
        stored[page_size..page_size + oob.len()].copy_from_slice(oob);
    }

    /// Number of RESETs issued so far.
    pub fn reset_count(&self) -> u32 {
        self.resets
    }

    fn stored_page(&self, page: u32) -> Option<&[u8]> {
        self.pages.get(&page).map(Vec::as_slice)
    }
}

impl BootNand for SimNand {
    fn reset(&mut self) -> Result<()> {
        self.resets += 1;
        Ok(())
    }

    fn read_id(&mut self, addr: u8, out: &mut [u8]) -> Result<()> {
        out.fill(0);
        match addr {
            0x20 => {
                if self.onfi_param.is_some() {
                    let n = out.len().min(4);
                    out[..n].copy_from_slice(&b"ONFI"[..n]);
                }
            }
            0x00 => {
                let n = out.len().min(self.id.len());
                out[..n].copy_from_slice(&self.id[..n]);
            }
            _ => {}
        }
        Ok(())
    }

    fn read_parameter_page(&mut self, out: &mut [u8]) -> Result<()> {
        out.fill(0);
        if let Some(param) = &self.onfi_param {
            let n = out.len().min(param.len());
            out[..n].copy_from_slice(&param[..n]);
        }
        Ok(())
    }

    fn set_ecc_layout(&mut self, layout: &EccLayout) -> Result<()> {
        self.layout = Some(*layout);
        Ok(())
    }

    fn read_page(&mut self, page: u32, mode: ReadMode, out: &mut [u8]) -> Result<()> {
        let health = self
            .health
            .get(&page)
            .copied()
            .unwrap_or(PageHealth::Clean);
        if health == PageHealth::ReadTimeout {
            return Err(Error::Timeout("simulated page read"));
        }

        let page_size = self.geometry.page_size as usize;
        let raw_len = page_size + self.geometry.oob_size as usize;

        match mode {
            ReadMode::Raw => {
                if out.len() > raw_len {
                    return Err(Error::BufferTooSmall {
                        needed: out.len(),
                        have: raw_len,
                    });
                }
                match self.stored_page(page) {
                    Some(stored) => out.copy_from_slice(&stored[..out.len()]),
                    None => out.fill(0xFF),
                }
            }
            ReadMode::Ecc { randomizer: _ } => {
                let layout = self.layout.ok_or(Error::EccLayoutNotSet)?;
                let needed = layout.buffer_len();
                if out.len() < needed {
                    return Err(Error::BufferTooSmall {
                        needed,
                        have: out.len(),
                    });
                }
                let out = &mut out[..needed];

                let data_len = layout.data_len();
                let meta = layout.metadata_size as usize;
                let status_offset = layout.status_offset();
                let chunks = layout.chunk_count as usize;

                match self.stored_page(page) {
                    Some(stored) => {
                        out[..data_len].copy_from_slice(&stored[..data_len]);
                        out[data_len..data_len + meta]
                            .copy_from_slice(&stored[page_size..page_size + meta]);
                        out[status_offset..status_offset + chunks].fill(0x00);
                    }
                    None => {
                        // Erased page: garbage data, all-erased status, the
                        // way the randomizer leaves it.
                        out[..status_offset].fill(0x3A);
                        out[status_offset..status_offset + chunks].fill(STATUS_ERASED);
                    }
                }

                match health {
                    PageHealth::Clean => {}
                    PageHealth::Corrected(flips) => out[status_offset] = flips,
                    PageHealth::Erased => {
                        out[..status_offset].fill(0x3A);
                        out[status_offset..status_offset + chunks].fill(STATUS_ERASED);
                    }
                    PageHealth::Uncorrectable => out[status_offset] = STATUS_UNCORRECTABLE,
                    PageHealth::ReadTimeout => unreachable!(),
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> NandGeometry {
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

    fn firmware_layout() -> EccLayout {
        EccLayout {
            metadata_size: 10,
            block0_size: 512,
            blockn_size: 512,
            ecc0_strength: 8,
            eccn_strength: 8,
            chunk_count: 4,
            gf_len: 13,
            total_page_size: 2048 + 64,
        }
    }

    #[test]
    fn test_raw_read_of_erased_page() {
        let mut sim = SimNand::new(geometry());
        let mut buf = vec![0u8; 2048 + 64];
        sim.read_page(7, ReadMode::Raw, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_ecc_read_splits_data_and_metadata() {
        let mut sim = SimNand::new(geometry());
        sim.set_ecc_layout(&firmware_layout()).unwrap();

        let data = vec![0x11u8; 2048];
        let oob = vec![0x22u8; 10];
        sim.program_page(3, &data, &oob);

        let layout = firmware_layout();
        let mut buf = vec![0u8; layout.buffer_len()];
        sim.read_page(3, ReadMode::Ecc { randomizer: false }, &mut buf)
            .unwrap();

        assert!(buf[..2048].iter().all(|&b| b == 0x11));
        assert!(buf[2048..2058].iter().all(|&b| b == 0x22));
        layout.check_status(&buf).unwrap();
    }

    #[test]
    fn test_scripted_health() {
        let mut sim = SimNand::new(geometry());
        sim.set_ecc_layout(&firmware_layout()).unwrap();
        sim.program_page(5, &[0u8; 2048], &[]);
        sim.set_page_health(5, PageHealth::Uncorrectable);

        let layout = firmware_layout();
        let mut buf = vec![0u8; layout.buffer_len()];
        sim.read_page(5, ReadMode::Ecc { randomizer: false }, &mut buf)
            .unwrap();
        assert!(matches!(
            layout.check_status(&buf),
            Err(Error::UncorrectableEcc)
        ));
    }

    #[test]
    fn test_ecc_read_requires_layout() {
        let mut sim = SimNand::new(geometry());
        let mut buf = vec![0u8; 4096];
        assert!(matches!(
            sim.read_page(0, ReadMode::Ecc { randomizer: false }, &mut buf),
            Err(Error::EccLayoutNotSet)
        ));
    }
}
