//! The NAND device model: discovered geometry and the controller seam the
//! boot pipeline is written against.
//!
//! Everything above the command primitives (discovery, FCB/DBBT search,
//! firmware streaming) talks to [`BootNand`]. The real implementation is
//! [`crate::gpmi::GpmiNand`]; tests substitute [`sim::SimNand`].

use crate::Result;

pub mod ecc;
pub mod id;
pub mod sim;

use ecc::EccLayout;

/// Parameters of the NAND device, discovered once before the FCB search and
/// immutable afterwards.
///
/// Populated either from the ONFI parameter page or from the generic
/// READ ID decode; only ever lives in boot-time memory.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NandGeometry {
    /// Main data area of one page, in bytes.
    pub page_size: u32,
    /// Spare (OOB) area of one page, in bytes.
    pub oob_size: u32,
    /// Pages per erase block.
    pub pages_per_block: u32,
    /// Erase blocks per LUN.
    pub blocks_per_lun: u32,
    /// LUNs per target.
    pub luns: u32,
    /// Bits stored per cell (1 = SLC).
    pub bits_per_cell: u8,
    /// Planes per LUN.
    pub planes: u32,
    /// Total device size in bytes.
    pub total_size: u64,
}

impl NandGeometry {
    /// Total number of pages on the device. Used to pick the row address
    /// cycle count for READ0.
    pub fn total_pages(&self) -> u32 {
        self.pages_per_block * self.blocks_per_lun * self.luns
    }
}

/// How a page read moves data out of the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReadMode {
    /// Plain transfer of data + OOB, bypassing the ECC pipeline. Used for
    /// the i.MX6 FCB candidates, whose own checksum is the integrity check.
    Raw,
    /// Transfer through the BCH engine. The randomizer (keyed by
    /// `page % 256`) is required by the i.MX7 FCB encoding and unused
    /// otherwise.
    Ecc { randomizer: bool },
}

/// The controller seam: the NAND operations the boot pipeline needs.
///
/// For [`ReadMode::Ecc`] reads, `out` receives the decoded data area
/// followed by the auxiliary region: metadata bytes, then (4-byte aligned)
/// one status byte per ECC chunk, exactly as the GPMI payload/auxiliary
/// split delivers them. See [`EccLayout::status_offset`].
pub trait BootNand {
    /// Issue NAND RESET and wait for the device to report ready.
    fn reset(&mut self) -> Result<()>;

    /// Issue READ ID with the given sub-address (0x00 for the device ID,
    /// 0x20 for the ONFI signature probe) and read `out.len()` bytes.
    fn read_id(&mut self, addr: u8, out: &mut [u8]) -> Result<()>;

    /// Issue READ PARAMETER PAGE and read `out.len()` bytes of the ONFI
    /// parameter structure. No CRC checking happens at this layer.
    fn read_parameter_page(&mut self, out: &mut [u8]) -> Result<()>;

    /// Program the ECC engine's flash layout. Affects all subsequent
    /// [`ReadMode::Ecc`] reads.
    fn set_ecc_layout(&mut self, layout: &EccLayout) -> Result<()>;

    /// Inform the controller of the discovered geometry (address cycle
    /// count). Called once by discovery; the default is a no-op for
    /// backends that do not need it.
    fn configure_geometry(&mut self, _geometry: &NandGeometry) {}

    /// Read one page into `out` per `mode`.
    fn read_page(&mut self, page: u32, mode: ReadMode, out: &mut [u8]) -> Result<()>;
}
