//! The boot orchestrator: the one call that takes a CPU with nothing but
//! a NAND controller to a firmware image in RAM.
//!
//! The sequence is fixed: identify the device, find the FCB, program the
//! ECC layout it describes, look for a DBBT, then stream the firmware with
//! bad blocks skipped and the redundant copy as the only fallback.

use log::info;

use crate::dbbt;
use crate::fcb::{self, Fcb, FcbStrategy};
use crate::gpmi::regs::{ControllerBases, DirectMmio};
use crate::gpmi::{BootScratchArena, GpmiNand};
use crate::nand::ecc::EccLayout;
use crate::nand::{id, BootNand};
use crate::{stream, Result};

/// Per-SoC boot parameters: FCB encoding, controller addresses, and the
/// APBH channel / chip select the NAND hangs off.
#[derive(Debug, Copy, Clone)]
pub struct TargetParams {
    pub strategy: FcbStrategy,
    pub bases: ControllerBases,
    pub dma_channel: u8,
    pub chip_select: u8,
}

impl TargetParams {
    pub const fn imx6() -> Self {
        TargetParams {
            strategy: FcbStrategy::Imx6,
            bases: ControllerBases::imx6(),
            dma_channel: 0,
            chip_select: 0,
        }
    }

    pub const fn imx7() -> Self {
        TargetParams {
            strategy: FcbStrategy::Imx7,
            bases: ControllerBases::imx7(),
            dma_channel: 0,
            chip_select: 0,
        }
    }

    /// Build the on-target driver, with its scratch arena at the given
    /// bus address.
    pub fn into_nand(self, arena_phys_base: u32) -> GpmiNand<DirectMmio> {
        GpmiNand::new(
            DirectMmio,
            self.bases,
            self.dma_channel,
            self.chip_select,
            BootScratchArena::new(arena_phys_base),
        )
    }

    /// Run the whole boot-read pipeline on target.
    pub fn load(self, arena_phys_base: u32, dest: &mut [u8]) -> Result<usize> {
        let strategy = self.strategy;
        let mut nand = self.into_nand(arena_phys_base);
        load_image(&mut nand, strategy, dest)
    }
}

/// Load the firmware image into `dest`, returning the number of bytes
/// written. Generic over the backend so the whole pipeline also runs
/// against [`crate::nand::sim::SimNand`].
pub fn load_image<N: BootNand>(nand: &mut N, strategy: FcbStrategy, dest: &mut [u8]) -> Result<usize> {
    let geometry = id::discover(nand)?;

    // One scratch buffer serves every stage; sized for the largest of the
    // raw FCB candidate read, the fixed i.MX7 FCB layout, and (after the
    // FCB is in hand) the firmware page layout.
    let raw_len = (geometry.page_size + geometry.oob_size) as usize;
    let mut scratch = vec![0u8; raw_len.max(EccLayout::imx7_fcb().buffer_len())];

    let fcb = fcb::locate(nand, strategy, &geometry, &mut scratch)?;
    log_fcb(&fcb);

    let firmware_buf = EccLayout::from_fcb(&fcb).buffer_len();
    if scratch.len() < firmware_buf {
        scratch.resize(firmware_buf, 0);
    }

    let bad_blocks = dbbt::locate(nand, &fcb, &mut scratch)?;

    let written = stream::load_firmware(nand, &fcb, bad_blocks.as_ref(), dest, &mut scratch)?;
    info!("firmware image loaded: {written} bytes");
    Ok(written)
}

fn log_fcb(fcb: &Fcb) {
    info!(
        "FCB: {}B pages, firmware copies at pages {} ({} pages) and {} ({} pages)",
        fcb.page_data_size,
        fcb.firmware1_starting_page,
        fcb.pages_in_firmware1,
        fcb.firmware2_starting_page,
        fcb.pages_in_firmware2,
    );
}
