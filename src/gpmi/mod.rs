//! The GPMI NAND controller driver: each NAND command primitive compiles
//! into one descriptor chain on the APBH DMA channel and runs
//! synchronously.
//!
//! All scratch memory — the descriptor pool, the command byte buffer, and
//! the page buffer — lives in one [`BootScratchArena`] at
//! compile-time-known offsets from a single base address, because no
//! allocator exists at this boot stage. Zeroing the descriptor pool is the
//! first act of every primitive; that convention is the only locking this
//! single-threaded code needs.

pub mod dma;
pub mod regs;

use log::trace;

use crate::nand::ecc::EccLayout;
use crate::nand::{BootNand, NandGeometry, ReadMode};
use crate::{Error, Result};
use dma::{spin_delay, ApbhDma, DmaDescriptor, POLL_BOUND};
use regs::{ControllerBases, Mmio, STMP_OFFSET_REG_CLR};

/// Descriptor pool size; the longest chain (ECC page read) uses 5.
pub const DESC_POOL_LEN: usize = 8;
/// Command/address byte buffer; the longest sequence is READ0 + 4 row
/// bytes + READSTART.
pub const CMD_BUF_LEN: usize = 16;
/// Page buffer: the largest supported page plus auxiliary data.
pub const PAGE_BUF_LEN: usize = 4096 + 512;

const DESC_POOL_BYTES: usize = DESC_POOL_LEN * core::mem::size_of::<DmaDescriptor>();

/// The fixed scratch region every hardware operation works out of.
///
/// `phys_base` is the bus address the region sits at on target; all
/// descriptor/buffer addresses handed to hardware derive from it. A test
/// harness supplies any base it likes, since the mock never dereferences.
pub struct BootScratchArena {
    phys_base: u32,
    pub descriptors: [DmaDescriptor; DESC_POOL_LEN],
    pub cmd_buf: [u8; CMD_BUF_LEN],
    pub page_buf: [u8; PAGE_BUF_LEN],
}

impl BootScratchArena {
    pub fn new(phys_base: u32) -> Self {
        BootScratchArena {
            phys_base,
            descriptors: [DmaDescriptor::default(); DESC_POOL_LEN],
            cmd_buf: [0; CMD_BUF_LEN],
            page_buf: [0; PAGE_BUF_LEN],
        }
    }

    pub fn desc_phys(&self, index: usize) -> u32 {
        self.phys_base + (index * core::mem::size_of::<DmaDescriptor>()) as u32
    }

    pub fn cmd_phys(&self) -> u32 {
        self.phys_base + DESC_POOL_BYTES as u32
    }

    pub fn page_phys(&self) -> u32 {
        self.cmd_phys() + CMD_BUF_LEN as u32
    }

    fn clear_descriptors(&mut self) {
        self.descriptors = [DmaDescriptor::default(); DESC_POOL_LEN];
    }
}

/// The GPMI/BCH/APBH driver implementing [`BootNand`] on real registers.
pub struct GpmiNand<M: Mmio> {
    mmio: M,
    bases: ControllerBases,
    dma: ApbhDma,
    arena: BootScratchArena,
    cs: u8,
    total_pages: u32,
    layout: Option<EccLayout>,
}

impl<M: Mmio> GpmiNand<M> {
    pub fn new(mmio: M, bases: ControllerBases, channel: u8, cs: u8, arena: BootScratchArena) -> Self {
        let dma = ApbhDma::new(bases.apbh, channel);
        GpmiNand {
            mmio,
            bases,
            dma,
            arena,
            cs,
            total_pages: 0,
            layout: None,
        }
    }

    /// Run the first `count` descriptors of the pool as one chain.
    fn run_chain(&mut self, count: usize) -> Result<()> {
        let phys_base = self.arena.phys_base;
        let stride = core::mem::size_of::<DmaDescriptor>() as u32;
        self.dma.run(
            &mut self.mmio,
            &mut self.arena.descriptors,
            count,
            |i| phys_base + i as u32 * stride,
        )
    }

    /// Compile a "write command/address bytes" descriptor: `len` bytes
    /// from the command buffer, driven as CLE then ALE cycles.
    fn command_descriptor(&mut self, index: usize, len: u32, address_increment: bool) {
        let mut ctrl0 = regs::gpmi_ctrl0(
            regs::GPMI_CTRL0_COMMAND_MODE_WRITE,
            regs::GPMI_CTRL0_ADDRESS_NAND_CLE,
            self.cs,
            len,
        );
        if address_increment {
            ctrl0 |= regs::GPMI_CTRL0_ADDRESS_INCREMENT;
        }

        let cmd_phys = self.arena.cmd_phys();
        let d = &mut self.arena.descriptors[index];
        d.data = dma::DESC_COMMAND_DMA_READ
            | dma::DESC_WAIT4END
            | dma::desc_pio_words(3)
            | dma::desc_xfer_count(len);
        d.buffer = cmd_phys;
        d.pio[0] = ctrl0;
    }

    /// Compile a "wait for device ready" descriptor.
    fn wait_ready_descriptor(&mut self, index: usize) {
        let d = &mut self.arena.descriptors[index];
        d.data = dma::DESC_COMMAND_NO_DMAXFER
            | dma::DESC_NAND_WAIT_4_READY
            | dma::DESC_WAIT4END
            | dma::desc_pio_words(1);
        d.pio[0] = regs::gpmi_ctrl0(
            regs::GPMI_CTRL0_COMMAND_MODE_WAIT_FOR_READY,
            regs::GPMI_CTRL0_ADDRESS_NAND_DATA,
            self.cs,
            0,
        );
    }

    /// Compile a plain device-to-memory data transfer descriptor.
    fn data_read_descriptor(&mut self, index: usize, len: u32) {
        let page_phys = self.arena.page_phys();
        let d = &mut self.arena.descriptors[index];
        d.data = dma::DESC_COMMAND_DMA_WRITE
            | dma::DESC_WAIT4END
            | dma::desc_pio_words(1)
            | dma::desc_xfer_count(len);
        d.buffer = page_phys;
        d.pio[0] = regs::gpmi_ctrl0(
            regs::GPMI_CTRL0_COMMAND_MODE_READ,
            regs::GPMI_CTRL0_ADDRESS_NAND_DATA,
            self.cs,
            len,
        );
    }

    /// Issue READ STATUS and return the status byte.
    fn read_status(&mut self) -> Result<u8> {
        self.arena.clear_descriptors();
        self.arena.cmd_buf[0] = regs::NAND_CMD_STATUS;
        self.command_descriptor(0, 1, false);
        self.data_read_descriptor(1, 1);
        self.run_chain(2)?;
        Ok(self.arena.page_buf[0])
    }

    /// Row address cycle count: 3 covers devices up to 65536 pages.
    fn row_address_cycles(&self) -> usize {
        if self.total_pages.saturating_sub(1) >= 65536 {
            4
        } else {
            3
        }
    }

    /// Bounded poll of the BCH completion interrupt, then clear it.
    fn wait_bch_complete(&mut self) -> Result<()> {
        for _ in 0..POLL_BOUND {
            let ctrl = self.mmio.read32(self.bases.bch + regs::HW_BCH_CTRL);
            if ctrl & regs::BCH_CTRL_COMPLETE_IRQ != 0 {
                self.mmio.write32(
                    self.bases.bch + regs::HW_BCH_CTRL + STMP_OFFSET_REG_CLR,
                    regs::BCH_CTRL_COMPLETE_IRQ,
                );
                return Ok(());
            }
        }
        Err(Error::Timeout("BCH completion"))
    }
}

impl<M: Mmio> BootNand for GpmiNand<M> {
    fn reset(&mut self) -> Result<()> {
        self.arena.clear_descriptors();
        self.arena.cmd_buf[0] = regs::NAND_CMD_RESET;
        self.command_descriptor(0, 1, false);
        self.run_chain(1)?;

        // The reset-wait budget is a retry count, not a time; no timer
        // exists this early in boot.
        for _ in 0..10 {
            spin_delay(50_000);
            if self.read_status()? & regs::NAND_STATUS_READY != 0 {
                return Ok(());
            }
        }
        Err(Error::DeviceNotResponding)
    }

    fn read_id(&mut self, addr: u8, out: &mut [u8]) -> Result<()> {
        trace!("READ ID @{addr:#04x}, {} bytes", out.len());
        self.arena.clear_descriptors();
        self.arena.cmd_buf[0] = regs::NAND_CMD_READID;
        self.arena.cmd_buf[1] = addr;
        self.command_descriptor(0, 2, true);
        self.data_read_descriptor(1, out.len() as u32);
        self.run_chain(2)?;
        out.copy_from_slice(&self.arena.page_buf[..out.len()]);
        Ok(())
    }

    fn read_parameter_page(&mut self, out: &mut [u8]) -> Result<()> {
        self.arena.clear_descriptors();
        self.arena.cmd_buf[0] = regs::NAND_CMD_PARAM;
        self.arena.cmd_buf[1] = 0x00;
        self.command_descriptor(0, 2, true);
        self.wait_ready_descriptor(1);
        self.data_read_descriptor(2, out.len() as u32);
        self.run_chain(3)?;
        out.copy_from_slice(&self.arena.page_buf[..out.len()]);
        Ok(())
    }

    fn set_ecc_layout(&mut self, layout: &EccLayout) -> Result<()> {
        let gf13 = layout.gf_len == 13;
        self.mmio.write32(
            self.bases.bch + regs::HW_BCH_FLASH0LAYOUT0,
            regs::bch_flash0layout0(
                layout.chunk_count as u8 - 1,
                layout.metadata_size,
                layout.ecc0_strength,
                gf13,
                layout.block0_size,
            ),
        );
        self.mmio.write32(
            self.bases.bch + regs::HW_BCH_FLASH0LAYOUT1,
            regs::bch_flash0layout1(
                layout.total_page_size,
                layout.eccn_strength,
                gf13,
                layout.blockn_size,
            ),
        );
        self.layout = Some(*layout);
        Ok(())
    }

    fn configure_geometry(&mut self, geometry: &NandGeometry) {
        self.total_pages = geometry.total_pages();
    }

    fn read_page(&mut self, page: u32, mode: ReadMode, out: &mut [u8]) -> Result<()> {
        self.arena.clear_descriptors();

        let cycles = self.row_address_cycles();
        self.arena.cmd_buf[0] = regs::NAND_CMD_READ0;
        let row = page.to_le_bytes();
        self.arena.cmd_buf[1..1 + cycles].copy_from_slice(&row[..cycles]);
        let readstart_at = 1 + cycles;
        self.arena.cmd_buf[readstart_at] = regs::NAND_CMD_READSTART;

        // READ0 + row address bytes.
        self.command_descriptor(0, (1 + cycles) as u32, true);

        // READSTART, from its own offset in the command buffer.
        self.command_descriptor(1, 1, false);
        let readstart_phys = self.arena.cmd_phys() + readstart_at as u32;
        self.arena.descriptors[1].buffer = readstart_phys;

        self.wait_ready_descriptor(2);

        match mode {
            ReadMode::Raw => {
                let len = out.len() as u32;
                if out.len() > PAGE_BUF_LEN {
                    return Err(Error::BufferTooSmall {
                        needed: out.len(),
                        have: PAGE_BUF_LEN,
                    });
                }
                self.data_read_descriptor(3, len);
                self.run_chain(4)?;
                out.copy_from_slice(&self.arena.page_buf[..out.len()]);
            }
            ReadMode::Ecc { randomizer } => {
                let layout = self.layout.ok_or(Error::EccLayoutNotSet)?;
                let needed = layout.buffer_len();
                if out.len() < needed {
                    return Err(Error::BufferTooSmall {
                        needed,
                        have: out.len(),
                    });
                }

                let total = layout.total_page_size;
                let mut eccctrl = regs::GPMI_ECCCTRL_ENABLE_ECC
                    | regs::GPMI_ECCCTRL_ECC_CMD_DECODE
                    | regs::GPMI_ECCCTRL_BUFFER_MASK_BCH_PAGE;
                if randomizer {
                    eccctrl |= regs::GPMI_ECCCTRL_RANDOMIZER_ENABLE
                        | regs::GPMI_ECCCTRL_RANDOMIZER_TYPE2
                        | ((page % 256) << regs::GPMI_ECCCTRL_RANDOMIZER_PAGE_SHIFT);
                }

                let payload = self.arena.page_phys();
                let auxiliary = payload + layout.data_len() as u32;

                // Transfer through the BCH engine: the DMA moves nothing
                // itself, the engine scatters payload and auxiliary.
                let d = &mut self.arena.descriptors[3];
                d.data = dma::DESC_COMMAND_NO_DMAXFER
                    | dma::DESC_WAIT4END
                    | dma::desc_pio_words(6);
                d.pio[0] = regs::gpmi_ctrl0(
                    regs::GPMI_CTRL0_COMMAND_MODE_READ,
                    regs::GPMI_CTRL0_ADDRESS_NAND_DATA,
                    self.cs,
                    total,
                );
                d.pio[1] = 0;
                d.pio[2] = eccctrl;
                d.pio[3] = total;
                d.pio[4] = payload;
                d.pio[5] = auxiliary;

                // Disable the ECC engine again, holding until ready.
                let d = &mut self.arena.descriptors[4];
                d.data = dma::DESC_COMMAND_NO_DMAXFER
                    | dma::DESC_NAND_WAIT_4_READY
                    | dma::DESC_WAIT4END
                    | dma::desc_pio_words(3);
                d.pio[0] = regs::gpmi_ctrl0(
                    regs::GPMI_CTRL0_COMMAND_MODE_WAIT_FOR_READY,
                    regs::GPMI_CTRL0_ADDRESS_NAND_DATA,
                    self.cs,
                    0,
                );

                self.run_chain(5)?;
                self.wait_bch_complete()?;
                out[..needed].copy_from_slice(&self.arena.page_buf[..needed]);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASES: ControllerBases = ControllerBases {
        apbh: 0x1000,
        gpmi: 0x2000,
        bch: 0x3000,
    };

    /// Completes every DMA chain when the semaphore is primed, reports BCH
    /// completion immediately, and honors the SET/CLR aliases on CTRL1.
    struct ScriptedMmio {
        writes: Vec<(u32, u32)>,
        apbh_ctrl1: u32,
        dma_completes: bool,
    }

    impl ScriptedMmio {
        fn new() -> Self {
            ScriptedMmio {
                writes: Vec::new(),
                apbh_ctrl1: 0,
                dma_completes: true,
            }
        }
    }

    impl Mmio for ScriptedMmio {
        fn read32(&mut self, addr: u32) -> u32 {
            if addr == BASES.apbh + regs::HW_APBH_CTRL1 {
                self.apbh_ctrl1
            } else if addr == BASES.bch + regs::HW_BCH_CTRL {
                regs::BCH_CTRL_COMPLETE_IRQ
            } else {
                0
            }
        }

        fn write32(&mut self, addr: u32, value: u32) {
            if addr == BASES.apbh + regs::hw_apbh_chn_sema(0) && self.dma_completes {
                self.apbh_ctrl1 |= regs::apbh_chn_complete_irq(0);
            }
            if addr == BASES.apbh + regs::HW_APBH_CTRL1 + STMP_OFFSET_REG_CLR {
                self.apbh_ctrl1 &= !value;
            }
            self.writes.push((addr, value));
        }
    }

    fn driver() -> GpmiNand<ScriptedMmio> {
        GpmiNand::new(
            ScriptedMmio::new(),
            BASES,
            0,
            0,
            BootScratchArena::new(0x0090_7000),
        )
    }

    #[test]
    fn test_read_id_chain_shape() {
        let mut nand = driver();
        let mut id = [0u8; 5];
        nand.read_id(0x00, &mut id).unwrap();

        let d0 = &nand.arena.descriptors[0];
        assert_eq!(d0.buffer, nand.arena.cmd_phys());
        assert_eq!(d0.data & 0x3, dma::DESC_COMMAND_DMA_READ);
        assert_ne!(d0.pio[0] & regs::GPMI_CTRL0_ADDRESS_INCREMENT, 0);
        assert_eq!(d0.pio[0] & regs::GPMI_CTRL0_XFER_COUNT_MASK, 2);
        assert_eq!(nand.arena.cmd_buf[0], regs::NAND_CMD_READID);

        let d1 = &nand.arena.descriptors[1];
        assert_eq!(d1.buffer, nand.arena.page_phys());
        assert_eq!(d1.data & 0x3, dma::DESC_COMMAND_DMA_WRITE);
        // Terminal flags landed on the last descriptor of the chain.
        assert_ne!(d1.data & (dma::DESC_IRQ | dma::DESC_DEC_SEM), 0);
    }

    #[test]
    fn test_reset_ready_short_circuit() {
        let mut nand = driver();
        // The mock DMA never moves data; pre-seed the status byte the
        // way a ready device would leave it.
        nand.arena.page_buf[0] = regs::NAND_STATUS_READY;
        nand.reset().unwrap();
    }

    #[test]
    fn test_reset_exhausts_status_polls() {
        let mut nand = driver();
        // Status byte stays 0: never ready.
        let err = nand.reset().unwrap_err();
        assert!(matches!(err, Error::DeviceNotResponding));

        // One RESET chain plus ten READ STATUS chains were issued.
        let sema_writes = nand
            .mmio
            .writes
            .iter()
            .filter(|(a, _)| *a == BASES.apbh + regs::hw_apbh_chn_sema(0))
            .count();
        assert_eq!(sema_writes, 11);
    }

    #[test]
    fn test_ecc_read_descriptor_and_randomizer() {
        let mut nand = driver();
        nand.configure_geometry(&NandGeometry {
            page_size: 4096,
            oob_size: 64,
            pages_per_block: 64,
            blocks_per_lun: 2048,
            luns: 1,
            bits_per_cell: 1,
            planes: 1,
            total_size: 4096 * 64 * 2048,
        });
        let layout = EccLayout::imx7_fcb();
        nand.set_ecc_layout(&layout).unwrap();

        let mut out = vec![0u8; layout.buffer_len()];
        nand.read_page(0x1234, ReadMode::Ecc { randomizer: true }, &mut out)
            .unwrap();

        // 4 row address cycles for a device this large.
        assert_eq!(nand.arena.cmd_buf[..5], [0x00, 0x34, 0x12, 0x00, 0x00]);
        assert_eq!(nand.arena.cmd_buf[5], regs::NAND_CMD_READSTART);

        let ecc = &nand.arena.descriptors[3];
        assert_ne!(ecc.pio[2] & regs::GPMI_ECCCTRL_ENABLE_ECC, 0);
        assert_ne!(ecc.pio[2] & regs::GPMI_ECCCTRL_RANDOMIZER_ENABLE, 0);
        assert_eq!(ecc.pio[2] >> regs::GPMI_ECCCTRL_RANDOMIZER_PAGE_SHIFT, 0x34);
        assert_eq!(ecc.pio[4], nand.arena.page_phys());
        assert_eq!(ecc.pio[5], nand.arena.page_phys() + layout.data_len() as u32);

        // Layout registers were programmed.
        assert!(nand
            .mmio
            .writes
            .iter()
            .any(|(a, _)| *a == BASES.bch + regs::HW_BCH_FLASH0LAYOUT0));
    }

    #[test]
    fn test_ecc_read_requires_layout() {
        let mut nand = driver();
        let mut out = vec![0u8; 4608];
        let err = nand
            .read_page(0, ReadMode::Ecc { randomizer: false }, &mut out)
            .unwrap_err();
        assert!(matches!(err, Error::EccLayoutNotSet));
    }
}
