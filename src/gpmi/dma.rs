//! The APBH DMA descriptor engine: compiles logical command steps into a
//! chained descriptor list on one channel and runs it to completion.
//!
//! Every NAND command in this crate is 1–5 chained descriptors (command
//! bytes, address bytes, wait-for-ready, data transfer, completion).
//! Chain building and the always-run teardown live here so higher layers
//! can never forget to reset the channel; a skipped reset wedges the
//! hardware for every subsequent operation.

use super::regs::{self, Mmio, STMP_OFFSET_REG_CLR, STMP_OFFSET_REG_SET};
use crate::{Error, Result};

/// One link in the hardware-walked descriptor list.
///
/// `next` and `buffer` are bus addresses; in this crate they are always
/// computed from the scratch arena's configured base, never from host
/// pointers.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct DmaDescriptor {
    /// Bus address of the next descriptor (valid when CHAIN is set).
    pub next: u32,
    /// Control word: command kind, flags, PIO word count, transfer count.
    pub data: u32,
    /// Bus address of the data buffer, when the command moves data.
    pub buffer: u32,
    /// Up to six words written to the peripheral's PIO registers.
    pub pio: [u32; 6],
}

// Control-word command kinds.
pub const DESC_COMMAND_NO_DMAXFER: u32 = 0x0;
/// Peripheral-to-memory transfer.
pub const DESC_COMMAND_DMA_WRITE: u32 = 0x1;
/// Memory-to-peripheral transfer.
pub const DESC_COMMAND_DMA_READ: u32 = 0x2;
pub const DESC_COMMAND_DMA_SENSE: u32 = 0x3;

pub const DESC_CHAIN: u32 = 1 << 2;
pub const DESC_IRQ: u32 = 1 << 3;
pub const DESC_NAND_LOCK: u32 = 1 << 4;
pub const DESC_NAND_WAIT_4_READY: u32 = 1 << 5;
pub const DESC_DEC_SEM: u32 = 1 << 6;
pub const DESC_WAIT4END: u32 = 1 << 7;

pub const fn desc_pio_words(count: u32) -> u32 {
    count << 12
}

pub const fn desc_xfer_count(bytes: u32) -> u32 {
    bytes << 16
}

/// Bound on every hardware completion poll in this crate.
pub const POLL_BOUND: u32 = 1_000_000;

/// Uncalibrated busy-wait. No timer is initialized this early in boot, so
/// the unit is "iterations", not time.
pub fn spin_delay(iterations: u32) {
    for _ in 0..iterations {
        core::hint::spin_loop();
    }
}

/// One APBH DMA channel.
#[derive(Debug, Copy, Clone)]
pub struct ApbhDma {
    base: u32,
    channel: u8,
}

impl ApbhDma {
    pub fn new(base: u32, channel: u8) -> Self {
        ApbhDma { base, channel }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Point the channel at the head descriptor, prime the semaphore, and
    /// ungate the channel clock so it may run.
    fn enable<M: Mmio>(&self, mmio: &mut M, head: u32) {
        mmio.write32(self.base + regs::hw_apbh_chn_nxtcmdar(self.channel), head);
        mmio.write32(self.base + regs::hw_apbh_chn_sema(self.channel), 1);
        mmio.write32(
            self.base + regs::HW_APBH_CTRL0 + STMP_OFFSET_REG_CLR,
            regs::apbh_chn_clkgate(self.channel),
        );
    }

    /// Assert the per-channel reset bit, returning hardware to a known
    /// state. Run after every chain, success or not.
    fn reset_channel<M: Mmio>(&self, mmio: &mut M) {
        mmio.write32(
            self.base + regs::HW_APBH_CHANNEL_CTRL + STMP_OFFSET_REG_SET,
            regs::apbh_chn_reset(self.channel),
        );
    }

    /// Poll the channel's completion bit, bounded. This is the single most
    /// important failure signal in the subsystem: every higher-level read
    /// bottoms out here.
    fn wait_complete<M: Mmio>(&self, mmio: &mut M) -> Result<()> {
        for _ in 0..POLL_BOUND {
            let ctrl1 = mmio.read32(self.base + regs::HW_APBH_CTRL1);
            if ctrl1 & regs::apbh_chn_complete_irq(self.channel) != 0 {
                return Ok(());
            }
        }
        Err(Error::Timeout("APBH DMA completion"))
    }

    /// Chain `descriptors[..count]`, execute, and block until done.
    ///
    /// Descriptors 0..count-1 get the CHAIN bit and a pointer to their
    /// successor (at `desc_phys(i)`); the final descriptor gets the
    /// terminal IRQ + semaphore-decrement flags. Teardown (IRQ disable,
    /// completion clear, channel reset) always runs, timeout included.
    pub fn run<M, F>(
        &self,
        mmio: &mut M,
        descriptors: &mut [DmaDescriptor],
        count: usize,
        desc_phys: F,
    ) -> Result<()>
    where
        M: Mmio,
        F: Fn(usize) -> u32,
    {
        assert!(count > 0 && count <= descriptors.len());

        for i in 0..count - 1 {
            descriptors[i].next = desc_phys(i + 1);
            descriptors[i].data |= DESC_CHAIN;
        }
        descriptors[count - 1].data |= DESC_IRQ | DESC_DEC_SEM;

        mmio.write32(
            self.base + regs::HW_APBH_CTRL1 + STMP_OFFSET_REG_SET,
            regs::apbh_chn_irq_enable(self.channel),
        );

        self.enable(mmio, desc_phys(0));
        let result = self.wait_complete(mmio);

        mmio.write32(
            self.base + regs::HW_APBH_CTRL1 + STMP_OFFSET_REG_CLR,
            regs::apbh_chn_irq_enable(self.channel) | regs::apbh_chn_complete_irq(self.channel),
        );
        self.reset_channel(mmio);

        result.map_err(|e| Error::Dma {
            channel: self.channel,
            source: Box::new(e),
        })
    }
}
