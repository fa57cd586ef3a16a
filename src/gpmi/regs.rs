//! Register-level interface to the APBH DMA controller, the GPMI NAND
//! front-end, and the BCH ECC engine.
//!
//! Offsets and bitfields follow the i.MX28/i.MX6-family public layouts.
//! All register access goes through [`Mmio`], so the drivers can run
//! against a recorded mock off-target; [`DirectMmio`] is the volatile
//! on-target implementation.
//!
//! These blocks use the STMP register convention: every control register
//! has set/clear aliases at fixed offsets, and the drivers must use those
//! aliases instead of read-modify-write.

/// 32-bit memory-mapped register access.
pub trait Mmio {
    fn read32(&mut self, addr: u32) -> u32;
    fn write32(&mut self, addr: u32, value: u32);
}

/// Volatile access at physical addresses, for on-target use.
///
/// Every access goes straight to the bus; only meaningful when the address
/// map actually contains the i.MX peripherals.
pub struct DirectMmio;

impl Mmio for DirectMmio {
    fn read32(&mut self, addr: u32) -> u32 {
        unsafe { core::ptr::read_volatile(addr as usize as *const u32) }
    }

    fn write32(&mut self, addr: u32, value: u32) {
        unsafe { core::ptr::write_volatile(addr as usize as *mut u32, value) }
    }
}

/// Controller base addresses for one SoC.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ControllerBases {
    pub apbh: u32,
    pub gpmi: u32,
    pub bch: u32,
}

impl ControllerBases {
    pub const fn imx6() -> Self {
        ControllerBases {
            apbh: 0x0011_0000,
            gpmi: 0x0011_2000,
            bch: 0x0011_4000,
        }
    }

    pub const fn imx7() -> Self {
        ControllerBases {
            apbh: 0x3300_0000,
            gpmi: 0x3300_2000,
            bch: 0x3300_4000,
        }
    }
}

// STMP set/clear register-offset aliases.
pub const STMP_OFFSET_REG_SET: u32 = 0x4;
pub const STMP_OFFSET_REG_CLR: u32 = 0x8;

// ---------------------------------------------------------------------------
// APBH DMA controller
// ---------------------------------------------------------------------------

/// CTRL0: clock gates per channel in the low half.
pub const HW_APBH_CTRL0: u32 = 0x000;
/// CTRL1: per-channel completion IRQ bits [15:0], IRQ enables [31:16].
pub const HW_APBH_CTRL1: u32 = 0x010;
/// CHANNEL_CTRL: per-channel reset bits in [31:16].
pub const HW_APBH_CHANNEL_CTRL: u32 = 0x030;

const APBH_CHANNEL_STRIDE: u32 = 0x70;

/// Per-channel next-command-descriptor address register.
pub const fn hw_apbh_chn_nxtcmdar(channel: u8) -> u32 {
    0x110 + APBH_CHANNEL_STRIDE * channel as u32
}

/// Per-channel semaphore register.
pub const fn hw_apbh_chn_sema(channel: u8) -> u32 {
    0x140 + APBH_CHANNEL_STRIDE * channel as u32
}

pub const fn apbh_chn_clkgate(channel: u8) -> u32 {
    1 << channel
}

pub const fn apbh_chn_complete_irq(channel: u8) -> u32 {
    1 << channel
}

pub const fn apbh_chn_irq_enable(channel: u8) -> u32 {
    1 << (16 + channel)
}

pub const fn apbh_chn_reset(channel: u8) -> u32 {
    1 << (16 + channel)
}

// ---------------------------------------------------------------------------
// GPMI NAND controller
// ---------------------------------------------------------------------------

pub const HW_GPMI_CTRL0: u32 = 0x000;
pub const HW_GPMI_COMPARE: u32 = 0x010;
pub const HW_GPMI_ECCCTRL: u32 = 0x020;
pub const HW_GPMI_ECCCOUNT: u32 = 0x030;
pub const HW_GPMI_PAYLOAD: u32 = 0x040;
pub const HW_GPMI_AUXILIARY: u32 = 0x050;

// CTRL0 command modes.
pub const GPMI_CTRL0_COMMAND_MODE_WRITE: u32 = 0 << 24;
pub const GPMI_CTRL0_COMMAND_MODE_READ: u32 = 1 << 24;
pub const GPMI_CTRL0_COMMAND_MODE_READ_AND_COMPARE: u32 = 2 << 24;
pub const GPMI_CTRL0_COMMAND_MODE_WAIT_FOR_READY: u32 = 3 << 24;

pub const GPMI_CTRL0_WORD_LENGTH_8BIT: u32 = 1 << 23;
pub const GPMI_CTRL0_CS_SHIFT: u32 = 20;
pub const GPMI_CTRL0_LOCK_CS: u32 = 1 << 27;

// CTRL0 address-select: which NAND cycle type the transfer drives.
pub const GPMI_CTRL0_ADDRESS_NAND_DATA: u32 = 0 << 17;
pub const GPMI_CTRL0_ADDRESS_NAND_CLE: u32 = 1 << 17;
pub const GPMI_CTRL0_ADDRESS_NAND_ALE: u32 = 2 << 17;
pub const GPMI_CTRL0_ADDRESS_INCREMENT: u32 = 1 << 16;

pub const GPMI_CTRL0_XFER_COUNT_MASK: u32 = 0xFFFF;

// ECCCTRL fields.
pub const GPMI_ECCCTRL_ECC_CMD_DECODE: u32 = 0 << 13;
pub const GPMI_ECCCTRL_ECC_CMD_ENCODE: u32 = 1 << 13;
pub const GPMI_ECCCTRL_ENABLE_ECC: u32 = 1 << 12;
pub const GPMI_ECCCTRL_RANDOMIZER_ENABLE: u32 = 1 << 11;
pub const GPMI_ECCCTRL_RANDOMIZER_TYPE2: u32 = 2 << 9;
/// Per-page randomizer seed field (page number modulo 256).
pub const GPMI_ECCCTRL_RANDOMIZER_PAGE_SHIFT: u32 = 16;
pub const GPMI_ECCCTRL_BUFFER_MASK_BCH_PAGE: u32 = 0x1FF;
pub const GPMI_ECCCTRL_BUFFER_MASK_BCH_AUXONLY: u32 = 0x100;

/// Build a GPMI CTRL0 word for an 8-bit transfer on the given chip select.
pub fn gpmi_ctrl0(mode: u32, address: u32, cs: u8, xfer_count: u32) -> u32 {
    mode | GPMI_CTRL0_WORD_LENGTH_8BIT
        | (u32::from(cs) << GPMI_CTRL0_CS_SHIFT)
        | address
        | (xfer_count & GPMI_CTRL0_XFER_COUNT_MASK)
}

// ---------------------------------------------------------------------------
// BCH ECC engine
// ---------------------------------------------------------------------------

pub const HW_BCH_CTRL: u32 = 0x000;
pub const BCH_CTRL_COMPLETE_IRQ: u32 = 1 << 0;

pub const HW_BCH_FLASH0LAYOUT0: u32 = 0x080;
pub const HW_BCH_FLASH0LAYOUT1: u32 = 0x090;

/// FLASH0LAYOUT0: chunk count (excluding chunk 0), metadata size, chunk-0
/// ECC level (encoded as strength/2), GF selector, chunk-0 data size in
/// 4-byte units.
pub fn bch_flash0layout0(nblocks: u8, meta_size: u16, ecc0_strength: u16, gf13: bool, block0_size: u16) -> u32 {
    (u32::from(nblocks) << 24)
        | (u32::from(meta_size) << 16)
        | (u32::from(ecc0_strength / 2) << 11)
        | (u32::from(!gf13) << 10)
        | u32::from(block0_size / 4)
}

/// FLASH0LAYOUT1: total page size, chunk-N ECC level, GF selector, chunk-N
/// data size in 4-byte units.
pub fn bch_flash0layout1(page_size: u32, eccn_strength: u16, gf13: bool, blockn_size: u16) -> u32 {
    (page_size << 16)
        | (u32::from(eccn_strength / 2) << 11)
        | (u32::from(!gf13) << 10)
        | u32::from(blockn_size / 4)
}

// ---------------------------------------------------------------------------
// NAND command set (JEDEC/ONFI opcodes)
// ---------------------------------------------------------------------------

pub const NAND_CMD_READ0: u8 = 0x00;
pub const NAND_CMD_READSTART: u8 = 0x30;
pub const NAND_CMD_STATUS: u8 = 0x70;
pub const NAND_CMD_READID: u8 = 0x90;
pub const NAND_CMD_PARAM: u8 = 0xEC;
pub const NAND_CMD_RESET: u8 = 0xFF;

/// READ STATUS ready bit.
pub const NAND_STATUS_READY: u8 = 0x40;

#[test]
fn test_ctrl0_packing() {
    let word = gpmi_ctrl0(
        GPMI_CTRL0_COMMAND_MODE_READ,
        GPMI_CTRL0_ADDRESS_NAND_DATA,
        0,
        256,
    );
    assert_eq!(word & GPMI_CTRL0_XFER_COUNT_MASK, 256);
    assert_eq!(word & (3 << 24), GPMI_CTRL0_COMMAND_MODE_READ);
    assert_ne!(word & GPMI_CTRL0_WORD_LENGTH_8BIT, 0);
}

#[test]
fn test_flash0layout_packing() {
    // 2048-byte page, 8-bit ECC, GF13, 512-byte chunks, 10-byte metadata.
    let l0 = bch_flash0layout0(3, 10, 8, true, 512);
    assert_eq!(l0 >> 24, 3);
    assert_eq!((l0 >> 16) & 0xFF, 10);
    assert_eq!((l0 >> 11) & 0x1F, 4);
    assert_eq!(l0 & 0x3FF, 128);

    let l1 = bch_flash0layout1(2048 + 64, 8, true, 512);
    assert_eq!(l1 >> 16, 2048 + 64);
    assert_eq!(l1 & 0x3FF, 128);
}
