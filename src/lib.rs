//! NAND boot-chain reader for the i.MX6/i.MX7 pre-bootloader stage.
//!
//! This crate implements the read path a boot ROM successor needs to pull a
//! second-stage firmware image out of raw NAND flash: device identification
//! (ONFI parameter page with a READ ID fallback), GPMI command sequencing
//! driven by chained APBH DMA descriptors, ECC-checked page reads through
//! the BCH engine, location of the Firmware Configuration Block (FCB) and
//! Discovered Bad Block Table (DBBT), and bad-block-aware sequential
//! streaming of the firmware payload into RAM.
//!
//! The pipeline is strictly single-threaded and synchronous; every hardware
//! wait is a bounded busy-poll. Hardware register access goes through the
//! [`gpmi::regs::Mmio`] seam, so the whole pipeline can also run against the
//! in-memory [`nand::sim::SimNand`] for testing.
//!
//! Writing, erasing, wear-leveling, and UBI are out of scope: this is a
//! reader, and the last software stage before the CPU either has a program
//! to run or does not.

use thiserror::Error;

pub mod boot;
pub mod dbbt;
pub mod fcb;
pub mod gpmi;
pub mod nand;
pub mod stream;

pub use boot::{load_image, TargetParams};
pub use fcb::FcbStrategy;

/// Everything that can go wrong between "CPU is running" and "firmware is
/// in RAM".
///
/// Low-level primitives propagate hardware failures unconditionally; the
/// FCB/DBBT searches absorb per-candidate integrity failures and re-raise
/// only once all candidates are exhausted; the firmware loader absorbs a
/// complete streaming failure once, by retrying the redundant copy.
#[derive(Error, Debug)]
pub enum Error {
    /// A bounded hardware poll exhausted its retry budget.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// A DMA descriptor chain failed to complete on the given channel.
    #[error("DMA failure on APBH channel {channel}")]
    Dma {
        channel: u8,
        #[source]
        source: Box<Error>,
    },

    /// The NAND device never reported ready after RESET.
    #[error("NAND device not responding after reset")]
    DeviceNotResponding,

    /// An embedded checksum disagreed with the one computed over the data.
    #[error("checksum mismatch (stored {stored:#010x}, computed {computed:#010x})")]
    ChecksumMismatch { stored: u32, computed: u32 },

    /// A record's magic fingerprint did not match.
    #[error("fingerprint mismatch (found {0:#010x})")]
    InvalidFingerprint(u32),

    /// READ ID returned the no-device signature.
    #[error("invalid READ ID response from NAND device")]
    InvalidDeviceResponse,

    /// Neither the ONFI path nor the generic READ ID path could identify
    /// the device.
    #[error("NAND device could not be identified")]
    UnsupportedDevice,

    /// The BCH engine reported an uncorrectable chunk in a page read.
    #[error("uncorrectable ECC error")]
    UncorrectableEcc,

    /// No candidate block contained a valid FCB.
    #[error("no valid FCB found in any candidate block")]
    FcbNotFound,

    /// A firmware page read failed; aborts the whole streaming attempt.
    #[error("failed to read firmware page {0}")]
    PageRead(u32),

    /// Both redundant firmware copies failed to stream.
    #[error("both firmware copies failed to load")]
    FirmwareLoadFailed,

    /// An ECC-mode page read was requested before any flash layout was
    /// programmed.
    #[error("ECC layout not configured")]
    EccLayoutNotSet,

    /// A destination or scratch buffer was too small for the configured
    /// page layout.
    #[error("buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall { needed: usize, have: usize },

    /// An on-flash record could not be decoded at all.
    #[error("malformed on-flash record: {0}")]
    MalformedRecord(&'static str),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;
