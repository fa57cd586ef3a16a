//! BCH flash layout description and per-chunk ECC status interpretation.
//!
//! After an ECC-mode page read, the engine leaves one status byte per ECC
//! chunk in the auxiliary region of the read buffer, immediately after the
//! metadata bytes (aligned to 4). Two interpretations exist:
//!
//! - the standard one, used for firmware pages on both SoCs: `0xFE` means
//!   the chunk was uncorrectable and the page is lost; every other value
//!   is accepted silently;
//! - the i.MX7 randomized one, used for the FCB: `0x00` is clean, `0xFF`
//!   means the chunk is actually erased but the randomizer made the
//!   transferred bytes look random (the chunk must be re-filled with
//!   `0xFF`, the bytes in the buffer are garbage), `0xFE` is
//!   uncorrectable, and anything else is a corrected bitflip count.
//!
//! Corrected bitflips are never rejected at this stage; there is no
//! bitflip threshold in the boot-time reader.

use log::debug;

use crate::{Error, Result};

/// ECC chunk size used for firmware pages.
pub const CHUNK_DATA_SIZE: u32 = 512;

/// Status byte value marking an uncorrectable chunk.
pub const STATUS_UNCORRECTABLE: u8 = 0xFE;

/// Status byte value marking an erased chunk (randomized layouts only).
pub const STATUS_ERASED: u8 = 0xFF;

/// One BCH flash layout: how a physical page splits into metadata and ECC
/// chunks. Mirrors the FLASH0LAYOUT0/1 register packing.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EccLayout {
    /// Metadata bytes at the start of the auxiliary area.
    pub metadata_size: u16,
    /// Data bytes in chunk 0.
    pub block0_size: u16,
    /// Data bytes in each of chunks 1..n.
    pub blockn_size: u16,
    /// ECC strength for chunk 0 (bits correctable).
    pub ecc0_strength: u16,
    /// ECC strength for chunks 1..n.
    pub eccn_strength: u16,
    /// Total number of ECC chunks, chunk 0 included.
    pub chunk_count: u16,
    /// Galois field width: 13 or 14.
    pub gf_len: u8,
    /// Raw bytes moved through the engine per page (data + OOB).
    pub total_page_size: u32,
}

impl EccLayout {
    /// The authoritative firmware-page layout, taken from the FCB once it
    /// has been located. This may differ from ONFI-reported geometry.
    pub fn from_fcb(fcb: &crate::fcb::Fcb) -> Self {
        EccLayout {
            metadata_size: fcb.metadata_bytes as u16,
            block0_size: fcb.ecc_block_0_size as u16,
            blockn_size: fcb.ecc_block_n_size as u16,
            // The FCB stores the register encoding: field value is half
            // the correctable-bit strength.
            ecc0_strength: (fcb.ecc_block_0_ecc_type * 2) as u16,
            eccn_strength: (fcb.ecc_block_n_ecc_type * 2) as u16,
            chunk_count: (fcb.num_ecc_blocks_per_page + 1) as u16,
            gf_len: if fcb.ecc_block_n_size > 512 { 14 } else { 13 },
            total_page_size: fcb.total_page_size,
        }
    }

    /// The fixed i.MX7 FCB layout: 62-bit BCH over eight 128-byte chunks
    /// with 32 bytes of metadata, in a 4 KiB page with 64 spare bytes.
    /// Not discovered; a property of the SoC's boot ROM.
    pub fn imx7_fcb() -> Self {
        EccLayout {
            metadata_size: 32,
            block0_size: 128,
            blockn_size: 128,
            ecc0_strength: 62,
            eccn_strength: 62,
            chunk_count: 8,
            gf_len: 13,
            total_page_size: 4096 + 64,
        }
    }

    /// Decoded data bytes per page under this layout.
    pub fn data_len(&self) -> usize {
        self.block0_size as usize + self.blockn_size as usize * (self.chunk_count as usize - 1)
    }

    /// Offset of the per-chunk status bytes within a read buffer: right
    /// after data + metadata, aligned to 4.
    pub fn status_offset(&self) -> usize {
        let meta_end = self.data_len() + self.metadata_size as usize;
        (meta_end + 3) & !3
    }

    /// Bytes a read buffer must hold for one ECC-mode page read.
    pub fn buffer_len(&self) -> usize {
        self.status_offset() + self.chunk_count as usize
    }

    /// Byte offset of chunk `index`'s data within the read buffer.
    fn chunk_offset(&self, index: usize) -> usize {
        if index == 0 {
            0
        } else {
            self.block0_size as usize + self.blockn_size as usize * (index - 1)
        }
    }

    /// Standard status scan: fail the read on any uncorrectable chunk,
    /// accept everything else.
    pub fn check_status(&self, buf: &[u8]) -> Result<()> {
        let status = &buf[self.status_offset()..][..self.chunk_count as usize];
        for (chunk, &byte) in status.iter().enumerate() {
            if byte == STATUS_UNCORRECTABLE {
                debug!("ECC: uncorrectable error in chunk {chunk}");
                return Err(Error::UncorrectableEcc);
            }
        }
        Ok(())
    }

    /// Randomized-layout status scan (i.MX7 FCB). Re-fills erased chunks
    /// with 0xFF in place and returns the total corrected-bitflip count.
    pub fn check_status_randomized(&self, buf: &mut [u8]) -> Result<u32> {
        let status_offset = self.status_offset();
        let mut corrected = 0u32;

        for chunk in 0..self.chunk_count as usize {
            let byte = buf[status_offset + chunk];
            match byte {
                0x00 => {}
                STATUS_ERASED => {
                    // The randomizer scrambled an erased chunk; the
                    // transferred bytes are garbage.
                    let size = if chunk == 0 {
                        self.block0_size as usize
                    } else {
                        self.blockn_size as usize
                    };
                    let offset = self.chunk_offset(chunk);
                    buf[offset..offset + size].fill(0xFF);
                }
                STATUS_UNCORRECTABLE => {
                    debug!("ECC: uncorrectable error in randomized chunk {chunk}");
                    return Err(Error::UncorrectableEcc);
                }
                flips => corrected += u32::from(flips),
            }
        }

        if corrected > 0 {
            debug!("ECC: {corrected} corrected bitflips in randomized page");
        }
        Ok(corrected)
    }
}

#[test]
fn test_status_offset_alignment() {
    // 2048-byte page, 10 bytes of metadata: 2058 aligns up to 2060.
    let layout = EccLayout {
        metadata_size: 10,
        block0_size: 512,
        blockn_size: 512,
        ecc0_strength: 8,
        eccn_strength: 8,
        chunk_count: 4,
        gf_len: 13,
        total_page_size: 2048 + 64,
    };
    assert_eq!(layout.data_len(), 2048);
    assert_eq!(layout.status_offset(), 2060);
    assert_eq!(layout.buffer_len(), 2064);
}

#[test]
fn test_check_status_uncorrectable() {
    let layout = EccLayout::imx7_fcb();
    let mut buf = vec![0u8; layout.buffer_len()];

    assert!(layout.check_status(&buf).is_ok());

    buf[layout.status_offset() + 3] = STATUS_UNCORRECTABLE;
    assert!(matches!(
        layout.check_status(&buf),
        Err(Error::UncorrectableEcc)
    ));
}

#[test]
fn test_randomized_erased_chunk_refill() {
    let layout = EccLayout::imx7_fcb();
    let mut buf = vec![0xA5u8; layout.buffer_len()];

    let status_offset = layout.status_offset();
    buf[status_offset..].fill(0x00);
    buf[status_offset + 2] = STATUS_ERASED; // chunk 2 is erased
    buf[status_offset + 5] = 3; // chunk 5 had 3 corrected flips

    let corrected = layout.check_status_randomized(&mut buf).unwrap();
    assert_eq!(corrected, 3);

    // Chunk 2 (bytes 256..384) must now read as erased; neighbors intact.
    assert!(buf[256..384].iter().all(|&b| b == 0xFF));
    assert!(buf[128..256].iter().all(|&b| b == 0xA5));
    assert!(buf[384..512].iter().all(|&b| b == 0xA5));
}
