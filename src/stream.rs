//! Sequential firmware streaming: pull one firmware copy out of flash,
//! skipping the erase blocks the DBBT marks bad.
//!
//! Bad blocks never consume the page budget: the stream simply continues
//! in the next good block, reading exactly as many pages as requested.
//! Any page that fails to read or decode aborts the whole copy; the
//! caller's only recovery is the redundant copy, not a partial image.

use log::{debug, warn};

use crate::dbbt::BadBlockTable;
use crate::fcb::Fcb;
use crate::nand::ecc::EccLayout;
use crate::nand::{BootNand, ReadMode};
use crate::{Error, Result};

/// Stream `page_count` pages of firmware starting at `start_page` into
/// `dest`, returning the number of bytes written.
///
/// `scratch` must hold one ECC read buffer for the FCB's layout. If the
/// starting block itself is bad the stream begins at the next good block;
/// mid-stream bad blocks are skipped whole at their boundary.
///
/// Each page carries the bad-block marker swap the flashing tool applied:
/// the data byte at the marker position lives in metadata byte 0, and is
/// restored before the page is copied out.
pub fn stream_firmware<N: BootNand>(
    nand: &mut N,
    fcb: &Fcb,
    bad_blocks: Option<&BadBlockTable>,
    start_page: u32,
    page_count: u32,
    dest: &mut [u8],
    scratch: &mut [u8],
) -> Result<usize> {
    let layout = EccLayout::from_fcb(fcb);
    nand.set_ecc_layout(&layout)?;

    let buf_len = layout.buffer_len();
    let have = scratch.len();
    let scratch = scratch
        .get_mut(..buf_len)
        .ok_or(Error::BufferTooSmall { needed: buf_len, have })?;

    let pages_per_block = fcb.sectors_per_block;
    let page_data_size = fcb.page_data_size as usize;
    let is_bad = |block: u32| bad_blocks.is_some_and(|t| t.contains(block));

    let mut page = start_page;
    while is_bad(page / pages_per_block) {
        let skipped = page / pages_per_block;
        debug!("firmware start block {skipped} is bad, moving to the next block");
        page = (skipped + 1) * pages_per_block;
    }

    let mut written = 0usize;
    let mut remaining = page_count;
    while remaining > 0 {
        if page % pages_per_block == 0 && is_bad(page / pages_per_block) {
            debug!("skipping bad block {}", page / pages_per_block);
            page += pages_per_block;
            continue;
        }

        nand.read_page(page, ReadMode::Ecc { randomizer: false }, scratch)
            .and_then(|_| layout.check_status(scratch))
            .map_err(|e| {
                warn!("firmware page {page} unreadable: {e}");
                Error::PageRead(page)
            })?;

        // Undo the marker swap: metadata byte 0 holds the displaced data
        // byte.
        let marker = fcb.bad_block_marker_byte as usize;
        if marker < page_data_size {
            scratch[marker] = scratch[page_data_size];
        }

        let n = page_data_size.min(dest.len() - written);
        dest[written..written + n].copy_from_slice(&scratch[..n]);
        written += n;
        if n < page_data_size {
            // Destination full; the caller asked for less than the copy
            // holds.
            return Ok(written);
        }

        page += 1;
        remaining -= 1;
    }

    Ok(written)
}

/// Load the firmware image, trying copy 1 and then falling back to the
/// redundant copy 2. Only both copies failing is fatal.
pub fn load_firmware<N: BootNand>(
    nand: &mut N,
    fcb: &Fcb,
    bad_blocks: Option<&BadBlockTable>,
    dest: &mut [u8],
    scratch: &mut [u8],
) -> Result<usize> {
    match stream_firmware(
        nand,
        fcb,
        bad_blocks,
        fcb.firmware1_starting_page,
        fcb.pages_in_firmware1,
        dest,
        scratch,
    ) {
        Ok(written) => Ok(written),
        Err(e) => {
            warn!("firmware copy 1 failed ({e}), trying copy 2");
            stream_firmware(
                nand,
                fcb,
                bad_blocks,
                fcb.firmware2_starting_page,
                fcb.pages_in_firmware2,
                dest,
                scratch,
            )
            .map_err(|e| {
                warn!("firmware copy 2 failed as well: {e}");
                Error::FirmwareLoadFailed
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbbt;
    use crate::fcb::tests::{test_fcb, test_geometry};
    use crate::nand::sim::{PageHealth, SimNand};

    const PAGE: usize = 2048;

    /// Small blocks so streams cross block boundaries quickly.
    fn small_block_fcb() -> Fcb {
        Fcb {
            sectors_per_block: 2,
            firmware1_starting_page: 4,
            firmware2_starting_page: 12,
            pages_in_firmware1: 4,
            pages_in_firmware2: 4,
            ..test_fcb()
        }
    }

    fn fill_page(nand: &mut SimNand, page: u32, tag: u8) {
        nand.program_page(page, &vec![tag; PAGE], &[tag]);
    }

    fn scratch(fcb: &Fcb) -> Vec<u8> {
        vec![0u8; EccLayout::from_fcb(fcb).buffer_len()]
    }

    fn table_with(nand: &mut SimNand, fcb: &Fcb, blocks: &[u32]) -> BadBlockTable {
        // Round-trip through the on-flash encoding rather than poking at
        // table internals.
        let start = fcb.dbbt_search_area_start_address;
        nand.program_page(start, &dbbt::tests::header_bytes(1, 1), &[]);
        nand.program_page(start + 4, &dbbt::tests::entries_bytes(blocks), &[]);
        let mut buf = vec![0u8; EccLayout::from_fcb(fcb).buffer_len()];
        dbbt::locate(nand, fcb, &mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_bad_blocks_skipped_without_consuming_budget() {
        let fcb = small_block_fcb();
        let mut nand = SimNand::new(test_geometry());
        let table = table_with(&mut nand, &fcb, &[3]);

        // Copy 1: block 2 (pages 4,5), bad block 3, block 4 (pages 8,9).
        for (page, tag) in [(4, 1u8), (5, 2), (8, 3), (9, 4)] {
            fill_page(&mut nand, page, tag);
        }
        // Pages 6 and 7 are in the bad block; they must never appear.
        fill_page(&mut nand, 6, 0xEE);
        fill_page(&mut nand, 7, 0xEE);

        let mut dest = vec![0u8; 4 * PAGE];
        let written = stream_firmware(
            &mut nand,
            &fcb,
            Some(&table),
            4,
            4,
            &mut dest,
            &mut scratch(&fcb),
        )
        .unwrap();

        assert_eq!(written, 4 * PAGE);
        for (i, tag) in [1u8, 2, 3, 4].into_iter().enumerate() {
            assert!(
                dest[i * PAGE..(i + 1) * PAGE].iter().all(|&b| b == tag),
                "page {i} of the image has the wrong contents"
            );
        }
    }

    #[test]
    fn test_bad_start_block_repositions_stream() {
        let fcb = small_block_fcb();
        let mut nand = SimNand::new(test_geometry());
        let table = table_with(&mut nand, &fcb, &[2]);

        // Start page 4 lies in bad block 2; the stream must begin at
        // block 3 (page 6) and still read 4 pages.
        for (page, tag) in [(6, 1u8), (7, 2), (8, 3), (9, 4)] {
            fill_page(&mut nand, page, tag);
        }

        let mut dest = vec![0u8; 4 * PAGE];
        let written = stream_firmware(
            &mut nand,
            &fcb,
            Some(&table),
            4,
            4,
            &mut dest,
            &mut scratch(&fcb),
        )
        .unwrap();

        assert_eq!(written, 4 * PAGE);
        assert!(dest[..PAGE].iter().all(|&b| b == 1));
        assert!(dest[3 * PAGE..].iter().all(|&b| b == 4));
    }

    #[test]
    fn test_marker_byte_restored_from_metadata() {
        let fcb = test_fcb();
        let mut nand = SimNand::new(test_geometry());

        let mut data = vec![0x11u8; PAGE];
        data[fcb.bad_block_marker_byte as usize] = 0xFF; // the swapped-in marker
        nand.program_page(256, &data, &[0x77]); // metadata byte 0 = displaced byte

        let mut dest = vec![0u8; PAGE];
        stream_firmware(&mut nand, &fcb, None, 256, 1, &mut dest, &mut scratch(&fcb)).unwrap();

        assert_eq!(dest[fcb.bad_block_marker_byte as usize], 0x77);
        assert_eq!(dest[0], 0x11);
    }

    #[test]
    fn test_redundant_copy_fallback() {
        let fcb = small_block_fcb();
        let mut nand = SimNand::new(test_geometry());

        // Copy 1's first page is uncorrectable; copy 2 (pages 12..) is good.
        fill_page(&mut nand, 4, 0x01);
        nand.set_page_health(4, PageHealth::Uncorrectable);
        for page in 12..16 {
            fill_page(&mut nand, page, 0x99);
        }

        let mut dest = vec![0u8; 4 * PAGE];
        let written =
            load_firmware(&mut nand, &fcb, None, &mut dest, &mut scratch(&fcb)).unwrap();
        assert_eq!(written, 4 * PAGE);
        assert!(dest.iter().all(|&b| b == 0x99));
    }

    #[test]
    fn test_both_copies_failing_is_fatal() {
        let fcb = small_block_fcb();
        let mut nand = SimNand::new(test_geometry());
        fill_page(&mut nand, 4, 0x01);
        fill_page(&mut nand, 12, 0x02);
        nand.set_page_health(4, PageHealth::Uncorrectable);
        nand.set_page_health(12, PageHealth::Uncorrectable);

        let mut dest = vec![0u8; 4 * PAGE];
        assert!(matches!(
            load_firmware(&mut nand, &fcb, None, &mut dest, &mut scratch(&fcb)),
            Err(Error::FirmwareLoadFailed)
        ));
    }
}
