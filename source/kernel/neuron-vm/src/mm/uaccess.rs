// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Byte copies between kernel buffers and a user address space
//! OWNERS: @kernel-mm-team
//! PUBLIC API: copy_out, copy_in, copy_in_str
//! DEPENDS_ON: PageTable::translate (user-accessible leaves only)
//! INVARIANTS: Never touches a page without a valid USER leaf; partial copies are not rolled back

use super::frame::frame_ptr;
use super::page_table::PageTable;
use super::{page_round_down, VmError, PAGE_SIZE};

/// Resolves the page containing `va` and returns the kernel pointer to `va` and
/// the bytes left in that page.
fn user_chunk(table: &PageTable, va: usize) -> Result<(*mut u8, usize), VmError> {
    let page = page_round_down(va);
    let Some(frame) = table.translate(page) else {
        log_debug!(target: "uaccess", "fault at {:#x}", va);
        return Err(VmError::BadAddress);
    };
    let offset = va - page;
    Ok((frame_ptr(frame + offset), PAGE_SIZE - offset))
}

/// Copies `src` to user address `dst_va`.
pub fn copy_out(table: &PageTable, dst_va: usize, src: &[u8]) -> Result<(), VmError> {
    let mut va = dst_va;
    let mut rest = src;
    while !rest.is_empty() {
        let (dst, room) = user_chunk(table, va)?;
        let n = room.min(rest.len());
        // SAFETY: `dst` addresses `n` bytes inside one translated user frame.
        unsafe { core::ptr::copy(rest.as_ptr(), dst, n) };
        rest = &rest[n..];
        va += n;
    }
    Ok(())
}

/// Fills `dst` from user address `src_va`.
pub fn copy_in(table: &PageTable, dst: &mut [u8], src_va: usize) -> Result<(), VmError> {
    let mut va = src_va;
    let mut done = 0;
    while done < dst.len() {
        let (src, room) = user_chunk(table, va)?;
        let n = room.min(dst.len() - done);
        // SAFETY: `src` addresses `n` bytes inside one translated user frame.
        unsafe { core::ptr::copy(src, dst[done..].as_mut_ptr(), n) };
        done += n;
        va += n;
    }
    Ok(())
}

/// Copies a NUL-terminated string from user address `src_va` into `dst`.
///
/// At most `min(max, dst.len())` bytes are examined, terminator included.
/// Returns the string length without the terminator, which is also written
/// to `dst`. Fails with `BadAddress` if no terminator is found in that window
/// or a page does not translate.
pub fn copy_in_str(
    table: &PageTable,
    dst: &mut [u8],
    src_va: usize,
    max: usize,
) -> Result<usize, VmError> {
    let limit = max.min(dst.len());
    let mut va = src_va;
    let mut done = 0;
    while done < limit {
        let (src, room) = user_chunk(table, va)?;
        let n = room.min(limit - done);
        // SAFETY: `src` addresses `n` readable bytes inside one translated user frame.
        let chunk = unsafe { core::slice::from_raw_parts(src as *const u8, n) };
        match chunk.iter().position(|byte| *byte == 0) {
            Some(end) => {
                dst[done..=done + end].copy_from_slice(&chunk[..=end]);
                return Ok(done + end);
            }
            None => {
                dst[done..done + n].copy_from_slice(chunk);
                done += n;
                va += n;
            }
        }
    }
    Err(VmError::BadAddress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{AddressSpace, Frames, HeapFrameAllocator, PageFlags};

    fn two_pages(frames: &mut Frames<HeapFrameAllocator>) -> AddressSpace {
        let mut space = AddressSpace::create(frames).expect("create");
        space.grow(frames, 2 * PAGE_SIZE, PageFlags::WRITE).expect("grow");
        space
    }

    #[test]
    fn copies_cross_page_boundaries() {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let space = two_pages(&mut frames);
        let data: [u8; 32] = core::array::from_fn(|i| i as u8 + 1);
        copy_out(space.page_table(), PAGE_SIZE - 16, &data).expect("copy_out");
        let mut back = [0u8; 32];
        copy_in(space.page_table(), &mut back, PAGE_SIZE - 16).expect("copy_in");
        assert_eq!(back, data);
    }

    #[test]
    fn copy_out_stops_at_first_unmapped_page() {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let space = two_pages(&mut frames);
        let va = 2 * PAGE_SIZE - 4;
        assert_eq!(copy_out(space.page_table(), va, &[7u8; 8]), Err(VmError::BadAddress));
        let mut written = [0u8; 4];
        copy_in(space.page_table(), &mut written, va).expect("copy_in");
        assert_eq!(written, [7u8; 4]);
    }

    #[test]
    fn copy_in_rejects_revoked_pages() {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let mut space = two_pages(&mut frames);
        space.clear_user_access(PAGE_SIZE);
        let mut buf = [0u8; 8];
        assert_eq!(copy_in(space.page_table(), &mut buf, PAGE_SIZE), Err(VmError::BadAddress));
        assert_eq!(copy_in(space.page_table(), &mut buf, 0), Ok(()));
    }

    #[test]
    fn empty_copies_touch_nothing() {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let space = AddressSpace::create(&mut frames).expect("create");
        assert_eq!(copy_out(space.page_table(), 0, &[]), Ok(()));
        assert_eq!(copy_in(space.page_table(), &mut [], 0), Ok(()));
    }

    #[test]
    fn copy_in_str_needs_terminator_within_limit() {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let space = two_pages(&mut frames);
        copy_out(space.page_table(), 0, b"0123456789").expect("unterminated");
        let mut dst = [0u8; 16];
        assert_eq!(copy_in_str(space.page_table(), &mut dst, 0, 5), Err(VmError::BadAddress));

        copy_out(space.page_table(), 0x100, b"abc\0").expect("terminated");
        let mut dst = [0xffu8; 16];
        assert_eq!(copy_in_str(space.page_table(), &mut dst, 0x100, 5), Ok(3));
        assert_eq!(&dst[..4], b"abc\0");
        assert_eq!(dst[4], 0xff);
    }

    #[test]
    fn copy_in_str_follows_strings_across_pages() {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let space = two_pages(&mut frames);
        copy_out(space.page_table(), PAGE_SIZE - 2, b"hi!\0").expect("write");
        let mut dst = [0u8; 8];
        assert_eq!(copy_in_str(space.page_table(), &mut dst, PAGE_SIZE - 2, 8), Ok(3));
        assert_eq!(&dst[..4], b"hi!\0");
    }

    #[test]
    fn copy_in_str_is_bounded_by_destination() {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let space = two_pages(&mut frames);
        copy_out(space.page_table(), 0, b"abcdef\0").expect("write");
        let mut small = [0u8; 4];
        assert_eq!(copy_in_str(space.page_table(), &mut small, 0, 64), Err(VmError::BadAddress));
        let mut exact = [0u8; 7];
        assert_eq!(copy_in_str(space.page_table(), &mut exact, 0, 64), Ok(6));
    }

    #[test]
    fn copy_in_str_faults_on_unmapped_tail() {
        let mut frames = Frames::new(HeapFrameAllocator::new());
        let space = two_pages(&mut frames);
        copy_out(space.page_table(), 2 * PAGE_SIZE - 3, b"xyz").expect("write");
        let mut dst = [0u8; 16];
        assert_eq!(
            copy_in_str(space.page_table(), &mut dst, 2 * PAGE_SIZE - 3, 16),
            Err(VmError::BadAddress)
        );
    }
}
