//! Volume table of contents: the free/used bitmap of the DOS 2 family.
//!
//! The canonical VTOC lives in sector 360.  Byte 0 is the version, bytes 1-2
//! the capacity, bytes 3-4 the free sector count, and the bitmap starts at
//! byte 10.  A set bit means the sector is free; within a byte the most
//! significant bit addresses the lowest sector.  Bit numbers are sector
//! numbers, so the bit for the nonexistent sector 0 is always clear.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use log::{debug, info, warn};

use crate::disk::directory::{DIRECTORY_SECTOR_COUNT, FIRST_DIRECTORY_SECTOR};
use crate::disk::error::DiskError;
use crate::disk::{DiskRef, SectorNum, BOOT_SECTOR_COUNT};

pub const VTOC_SECTOR: SectorNum = 360;
/// Second bitmap sector of enhanced density DOS 2.5 disks.
pub const VTOC2_SECTOR: SectorNum = 1024;
/// Sector 720 is left unused by DOS 2.0 and most of its descendants.
pub const RESERVED_SECTOR: SectorNum = 720;

const VTOC_VERSION_OFFSET: usize = 0;
const VTOC_CAPACITY_OFFSET: usize = 1;
const VTOC_FREE_OFFSET: usize = 3;
const VTOC_BITMAP_OFFSET: usize = 10;

/// Sectors 0..720 are covered by the 90 bitmap bytes of a plain VTOC.
const SIMPLE_BITMAP_LIMIT: SectorNum = 720;
const ENHANCED_BITMAP_LIMIT: SectorNum = 1024;
/// VTOC2 repeats the bitmap from sector 48 on, so its byte for sector `n` is
/// `n / 8 - 6`.
const VTOC2_FIRST_SECTOR: SectorNum = 48;
const VTOC2_BYTE_SKIP: usize = VTOC2_FIRST_SECTOR / 8;
/// Free sectors above 719 are counted separately in VTOC2.
const VTOC2_FREE_OFFSET: usize = 122;

const VTOC_VERSION_DOS2: u8 = 2;
const VTOC_VERSION_EXPANDED: u8 = 3;

/// Partial bytes for a bitmap run of 0..8 sectors, high bit first.
static PARTIAL_BYTE: [u8; 8] = [0x00, 0x80, 0xC0, 0xE0, 0xF0, 0xF8, 0xFC, 0xFE];

pub type AllocatorRef = Rc<RefCell<dyn Allocator>>;

/// Bitmap bookkeeping for one disk.  Implementations hold their own handle to
/// the disk and go through the sector cache for every access, so the bitmap
/// on disk is always the only copy.
pub trait Allocator {
    /// Write a fresh bitmap: every sector free except the boot sectors, the
    /// VTOC sectors, the directory, and any reserved sectors.
    fn format(&mut self) -> io::Result<()>;

    /// Claim the lowest-numbered free sector.
    fn alloc_sector(&mut self) -> io::Result<SectorNum>;

    /// Flip the bit for `num` and adjust the free count to match.
    fn switch_sector_use(&mut self, num: SectorNum) -> io::Result<()>;

    fn is_free(&self, num: SectorNum) -> io::Result<bool>;

    /// The free count as stored on disk.
    fn free_sector_count(&self) -> io::Result<usize>;

    fn capacity(&self) -> io::Result<usize>;

    fn version(&self) -> io::Result<u8>;

    /// One past the highest sector number the bitmap can address.
    fn bitmap_limit(&self) -> SectorNum;

    /// The sectors holding the bitmap.
    fn vtoc_sectors(&self) -> Vec<SectorNum>;

    /// Sectors a fresh format leaves used without giving them an owner.
    fn reserved_sectors(&self) -> Vec<SectorNum> {
        vec![]
    }

    /// Return a used sector to the free pool.  Freeing a free sector is a
    /// no-op.
    fn free_sector(&mut self, num: SectorNum) -> io::Result<()> {
        if self.is_free(num)? {
            warn!("vtoc: sector {} is already free", num);
            return Ok(());
        }
        self.switch_sector_use(num)
    }

    /// Mark a sector used if it is not already.
    fn mark_used(&mut self, num: SectorNum) -> io::Result<()> {
        if self.is_free(num)? {
            self.switch_sector_use(num)?;
        }
        Ok(())
    }

    /// Claim the first run of `count` contiguous free sectors, returning the
    /// first one.
    fn alloc_run(&mut self, count: usize) -> io::Result<SectorNum> {
        let mut start = 0;
        let mut length = 0;
        for num in 0..self.bitmap_limit() {
            if self.is_free(num)? {
                if length == 0 {
                    start = num;
                }
                length += 1;
                if length == count {
                    for sector in start..start + count {
                        self.switch_sector_use(sector)?;
                    }
                    debug!("vtoc: allocated sectors {}..{}", start, start + count);
                    return Ok(start);
                }
            } else {
                length = 0;
            }
        }
        Err(DiskError::DiskFull.into())
    }

    /// Count the free bits in the bitmap, independent of the stored count.
    fn count_free_bits(&self) -> io::Result<usize> {
        let mut count = 0;
        for num in 0..self.bitmap_limit() {
            if self.is_free(num)? {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Sectors that a fresh format leaves used: the boot sectors (and the
/// nonexistent sector 0) and the root directory.
fn is_system_sector(num: SectorNum) -> bool {
    num <= BOOT_SECTOR_COUNT
        || (FIRST_DIRECTORY_SECTOR..FIRST_DIRECTORY_SECTOR + DIRECTORY_SECTOR_COUNT).contains(&num)
}

/// First set bit of a bitmap byte, as a bit index from the high end.
#[inline]
fn first_free_bit(byte: u8) -> usize {
    byte.leading_zeros() as usize
}

#[inline]
fn bit_mask(num: SectorNum) -> u8 {
    0x80 >> (num & 7)
}

/// The single-sector VTOC of DOS 2.0, and the two-sector layout of DOS 2.5
/// enhanced density (1040 sectors of 128 bytes, second bitmap in sector
/// 1024).
pub struct SimpleVtoc {
    disk: DiskRef,
    enhanced: bool,
    limit: SectorNum,
}

impl SimpleVtoc {
    pub fn new(disk: DiskRef) -> SimpleVtoc {
        let geometry = disk.borrow().geometry();
        let enhanced = geometry.sector_size == 128 && geometry.sector_count >= VTOC2_SECTOR;
        let limit = if enhanced {
            ENHANCED_BITMAP_LIMIT
        } else {
            (geometry.sector_count + 1).min(SIMPLE_BITMAP_LIMIT)
        };
        SimpleVtoc {
            disk,
            enhanced,
            limit,
        }
    }

    pub fn is_enhanced(&self) -> bool {
        self.enhanced
    }

    /// Where the authoritative bit for `num` lives.
    fn locate(&self, num: SectorNum) -> io::Result<(SectorNum, usize)> {
        if num >= self.limit {
            Err(DiskError::InvalidSector.into())
        } else if num < SIMPLE_BITMAP_LIMIT {
            Ok((VTOC_SECTOR, VTOC_BITMAP_OFFSET + num / 8))
        } else {
            Ok((VTOC2_SECTOR, num / 8 - VTOC2_BYTE_SKIP))
        }
    }

    /// VTOC2 keeps a second copy of the bits for sectors 48..720.
    fn mirror(&self, num: SectorNum) -> Option<(SectorNum, usize)> {
        if self.enhanced && (VTOC2_FIRST_SECTOR..SIMPLE_BITMAP_LIMIT).contains(&num) {
            Some((VTOC2_SECTOR, num / 8 - VTOC2_BYTE_SKIP))
        } else {
            None
        }
    }

    fn counter(&self, num: SectorNum) -> (SectorNum, usize) {
        if self.enhanced && num >= SIMPLE_BITMAP_LIMIT {
            (VTOC2_SECTOR, VTOC2_FREE_OFFSET)
        } else {
            (VTOC_SECTOR, VTOC_FREE_OFFSET)
        }
    }

    /// Scan `sector` from `start` for a set bit; `base` is the sector number
    /// addressed by the high bit of byte `start`.
    fn scan(
        &self,
        sector: SectorNum,
        start: usize,
        base: SectorNum,
        limit: SectorNum,
    ) -> io::Result<Option<SectorNum>> {
        let bytes = self.disk.borrow_mut().read_sector(sector)?;
        for (i, &byte) in bytes[start..].iter().enumerate() {
            let first = base + i * 8;
            if first >= limit {
                break;
            }
            if byte != 0 {
                let num = first + first_free_bit(byte);
                if num < limit {
                    return Ok(Some(num));
                }
            }
        }
        Ok(None)
    }
}

impl Allocator for SimpleVtoc {
    fn format(&mut self) -> io::Result<()> {
        let mut bitmap = [0u8; ENHANCED_BITMAP_LIMIT / 8];
        for num in 0..self.limit {
            let reserved = self.enhanced && num == RESERVED_SECTOR;
            if !is_system_sector(num) && num != VTOC_SECTOR && !reserved {
                bitmap[num / 8] |= bit_mask(num);
            }
        }
        let count_bits =
            |bytes: &[u8]| -> usize { bytes.iter().map(|b| b.count_ones() as usize).sum() };
        let low_free = count_bits(&bitmap[..SIMPLE_BITMAP_LIMIT / 8]);
        let high_free = count_bits(&bitmap[SIMPLE_BITMAP_LIMIT / 8..]);

        let mut disk = self.disk.borrow_mut();
        let cache = disk.cache();
        let vtoc = cache.init(VTOC_SECTOR)?;
        cache.poke(vtoc, VTOC_VERSION_OFFSET, VTOC_VERSION_DOS2)?;
        cache.dpoke(vtoc, VTOC_CAPACITY_OFFSET, (low_free + high_free) as u16)?;
        cache.dpoke(vtoc, VTOC_FREE_OFFSET, low_free as u16)?;
        cache.buffer_mut(vtoc)?[VTOC_BITMAP_OFFSET..VTOC_BITMAP_OFFSET + SIMPLE_BITMAP_LIMIT / 8]
            .copy_from_slice(&bitmap[..SIMPLE_BITMAP_LIMIT / 8]);
        if self.enhanced {
            let vtoc2 = cache.init(VTOC2_SECTOR)?;
            cache.buffer_mut(vtoc2)?[..VTOC2_FREE_OFFSET]
                .copy_from_slice(&bitmap[VTOC2_BYTE_SKIP..]);
            cache.dpoke(vtoc2, VTOC2_FREE_OFFSET, high_free as u16)?;
        }
        info!(
            "vtoc: formatted {} sectors, {} free",
            self.limit,
            low_free + high_free
        );
        Ok(())
    }

    fn alloc_sector(&mut self) -> io::Result<SectorNum> {
        let mut found = self.scan(
            VTOC_SECTOR,
            VTOC_BITMAP_OFFSET,
            0,
            self.limit.min(SIMPLE_BITMAP_LIMIT),
        )?;
        if found.is_none() && self.enhanced {
            found = self.scan(
                VTOC2_SECTOR,
                SIMPLE_BITMAP_LIMIT / 8 - VTOC2_BYTE_SKIP,
                SIMPLE_BITMAP_LIMIT,
                self.limit,
            )?;
        }
        match found {
            Some(num) => {
                self.switch_sector_use(num)?;
                debug!("vtoc: allocated sector {}", num);
                Ok(num)
            }
            None => Err(DiskError::DiskFull.into()),
        }
    }

    fn switch_sector_use(&mut self, num: SectorNum) -> io::Result<()> {
        let (sector, offset) = self.locate(num)?;
        let mask = bit_mask(num);
        let mut disk = self.disk.borrow_mut();
        let byte = disk.read_byte(sector, offset)? ^ mask;
        disk.write_byte(sector, offset, byte)?;
        if let Some((sector, offset)) = self.mirror(num) {
            disk.write_byte(sector, offset, byte)?;
        }
        let (sector, offset) = self.counter(num);
        let free = disk.read_word(sector, offset)?;
        let free = if byte & mask != 0 {
            free.wrapping_add(1)
        } else {
            free.wrapping_sub(1)
        };
        disk.write_word(sector, offset, free)
    }

    fn is_free(&self, num: SectorNum) -> io::Result<bool> {
        let (sector, offset) = self.locate(num)?;
        Ok(self.disk.borrow_mut().read_byte(sector, offset)? & bit_mask(num) != 0)
    }

    fn free_sector_count(&self) -> io::Result<usize> {
        let mut disk = self.disk.borrow_mut();
        let mut count = disk.read_word(VTOC_SECTOR, VTOC_FREE_OFFSET)? as usize;
        if self.enhanced {
            count += disk.read_word(VTOC2_SECTOR, VTOC2_FREE_OFFSET)? as usize;
        }
        Ok(count)
    }

    fn capacity(&self) -> io::Result<usize> {
        Ok(self
            .disk
            .borrow_mut()
            .read_word(VTOC_SECTOR, VTOC_CAPACITY_OFFSET)? as usize)
    }

    fn version(&self) -> io::Result<u8> {
        self.disk
            .borrow_mut()
            .read_byte(VTOC_SECTOR, VTOC_VERSION_OFFSET)
    }

    fn bitmap_limit(&self) -> SectorNum {
        self.limit
    }

    fn vtoc_sectors(&self) -> Vec<SectorNum> {
        if self.enhanced {
            vec![VTOC_SECTOR, VTOC2_SECTOR]
        } else {
            vec![VTOC_SECTOR]
        }
    }

    fn reserved_sectors(&self) -> Vec<SectorNum> {
        if self.enhanced {
            vec![RESERVED_SECTOR]
        } else {
            vec![]
        }
    }
}

/// A bitmap that grows downward from sector 360 into whole extension sectors
/// (359, 358, ...) when one sector cannot address the disk.  Only the
/// canonical sector carries the header fields.
pub struct ExpandedVtoc {
    disk: DiskRef,
    max_disk_size: SectorNum,
    reserve_720: bool,
}

impl ExpandedVtoc {
    pub fn new(disk: DiskRef, max_disk_size: SectorNum, reserve_720: bool) -> ExpandedVtoc {
        ExpandedVtoc {
            disk,
            max_disk_size,
            reserve_720,
        }
    }

    /// Highest sector number the bitmap manages.
    fn disk_size(&self) -> SectorNum {
        self.disk.borrow().sector_count().min(self.max_disk_size)
    }

    fn sector_size(&self) -> usize {
        self.disk.borrow().sector_size()
    }

    fn vtoc_sector_count(&self) -> usize {
        let sector_size = self.sector_size();
        let canonical_bits = (sector_size - VTOC_BITMAP_OFFSET) * 8;
        let extension_bits = sector_size * 8;
        let bits = self.disk_size() + 1;
        if bits <= canonical_bits {
            1
        } else {
            1 + (bits - canonical_bits + extension_bits - 1) / extension_bits
        }
    }

    /// Translate a sector number to the bitmap sector, byte offset, and bit
    /// mask that address it.
    fn locate(&self, num: SectorNum) -> io::Result<(SectorNum, usize, u8)> {
        if num > self.disk_size() {
            return Err(DiskError::InvalidSector.into());
        }
        let sector_size = self.sector_size();
        let mut sector = VTOC_SECTOR;
        let mut offset = VTOC_BITMAP_OFFSET;
        let mut rest = num;
        loop {
            let bits = (sector_size - offset) * 8;
            if rest < bits {
                break;
            }
            rest -= bits;
            sector -= 1;
            offset = 0;
        }
        Ok((sector, offset + rest / 8, bit_mask(rest)))
    }
}

impl Allocator for ExpandedVtoc {
    fn format(&mut self) -> io::Result<()> {
        let disk_size = self.disk_size();
        let sector_size = self.sector_size();
        let version = if disk_size > SIMPLE_BITMAP_LIMIT {
            VTOC_VERSION_EXPANDED
        } else {
            VTOC_VERSION_DOS2
        };
        // Every sector after the boot sectors starts out free.
        let mut size = disk_size.saturating_sub(BOOT_SECTOR_COUNT);
        let mut sector = VTOC_SECTOR;
        {
            let mut disk = self.disk.borrow_mut();
            let cache = disk.cache();
            loop {
                let handle = cache.init(sector)?;
                let mut head = 0;
                if sector == VTOC_SECTOR {
                    cache.poke(handle, VTOC_VERSION_OFFSET, version)?;
                    cache.dpoke(handle, VTOC_CAPACITY_OFFSET, size as u16)?;
                    cache.dpoke(handle, VTOC_FREE_OFFSET, size as u16)?;
                    // Sectors 4-7 by hand, leaving 0-3 used.
                    cache.poke(handle, VTOC_BITMAP_OFFSET, 0x0F)?;
                    head = VTOC_BITMAP_OFFSET + 1;
                    size = size.saturating_sub(4);
                }
                let bits = ((sector_size - head) * 8).min(size);
                cache.fill(handle, head, bits / 8, 0xFF)?;
                if bits % 8 != 0 {
                    cache.poke(handle, head + bits / 8, PARTIAL_BYTE[bits % 8])?;
                }
                size -= bits;
                if size == 0 {
                    break;
                }
                sector -= 1;
            }
        }

        for num in self.vtoc_sectors() {
            self.mark_used(num)?;
        }
        for num in FIRST_DIRECTORY_SECTOR..FIRST_DIRECTORY_SECTOR + DIRECTORY_SECTOR_COUNT {
            self.mark_used(num)?;
        }
        for num in self.reserved_sectors() {
            self.mark_used(num)?;
        }

        let mut disk = self.disk.borrow_mut();
        let free = disk.read_word(VTOC_SECTOR, VTOC_FREE_OFFSET)?;
        disk.write_word(VTOC_SECTOR, VTOC_CAPACITY_OFFSET, free)?;
        info!(
            "vtoc: formatted {} sectors in {} bitmap sectors, {} free",
            disk_size,
            VTOC_SECTOR - sector + 1,
            free
        );
        Ok(())
    }

    fn alloc_sector(&mut self) -> io::Result<SectorNum> {
        let disk_size = self.disk_size();
        let mut base = 0;
        for (i, sector) in self.vtoc_sectors().into_iter().enumerate() {
            let start = if i == 0 { VTOC_BITMAP_OFFSET } else { 0 };
            let bytes = self.disk.borrow_mut().read_sector(sector)?;
            let found = bytes[start..]
                .iter()
                .position(|&b| b != 0)
                .map(|p| base + p * 8 + first_free_bit(bytes[start + p]));
            match found {
                Some(num) if num <= disk_size => {
                    self.switch_sector_use(num)?;
                    debug!("vtoc: allocated sector {}", num);
                    return Ok(num);
                }
                Some(num) => {
                    warn!("vtoc: free bit for sector {} beyond the disk", num);
                    break;
                }
                None => base += (bytes.len() - start) * 8,
            }
        }
        Err(DiskError::DiskFull.into())
    }

    fn switch_sector_use(&mut self, num: SectorNum) -> io::Result<()> {
        let (sector, offset, mask) = self.locate(num)?;
        let mut disk = self.disk.borrow_mut();
        let byte = disk.read_byte(sector, offset)? ^ mask;
        disk.write_byte(sector, offset, byte)?;
        let free = disk.read_word(VTOC_SECTOR, VTOC_FREE_OFFSET)?;
        let free = if byte & mask != 0 {
            free.wrapping_add(1)
        } else {
            free.wrapping_sub(1)
        };
        disk.write_word(VTOC_SECTOR, VTOC_FREE_OFFSET, free)
    }

    fn is_free(&self, num: SectorNum) -> io::Result<bool> {
        let (sector, offset, mask) = self.locate(num)?;
        Ok(self.disk.borrow_mut().read_byte(sector, offset)? & mask != 0)
    }

    fn free_sector_count(&self) -> io::Result<usize> {
        Ok(self
            .disk
            .borrow_mut()
            .read_word(VTOC_SECTOR, VTOC_FREE_OFFSET)? as usize)
    }

    fn capacity(&self) -> io::Result<usize> {
        Ok(self
            .disk
            .borrow_mut()
            .read_word(VTOC_SECTOR, VTOC_CAPACITY_OFFSET)? as usize)
    }

    fn version(&self) -> io::Result<u8> {
        self.disk
            .borrow_mut()
            .read_byte(VTOC_SECTOR, VTOC_VERSION_OFFSET)
    }

    fn bitmap_limit(&self) -> SectorNum {
        self.disk_size() + 1
    }

    fn vtoc_sectors(&self) -> Vec<SectorNum> {
        (0..self.vtoc_sector_count())
            .map(|i| VTOC_SECTOR - i)
            .collect()
    }

    fn reserved_sectors(&self) -> Vec<SectorNum> {
        if self.reserve_720 && RESERVED_SECTOR <= self.disk_size() {
            vec![RESERVED_SECTOR]
        } else {
            vec![]
        }
    }
}
