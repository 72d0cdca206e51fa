//! A small fixed-capacity sector cache.  Every sector access in the crate
//! goes through here, so there is exactly one live copy of any sector's
//! contents at a time.

use std::io;

use log::trace;

use crate::disk::error::DiskError;
use crate::disk::image::Image;
use crate::disk::{Geometry, SectorNum};

/// Number of resident sectors unless a caller asks for something else.
pub const DEFAULT_CACHE_CAPACITY: usize = 4;

/// A token naming one resident sector.  It stays usable only while the slot
/// it points at still holds the same load of the same sector; any cache miss
/// may recycle the slot, after which the handle yields `StaleSector`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SectorHandle {
    slot: usize,
    generation: u64,
    sector: SectorNum,
}

impl SectorHandle {
    /// The sector number this handle was issued for.
    pub fn sector(&self) -> SectorNum {
        self.sector
    }
}

struct Slot {
    sector: Option<SectorNum>,
    dirty: bool,
    generation: u64,
    last_used: u64,
    buf: Vec<u8>,
}

pub struct SectorCache {
    image: Image,
    geometry: Geometry,
    slots: Vec<Slot>,
    clock: u64,
    generation: u64,
    loads: usize,
}

impl SectorCache {
    /// Wrap a flat sector image.  A zero capacity is treated as one.
    pub fn new(image: Image, geometry: Geometry, capacity: usize) -> SectorCache {
        let slots = (0..capacity.max(1))
            .map(|_| Slot {
                sector: None,
                dirty: false,
                generation: 0,
                last_used: 0,
                buf: Vec::with_capacity(geometry.sector_size),
            })
            .collect();
        SectorCache {
            image,
            geometry,
            slots,
            clock: 0,
            generation: 0,
            loads: 0,
        }
    }

    #[inline]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of times a sector has been read from the backing image.
    #[inline]
    pub fn loads(&self) -> usize {
        self.loads
    }

    /// Return a handle for sector `num`, loading it if it is not resident.
    /// With `zero_init` the buffer is cleared and marked dirty instead of
    /// being read, which is what formatting wants.
    pub fn get_or_init(&mut self, num: SectorNum, zero_init: bool) -> io::Result<SectorHandle> {
        let offset = self.geometry.offset(num)?;
        let length = self.geometry.sector_len(num);
        self.clock += 1;

        if let Some(index) = self.slots.iter().position(|s| s.sector == Some(num)) {
            let slot = &mut self.slots[index];
            slot.last_used = self.clock;
            if zero_init {
                slot.buf.iter_mut().for_each(|b| *b = 0);
                slot.dirty = true;
            }
            return Ok(SectorHandle {
                slot: index,
                generation: slot.generation,
                sector: num,
            });
        }

        let index = self.victim();
        self.flush_slot(index)?;
        self.generation += 1;

        let slot = &mut self.slots[index];
        if let Some(evicted) = slot.sector {
            trace!("cache: evicting sector {} from slot {}", evicted, index);
        }
        slot.buf.clear();
        if zero_init {
            slot.buf.resize(length, 0);
            slot.dirty = true;
        } else {
            slot.buf
                .extend_from_slice(self.image.slice(offset, length)?);
            slot.dirty = false;
            self.loads += 1;
            trace!("cache: loaded sector {} into slot {}", num, index);
        }
        slot.sector = Some(num);
        slot.generation = self.generation;
        slot.last_used = self.clock;

        Ok(SectorHandle {
            slot: index,
            generation: slot.generation,
            sector: num,
        })
    }

    #[inline]
    pub fn get(&mut self, num: SectorNum) -> io::Result<SectorHandle> {
        self.get_or_init(num, false)
    }

    #[inline]
    pub fn init(&mut self, num: SectorNum) -> io::Result<SectorHandle> {
        self.get_or_init(num, true)
    }

    /// Pick the slot to recycle: an empty one if any, else the least recently
    /// used.
    fn victim(&self) -> usize {
        if let Some(index) = self.slots.iter().position(|s| s.sector.is_none()) {
            return index;
        }
        self.slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.last_used)
            .map(|(i, _)| i)
            .unwrap_or(0)
    }

    fn flush_slot(&mut self, index: usize) -> io::Result<()> {
        let slot = &mut self.slots[index];
        if let (true, Some(num)) = (slot.dirty, slot.sector) {
            let offset = self.geometry.offset(num)?;
            self.image
                .slice_mut(offset, slot.buf.len())?
                .copy_from_slice(&slot.buf);
            slot.dirty = false;
        }
        Ok(())
    }

    /// Write every dirty resident sector back to the image.
    pub fn flush_all(&mut self) -> io::Result<()> {
        for index in 0..self.slots.len() {
            self.flush_slot(index)?;
        }
        Ok(())
    }

    fn slot(&self, handle: SectorHandle) -> io::Result<&Slot> {
        match self.slots.get(handle.slot) {
            Some(slot)
                if slot.generation == handle.generation
                    && slot.sector == Some(handle.sector) =>
            {
                Ok(slot)
            }
            _ => Err(DiskError::StaleSector.into()),
        }
    }

    fn slot_mut(&mut self, handle: SectorHandle) -> io::Result<&mut Slot> {
        match self.slots.get_mut(handle.slot) {
            Some(slot)
                if slot.generation == handle.generation
                    && slot.sector == Some(handle.sector) =>
            {
                Ok(slot)
            }
            _ => Err(DiskError::StaleSector.into()),
        }
    }

    pub fn buffer(&self, handle: SectorHandle) -> io::Result<&[u8]> {
        Ok(&self.slot(handle)?.buf)
    }

    /// Mutable access to a resident sector; the sector is marked dirty.
    pub fn buffer_mut(&mut self, handle: SectorHandle) -> io::Result<&mut [u8]> {
        let slot = self.slot_mut(handle)?;
        slot.dirty = true;
        Ok(&mut slot.buf)
    }

    pub fn peek(&self, handle: SectorHandle, offset: usize) -> io::Result<u8> {
        self.buffer(handle)?
            .get(offset)
            .cloned()
            .ok_or_else(|| DiskError::InvalidOffset.into())
    }

    pub fn poke(&mut self, handle: SectorHandle, offset: usize, value: u8) -> io::Result<()> {
        match self.buffer_mut(handle)?.get_mut(offset) {
            Some(b) => {
                *b = value;
                Ok(())
            }
            None => Err(DiskError::InvalidOffset.into()),
        }
    }

    /// Little-endian word at `offset`.
    pub fn dpeek(&self, handle: SectorHandle, offset: usize) -> io::Result<u16> {
        let lo = self.peek(handle, offset)? as u16;
        let hi = self.peek(handle, offset + 1)? as u16;
        Ok(lo | hi << 8)
    }

    pub fn dpoke(&mut self, handle: SectorHandle, offset: usize, value: u16) -> io::Result<()> {
        self.poke(handle, offset, value as u8)?;
        self.poke(handle, offset + 1, (value >> 8) as u8)
    }

    pub fn fill(
        &mut self,
        handle: SectorHandle,
        offset: usize,
        length: usize,
        value: u8,
    ) -> io::Result<()> {
        let buf = self.buffer_mut(handle)?;
        match buf.get_mut(offset..offset + length) {
            Some(range) => {
                range.iter_mut().for_each(|b| *b = value);
                Ok(())
            }
            None => Err(DiskError::InvalidOffset.into()),
        }
    }

    pub fn read_byte(&mut self, num: SectorNum, offset: usize) -> io::Result<u8> {
        let handle = self.get(num)?;
        self.peek(handle, offset)
    }

    pub fn write_byte(&mut self, num: SectorNum, offset: usize, value: u8) -> io::Result<()> {
        let handle = self.get(num)?;
        self.poke(handle, offset, value)
    }

    pub fn read_word(&mut self, num: SectorNum, offset: usize) -> io::Result<u16> {
        let handle = self.get(num)?;
        self.dpeek(handle, offset)
    }

    pub fn write_word(&mut self, num: SectorNum, offset: usize, value: u16) -> io::Result<()> {
        let handle = self.get(num)?;
        self.dpoke(handle, offset, value)
    }

    /// Copy a sector's contents out of the cache.
    pub fn read_sector(&mut self, num: SectorNum) -> io::Result<Vec<u8>> {
        let handle = self.get(num)?;
        Ok(self.buffer(handle)?.to_vec())
    }

    /// Replace a sector's contents.  `data` may be shorter than the sector;
    /// the remainder is left untouched.
    pub fn write_sector(&mut self, num: SectorNum, data: &[u8]) -> io::Result<()> {
        let handle = self.get(num)?;
        let buf = self.buffer_mut(handle)?;
        if data.len() > buf.len() {
            return Err(DiskError::InvalidOffset.into());
        }
        buf[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Flush and expose the backing image.
    pub fn image(&mut self) -> io::Result<&Image> {
        self.flush_all()?;
        Ok(&self.image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> SectorCache {
        let geometry = Geometry::new(128, 720);
        let image = Image::open_memory(geometry.byte_size()).unwrap();
        SectorCache::new(image, geometry, capacity)
    }

    #[test]
    fn test_eviction_forces_reload() {
        let mut cache = cache(4);
        for num in 1..=5 {
            cache.get(num).unwrap();
        }
        assert_eq!(cache.loads(), 5);
        // Sector 1 is the least recently used and must have been evicted.
        cache.get(1).unwrap();
        assert_eq!(cache.loads(), 6);
        // Sector 5 is still resident.
        cache.get(5).unwrap();
        assert_eq!(cache.loads(), 6);
    }

    #[test]
    fn test_hit_promotes() {
        let mut cache = cache(4);
        for num in 1..=4 {
            cache.get(num).unwrap();
        }
        cache.get(1).unwrap();
        cache.get(5).unwrap(); // evicts 2, not 1
        let loads = cache.loads();
        cache.get(1).unwrap();
        assert_eq!(cache.loads(), loads);
        cache.get(2).unwrap();
        assert_eq!(cache.loads(), loads + 1);
    }

    #[test]
    fn test_stale_handle() {
        let mut cache = cache(4);
        let first = cache.get(10).unwrap();
        cache.poke(first, 0, 0xAA).unwrap();
        for num in 11..=14 {
            cache.get(num).unwrap();
        }
        assert!(cache.peek(first, 0).unwrap_err() == DiskError::StaleSector);
        // The write survived eviction.
        assert_eq!(cache.read_byte(10, 0).unwrap(), 0xAA);
    }

    #[test]
    fn test_dirty_write_back() {
        let mut cache = cache(1);
        cache.write_word(400, 3, 0x1234).unwrap();
        cache.get(401).unwrap();
        assert_eq!(cache.read_word(400, 3).unwrap(), 0x1234);
        let image = cache.image().unwrap();
        let offset = Geometry::new(128, 720).offset(400).unwrap();
        assert_eq!(image.slice(offset + 3, 2).unwrap(), &[0x34, 0x12]);
    }

    #[test]
    fn test_init_zeroes() {
        let mut cache = cache(2);
        cache.write_byte(7, 5, 0x55).unwrap();
        let handle = cache.init(7).unwrap();
        assert_eq!(cache.peek(handle, 5).unwrap(), 0);
    }

    #[test]
    fn test_boot_sectors_are_short() {
        let geometry = Geometry::new(256, 720);
        let image = Image::open_memory(geometry.byte_size()).unwrap();
        let mut cache = SectorCache::new(image, geometry, 4);
        assert_eq!(cache.read_sector(3).unwrap().len(), 128);
        assert_eq!(cache.read_sector(4).unwrap().len(), 256);
        assert!(cache.get(0).is_err());
        assert!(cache.get(721).is_err());
    }
}
