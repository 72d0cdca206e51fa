use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use memmap::{Mmap, MmapMut, MmapOptions};

use crate::disk::error::DiskError;

/// Provide backing storage (file or memory) for container bytes.  A loaded
/// ATR file is mapped read-only and parsed into a `Memory` image holding the
/// flat sector space; saving maps the destination read-write.
pub enum Image {
    ReadOnlyMap(Mmap),
    ReadWriteMap(MmapMut),
    Memory(Box<[u8]>),
}

impl Image {
    pub fn open_memory(length: usize) -> io::Result<Image> {
        Ok(Image::Memory(vec![0; length].into_boxed_slice()))
    }

    pub fn open_read_only<P: AsRef<Path>>(path: P) -> io::Result<Image> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(DiskError::MissingFile.into())
            }
            Err(e) => return Err(e),
        };
        // Zero-length files cannot be mapped.
        if file.metadata()?.len() == 0 {
            return Ok(Image::Memory(Box::new([])));
        }
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(Image::ReadOnlyMap(mmap))
    }

    pub fn create<P: AsRef<Path>>(path: P, length: usize) -> io::Result<Image> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(length as u64)?;
        let mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(Image::ReadWriteMap(mmap))
    }

    pub fn len(&self) -> usize {
        match self {
            Image::ReadOnlyMap(mmap) => mmap.len(),
            Image::ReadWriteMap(mmap) => mmap.len(),
            Image::Memory(array) => array.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_bounds(&self, offset: usize) -> io::Result<()> {
        if offset > self.len() {
            Err(DiskError::InvalidOffset.into())
        } else {
            Ok(())
        }
    }

    pub fn slice(&self, offset: usize, length: usize) -> io::Result<&[u8]> {
        self.check_bounds(offset + length)?;
        Ok(match self {
            Image::ReadOnlyMap(mmap) => &mmap[offset..offset + length],
            Image::ReadWriteMap(mmap) => &mmap[offset..offset + length],
            Image::Memory(array) => &array[offset..offset + length],
        })
    }

    pub fn slice_mut(&mut self, offset: usize, length: usize) -> io::Result<&mut [u8]> {
        self.check_bounds(offset + length)?;
        match self {
            Image::ReadOnlyMap(_) => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "write access attempted to read-only media",
            )),
            Image::ReadWriteMap(mmap) => Ok(&mut mmap[offset..offset + length]),
            Image::Memory(array) => Ok(&mut array[offset..offset + length]),
        }
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match self {
            Image::ReadOnlyMap(_) => Ok(()),
            Image::ReadWriteMap(mmap) => mmap.flush(),
            Image::Memory(_) => Ok(()),
        }
    }
}
