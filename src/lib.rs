//! This is a Rust library for working with ATR disk images, the common
//! container for floppy disks of the Atari 8-bit home computers (400, 800,
//! XL and XE series).
//!
//! Features:
//!
//! * Load and save ATR images, including enhanced (1040 sector) and double
//! density disks, through a small write-back sector cache.
//! * Format disk images with Atari DOS 2.0, DOS 2.5, MyDOS, DOS II+, XDOS
//! and RK-DOS, and detect which of these (or SpartaDOS) a disk carries.
//! * Iterate directory entries, including MyDOS and RK-DOS subdirectories.
//! * Read and write files, following the DOS 2 sector chains or the RK-DOS
//! clusters.
//! * Read SpartaDOS files and directories.  (Currently read-only.)
//! * Get and set boot sector properties such as the number of DOS buffers.
//! * Validate the consistency of DOS 2 family disk images.
//! * Convert between escaped text and raw 8.3 Atari filenames.
//! * Pack a disk from host files described by a directory index, and unpack
//! a disk into one.
//! * A sample `atr` program for operating on disk images from the command
//! line.
//!
//! Current shortcomings:
//!
//! * Files cannot be deleted or renamed.
//! * SpartaDOS disks cannot be formatted or written.
//!
//! # Example
//!
//! The following example creates a DOS 2.5 disk with one file, then reads
//! the directory back:
//!
//! ```
//! use std::io;
//! use atr::disk::{self, Directory, FileOps, Filesystem};
//! # fn main() -> io::Result<()> {
//!
//! let mut fs = disk::create(128, 1040, "2.5")?;
//! let mut file = fs.create_file(&"HELLO.TXT".parse()?)?;
//! file.write_bytes(b"Hello, Atari!\x9b")?;
//! file.close()?;
//!
//! let mut dir = fs.root_dir()?;
//! while !dir.at_end() {
//!     println!("{} {}", dir.name(), dir.sec_size());
//!     dir.next()?;
//! }
//! println!("{} free sectors", fs.free_sector_count()?);
//! # Ok(())
//! # }
//! ```
//!
//! This prints:
//!
//! ```text
//! HELLO.TXT 1
//! 1009 free sectors
//! ```
//!
//! For more examples, see the accompanying `atr` program:
//!
//! ```text
//! atr list game.atr
//! atr unpack game.atr game/atr.dir
//! atr pack --dos mydos new.atr game/atr.dir
//! ```

pub mod atascii;
pub mod disk;
pub mod index;
mod util;

pub use crate::atascii::AtariName;
