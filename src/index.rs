//! Directory index files
//!
//! An index is a line-oriented text file describing the contents of a disk
//! image, so a disk can be unpacked to host files and packed back again:
//!
//! ```text
//! ; comment
//! DISK 1040 128
//! FORMAT 2.5
//! BOOT boot.bin
//! BUFFERS $03
//! DOS.SYS DOS dos.sys
//! AUTORUN.SYS
//! README.TXT BIN readme.txt
//! EMPTY ---
//! ```
//!
//! Host file names are relative to the directory holding the index.

use std::collections::HashSet;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{error, info, warn};

use crate::atascii::AtariName;
use crate::disk::{self, Directory, DiskError, Filesystem, SectorNum};

pub const DEFAULT_INDEX_FILE: &str = "atr.dir";
pub const DEFAULT_DOS: &str = "2.5";
pub const DEFAULT_SECTOR_COUNT: SectorNum = 1040;
pub const DEFAULT_SECTOR_SIZE: usize = 128;
/// Host file receiving the boot sectors on unpack.
pub const BOOT_FILE: &str = "boot.bin";

const KEYWORD_DISK: &str = "DISK";
const KEYWORD_FORMAT: &str = "FORMAT";
const KEYWORD_BOOT: &str = "BOOT";

/// Settings that take precedence over the index's own `DISK` and `FORMAT`
/// lines.
#[derive(Clone, Debug, Default)]
pub struct PackOptions {
    pub dos: Option<String>,
    pub sector_count: Option<SectorNum>,
    pub sector_size: Option<usize>,
}

/// Where the contents of a packed file come from.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Source<'a> {
    Import(&'a str),
    Dos(&'a str),
    Empty,
}

/// One meaningful line of an index.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Line<'a> {
    Disk(SectorNum, usize),
    Format(&'a str),
    Boot(&'a str),
    /// Anything else: a property assignment or a file, depending on the
    /// variant's property table.
    Other(&'a str),
}

fn is_directive(word: &str) -> bool {
    word == "---" || word.eq_ignore_ascii_case("BIN") || word.eq_ignore_ascii_case("DOS")
}

fn invalid_index() -> io::Error {
    DiskError::InvalidIndex.into()
}

/// Classify a line.  Keyword lines must have exactly the expected
/// arguments, so a file named like a keyword can still be listed with an
/// explicit directive.
fn parse_line(line: &str) -> Option<Line<'_>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(';') {
        return None;
    }
    let words: Vec<&str> = line.split_whitespace().collect();
    let parsed = match words.as_slice() {
        [KEYWORD_DISK, count, size] => match (count.parse(), size.parse()) {
            (Ok(count), Ok(size)) => Some(Line::Disk(count, size)),
            _ => None,
        },
        [KEYWORD_FORMAT, dos] if !is_directive(dos) => Some(Line::Format(*dos)),
        [KEYWORD_BOOT, path] if !is_directive(path) => Some(Line::Boot(*path)),
        _ => None,
    };
    Some(parsed.unwrap_or(Line::Other(line)))
}

/// Split a file line into the Atari name and the source of its contents.
fn parse_file_line(line: &str) -> io::Result<(AtariName, Source<'_>)> {
    let (name, rest) = AtariName::parse_prefix(line)?;
    let name_text = line[..line.len() - rest.len()].trim();
    let mut words = rest.split_whitespace();
    let source = match words.next() {
        None => {
            if name_text.contains('\\') {
                return Err(invalid_index());
            }
            Source::Import(name_text)
        }
        Some("---") => Source::Empty,
        Some(word) if word.eq_ignore_ascii_case("BIN") => {
            Source::Import(words.next().ok_or_else(invalid_index)?)
        }
        Some(word) if word.eq_ignore_ascii_case("DOS") => {
            Source::Dos(words.next().ok_or_else(invalid_index)?)
        }
        Some(path) => Source::Import(path),
    };
    if words.next().is_some() {
        return Err(invalid_index());
    }
    Ok((name, source))
}

/// Builds a disk from index lines.  The filesystem is formatted on the
/// first line that needs it, so `DISK` and `FORMAT` must come first.
struct Packer<'o> {
    base: PathBuf,
    options: &'o PackOptions,
    dos: String,
    sector_count: SectorNum,
    sector_size: usize,
    fs: Option<Box<dyn Filesystem>>,
}

impl<'o> Packer<'o> {
    fn new(base: PathBuf, options: &'o PackOptions) -> Packer<'o> {
        Packer {
            base,
            options,
            dos: DEFAULT_DOS.to_string(),
            sector_count: DEFAULT_SECTOR_COUNT,
            sector_size: DEFAULT_SECTOR_SIZE,
            fs: None,
        }
    }

    fn filesystem(&mut self) -> io::Result<&mut Box<dyn Filesystem>> {
        if self.fs.is_none() {
            let dos = self.options.dos.as_deref().unwrap_or(&self.dos);
            let sector_count = self.options.sector_count.unwrap_or(self.sector_count);
            let sector_size = self.options.sector_size.unwrap_or(self.sector_size);
            info!(
                "pack: formatting {} sectors of {} bytes as DOS {}",
                sector_count, sector_size, dos
            );
            self.fs = Some(disk::create(sector_size, sector_count, dos)?);
        }
        self.fs.as_mut().ok_or_else(|| DiskError::Unknown.into())
    }

    fn line(&mut self, line: &str) -> io::Result<()> {
        match parse_line(line) {
            None => Ok(()),
            Some(Line::Disk(count, size)) => {
                if self.fs.is_some() {
                    return Err(invalid_index());
                }
                self.sector_count = count;
                self.sector_size = size;
                Ok(())
            }
            Some(Line::Format(dos)) => {
                if self.fs.is_some() {
                    return Err(invalid_index());
                }
                self.dos = dos.to_string();
                Ok(())
            }
            Some(Line::Boot(path)) => {
                let path = self.base.join(path);
                let fs = self.filesystem()?;
                fs.disk().borrow_mut().install_boot(&path)?;
                info!("pack: installed boot sectors from {}", path.display());
                Ok(())
            }
            Some(Line::Other(text)) => self.property_or_file(text),
        }
    }

    fn property_or_file(&mut self, text: &str) -> io::Result<()> {
        let base = self.base.clone();
        let fs = self.filesystem()?;
        let mut words = text.splitn(2, char::is_whitespace);
        let key = words.next().unwrap_or("");
        let value = words.next().map(str::trim).unwrap_or("");
        let next_word = value.split_whitespace().next().unwrap_or("");
        if let Some(property) = fs.find_property(key) {
            if !value.is_empty() && !is_directive(next_word) {
                return fs.set_property(property, value);
            }
        }

        let (name, source) = parse_file_line(text)?;
        let mut file = fs.create_file(&name)?;
        match source {
            Source::Empty => {}
            Source::Import(path) | Source::Dos(path) => {
                file.import(&base.join(path))?;
            }
        }
        file.close()?;
        if let Source::Dos(_) = source {
            let first = file.first_sector();
            fs.set_dos_first_sector(first)?;
        }
        info!("pack: added {}", name);
        Ok(())
    }

    fn finish(mut self) -> io::Result<Box<dyn Filesystem>> {
        self.filesystem()?;
        self.fs.ok_or_else(|| DiskError::Unknown.into())
    }
}

/// Build a disk from an index file and the host files it names.
pub fn pack(index: &Path, options: &PackOptions) -> io::Result<Box<dyn Filesystem>> {
    let text = fs::read_to_string(index)?;
    let base = index.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut packer = Packer::new(base, options);
    for (number, line) in text.lines().enumerate() {
        if let Err(e) = packer.line(line) {
            error!("pack: {}:{}: {}", index.display(), number + 1, e);
            return Err(e);
        }
    }
    packer.finish()
}

/// Host name for a file whose Atari name does not survive as a host name:
/// `F<n>` plus the extension when it is plain.
fn host_name(name: &AtariName, number: usize) -> String {
    let extension = String::from_utf8_lossy(&name.as_bytes()[8..])
        .trim_end()
        .to_string();
    let plain = !extension.is_empty()
        && extension
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_');
    if plain {
        format!("F{}.{}", number, extension)
    } else {
        format!("F{}", number)
    }
}

fn is_reserved_word(fs: &dyn Filesystem, word: &str) -> bool {
    word == KEYWORD_DISK
        || word == KEYWORD_FORMAT
        || word == KEYWORD_BOOT
        || fs.find_property(word).is_some()
}

/// Write every file of the root directory to the index's directory, along
/// with the boot sectors and an index that packs them back into an
/// equivalent disk.  Subdirectories are skipped.
pub fn unpack(fs: &dyn Filesystem, index: &Path) -> io::Result<()> {
    let base = index.parent().map(Path::to_path_buf).unwrap_or_default();
    let mut out = BufWriter::new(fs::File::create(index)?);

    let disk = fs.disk();
    {
        let disk = disk.borrow();
        writeln!(out, "{} {} {}", KEYWORD_DISK, disk.sector_count(), disk.sector_size())?;
    }
    writeln!(out, "{} {}", KEYWORD_FORMAT, fs.name())?;
    disk.borrow_mut().save_boot(base.join(BOOT_FILE))?;
    writeln!(out, "{} {}", KEYWORD_BOOT, BOOT_FILE)?;
    for property in fs.properties() {
        let value = fs.get_property(property)?;
        let value = value.trim();
        if !value.is_empty() {
            writeln!(out, "{} {}", property.name, value)?;
        }
    }

    let dos_first = fs.get_dos_first_sector()?;
    let mut dir = fs.root_dir()?;
    let mut renamed = 0;
    while !dir.at_end() {
        if dir.is_deleted() {
            dir.next()?;
            continue;
        }
        let name = dir.name();
        if dir.is_dir() {
            warn!("unpack: skipping subdirectory {}", name);
            dir.next()?;
            continue;
        }
        if dir.sec_size() == 0 {
            writeln!(out, "{} ---", name)?;
            info!("unpack: {} (empty)", name);
            dir.next()?;
            continue;
        }

        let host = if name.contains('\\') {
            renamed += 1;
            host_name(&dir.raw_name(), renamed)
        } else {
            name.clone()
        };
        dir.open_file()?.save(&base.join(&host))?;
        let is_dos = dos_first != 0 && dir.first_sector() == dos_first;
        if is_dos {
            writeln!(out, "{} DOS {}", name, host)?;
        } else if host != name || is_reserved_word(fs, &name) {
            writeln!(out, "{} BIN {}", name, host)?;
        } else {
            writeln!(out, "{}", name)?;
        }
        info!("unpack: {} -> {}", name, host);
        dir.next()?;
    }
    out.flush()
}

fn list_directory(
    mut dir: Box<dyn Directory>,
    prefix: &str,
    visited: &mut HashSet<SectorNum>,
    writer: &mut dyn Write,
) -> io::Result<()> {
    while !dir.at_end() {
        if !dir.is_deleted() {
            let name = format!("{}{}", prefix, dir.name());
            if dir.is_dir() {
                writeln!(writer, "{} <DIR>", name)?;
                if !visited.insert(dir.first_sector()) {
                    return Err(DiskError::ChainLoop.into());
                }
                list_directory(dir.open_dir()?, &format!("{}>", name), visited, writer)?;
            } else {
                writeln!(writer, "{} {}", name, dir.sec_size())?;
            }
        }
        dir.next()?;
    }
    Ok(())
}

/// Print each entry's name and size in sectors, subdirectory contents
/// prefixed with their parent's name, then the free sector count.
pub fn list(fs: &dyn Filesystem, writer: &mut dyn Write) -> io::Result<()> {
    let mut visited = HashSet::new();
    list_directory(fs.root_dir()?, "", &mut visited, writer)?;
    writeln!(writer, "{} FREE SECTORS", fs.free_sector_count()?)
}
