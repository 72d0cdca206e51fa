extern crate atr;
extern crate clap;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use std::io::{self, Write};
use std::path::Path;
use std::process;

use atr::disk::{self, Directory, DiskError, FileOps, Filesystem};
use atr::index::{self, PackOptions, DEFAULT_INDEX_FILE};
use atr::AtariName;

// Possible exit codes
static _EXIT_SUCCESS: i32 = 0;
static EXIT_FAILURE: i32 = 1;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    // Parse command-line arguments
    let diskimage = || Arg::with_name("diskimage").required(true);
    let index_file = || {
        Arg::with_name("index")
            .default_value(DEFAULT_INDEX_FILE)
            .help("Directory index file")
    };
    let app = App::new("Atari Disk Image Utility")
        .version("0.1.0")
        .about("Read, write, and understand ATR disk images.")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("list")
                .about("Show a directory listing")
                .arg(diskimage()),
        )
        .subcommand(
            SubCommand::with_name("pack")
                .about("Create a disk image from a directory index and host files.")
                .arg(
                    Arg::with_name("dos")
                        .short("d")
                        .long("dos")
                        .takes_value(true)
                        .possible_values(&["2", "2.0", "2.5", "mydos", "II+", "xdos", "rkdos"])
                        .case_insensitive(true)
                        .help("DOS to format with, overriding the index"),
                )
                .arg(
                    Arg::with_name("sectors")
                        .short("n")
                        .long("sectors")
                        .takes_value(true)
                        .validator(sector_count_validator)
                        .help("Number of sectors, overriding the index"),
                )
                .arg(
                    Arg::with_name("sector-size")
                        .short("s")
                        .long("sector-size")
                        .takes_value(true)
                        .possible_values(&["128", "256", "512"])
                        .help("Sector size in bytes, overriding the index"),
                )
                .arg(diskimage())
                .arg(index_file()),
        )
        .subcommand(
            SubCommand::with_name("unpack")
                .about("Extract every file and write a directory index.")
                .arg(diskimage())
                .arg(index_file()),
        )
        .subcommand(
            SubCommand::with_name("dump")
                .about("Provide a hex dump of a disk image or file.")
                .arg(diskimage())
                .arg(Arg::with_name("filename").required(false)),
        )
        .subcommand(
            SubCommand::with_name("validate")
                .about("Validate a disk image.")
                .arg(diskimage()),
        );

    let mut app_clone = app.clone();
    let matches = app.get_matches();

    let result = match matches.subcommand() {
        ("list", Some(m)) => cmd_list(diskimage_of(m)),
        ("pack", Some(m)) => cmd_pack(diskimage_of(m), index_of(m), pack_options(m)),
        ("unpack", Some(m)) => cmd_unpack(diskimage_of(m), index_of(m)),
        ("dump", Some(m)) => cmd_dump(diskimage_of(m), m.value_of("filename")),
        ("validate", Some(m)) => cmd_validate(diskimage_of(m)),
        _ => {
            let _ = app_clone.print_help();
            println!();
            process::exit(EXIT_FAILURE);
        }
    };
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(EXIT_FAILURE);
    }
}

fn diskimage_of<'a>(m: &'a ArgMatches) -> &'a str {
    m.value_of("diskimage").unwrap_or_default()
}

fn index_of<'a>(m: &'a ArgMatches) -> &'a str {
    m.value_of("index").unwrap_or(DEFAULT_INDEX_FILE)
}

/// Require a sector count to be a number the ATR header can describe.
fn sector_count_validator(v: String) -> Result<(), String> {
    match v.parse::<usize>() {
        Ok(n) if (3..=0xFFFF).contains(&n) => Ok(()),
        _ => Err("Expected a sector count from 3-65535.".to_string()),
    }
}

fn pack_options(m: &ArgMatches) -> PackOptions {
    PackOptions {
        dos: m.value_of("dos").map(str::to_string),
        sector_count: m.value_of("sectors").and_then(|v| v.parse().ok()),
        sector_size: m.value_of("sector-size").and_then(|v| v.parse().ok()),
    }
}

/// Find a file in the root directory by its escaped name.
fn open_atari_file(fs: &dyn Filesystem, filename: &str) -> io::Result<Box<dyn FileOps>> {
    let name: AtariName = filename.parse()?;
    let mut dir = fs.root_dir()?;
    while !dir.at_end() {
        if !dir.is_deleted() && !dir.is_dir() && dir.raw_name() == name {
            return dir.open_file();
        }
        dir.next()?;
    }
    Err(DiskError::MissingFile.into())
}

fn cmd_list(diskimage: &str) -> io::Result<()> {
    let fs = disk::open(diskimage)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    index::list(&*fs, &mut out)?;
    out.flush()
}

fn cmd_pack(diskimage: &str, index_file: &str, options: PackOptions) -> io::Result<()> {
    let fs = index::pack(Path::new(index_file), &options)?;
    let disk = fs.disk();
    let mut disk = disk.borrow_mut();
    disk.save(diskimage)
}

fn cmd_unpack(diskimage: &str, index_file: &str) -> io::Result<()> {
    let fs = disk::open(diskimage)?;
    let index_path = Path::new(index_file);
    if let Some(parent) = index_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    index::unpack(&*fs, index_path)
}

fn cmd_dump(diskimage: &str, filename: Option<&str>) -> io::Result<()> {
    let fs = disk::open(diskimage)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    match filename {
        Some(filename) => {
            let mut file = open_atari_file(&*fs, filename)?;
            file.dump(&mut out)?;
        }
        None => fs.disk().borrow_mut().dump(&mut out)?,
    }
    out.flush()
}

fn cmd_validate(diskimage: &str) -> io::Result<()> {
    let fs = disk::open(diskimage)?;
    let errors = fs.validate()?;
    for e in errors.iter() {
        println!("{}", e);
    }
    if errors.is_empty() {
        println!("Disk validates successfully.");
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::Other,
            format!("{} errors found during validation.", errors.len()),
        ))
    }
}
