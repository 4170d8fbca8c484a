//! cmunpack decompresses "CM" streams, which carry their own real-mode
//! decompression routine.
//!
//! # Decompression
//!
//! ```sh
//! cmunpack input.cm output.bin
//! ```
//!
//! # Listing
//!
//! ```sh
//! cmunpack --list input.cm
//! ```
//!
//! Shows the block table and where the decompressor image is, without running
//! anything.
//!
//! # Exit status
//!
//! Exit status is 0 if there was no error, or 1 if there was any kind of error
//! (I/O error, format error, or a decompressor that misbehaved).

use std::ffi::OsString;
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process;

extern crate cmunpack as cmunpack_crate;
use cmunpack_crate::stream;
use cmunpack_crate::Options;

/// An error that may occur while processing a stream.
#[derive(Debug)]
enum Error {
    /// An I/O error.
    Io(io::Error),
    /// A decompression error.
    Cm(cmunpack_crate::Error),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => err.fmt(f),
            Error::Cm(err) => err.fmt(f),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<cmunpack_crate::Error> for Error {
    fn from(err: cmunpack_crate::Error) -> Self {
        Error::Cm(err)
    }
}

impl From<stream::FormatError> for Error {
    fn from(err: stream::FormatError) -> Self {
        Error::Cm(err.into())
    }
}

/// An `Error` annotated with a `Path`.
#[derive(Debug)]
struct PathError {
    path: PathBuf,
    err: Error,
}

impl PathError {
    fn new<P: AsRef<Path>>(path: P, err: Error) -> Self {
        Self { path: path.as_ref().to_owned(), err }
    }
}

impl std::error::Error for PathError {}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.err)
    }
}

fn read_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, Error> {
    let mut buf = Vec::new();
    File::open(path)?.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Reads a stream from `input_path`, decompresses it, and writes the result
/// to `output_path`.
fn decompress_file<P, Q>(input_path: P, output_path: Q, options: &Options) -> Result<(), PathError>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    // Any error here gets annotated with input_path.
    let output = (|| -> Result<_, Error> {
        let input = read_file(&input_path)?;
        Ok(cmunpack_crate::decompress_with(&input, options)?)
    })()
        .map_err(|err| PathError::new(&input_path, err))?;

    // Any error here gets annotated with output_path.
    (|| -> Result<_, Error> {
        let f = File::create(&output_path)?;
        let mut w = io::BufWriter::new(f);
        w.write_all(&output)?;
        w.flush()?;
        Ok(())
    })()
        .map_err(|err| PathError::new(&output_path, err))
}

/// Prints the block table and decompressor image location of the stream in
/// `input_path` to `w`.
fn list_file<P, W>(input_path: P, w: &mut W) -> Result<(), PathError>
where
    P: AsRef<Path>,
    W: Write + ?Sized,
{
    (|| -> Result<_, Error> {
        let input = read_file(&input_path)?;
        let container = stream::Container::parse(&input)?;
        writeln!(w, "{:>8} {:>10} {:>12} {:>7}", "offset", "compressed", "uncompressed", "control")?;
        let mut total = 0;
        for block in container.blocks() {
            let block = block?;
            let sub_header = block.sub_header()?;
            writeln!(w, "{:>8} {:>10} {:>12} {:#07x}",
                block.offset, block.compressed_len(), block.uncompressed_len, sub_header.control)?;
            total += usize::from(block.uncompressed_len);
        }
        let image = container.image();
        writeln!(w, "decompressor at offset {}: {} paragraphs, entry {:#06x}",
            image.offset, image.len_paragraphs, image.entry)?;
        writeln!(w, "total uncompressed length {}", total)?;
        Ok(())
    })()
        .map_err(|err| PathError::new(&input_path, err))
}

/// Prints a usage message to `w`.
fn print_usage<W: Write + ?Sized>(w: &mut W) -> io::Result<()> {
    write!(w, "\
Usage: cmunpack [OPTION]... INPUT OUTPUT
       cmunpack --list INPUT
Decompress a CM stream by running its embedded decompressor.

Options:
    -l, --list          show the block table instead of decompressing
        --max-steps N   give up on a block after N instructions
    -v, --verbose       log progress to stderr; repeat to trace instructions
    -h, --help          show this help
")
}

struct Args {
    list: bool,
    help: bool,
    verbosity: u8,
    options: Options,
    free: Vec<OsString>,
}

fn parse_args() -> Result<Args, lexopt::Error> {
    use lexopt::prelude::*;

    let mut args = Args {
        list: false,
        help: false,
        verbosity: 0,
        options: Options::default(),
        free: Vec::new(),
    };
    let mut parser = lexopt::Parser::from_env();
    while let Some(arg) = parser.next()? {
        match arg {
            Short('l') | Long("list") => args.list = true,
            Long("max-steps") => args.options.max_steps = Some(parser.value()?.parse()?),
            Short('v') | Long("verbose") => args.verbosity = args.verbosity.saturating_add(1),
            Short('h') | Long("help") => args.help = true,
            Value(value) => args.free.push(value),
            _ => return Err(arg.unexpected()),
        }
    }
    Ok(args)
}

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(err) => {
            eprintln!("{}", err);
            process::exit(1);
        }
    };

    if args.help {
        print_usage(&mut io::stdout()).unwrap();
        return;
    }

    cmunpack_crate::set_verbosity(args.verbosity);

    let result = match (args.list, args.free.as_slice()) {
        (true, [input_path]) => list_file(input_path, &mut io::stdout()),
        (false, [input_path, output_path]) => decompress_file(input_path, output_path, &args.options),
        (list, _) => {
            print_usage(&mut io::stderr()).unwrap();
            if list {
                eprintln!("\nNeed an INPUT argument");
            } else {
                eprintln!("\nNeed INPUT and OUTPUT arguments");
            }
            process::exit(1);
        }
    };

    if let Err(err) = result {
        eprintln!("{}", err);
        process::exit(1);
    }
}
