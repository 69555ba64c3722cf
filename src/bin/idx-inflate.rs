use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use blockseek::Archive;
use clap::Parser;

/// Stream the decoded contents of a seekable container to stdout.
#[derive(Parser, Debug)]
struct Cli {
    /// An `.idxdefl` or `.xz` container.
    input: PathBuf,
}

fn run(cli: Cli) -> blockseek::Result<()> {
    let archive = Archive::open_mmap(&cli.input)?;
    let size = archive.uncompressed_size();
    eprintln!("uncompressed size: {size}");

    let mut reader = archive.reader();
    let stdout = std::io::stdout();
    let mut out = stdout.lock();

    let mut pos = 0u64;
    while pos < size {
        let view = reader.read(pos, 4096)?;
        out.write_all(view)?;
        pos += view.len() as u64;
    }
    out.flush()?;
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("idx-inflate: {e}");
            ExitCode::FAILURE
        }
    }
}
