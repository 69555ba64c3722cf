use std::path::PathBuf;
use std::process::ExitCode;

use blockseek::idxdefl::{compress_file, EncodeOptions};
use clap::Parser;

/// Block-compress a file into a seekable `.idxdefl` container.
#[derive(Parser, Debug)]
struct Cli {
    /// File to compress; output goes to `<path>.idxdefl`.
    input: PathBuf,

    /// Plaintext bytes per block.
    #[arg(long, default_value_t = 64 * 1024)]
    block_size: u32,

    /// DEFLATE compression level (0-10).
    #[arg(long, default_value_t = 7)]
    level: u8,
}

fn run(cli: Cli) -> blockseek::Result<()> {
    let options = EncodeOptions {
        block_size: cli.block_size,
        level: cli.level,
    };
    let output = compress_file(&cli.input, options)?;
    eprintln!("wrote {}", output.display());
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("idx-deflate: {e}");
            ExitCode::FAILURE
        }
    }
}
