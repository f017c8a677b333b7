use std::path::PathBuf;
use std::process;

use clap::Parser;
use logger::{error, info};

use obfuscator::engine::{Engine, Options, Region};
use obfuscator::error::Error;
use obfuscator::pe::{LoadMode, PeFile};

#[derive(Parser)]
#[command(author, version, about = "Static x86 virtualizing obfuscator for PE binaries")]
struct Args {
    /// Target PE, rewritten in place
    #[arg(short, long)]
    input: PathBuf,

    /// Raw VM interpreter image to embed
    #[arg(long)]
    vm: PathBuf,

    /// Hex ADDR SIZE pair naming a code region to virtualize; repeatable
    #[arg(
        short = 'b',
        long = "block",
        num_args = 2,
        value_names = ["ADDR", "SIZE"],
        value_parser = parse_hex,
        action = clap::ArgAction::Append,
        required = true
    )]
    block: Vec<u64>,

    /// Prepend the timing-trap gadget to every region's p-code
    #[arg(short = 't', long)]
    timing_trap: bool,

    /// Skip import-table parsing
    #[arg(long)]
    lazy: bool,
}

fn parse_hex(value: &str) -> Result<u64, String> {
    let digits = value
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u64::from_str_radix(digits, 16).map_err(|err| format!("'{value}' is not hex: {err}"))
}

fn main() {
    let args = Args::parse();

    if args.block.is_empty() || args.block.len() % 2 != 0 {
        error!("{}", Error::RegionPairs);
        process::exit(1);
    }

    let regions: Vec<Region> = args
        .block
        .chunks(2)
        .map(|pair| Region {
            rva: pair[0] as u32,
            size: pair[1] as usize,
        })
        .collect();

    let vm_image = match std::fs::read(&args.vm) {
        Ok(image) => image,
        Err(err) => {
            error!("could not read the vm image '{}': {}", args.vm.display(), err);
            process::exit(1);
        }
    };

    let load_mode = if args.lazy {
        LoadMode::Lazy
    } else {
        LoadMode::Full
    };

    let options = Options {
        timing_trap: args.timing_trap,
    };

    let outcome = PeFile::load(&args.input, load_mode)
        .and_then(|pe| Engine::new(pe, &vm_image, regions, options))
        .and_then(|mut engine| engine.execute());

    match outcome {
        Ok(()) => info!("Rewrote '{}'", args.input.display()),
        Err(err) => {
            error!("{err}");
            process::exit(1);
        }
    }
}
