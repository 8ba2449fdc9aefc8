use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
#[allow(unused_imports)]
use tracing::{trace, debug, error, warn, info};

use allegrex::Config;
use allegrex::cpu::{Cpu, abi_name};
use allegrex::mem::{Memory, MemoryConfig};

/// Run a flat guest image through the dynamic translator.
#[derive(Parser)]
#[command(name = "allegrex", version)]
struct Args {
    /// flat binary image, loaded at the main memory base
    image: PathBuf,

    /// entry point, e.g. 0x08000000 or $08000000 (defaults to the load base)
    #[arg(long)]
    entry: Option<String>,

    /// stop after this many trap exits
    #[arg(long, default_value_t = 1)]
    max_traps: u32,

    /// log verbosity: 0 = info, 1 = debug, 2 = trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_address(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches('$');
    u32::from_str_radix(digits, 16).map_err(|err| err.to_string())
}

fn dump_registers(cpu: &Cpu) {
    let regs = &cpu.context().registers;
    for k in 0..4 {
        for j in 0..8 {
            let n = k * 8 + j;
            print!("R{:02}(${}): {:08X} ", n, abi_name(n), regs[n]);
        }
        println!();
    }
    println!("PC: ${:08X}", cpu.context().pc);
}

fn main() -> ExitCode {
    let args = Args::parse();

    let max_level = match args.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(max_level).init();

    let memory_config = MemoryConfig::default();
    let entry = match args.entry.as_deref().map(parse_address) {
        Some(Ok(entry)) => entry,
        Some(Err(err)) => {
            error!("bad entry address: {}", err);
            return ExitCode::FAILURE;
        },
        None => memory_config.main_base,
    };

    let image = match std::fs::read(&args.image) {
        Ok(image) => image,
        Err(err) => {
            error!("could not read {}: {}", args.image.display(), err);
            return ExitCode::FAILURE;
        },
    };

    let mut memory = Memory::new(memory_config);
    if let Err(fault) = memory.write_block(memory_config.main_base, &image) {
        error!("image does not fit in main memory: {:?}", fault);
        return ExitCode::FAILURE;
    }
    info!("loaded {} bytes at ${:08X}", image.len(), memory_config.main_base);

    let mut cpu = Cpu::new(memory, Config::default());

    let mut pc = entry;
    for trap in 0..args.max_traps {
        match cpu.run(pc) {
            Ok(trap_pc) => {
                info!("trap exit {} at pc=${:08X}", trap + 1, trap_pc);
                pc = trap_pc;
            },
            Err(err) => {
                error!("translation failed: {:?}", err);
                dump_registers(&cpu);
                return ExitCode::FAILURE;
            },
        }

        if cpu.diagnostics().halt_requested() {
            warn!("halt requested by diagnostics");
            break;
        }
    }

    dump_registers(&cpu);

    #[cfg(feature = "statistics")]
    {
        use atomic_counter::AtomicCounter;
        let stats = cpu.stats();
        info!("blocks generated: {}", stats.blocks_generated.get());
        info!("thunk calls: {} (hits {}, builds {})",
              stats.thunk_calls.get(), stats.thunk_hits.get(), stats.thunk_builds.get());
        info!("block length: mean {:.1} instructions (max {:.0})",
              stats.block_length.mean(), stats.block_length.max());
        info!("code size ratio: mean {:.1} native bytes per guest word", stats.code_ratio.mean());
        info!("generation time: mean {:.1}us", stats.generation_time.mean() * 1e6);
    }

    ExitCode::SUCCESS
}
