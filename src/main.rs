use clap::Parser;
use log::{debug, error, info};
use lstack::{format_stack, Debugger, LuaSampler};
use std::collections::BTreeMap;
use std::process;
use std::thread;
use std::time::Duration;

#[derive(Parser)]
#[command(about = "Sampling profiler for Lua 5.3 states in remote processes")]
struct Args {
    /// Target process id
    #[arg(short, long)]
    pid: u32,

    /// Log debug and trace output to stdout
    #[arg(short, long)]
    verbose: bool,

    /// Sample interval in milliseconds
    #[arg(short, long, default_value_t = 1000)]
    interval: u64,

    /// Number of samples to take
    #[arg(short, long, default_value_t = 10)]
    count: u32,

    /// Additional hook entry addresses (must be Lua API entry points),
    /// decimal or 0x-prefixed, comma separated
    #[arg(short = 'k', long, value_delimiter = ',', value_parser = parse_address)]
    hook: Vec<u64>,
}

fn parse_address(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else {
        s.parse()
    };
    parsed.map_err(|_| format!("invalid hook entry address: {}", s))
}

fn init_logging(verbose: bool) {
    let mut builder = env_logger::Builder::new();
    if verbose {
        builder
            .filter_level(log::LevelFilter::Trace)
            .target(env_logger::Target::Stdout);
    } else {
        // warnings and errors only, on stderr
        builder.filter_level(log::LevelFilter::Warn);
    }
    builder.init();
}

fn run(args: &Args) -> lstack::Result<()> {
    let mut debugger = Debugger::attach(args.pid, false)?;
    let mut sampler = LuaSampler::new(&mut debugger);

    debug!("fetching lua_State of process {}", args.pid);
    let state = sampler.fetch_lua_state(&args.hook)?;
    info!("lua_State located at {:#x}", state);

    let mut histogram = BTreeMap::new();
    for sample in 0..args.count {
        thread::sleep(Duration::from_millis(args.interval));

        debug!("capturing lua stack {}/{}", sample + 1, args.count);
        let frames = match sampler.dump_stack(state) {
            Ok(frames) => frames,
            Err(e) => {
                error!("capture frame failure: {}", e);
                continue;
            }
        };

        let folded = format_stack(&frames);
        info!("captured stack: {}", folded);
        *histogram.entry(folded).or_insert(0u64) += 1;
    }

    for (stack, count) in &histogram {
        println!("{} {}", stack, count);
    }
    Ok(())
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // help and usage errors share the fatal exit code
            let _ = e.print();
            process::exit(1);
        }
    };

    init_logging(args.verbose);

    if let Err(e) = run(&args) {
        error!("{}", e);
        process::exit(1);
    }
}
