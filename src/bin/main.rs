use std::fs::File;
use std::io::{self, Read, Write};
use std::process;

use clap::Parser;
use tracing::error;

use sipwatch::{
    Attr, CaptureOpts, FilterField, FilterSpec, MatchOpts, Registry, SortSpec, TraceReader,
};

#[derive(Parser)]
#[command(
    name = "sipwatch",
    about = "Group SIP traffic from mod_sofia trace dumps into call dialogs"
)]
struct Cli {
    /// Dump files to replay (- for stdin, default: stdin)
    files: Vec<String>,

    /// Maximum number of calls to keep
    #[arg(short, long, default_value_t = 200)]
    limit: u32,

    /// Evict the oldest call when the limit is reached
    #[arg(short = 'R', long)]
    rotate: bool,

    /// Skip SDP media tracking
    #[arg(long)]
    no_rtp: bool,

    /// Only track dialogs that start with an INVITE
    #[arg(short = 'c', long)]
    calls: bool,

    /// Only track dialogs captured from their start
    #[arg(long)]
    no_incomplete: bool,

    /// Only track calls whose payload matches this regex
    #[arg(short = 'm', long = "match", value_name = "REGEX")]
    mexpr: Option<String>,

    /// Invert the --match expression
    #[arg(long)]
    invert: bool,

    /// Make --match case-insensitive
    #[arg(long)]
    ignore_case: bool,

    /// Display filter FIELD=REGEX (from, to, src, dst, method, payload, line), repeatable
    #[arg(short = 'f', long = "filter", value_name = "FIELD=REGEX")]
    filter: Vec<String>,

    /// Sort attribute (callid, from, to, date, time, msgcnt, state, ...)
    #[arg(short = 's', long, default_value = "date")]
    sort: String,

    /// Sort descending
    #[arg(long)]
    desc: bool,

    /// Print the message flow of every displayed call
    #[arg(short = 'd', long, group = "output_mode")]
    detail: bool,

    /// Print a capture summary instead of the call list
    #[arg(long, group = "output_mode")]
    stats: bool,

    /// Only list calls still in progress
    #[arg(short = 'a', long)]
    active: bool,

    /// Copy raw packet payloads to this dump file while replaying
    #[arg(short = 'O', long, value_name = "FILE")]
    outfile: Option<String>,

    /// Increase verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| level.into()),
        )
        .with_writer(io::stderr)
        .init();
}

fn open_input(files: &[String]) -> Box<dyn Read> {
    if files.is_empty() || (files.len() == 1 && files[0] == "-") {
        return Box::new(io::stdin().lock());
    }

    let mut readers: Vec<Box<dyn Read>> = Vec::new();
    for path in files {
        if path == "-" {
            readers.push(Box::new(io::stdin().lock()));
        } else {
            match File::open(path) {
                Ok(f) => readers.push(Box::new(f)),
                Err(e) => {
                    eprintln!("{path}: {e}");
                    process::exit(1);
                }
            }
        }
    }

    if readers.len() == 1 {
        return readers.remove(0);
    }

    let mut chain: Box<dyn Read> = readers.remove(0);
    for r in readers {
        chain = Box::new(chain.chain(r));
    }
    chain
}

fn build_registry(cli: &Cli) -> Registry {
    let capture = CaptureOpts {
        limit: cli.limit,
        rotate: cli.rotate,
        rtp: !cli.no_rtp,
        outfile: cli.outfile.clone(),
    };
    let matching = MatchOpts {
        invite: cli.calls,
        complete: cli.no_incomplete,
        mexpr: cli.mexpr.clone(),
        minvert: cli.invert,
        micase: cli.ignore_case,
    };
    let by = match Attr::from_str(&cli.sort) {
        Some(attr) => attr,
        None => {
            eprintln!("unknown sort attribute '{}'", cli.sort);
            process::exit(2);
        }
    };
    let sort = SortSpec { by, asc: !cli.desc };

    let registry = match Registry::new(capture, matching, sort) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{e}");
            process::exit(2);
        }
    };

    for spec in &cli.filter {
        let Some((field, expr)) = spec.split_once('=') else {
            eprintln!("invalid filter '{spec}': expected FIELD=REGEX");
            process::exit(2);
        };
        let Some(field) = FilterField::from_str(field) else {
            eprintln!("unknown filter field '{field}'");
            process::exit(2);
        };
        let spec = FilterSpec {
            expr: expr.to_owned(),
            ignore_case: cli.ignore_case,
            invert: false,
        };
        if let Err(e) = registry.set_filter(field, Some(spec)) {
            eprintln!("{e}");
            process::exit(2);
        }
    }

    registry
}

fn replay(registry: &Registry, reader: Box<dyn Read>, outfile: Option<&str>) -> u64 {
    let mut out = outfile.map(|path| match File::create(path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("{path}: {e}");
            process::exit(1);
        }
    });

    let trace = match TraceReader::new(reader) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };

    let mut packets = 0;
    for result in trace {
        match result {
            Ok(packet) => {
                packets += 1;
                if let Some(f) = out.as_mut() {
                    if let Err(e) = write_frame(f, &packet) {
                        error!("outfile write failed: {e}");
                    }
                }
                registry.check_packet(packet);
            }
            Err(e) => error!("frame error: {e}"),
        }
    }
    packets
}

/// Re-emit a packet in the dump format so a filtered replay can be saved.
fn write_frame(f: &mut File, packet: &sipwatch::Packet) -> io::Result<()> {
    let (dir, prep, addr) = if packet.src.host == "local" {
        ("sent", "to", &packet.dst)
    } else {
        ("recv", "from", &packet.src)
    };
    writeln!(
        f,
        "{dir} {} bytes {prep} {}/{} at {}:",
        packet.payload.len(),
        packet.transport,
        addr,
        packet.ts.format("%Y-%m-%d %H:%M:%S%.6f"),
    )?;
    f.write_all(&packet.payload)?;
    f.write_all(b"\x0B\n")
}

fn print_calls(registry: &Registry, cli: &Cli) {
    let view = if cli.active {
        registry.active_calls()
    } else {
        registry.calls()
    };
    let patterns = view.patterns();
    for call in view.iter() {
        if call.verdict() == sipwatch::Verdict::Reject {
            continue;
        }
        println!("{}", call.line(patterns));
        if let Some(linked) = view.linked_call(call) {
            println!("  linked to {}", linked.callid());
        }
        if cli.detail {
            for msg in call.msgs() {
                println!("  {}", msg.header_line(patterns));
            }
        }
    }
}

fn print_stats(registry: &Registry, packets: u64) {
    let stats = registry.stats();
    println!("packets: {packets}");
    println!("dropped: {}", registry.drop_count());
    println!("calls: {}", stats.total);
    println!("displayed: {}", stats.displayed);
    println!("active: {}", registry.active_calls().len());
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let registry = build_registry(&cli);
    let reader = open_input(&cli.files);
    let packets = replay(&registry, reader, cli.outfile.as_deref());

    // Evaluate verdicts so the list below can skip rejected calls.
    let _ = registry.stats();

    if cli.stats {
        print_stats(&registry, packets);
    } else {
        print_calls(&registry, &cli);
    }
}
