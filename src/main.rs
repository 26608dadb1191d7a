use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use warren::{config::Config, memstat, node::Node, runtime, services};

/// Every allocation is attributed to the service the allocating thread is
/// dispatching for; `memstat` reports per-service heap usage.
#[global_allocator]
static ALLOC: memstat::CountingAlloc = memstat::CountingAlloc::new();

#[derive(Debug, Parser)]
#[command(name = "warren", about = "A multi-threaded actor runtime node")]
struct Args {
    /// Path to the `key = value` config file.
    config: PathBuf,
}

// A peer dropping a connection mid-write must not kill the process.
fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

fn run(args: &Args) -> warren::Result<()> {
    let config = Config::load(&args.config)?;
    let node: Arc<Node> = Node::new(config.harbor, services::builtin_modules())?;
    runtime::run(&node, &config)
}

fn main() -> ExitCode {
    env_logger::init();
    ignore_sigpipe();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("warren: {err}");
            ExitCode::FAILURE
        }
    }
}
