use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use common::{DemoConfig, DemoState};
use shstate::StateSync;

#[derive(Parser)]
#[command(about = "Subscribes to the shared demo record and logs changes")]
struct Opts {
    #[arg(short = 'c', long = "config", default_value = "shstate-reader.toml")]
    config: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let opts = Opts::parse();
    let cfg: DemoConfig = confy::load_path(&opts.config)?;
    run(cfg)
}

fn run(cfg: DemoConfig) -> Result<(), Box<dyn std::error::Error>> {
    let record = Arc::new(Mutex::new(DemoState::default()));
    let mut engine = StateSync::with_config(Arc::clone(&record), cfg.sync)?;
    engine.on_change(|state: DemoState| {
        info!(
            count = state.count,
            message = %state.message,
            x = state.position.x,
            "change received"
        );
    });

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;

    let mut ticks = 0u64;
    while !term.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_secs(1));
        ticks += 1;
        if ticks % 10 == 0 {
            let state = record.lock().expect("record mutex poisoned").clone();
            info!(
                count = state.count,
                message = %state.message,
                "current record"
            );
        }
    }

    engine.close();
    Ok(())
}
