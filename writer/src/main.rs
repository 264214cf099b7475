use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use tracing::info;

use common::{DemoConfig, DemoState};
use shstate::StateSync;

#[derive(Parser)]
#[command(about = "Mutates the shared demo record on a timer")]
struct Opts {
    #[arg(short = 'c', long = "config", default_value = "shstate-writer.toml")]
    config: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let opts = Opts::parse();
    let cfg: DemoConfig = confy::load_path(&opts.config)?;
    run(cfg)
}

fn run(cfg: DemoConfig) -> Result<(), Box<dyn std::error::Error>> {
    let record = Arc::new(Mutex::new(DemoState {
        message: cfg.message.clone(),
        count: cfg.count,
        position: Default::default(),
    }));
    let mut engine = StateSync::with_config(Arc::clone(&record), cfg.sync)?;

    let term = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&term))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&term))?;

    while !term.load(Ordering::Relaxed) {
        {
            let mut state = record.lock().expect("record mutex poisoned");
            state.count += 1;
            state.position.x += 1;
            state.position.y += 1;
            state.position.z += 1;
            state.message = format!("tick {}", now_secs());
            info!(
                count = state.count,
                message = %state.message,
                "updated shared record"
            );
        }
        thread::sleep(Duration::from_secs(2));
    }

    engine.close();
    Ok(())
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
