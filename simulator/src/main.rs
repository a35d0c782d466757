//! CLI entrypoint: load a configuration, run the simulation on the
//! deterministic runtime, and print the report as JSON.

use clap::{value_parser, Arg, ArgAction, Command};
use futures::future::{self, Either};
use simbft_runtime::{deterministic, Clock, Runner};
use std::time::Duration;
use tracing::Level;

fn main() {
    let matches = Command::new("simbft-simulator")
        .about("Simulate PBFT replication under realistic network conditions")
        .arg(
            Arg::new("config")
                .value_parser(value_parser!(String))
                .required(true)
                .help("Path to the JSON configuration file"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .value_parser(value_parser!(u64))
                .default_value("42")
                .help("Seed for the deterministic runtime"),
        )
        .arg(
            Arg::new("until")
                .long("until")
                .value_parser(value_parser!(f64))
                .help("Give up after this much simulated time (seconds)"),
        )
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable debug logging"),
        )
        .get_matches();

    // Initialize logging
    let level = if matches.get_flag("verbose") {
        Level::DEBUG
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    // Load and validate the configuration before touching the runtime
    let path = matches.get_one::<String>("config").expect("config required");
    let raw = std::fs::read_to_string(path).expect("failed to read config file");
    let config = match simulator::Config::from_json(&raw) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            std::process::exit(1);
        }
    };
    let seed = *matches.get_one::<u64>("seed").expect("seed has a default");
    let until = matches.get_one::<f64>("until").copied();

    // Run the simulation
    let executor = deterministic::Runner::new(
        deterministic::Config::default()
            .with_seed(seed)
            .with_cycle(Duration::from_micros(1)),
    );
    let report = executor.start(|context| async move {
        match until {
            Some(seconds) => {
                let deadline = context.current() + Duration::from_secs_f64(seconds);
                let run = Box::pin(simulator::run(context.clone(), config));
                let timeout = Box::pin(context.sleep_until(deadline));
                match future::select(run, timeout).await {
                    Either::Left((report, _)) => Some(report),
                    Either::Right(((), _)) => None,
                }
            }
            None => Some(simulator::run(context, config).await),
        }
    });

    // Emit the report
    match report {
        Some(report) => {
            let metrics = report.metrics();
            println!(
                "{}",
                serde_json::to_string_pretty(&metrics).expect("report serializes")
            );
        }
        None => eprintln!("simulated time limit reached before the run completed"),
    }
}
