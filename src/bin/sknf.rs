use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::error;
use tracing_subscriber::EnvFilter;

use sknf::commands::run_cni;
use sknf::config::CNI_VERSION;

/// Appends logs here instead of stderr when set
const LOG_FILE_ENV: &str = "SKNF_LOG_FILE";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    // stdout carries the CNI response only
    let log_file = std::env::var(LOG_FILE_ENV)
        .ok()
        .and_then(|path| OpenOptions::new().create(true).append(true).open(path).ok());

    let _ = match log_file {
        Some(file) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .try_init(),
        None => builder.with_writer(std::io::stderr).try_init(),
    };
}

fn main() {
    init_tracing();

    if let Err(err) = run_cni() {
        error!("CNI plugin error: {}", err);

        let response = err.to_response(CNI_VERSION);
        match serde_json::to_string(&response) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("Failure serializing error response: {}", e),
        }
        std::process::exit(1);
    }
}
