mod config;
mod persist;
mod runtime;

use crate::config::ControllerConfig;
use crate::runtime::Runtime;
use penstock::logging;
use std::env;
use std::process;

fn main() {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "headworks.toml".to_string());

    let config = ControllerConfig::load(&config_path);
    let log = logging::from_toml(&config.logging_toml());

    logging::info!(log, "headworks controller starting";
                   "context" => "main",
                   "config" => &config_path,
                   "interface" => &config.controller.interface,
                   "station" => &config.controller.station_name,
                   "rtus" => config.rtus.len());

    let (controller, _handle) = match Runtime::start(&config, &log) {
        Ok(parts) => parts,
        Err(err) => {
            logging::crit!(log, "failed to open the RTU segment interface";
                           "context" => "main",
                           "interface" => &config.controller.interface,
                           "error" => %err);
            process::exit(1);
        }
    };

    // The bridge handle is handed to the API layer in a full deployment;
    // the core itself runs until the process is terminated.
    runtime::run_forever(controller);
}
