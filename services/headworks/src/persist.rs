//! Persistence of the last-successful strategy index per RTU, so
//! reconnection after a controller restart begins at the proven variant.
//! This is the only state the core persists; a missing or corrupt file
//! degrades to empty and is never fatal.

use hashbrown::HashMap;
use penstock::logging::{self, Logger};
use pnio::rpc::strategy::PersistedStrategy;
use serde_derive::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    station: String,
    last_successful: usize,
    attempts: u64,
}

pub struct StrategyStore {
    path: PathBuf,
    entries: HashMap<String, PersistedStrategy>,
    log: Logger,
}

impl StrategyStore {
    pub fn load(path: PathBuf, log: &Logger) -> StrategyStore {
        let log = log.new(logging::o!());

        let entries = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Vec<StoredEntry>>(&content) {
                Ok(stored) => stored
                    .into_iter()
                    .map(|entry| {
                        (
                            entry.station,
                            PersistedStrategy {
                                last_successful: entry.last_successful,
                                attempts: entry.attempts,
                            },
                        )
                    })
                    .collect(),
                Err(err) => {
                    logging::warn!(log, "strategy store unreadable, starting empty";
                                   "context" => "load",
                                   "path" => %path.display(),
                                   "error" => %err);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        logging::debug!(log, "strategy store loaded";
                        "context" => "load",
                        "path" => %path.display(),
                        "entries" => entries.len());

        StrategyStore { path, entries, log }
    }

    pub fn last_successful(&self, station: &str) -> Option<usize> {
        self.entries
            .get(station)
            .map(|entry| entry.last_successful)
    }

    /// Records a proven index and writes the store through to disk.
    pub fn record(&mut self, station: &str, last_successful: usize, attempts: u64) {
        let entry = self
            .entries
            .entry(station.to_string())
            .or_insert(PersistedStrategy {
                last_successful,
                attempts: 0,
            });

        entry.last_successful = last_successful;
        entry.attempts += attempts;

        self.save();
    }

    pub fn forget(&mut self, station: &str) {
        if self.entries.remove(station).is_some() {
            self.save();
        }
    }

    fn save(&self) {
        let mut stored: Vec<StoredEntry> = self
            .entries
            .iter()
            .map(|(station, entry)| StoredEntry {
                station: station.clone(),
                last_successful: entry.last_successful,
                attempts: entry.attempts,
            })
            .collect();
        stored.sort_by(|a, b| a.station.cmp(&b.station));

        let json = match serde_json::to_string_pretty(&stored) {
            Ok(json) => json,
            Err(err) => {
                logging::error!(self.log, "strategy store serialization failed";
                                "context" => "save",
                                "error" => %err);
                return;
            }
        };

        if let Err(err) = fs::write(&self.path, json) {
            logging::warn!(self.log, "strategy store write failed";
                           "context" => "save",
                           "path" => %self.path.display(),
                           "error" => %err);
        }
    }
}
