//! Command Line Interface (CLI) arguments.

use std::path::PathBuf;

use clap::Parser;

/// Cubereduce command line interface
#[derive(Clone, Debug, Parser)]
pub struct CommandLineArgs {
    /// Number of workers taking part in the reduction
    #[arg(long, default_value_t = 4, env = "CUBEREDUCE_WORKERS")]
    pub workers: u64,
    /// Threads used by each worker to aggregate its fragments
    #[arg(long, default_value_t = num_cpus::get(), env = "CUBEREDUCE_THREADS")]
    pub threads: usize,
    /// Directory of the dimension store; a temporary store is used when omitted
    #[arg(long, env = "CUBEREDUCE_STORE_PATH")]
    pub store_path: Option<String>,
    /// Path of a JSON reduction request; the synthetic datacube is reduced to daily sums when
    /// omitted
    #[arg(long, env = "CUBEREDUCE_REQUEST")]
    pub request: Option<String>,
    /// Number of fragments of the synthetic datacube
    #[arg(long, default_value_t = 4, env = "CUBEREDUCE_FRAGMENTS")]
    pub fragments: u64,
    /// Hourly time steps of the synthetic datacube
    #[arg(long, default_value_t = 48, env = "CUBEREDUCE_TIME_STEPS")]
    pub time_steps: u64,
    /// Latitudes of the synthetic datacube
    #[arg(long, default_value_t = 4, env = "CUBEREDUCE_LAT")]
    pub lat: u64,
    /// Longitudes held by each row of the synthetic datacube
    #[arg(long, default_value_t = 8, env = "CUBEREDUCE_ARRAY_LENGTH")]
    pub array_length: u64,
    /// Whether the synthetic datacube is compressed
    #[arg(long, default_value_t = false, env = "CUBEREDUCE_COMPRESSED")]
    pub compressed: bool,
}

impl CommandLineArgs {
    /// Returns the dimension store directory with `~` expanded.
    pub fn store_path(&self) -> Option<PathBuf> {
        self.store_path
            .as_ref()
            .map(|path| expanduser::expanduser(path).unwrap_or_else(|_| PathBuf::from(path)))
    }

    /// Returns the request path with `~` expanded.
    pub fn request_path(&self) -> Option<PathBuf> {
        self.request
            .as_ref()
            .map(|path| expanduser::expanduser(path).unwrap_or_else(|_| PathBuf::from(path)))
    }
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}
