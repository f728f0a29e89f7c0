use std::path::PathBuf;

use clap::Parser;

/// Agent options. Flags carry environment fallbacks where an operator would
/// set them from a unit file or container environment.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path of the SQLite flow ledger.
    #[arg(long, env = "GANTRY_DB", default_value = "flows.db")]
    pub database: PathBuf,

    /// Prebuilt BPF object file holding the tcp_connect probe.
    #[arg(long, env = "GANTRY_BPF_OBJECT", default_value = "gantry.bpf.o")]
    pub bpf_object: PathBuf,

    /// How many of the newest flows each summary examines.
    #[arg(long, default_value_t = 200)]
    pub recent: u32,

    /// Seconds between summary frames.
    #[arg(long, default_value_t = 2)]
    pub summary_interval: u64,

    /// Container names to flag as anomalous (repeatable or comma separated).
    #[arg(long = "deny", env = "GANTRY_DENYLIST", value_delimiter = ',', value_name = "NAME")]
    pub denylist: Vec<String>,
}
