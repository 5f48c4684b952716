use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "codemash", version = "0.1", about, long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP server and the engine workers
    Serve {
        /// Path to the configuration file
        #[arg(long = "config", short = 'c')]
        config_path: Option<String>,

        /// Directory to keep coalesced; its last compiling version is served
        /// at `/mash/latest`
        #[arg(long)]
        watch: Option<PathBuf>,

        /// File name of the entry unit of the watched directory
        #[arg(long, default_value = "main.mash")]
        main: String,
    },

    /// Compile and run the given files once, printing the verdict
    Run {
        /// Source files; each becomes a unit named after its file stem
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Unit holding `fn main`; defaults to the first file
        #[arg(long)]
        entry: Option<String>,

        /// Wall-clock deadline in milliseconds
        #[arg(long = "deadline-ms")]
        deadline_ms: Option<u64>,

        /// Path to the configuration file
        #[arg(long = "config", short = 'c')]
        config_path: Option<String>,
    },

    /// Coalesce every `.mash` file of a directory into one source
    Mash {
        dir: PathBuf,

        /// File name of the entry unit; defaults to `main.mash`
        #[arg(long, default_value = "main.mash")]
        main: String,

        /// Where to write the coalesced source; stdout when omitted
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,

        /// Keep running and re-mash on every change to the directory
        #[arg(long)]
        watch: bool,
    },
}

/// Load the configuration from the specified file, or the defaults
pub fn load_config(path: Option<&str>) -> std::io::Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    serde_json::from_reader(reader).map_err(|e| e.into())
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
}

#[derive(Deserialize, Debug, Default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of sessions compiled or executed at once
    pub slots: usize,
    /// Queue bound; unbounded when absent
    pub queue_capacity: Option<usize>,
    pub default_deadline_ms: MilliSecond,
    /// Cumulative allocation budget of one execution
    pub memory_ceiling: Option<ByteSize>,
    pub max_output_bytes: ByteSize,
    pub max_call_depth: usize,
    /// Terminal sessions kept for lookup
    pub retained_sessions: usize,
    pub max_source_bytes: ByteSize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            slots: 4,
            queue_capacity: None,
            default_deadline_ms: MilliSecond(5000),
            memory_ceiling: Some(ByteSize(64 * 1024 * 1024)),
            max_output_bytes: ByteSize(64 * 1024),
            max_call_depth: 1024,
            retained_sessions: 1024,
            max_source_bytes: ByteSize(1024 * 1024),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

impl From<MilliSecond> for Duration {
    fn from(value: MilliSecond) -> Self {
        Duration::from_millis(value.0)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

impl ByteSize {
    /// The size as `usize`, saturating on narrow targets
    pub fn as_usize(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}
