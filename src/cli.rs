use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Synchronize one subtitle against a reference
    Sync {
        /// Video, audio or subtitle the timing is taken from
        #[arg(short, long)]
        reference: PathBuf,

        /// Subtitle to retime
        #[arg(short, long)]
        subtitle: PathBuf,

        /// Synchronization tool (defaults to the configured default tool)
        #[arg(short, long)]
        tool: Option<String>,

        /// Output file (default: <subtitle-stem>.<suffix>.<ext>)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Encoding of the output file, e.g. utf-8 or windows-1252
        #[arg(short, long)]
        encoding: Option<String>,

        /// Tool option as name=value; repeatable
        #[arg(long = "option", value_name = "NAME=VALUE")]
        options: Vec<String>,

        /// Use a subtitle stream embedded in the reference video
        #[arg(long)]
        embedded_reference: bool,

        /// Extra arguments passed verbatim to the tool
        #[arg(last = true)]
        extra: Vec<String>,
    },

    /// Synchronize many pairs, one after another
    Batch {
        /// TOML file with [[pair]] entries
        #[arg(short, long, conflicts_with = "dir", required_unless_present = "dir")]
        manifest: Option<PathBuf>,

        /// Directory to scan for videos with matching subtitles
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Tool for pairs that do not name one
        #[arg(short, long)]
        tool: Option<String>,

        /// Skip references already synchronized successfully
        #[arg(long)]
        skip_processed: bool,
    },

    /// List configured synchronization tools
    Tools,

    /// Isolated module runner used by module tools
    #[command(hide = true)]
    Worker {
        /// Entry point as package.module:function
        #[arg(long)]
        module: String,

        /// Python interpreter
        #[arg(long)]
        python: String,

        /// Terminal width advertised to the module
        #[arg(long, default_value_t = 80)]
        columns: u16,

        /// Largest read from the module's output, in bytes
        #[arg(long, default_value_t = 1024)]
        chunk_size: usize,

        /// Arguments for the entry point
        #[arg(last = true)]
        args: Vec<String>,
    },
}
