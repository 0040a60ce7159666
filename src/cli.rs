use clap::{Parser, Subcommand};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Write a debug log under the config directory
    #[clap(long, global = true)]
    pub debug: bool,
    #[clap(subcommand)]
    pub command: Commands,
}

/// Options shared by every bulk operation subcommand.
#[derive(clap::Args, Debug, Clone)]
pub struct OperationOpts {
    #[clap(short, long, help = "Number of concurrent control connections", display_order = 1)]
    pub workers: Option<usize>,
    #[clap(long, help = "Use active (PORT) data connections instead of passive")]
    pub active: bool,
    #[clap(long, help = "Retries per transient failure")]
    pub retry: Option<usize>,
    #[clap(long, help = "Base backoff between retries in milliseconds")]
    pub retry_backoff_ms: Option<u64>,
    #[clap(long, help = "Flush buffer size in MiB (1-8)")]
    pub buf_mib: Option<usize>,
    #[clap(short, long)]
    pub verbose: bool,
    #[clap(long, help = "Emit a single-line JSON summary")]
    pub json: bool,
    #[clap(short, long)]
    pub quiet: bool,
    #[clap(
        long,
        help = "Resolution for prompts nobody can answer in batch mode: skip|fail",
        default_value = "skip"
    )]
    pub on_prompt: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Create alias for an FTP server", name = "new", display_order = 3)]
    Create { alias: String, remote_host: String },
    #[clap(about = "Remove the specify alias", name = "rm", display_order = 4)]
    Remove { alias: String },
    #[clap(about = "Rename the specify alias", name = "mv", display_order = 5)]
    Rename { alias: String, new_alias: String },
    #[clap(about = "List all server alias", name = "ls", display_order = 2)]
    List {},
    #[clap(about = "Delete files/directories on the server (dir paths end with '/')")]
    Del {
        #[clap(help = "alias:/path or alias:/dir/")]
        targets: Vec<String>,
        #[clap(flatten)]
        opts: OperationOpts,
    },
    #[clap(about = "Download files/directories from the server")]
    Get {
        #[clap(help = "alias:/path or alias:/dir/")]
        source: String,
        #[clap(help = "Local target directory")]
        target: String,
        #[clap(long, help = "Delete the server source after a successful transfer")]
        r#move: bool,
        #[clap(flatten)]
        opts: OperationOpts,
    },
    #[clap(about = "Upload local files/directories to the server")]
    Put {
        #[clap(help = "Local source file or directory")]
        source: String,
        #[clap(help = "alias:/path target directory")]
        target: String,
        #[clap(long, help = "Delete the local source after a successful transfer")]
        r#move: bool,
        #[clap(flatten)]
        opts: OperationOpts,
    },
    #[clap(about = "Change permissions on the server (mode in octal)")]
    Chattr {
        #[clap(help = "alias:/path or alias:/dir/")]
        target: String,
        #[clap(help = "Octal mode, e.g. 644")]
        mode: String,
        #[clap(flatten)]
        opts: OperationOpts,
    },
}
