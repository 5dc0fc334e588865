use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::holo::PublishMode;

#[derive(Debug, Parser)]
#[command(
    name = "holo",
    version,
    about = "holo - Drive the holo short-video dashboard from the terminal."
)]
pub struct Cli {
    /// Config file (defaults to the platform config dir).
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Backend base URL, overriding config and the backend's own /config.
    #[arg(long, global = true, value_name = "URL")]
    pub base_url: Option<String>,

    /// Log requests and token refreshes to stderr.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Open the backend login page in a browser.
    Login {
        /// Print the URL without opening a browser.
        #[arg(long)]
        no_browser: bool,
    },
    /// Clear stored tokens and notify the backend.
    Logout,
    /// Manage stored tokens.
    #[command(subcommand)]
    Tokens(TokensCommand),
    /// Check the login and show the current user.
    Me,
    /// List your videos.
    Videos(VideosArgs),
    /// Look up videos by id.
    Query {
        /// Video ids; arguments may also hold newline-separated ids.
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Show the display-API profile.
    Profile,
    /// Show creator info and allowed privacy options.
    CreatorInfo,
    /// Request a client-level token.
    ClientToken,
    /// Show backend diagnostics.
    Debug {
        #[arg(value_enum, default_value_t = DebugTarget::Display)]
        target: DebugTarget,
    },
    /// Upload media to create a content job.
    #[command(subcommand)]
    Upload(UploadCommand),
    /// Check the status of a content job.
    Status { job_id: String },
    /// Publish a completed job or move it to drafts.
    Publish {
        job_id: String,
        #[arg(long, value_enum, default_value_t = PublishMode::Draft)]
        privacy: PublishMode,
        #[arg(long)]
        caption: Option<String>,
    },
    /// Manage the config file.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Debug, Subcommand)]
pub enum TokensCommand {
    /// Store tokens obtained from the login callback.
    Set {
        access: String,
        #[arg(default_value = "")]
        refresh: String,
    },
    /// Remove every stored token.
    Clear,
    /// Show which tokens are stored.
    Show,
}

#[derive(Debug, Args)]
pub struct VideosArgs {
    /// Videos per page (defaults to videos.page_size).
    #[arg(long)]
    pub max_count: Option<u32>,
    /// Number of pages to follow.
    #[arg(long, default_value_t = 1)]
    pub pages: u32,
    /// Continue from a cursor printed by an earlier run.
    #[arg(long)]
    pub cursor: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum UploadCommand {
    /// Upload a local file.
    File {
        path: PathBuf,
        #[arg(long, value_enum, default_value_t = PublishMode::Draft)]
        mode: PublishMode,
    },
    /// Have the backend pull media from an allowed URL.
    Url {
        source_url: String,
        #[arg(long, value_enum, default_value_t = PublishMode::Draft)]
        mode: PublishMode,
    },
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Write a config file pointing at a backend.
    Init { base_url: String },
    /// Print the effective config.
    Show,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DebugTarget {
    Display,
    Content,
}

impl Command {
    /// Whether the command talks to the backend at all.
    pub fn needs_backend(&self) -> bool {
        !matches!(self, Command::Tokens(_) | Command::Config(_))
    }
}
