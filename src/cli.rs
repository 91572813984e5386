use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

use crate::index::BackendKind;

#[derive(Debug, Parser)]
#[command(
    name = "localdex",
    about = "Search your local images by the text and objects in them"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Annotate every image under a directory once, then exit
    Index(IngestArgs),
    /// Annotate a directory and keep watching it for changes
    Watch(IngestArgs),
    /// Search annotated images
    Search(SearchArgs),
    /// Show the annotations stored for one file
    Get(GetArgs),
    /// List annotated files, optionally filtered by a glob pattern
    List(ListArgs),
    /// Forget the annotations of a file
    Remove(RemoveArgs),
    /// Show system status and statistics
    Status(StatusArgs),
    /// Search text files in memory with a chosen index backend
    Find(FindArgs),
    /// Manage persisted settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Index / Watch --

#[derive(Debug, Parser)]
pub struct IngestArgs {
    /// Directories to ingest
    #[arg(required = true)]
    pub dirs: Vec<PathBuf>,

    /// OCR command; `{}` is replaced by the image path
    #[arg(long)]
    pub ocr_cmd: Option<String>,

    /// Content labeling command printing `label<TAB>confidence` lines
    #[arg(long)]
    pub label_cmd: Option<String>,

    /// File extensions to ingest (repeatable)
    #[arg(long = "ext")]
    pub extensions: Vec<String>,

    /// Path prefixes to skip (repeatable)
    #[arg(long)]
    pub exclude: Vec<PathBuf>,

    /// Minimum confidence for content labels
    #[arg(long)]
    pub label_threshold: Option<f32>,

    /// Output the final statistics as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,

    /// Output only file paths (one per line)
    #[arg(long)]
    pub files: bool,
}

// -- Get / List / Remove --

#[derive(Debug, Parser)]
pub struct GetArgs {
    /// Path of the annotated file
    pub path: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ListArgs {
    /// Glob pattern applied to stored paths
    #[arg(long)]
    pub pattern: Option<String>,

    /// Output as JSON array
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct RemoveArgs {
    /// Path of the annotated file
    pub path: PathBuf,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Find --

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Backend {
    Linear,
    Inverted,
}

impl From<Backend> for BackendKind {
    fn from(value: Backend) -> Self {
        match value {
            Backend::Linear => BackendKind::Linear,
            Backend::Inverted => BackendKind::Inverted,
        }
    }
}

#[derive(Debug, Parser)]
pub struct FindArgs {
    /// Directory of markdown and text files
    pub dir: PathBuf,

    /// The search query
    pub query: String,

    /// Index backend
    #[arg(long, value_enum, default_value = "inverted")]
    pub backend: Backend,

    /// Number of results to return (0 for all)
    #[arg(short = 'n', long, default_value = "10")]
    pub count: usize,

    /// Minimum relevance for the linear backend
    #[arg(long)]
    pub min_score: Option<f64>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show every persisted setting
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a setting
    Set {
        /// Setting key, e.g. ingest.extensions
        key: String,
        /// New value
        value: String,
    },
    /// Remove a persisted setting (revert to default)
    Clear {
        /// Setting key
        key: String,
    },
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "localdex",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn cli_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_search_defaults() {
        let cli = Cli::parse_from(["localdex", "search", "sunset beach"]);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.query, "sunset beach");
                assert_eq!(args.count, 10);
                assert!(!args.json);
                assert!(!args.files);
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn parse_index_options() {
        let cli = Cli::parse_from([
            "localdex",
            "-q",
            "index",
            "/photos",
            "--ext",
            "png",
            "--ext",
            "heic",
            "--label-cmd",
            "classify {}",
        ]);
        assert!(cli.quiet);
        match cli.command {
            Command::Index(args) => {
                assert_eq!(args.dirs, vec![PathBuf::from("/photos")]);
                assert_eq!(args.extensions, vec!["png", "heic"]);
                assert_eq!(args.label_cmd.as_deref(), Some("classify {}"));
                assert!(args.ocr_cmd.is_none());
            }
            _ => panic!("expected index command"),
        }
    }

    #[test]
    fn parse_find_backend() {
        let cli = Cli::parse_from([
            "localdex", "find", "docs", "wifi", "--backend", "linear",
        ]);
        match cli.command {
            Command::Find(args) => {
                assert_eq!(BackendKind::from(args.backend), BackendKind::Linear);
                assert_eq!(args.count, 10);
            }
            _ => panic!("expected find command"),
        }
    }
}
