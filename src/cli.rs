use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "rundrawer",
    about = "Follow a test execution's live log and drawer tabs from the terminal",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Open a drawer for an execution and follow its log
    Watch {
        /// Execution ID
        execution_id: String,

        /// Tab to select on open (terminal, artifacts, ai-analysis)
        #[arg(long)]
        tab: Option<String>,

        /// Strip ANSI escape sequences from the log
        #[arg(long)]
        plain: bool,

        /// Record drawer transitions to the journal directory
        #[arg(long)]
        journal: bool,
    },

    /// Evaluate the tab visibility policy and selector offline
    Tabs {
        /// Execution status (RUNNING, PASSED, FAILED, ...)
        #[arg(long)]
        status: String,

        /// Artifacts exist or are still loading
        #[arg(long)]
        artifacts: bool,

        /// AI analysis is present
        #[arg(long)]
        analysis: bool,

        /// Tab the user last selected
        #[arg(long)]
        desired: Option<String>,

        /// Execution that owns the selection
        #[arg(long, requires = "desired")]
        owner: Option<String>,

        /// Execution currently shown
        #[arg(long)]
        current: Option<String>,

        /// Default tab
        #[arg(long = "default", default_value = "terminal")]
        default_tab: String,
    },

    /// Show resolved configuration
    Config {
        /// Emit JSON instead of a human-readable listing
        #[arg(long)]
        json: bool,
    },
}
