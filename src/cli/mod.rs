pub mod commands;
pub mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use crate::cli::commands::Workspace;
use crate::cli::config::AppConfig;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file to use instead of the default one
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage the tasks of a session
    Task {
        #[command(subcommand)]
        action: TaskCommand,
    },

    /// Run tasks of a session concurrently and save their results
    Run {
        /// Session to run
        #[arg(required = true)]
        session: String,

        /// Task indices to run (all when omitted)
        indices: Vec<usize>,
    },

    /// Keep running tasks on their timers until interrupted
    Watch {
        /// Session to watch
        #[arg(required = true)]
        session: String,
    },

    /// Manage saved sessions
    Session {
        #[command(subcommand)]
        action: SessionCommand,
    },

    /// Export the results of one task
    Export {
        /// Session holding the task
        #[arg(required = true)]
        session: String,

        /// Task index
        #[arg(required = true)]
        index: usize,

        /// Export format (default, group_by_tags, articles, with_links, csv)
        #[arg(short, long, default_value = "default")]
        format: String,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the effective configuration
    Config,
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Add a task, using the configured template for missing fields
    Add {
        session: String,

        #[arg(long)]
        url: Option<String>,

        #[arg(long)]
        selector: Option<String>,

        /// css or xpath
        #[arg(short, long)]
        method: Option<String>,

        /// Seconds between scheduled runs, 0 disables the timer
        #[arg(short, long, default_value_t = 0)]
        interval: u64,
    },

    /// List the tasks of a session
    List {
        session: String,

        /// Show only tasks matching field=value (fields: url, selector, status, last_run).
        /// Repeated values of one field are alternatives, distinct fields must all match.
        #[arg(long = "filter", value_name = "FIELD=VALUE")]
        filters: Vec<String>,
    },

    /// Edit url, selector, method or interval of a task
    Edit {
        session: String,
        index: usize,

        #[arg(long)]
        url: Option<String>,

        #[arg(long)]
        selector: Option<String>,

        #[arg(short, long)]
        method: Option<String>,

        #[arg(short, long)]
        interval: Option<u64>,
    },

    /// Edit the request parameters of a task
    Params {
        session: String,
        index: usize,

        /// Proxy URL, empty to remove
        #[arg(long)]
        proxy: Option<String>,

        /// User agent, empty to remove
        #[arg(long)]
        user_agent: Option<String>,

        /// Headers as a JSON object
        #[arg(long)]
        headers: Option<String>,

        /// Request timeout in seconds (1-60)
        #[arg(long)]
        timeout: Option<u32>,
    },

    /// Remove one or more tasks
    Remove {
        session: String,

        #[arg(required = true)]
        indices: Vec<usize>,
    },

    /// Drop the stored results of a task
    ClearResults { session: String, index: usize },
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Create an empty session, named after the current time by default
    New { name: Option<String> },

    /// List saved sessions
    List,

    /// Show the tasks and run statistics of a session
    Show { name: String },

    /// Delete a session file, keeping its result files
    Delete { name: String },
}

impl Cli {
    /// Whether the command keeps running until interrupted
    pub fn is_long_running(&self) -> bool {
        matches!(self.command, Commands::Watch { .. })
    }
}

/// Parse command line arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

/// Process the command
pub async fn process_command(cli: Cli) -> Result<()> {
    let config = AppConfig::load(cli.config.as_deref())?;
    let workspace = Workspace::new(config);

    match cli.command {
        Commands::Task { action } => match action {
            TaskCommand::Add { session, url, selector, method, interval } => {
                info!("Adding task to session {}", session);
                commands::task_add(&workspace, &session, url, selector, method, interval).await
            }
            TaskCommand::List { session, filters } => {
                commands::task_list(&workspace, &session, &filters).await
            }
            TaskCommand::Edit { session, index, url, selector, method, interval } => {
                info!("Editing task {} of session {}", index, session);
                commands::task_edit(&workspace, &session, index, url, selector, method, interval).await
            }
            TaskCommand::Params { session, index, proxy, user_agent, headers, timeout } => {
                info!("Updating parameters of task {} in session {}", index, session);
                let update = commands::ParamsUpdate { proxy, user_agent, headers, timeout };
                commands::task_params(&workspace, &session, index, update).await
            }
            TaskCommand::Remove { session, indices } => {
                info!("Removing tasks {:?} from session {}", indices, session);
                commands::task_remove(&workspace, &session, &indices).await
            }
            TaskCommand::ClearResults { session, index } => {
                info!("Clearing results of task {} in session {}", index, session);
                commands::task_clear_results(&workspace, &session, index).await
            }
        },
        Commands::Run { session, indices } => {
            info!("Running session {}", session);
            commands::run(&workspace, &session, &indices).await
        }
        Commands::Watch { session } => {
            info!("Watching session {}", session);
            commands::watch(&workspace, &session).await
        }
        Commands::Session { action } => match action {
            SessionCommand::New { name } => commands::session_new(&workspace, name).await,
            SessionCommand::List => commands::session_list(&workspace),
            SessionCommand::Show { name } => commands::session_show(&workspace, &name),
            SessionCommand::Delete { name } => {
                info!("Deleting session {}", name);
                commands::session_delete(&workspace, &name)
            }
        },
        Commands::Export { session, index, format, output } => {
            info!("Exporting task {} of session {} as {}", index, session, format);
            commands::export(&workspace, &session, index, &format, output).await
        }
        Commands::Config => {
            info!("Showing current configuration");
            commands::show_config(&workspace, cli.config.as_deref())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert()
    }

    #[test]
    fn test_parse_run_with_indices() {
        let cli = Cli::try_parse_from(["smart-scraper", "-v", "run", "daily", "0", "2"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Run { session, indices } => {
                assert_eq!(session, "daily");
                assert_eq!(indices, vec![0, 2]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_repeated_filters() {
        let cli = Cli::try_parse_from([
            "smart-scraper", "task", "list", "daily", "--filter", "url=shop", "--filter", "status=error",
        ])
        .unwrap();
        match cli.command {
            Commands::Task {
                action: TaskCommand::List { session, filters },
            } => {
                assert_eq!(session, "daily");
                assert_eq!(filters, vec!["url=shop", "status=error"]);
            }
            _ => panic!("expected task list"),
        }
    }

    #[test]
    fn test_remove_requires_indices() {
        assert!(Cli::try_parse_from(["smart-scraper", "task", "remove", "daily"]).is_err());
    }
}
