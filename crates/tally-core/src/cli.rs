use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::{anyhow, bail};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::store::TaskOrder;
use crate::views::Tab;

#[derive(Debug, Clone)]
pub struct PreprocessedArgs {
    pub cleaned_args: Vec<OsString>,
    pub rc_overrides: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct KeyVal {
    pub key: String,
    pub value: String,
}

impl std::str::FromStr for KeyVal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (k, v) = s
            .split_once('=')
            .ok_or_else(|| anyhow!("expected KEY=VALUE, got: {s}"))?;
        Ok(Self {
            key: k.trim().to_string(),
            value: v.trim().to_string(),
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tally",
    version,
    about = "Tally: a personal task list synced to a hosted backend",
    disable_help_subcommand = true
)]
pub struct GlobalCli {
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[arg(short = 'q', long = "quiet", action = ArgAction::Count, global = true)]
    pub quiet: u8,

    #[arg(
        long = "rc",
        value_parser = clap::builder::ValueParser::new(|s: &str| s.parse::<KeyVal>()),
        action = ArgAction::Append
    )]
    pub rc_overrides: Vec<KeyVal>,

    #[arg(long = "tallyrc")]
    pub tallyrc: Option<PathBuf>,

    #[arg(long = "data")]
    pub data: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Sign in with email and password
    Login(Credentials),
    /// Create an account
    Signup(Credentials),
    /// Sign out and forget the stored session
    Logout,
    /// Show who is signed in
    Whoami,
    /// Print the effective configuration
    Config,
    #[command(subcommand)]
    Kv(KvCommand),
    /// Read commands line by line, keeping one task list loaded
    Shell,
    #[command(flatten)]
    Task(TaskCommand),
}

#[derive(clap::Args, Debug, Clone)]
pub struct Credentials {
    pub email: String,

    /// Read from stdin when neither given nor set in the environment
    #[arg(long, env = "TALLY_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

/// Commands that act on the signed-in user's task list.
#[derive(Subcommand, Debug, Clone)]
pub enum TaskCommand {
    /// Show tasks
    #[command(visible_alias = "ls")]
    List {
        /// Category name, `none` for uncategorized tasks, or `all`
        #[arg(long, short = 'c')]
        category: Option<String>,

        #[arg(long, short = 't', value_enum, default_value_t = TabArg::All)]
        tab: TabArg,
    },
    /// Add a task, optionally in a category that is created on first use
    Add {
        #[arg(long, short = 'c')]
        category: Option<String>,

        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        text: Vec<String>,
    },
    /// Advance a task: not started, in progress, completed, not started
    Cycle { id: i64 },
    /// Switch a task between completed and not started
    Toggle { id: i64 },
    /// Replace the text of a task
    Edit {
        id: i64,

        #[arg(required = true, num_args = 1.., allow_hyphen_values = true)]
        text: Vec<String>,
    },
    /// Delete a task
    #[command(visible_alias = "rm")]
    Delete { id: i64 },
    /// Delete every completed task
    Clear,
    /// Show categories with their task counts
    Categories,
    /// Delete a category; its tasks become uncategorized
    DeleteCategory {
        name: String,

        /// Skip the confirmation prompt
        #[arg(long, short = 'y')]
        yes: bool,
    },
    /// Show task counts
    Stats,
}

#[derive(Subcommand, Debug, Clone)]
pub enum KvCommand {
    Get { key: String },
    Set { key: String, value: String },
    Delete { key: String },
    /// List stored keys
    Keys,
}

/// One line typed into `tally shell`.
#[derive(Parser, Debug, Clone)]
#[command(multicall = true, disable_help_subcommand = true)]
pub struct ShellLine {
    #[command(subcommand)]
    pub command: ShellCommand,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ShellCommand {
    /// List changes the backend did not accept
    Failed,
    /// Send a failed change again
    Retry { seq: u64 },
    /// Undo a failed change locally
    Revert { seq: u64 },
    /// Forget a failed change and keep the local state
    Dismiss { seq: u64 },
    Whoami,
    /// Reload the list from the backend
    Reload,
    #[command(visible_alias = "quit")]
    Exit,
    #[command(flatten)]
    Task(TaskCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TabArg {
    All,
    Active,
    Completed,
}

impl From<TabArg> for Tab {
    fn from(tab: TabArg) -> Self {
        match tab {
            TabArg::All => Tab::All,
            TabArg::Active => Tab::Active,
            TabArg::Completed => Tab::Completed,
        }
    }
}

impl TaskCommand {
    /// Whether the command only reads the list.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            TaskCommand::List { .. } | TaskCommand::Categories | TaskCommand::Stats
        )
    }
}

pub fn order_label(order: TaskOrder) -> &'static str {
    match order {
        TaskOrder::NewestFirst => "newest first",
        TaskOrder::OldestFirst => "oldest first",
    }
}

pub fn init_tracing(verbose: u8, quiet: u8) -> anyhow::Result<()> {
    let default_level = if quiet >= 2 {
        "error"
    } else if quiet == 1 {
        "warn"
    } else if verbose >= 3 {
        "trace"
    } else if verbose == 2 {
        "debug"
    } else if verbose == 1 {
        "info"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .map_err(|e| anyhow!("invalid RUST_LOG / log filter: {e}"))?;

    let init_result = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();

    if let Err(err) = init_result {
        debug!(error = %err, "tracing subscriber already set, continuing");
    }

    Ok(())
}

/// Pulls positional `rc.key=value` and `rc.key:value` overrides out of the
/// argument list before clap sees it.
#[tracing::instrument(skip_all)]
pub fn preprocess_args(raw: &[OsString]) -> anyhow::Result<PreprocessedArgs> {
    let mut cleaned = Vec::with_capacity(raw.len());
    let mut overrides: Vec<(String, String)> = Vec::new();

    let mut iter = raw.iter().cloned();
    if let Some(bin) = iter.next() {
        cleaned.push(bin);
    }

    for arg in iter {
        let s = arg.to_string_lossy();
        if let Some(rest) = s.strip_prefix("rc.") {
            let parsed = rest.split_once('=').or_else(|| rest.split_once(':'));
            if let Some((k, v)) = parsed {
                debug!(key = %k, value = %v, "captured positional rc override");
                overrides.push((format!("rc.{k}"), v.to_string()));
                continue;
            }
        }

        cleaned.push(arg);
    }

    Ok(PreprocessedArgs {
        cleaned_args: cleaned,
        rc_overrides: overrides,
    })
}

/// Splits a shell line into words. Single and double quotes group words;
/// a backslash escapes the next character outside single quotes.
pub fn split_line(line: &str) -> anyhow::Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(ch) = chars.next() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some('\''), c) => current.push(c),
            (_, '\\') => {
                let Some(next) = chars.next() else {
                    bail!("line ends with a lone backslash");
                };
                current.push(next);
                in_word = true;
            }
            (Some(_), c) => current.push(c),
            (None, '"' | '\'') => {
                quote = Some(ch);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if let Some(q) = quote {
        bail!("unterminated {q} quote");
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use std::ffi::OsString;

    use clap::Parser;

    use super::{
        Command, GlobalCli, ShellCommand, ShellLine, TabArg, TaskCommand, preprocess_args,
        split_line,
    };

    #[test]
    fn positional_rc_overrides_are_extracted() {
        let raw: Vec<OsString> = ["tally", "rc.color=off", "list", "rc.task.order:oldest"]
            .into_iter()
            .map(OsString::from)
            .collect();
        let pre = preprocess_args(&raw).unwrap();
        assert_eq!(
            pre.cleaned_args,
            vec![OsString::from("tally"), OsString::from("list")]
        );
        assert_eq!(
            pre.rc_overrides,
            vec![
                ("rc.color".to_string(), "off".to_string()),
                ("rc.task.order".to_string(), "oldest".to_string()),
            ]
        );
    }

    #[test]
    fn task_commands_parse_at_top_level() {
        let cli =
            GlobalCli::parse_from(["tally", "-vv", "add", "-c", "Work", "write", "report"]);
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Some(Command::Task(TaskCommand::Add { category, text })) => {
                assert_eq!(category.as_deref(), Some("Work"));
                assert_eq!(text, vec!["write", "report"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }

        let cli = GlobalCli::parse_from(["tally", "ls", "--tab", "completed"]);
        assert!(matches!(
            cli.command,
            Some(Command::Task(TaskCommand::List {
                tab: TabArg::Completed,
                ..
            }))
        ));
    }

    #[test]
    fn shell_lines_parse_journal_commands() {
        let line = ShellLine::try_parse_from(split_line("retry 3").unwrap()).unwrap();
        assert!(matches!(line.command, ShellCommand::Retry { seq: 3 }));

        let line =
            ShellLine::try_parse_from(split_line("edit 12 'buy oat milk'").unwrap()).unwrap();
        match line.command {
            ShellCommand::Task(TaskCommand::Edit { id, text }) => {
                assert_eq!(id, 12);
                assert_eq!(text, vec!["buy oat milk"]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn split_line_handles_quotes_and_escapes() {
        assert_eq!(
            split_line(r#"add -c "Home Office" fix\ lamp '' "#).unwrap(),
            vec!["add", "-c", "Home Office", "fix lamp", ""]
        );
        assert!(split_line("add \"open").is_err());
        assert!(split_line("trailing \\").is_err());
        assert!(split_line("   ").unwrap().is_empty());
    }
}
