use std::io::{self, IsTerminal, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use clap::Parser;
use tracing::{info, instrument, warn};

use crate::backend::{AuthProvider, TableService};
use crate::cli::{
    Command, Credentials, KvCommand, ShellCommand, ShellLine, TaskCommand, order_label,
    split_line,
};
use crate::config::{BackendKind, Config};
use crate::kv::KvStore;
use crate::memory::MemoryBackend;
use crate::render::Renderer;
use crate::rest::RestBackend;
use crate::session::{AuthMode, SessionGate, SubmitOutcome};
use crate::store::{CategoryRemoval, TaskStore};
use crate::task::Category;
use crate::views::CategoryFilter;

pub struct Backends {
    pub auth: Arc<dyn AuthProvider>,
    pub tables: Arc<dyn TableService>,
}

pub struct App {
    pub cfg: Config,
    pub kv: Arc<KvStore>,
    pub backends: Backends,
    pub renderer: Renderer,
}

/// Signed-in gate plus the loaded task list of its user.
struct Session {
    gate: SessionGate,
    store: TaskStore,
}

impl Session {
    fn close(mut self) {
        self.gate.unmount();
    }
}

#[instrument(skip(cfg, kv, data_dir))]
pub async fn connect(cfg: &Config, kv: Arc<KvStore>, data_dir: &Path) -> anyhow::Result<Backends> {
    match cfg.backend_kind()? {
        BackendKind::Local => {
            let path = data_dir.join("local.json");
            let backend = Arc::new(MemoryBackend::open(&path).with_context(|| {
                format!("failed to open local backend at {}", path.display())
            })?);
            Ok(Backends {
                auth: backend.clone(),
                tables: backend,
            })
        }
        BackendKind::Rest => {
            let settings = cfg.rest_settings()?;
            let backend = Arc::new(
                RestBackend::connect(settings, kv)
                    .await
                    .context("failed to set up the hosted backend client")?,
            );
            Ok(Backends {
                auth: backend.clone(),
                tables: backend,
            })
        }
    }
}

#[instrument(skip(app, command))]
pub async fn dispatch(app: &App, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Login(credentials) => cmd_authenticate(app, AuthMode::SignIn, credentials).await,
        Command::Signup(credentials) => cmd_authenticate(app, AuthMode::SignUp, credentials).await,
        Command::Logout => cmd_logout(app).await,
        Command::Whoami => cmd_whoami(app).await,
        Command::Config => cmd_config(&app.cfg),
        Command::Kv(command) => cmd_kv(&app.kv, command).await,
        Command::Shell => cmd_shell(app).await,
        Command::Task(command) => {
            let mut session = open_session(app).await?;
            let result = run_task_command(app, &mut session.store, command).await;
            session.close();
            result
        }
    }
}

async fn open_session(app: &App) -> anyhow::Result<Session> {
    let gate = SessionGate::mount(app.backends.auth.clone()).await;
    let Some(user) = gate.user().cloned() else {
        let reason = gate.form().error.clone().unwrap_or_else(|| {
            "not signed in; run `tally login <email>` first".to_string()
        });
        bail!(reason);
    };

    let mut store = TaskStore::new(app.backends.tables.clone(), app.cfg.store_settings()?);
    store.load(&user).await;
    if let Some(warning) = store.warning() {
        eprintln!("{warning}");
    }
    Ok(Session { gate, store })
}

#[instrument(skip(app, store, command))]
async fn run_task_command(
    app: &App,
    store: &mut TaskStore,
    command: TaskCommand,
) -> anyhow::Result<()> {
    let read_only = command.is_read_only();
    match command {
        TaskCommand::List { category, tab } => {
            let filter = resolve_filter(store, category.as_deref())?;
            store.set_filter(filter);
            store.set_tab(tab.into());
            app.renderer.print_tasks(&mut io::stdout().lock(), store)?;
        }
        TaskCommand::Add { category, text } => {
            store.set_input(text.join(" "));
            store.set_category_input(category.unwrap_or_default());
            let id = store.add_task().await?;
            println!("Created task {id}.");
        }
        TaskCommand::Cycle { id } => {
            let status = store.cycle_status(id).await?;
            println!("Task {id} is now {}.", app.renderer.status_label(status));
        }
        TaskCommand::Toggle { id } => {
            let completed = store.toggle_complete(id).await?;
            let state = if completed { "completed" } else { "not started" };
            println!("Task {id} is now {state}.");
        }
        TaskCommand::Edit { id, text } => {
            store.start_edit(id)?;
            store.set_edit_text(text.join(" "))?;
            if let Err(err) = store.save_edit().await {
                store.cancel_edit();
                return Err(err.into());
            }
            println!("Updated task {id}.");
        }
        TaskCommand::Delete { id } => {
            store.delete_task(id).await?;
            println!("Deleted task {id}.");
        }
        TaskCommand::Clear => {
            let removed = store.clear_completed().await?;
            println!("Cleared {removed} completed task(s).");
        }
        TaskCommand::Categories => {
            app.renderer
                .print_categories(&mut io::stdout().lock(), store)?;
        }
        TaskCommand::DeleteCategory { name, yes } => {
            let category = store
                .category_named(&name)
                .cloned()
                .ok_or_else(|| anyhow!("no category named {name:?}"))?;
            let outcome = store
                .delete_category(category.id, |category| yes || confirm_deletion(category))
                .await?;
            match outcome {
                CategoryRemoval::Cancelled => println!("Kept category {}.", category.name),
                CategoryRemoval::Removed => println!("Deleted category {}.", category.name),
                CategoryRemoval::Failed => {}
            }
        }
        TaskCommand::Stats => {
            let mut out = io::stdout().lock();
            app.renderer.print_stats(&mut out, store)?;
            writeln!(out, "order        {}", order_label(store.settings().order))?;
        }
    }

    if !read_only && let Some(error) = store.error() {
        bail!("{error}");
    }
    Ok(())
}

/// `none` and `uncategorized` select tasks without a category unless a
/// category has that name.
fn resolve_filter(store: &TaskStore, category: Option<&str>) -> anyhow::Result<CategoryFilter> {
    let Some(name) = category.map(str::trim) else {
        return Ok(CategoryFilter::All);
    };
    if let Some(category) = store.category_named(name) {
        return Ok(CategoryFilter::Category(category.id));
    }
    match name.to_ascii_lowercase().as_str() {
        "" | "all" => Ok(CategoryFilter::All),
        "none" | "uncategorized" => Ok(CategoryFilter::Uncategorized),
        _ => Err(anyhow!("no category named {name:?}")),
    }
}

fn confirm_deletion(category: &Category) -> bool {
    print!(
        "Delete category {:?}? Its tasks will become uncategorized. [y/N] ",
        category.name
    );
    if let Err(err) = io::stdout().flush() {
        warn!(error = %err, "failed to flush prompt");
    }
    let mut answer = String::new();
    match io::stdin().read_line(&mut answer) {
        Ok(_) => matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        Err(err) => {
            warn!(error = %err, "failed to read confirmation; keeping category");
            false
        }
    }
}

#[instrument(skip(app, credentials), fields(email = %credentials.email))]
async fn cmd_authenticate(
    app: &App,
    mode: AuthMode,
    credentials: Credentials,
) -> anyhow::Result<()> {
    let password = match credentials.password {
        Some(password) => password,
        None => read_password()?,
    };

    let mut gate = SessionGate::mount(app.backends.auth.clone()).await;
    let form = gate.form_mut();
    form.mode = mode;
    form.email = credentials.email;
    form.password = password;

    let outcome = gate.submit().await;
    let form = gate.form().clone();
    gate.unmount();

    match outcome {
        SubmitOutcome::SignedIn(user) => {
            println!(
                "{} ({})",
                form.notice.unwrap_or_default(),
                user.email.as_deref().unwrap_or("no email")
            );
        }
        SubmitOutcome::VerificationPending => {
            println!("{}", form.notice.unwrap_or_default());
        }
        SubmitOutcome::Rejected => {
            bail!(
                form.error
                    .unwrap_or_else(|| "authentication failed".to_string())
            );
        }
    }
    Ok(())
}

fn read_password() -> anyhow::Result<String> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        eprint!("Password (input is visible): ");
        io::stderr().flush()?;
    }
    let mut password = String::new();
    stdin
        .read_line(&mut password)
        .context("failed to read password from stdin")?;
    Ok(password.trim_end_matches(['\r', '\n']).to_string())
}

async fn cmd_logout(app: &App) -> anyhow::Result<()> {
    let mut gate = SessionGate::mount(app.backends.auth.clone()).await;
    if !gate.is_authenticated() {
        gate.unmount();
        println!("Not signed in.");
        return Ok(());
    }
    let signed_out = gate.sign_out().await;
    let error = gate.form().error.clone();
    gate.unmount();

    if !signed_out {
        bail!(error.unwrap_or_else(|| "Failed to sign out".to_string()));
    }
    println!("Signed out.");
    Ok(())
}

async fn cmd_whoami(app: &App) -> anyhow::Result<()> {
    let mut gate = SessionGate::mount(app.backends.auth.clone()).await;
    app.renderer
        .print_gate(&mut io::stdout().lock(), gate.view())?;
    gate.unmount();
    Ok(())
}

fn cmd_config(cfg: &Config) -> anyhow::Result<()> {
    let mut entries: Vec<_> = cfg.iter().collect();
    entries.sort();
    for (key, value) in entries {
        if key == "backend.key" {
            println!("{key} = ********");
        } else {
            println!("{key} = {value}");
        }
    }
    for file in &cfg.loaded_files {
        println!("# loaded {}", file.display());
    }
    Ok(())
}

#[instrument(skip(kv))]
async fn cmd_kv(kv: &KvStore, command: KvCommand) -> anyhow::Result<()> {
    match command {
        KvCommand::Get { key } => match kv.get(&key).await {
            Some(value) => println!("{value}"),
            None => bail!("no value stored under {key:?}"),
        },
        KvCommand::Set { key, value } => kv.set(&key, &value).await?,
        KvCommand::Delete { key } => kv.delete(&key).await?,
        KvCommand::Keys => {
            for key in kv.keys() {
                println!("{key}");
            }
        }
    }
    Ok(())
}

#[instrument(skip(app))]
async fn cmd_shell(app: &App) -> anyhow::Result<()> {
    let mut session = open_session(app).await?;
    let stdin = io::stdin();
    let interactive = stdin.is_terminal();
    info!(interactive, "starting shell");

    let mut line = String::new();
    loop {
        if interactive {
            print!("tally> ");
            io::stdout().flush()?;
        }
        line.clear();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }

        let words = match split_line(&line) {
            Ok(words) if words.is_empty() => continue,
            Ok(words) => words,
            Err(err) => {
                eprintln!("error: {err}");
                continue;
            }
        };
        let parsed = match ShellLine::try_parse_from(words) {
            Ok(parsed) => parsed,
            Err(err) => {
                if let Err(print_err) = err.print() {
                    warn!(error = %print_err, "failed to print usage");
                }
                continue;
            }
        };

        match shell_command(app, &mut session, parsed.command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => eprintln!("error: {err:#}"),
        }
    }

    session.close();
    Ok(())
}

/// Runs one shell command; `Ok(false)` ends the shell.
async fn shell_command(
    app: &App,
    session: &mut Session,
    command: ShellCommand,
) -> anyhow::Result<bool> {
    let store = &mut session.store;
    match command {
        ShellCommand::Exit => return Ok(false),
        ShellCommand::Failed => {
            app.renderer
                .print_failed(&mut io::stdout().lock(), store.failed())?;
        }
        ShellCommand::Retry { seq } => {
            if store.retry(seq).await? {
                println!("Change {seq} synced.");
            } else {
                app.renderer
                    .print_messages(&mut io::stderr().lock(), store)?;
            }
        }
        ShellCommand::Revert { seq } => {
            store.revert(seq)?;
            println!("Change {seq} reverted.");
        }
        ShellCommand::Dismiss { seq } => {
            store.dismiss(seq)?;
            println!("Change {seq} dismissed.");
        }
        ShellCommand::Whoami => {
            app.renderer
                .print_gate(&mut io::stdout().lock(), session.gate.view())?;
        }
        ShellCommand::Reload => {
            let user = session
                .gate
                .user()
                .cloned()
                .ok_or_else(|| anyhow!("no longer signed in"))?;
            store.load(&user).await;
            app.renderer
                .print_messages(&mut io::stderr().lock(), store)?;
            app.renderer.print_tasks(&mut io::stdout().lock(), store)?;
        }
        ShellCommand::Task(command) => {
            let failed_before = store.failed().len();
            let result = run_task_command(app, store, command).await;
            if store.failed().len() > failed_before {
                eprintln!("The change is kept locally; see `failed` to retry or revert it.");
            }
            result?;
        }
    }
    Ok(true)
}
