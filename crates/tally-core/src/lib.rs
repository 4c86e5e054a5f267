pub mod backend;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod kv;
pub mod memory;
pub mod render;
pub mod rest;
pub mod session;
pub mod store;
pub mod task;
pub mod views;

use std::ffi::OsString;

use anyhow::Context;
use clap::Parser;
use tracing::{
  debug,
  info
};

#[tracing::instrument(skip_all)]
pub async fn run(
  raw_args: Vec<OsString>
) -> anyhow::Result<()> {
  let pre =
    cli::preprocess_args(&raw_args)?;
  let cli = cli::GlobalCli::parse_from(
    pre.cleaned_args
  );

  cli::init_tracing(
    cli.verbose,
    cli.quiet
  )?;

  info!(
    verbose = cli.verbose,
    quiet = cli.quiet,
    "starting tally CLI"
  );
  debug!(?pre.rc_overrides, "preprocessed rc overrides");

  let mut cfg = config::Config::load(
    cli.tallyrc.as_deref()
  )?;
  cfg.apply_overrides(
    pre.rc_overrides.into_iter().chain(
      cli
        .rc_overrides
        .into_iter()
        .map(|kv| (kv.key, kv.value))
    )
  );

  let data_dir =
    config::resolve_data_dir(
      &cfg,
      cli.data.as_deref()
    )
    .context(
      "failed to resolve data \
       directory"
    )?;

  let kv_path = data_dir.join("kv.json");
  let kv = kv::KvStore::install(
    &kv_path
  )
  .with_context(|| {
    format!(
      "failed to open key/value \
       store at {}",
      kv_path.display()
    )
  })?;

  let backends = commands::connect(
    &cfg,
    kv.clone(),
    &data_dir
  )
  .await?;

  let renderer =
    render::Renderer::new(&cfg);
  let app = commands::App {
    cfg,
    kv,
    backends,
    renderer
  };

  let command =
    cli.command.unwrap_or(
      cli::Command::Task(
        cli::TaskCommand::List {
          category: None,
          tab:      cli::TabArg::All
        }
      )
    );
  commands::dispatch(&app, command)
    .await?;

  info!("done");
  Ok(())
}
