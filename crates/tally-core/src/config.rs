use std::collections::HashMap;
use std::fs;
use std::path::{
  Path,
  PathBuf
};
use std::time::Duration;

use anyhow::{
  Context,
  anyhow
};
use tracing::{
  debug,
  info,
  trace,
  warn
};

use crate::rest::RestSettings;
use crate::store::{
  StoreSettings,
  TaskOrder,
  TextRule
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
  Rest,
  Local
}

#[derive(Debug, Clone)]
pub struct Config {
  map: HashMap<String, String>,
  pub loaded_files: Vec<PathBuf>
}

impl Config {
  #[tracing::instrument(skip(
    rc_override
  ))]
  pub fn load(
    rc_override: Option<&Path>
  ) -> anyhow::Result<Self> {
    let mut cfg = Config::defaults();

    let rc = resolve_rc_path(
      rc_override
    )?;
    if let Some(path) = rc {
      info!(tallyrc = %path.display(), "loading tallyrc");
      cfg.load_file(&path)?;
    } else {
      warn!(
        "no tallyrc found; using \
         defaults"
      );
    }

    Ok(cfg)
  }

  pub fn defaults() -> Self {
    let mut cfg = Config {
      map:          HashMap::new(),
      loaded_files: vec![]
    };

    for (key, value) in [
      ("backend", "local"),
      ("backend.timeout", "30"),
      ("data.location", "~/.tally"),
      ("color", "on"),
      ("task.validation", "basic"),
      ("task.order", "newest")
    ] {
      cfg.map.insert(
        key.to_string(),
        value.to_string()
      );
    }

    cfg
  }

  #[tracing::instrument(skip(
    self, overrides
  ))]
  pub fn apply_overrides<I>(
    &mut self,
    overrides: I
  ) where
    I: IntoIterator<
      Item = (String, String)
    >
  {
    for (k, v) in overrides {
      let key = k
        .strip_prefix("rc.")
        .unwrap_or(&k)
        .to_string();
      debug!(key = %key, value = %v, "applying override");
      self.map.insert(key, v);
    }
  }

  pub fn get(
    &self,
    key: &str
  ) -> Option<String> {
    self.map.get(key).cloned()
  }

  pub fn get_bool(
    &self,
    key: &str
  ) -> Option<bool> {
    self
      .map
      .get(key)
      .map(|v| parse_bool(v))
  }

  pub fn iter(
    &self
  ) -> impl Iterator<Item = (&String, &String)>
  {
    self.map.iter()
  }

  pub fn backend_kind(
    &self
  ) -> anyhow::Result<BackendKind> {
    match self
      .get("backend")
      .unwrap_or_default()
      .to_ascii_lowercase()
      .as_str()
    {
      | "rest" | "supabase" => {
        Ok(BackendKind::Rest)
      }
      | "local" | "memory" => {
        Ok(BackendKind::Local)
      }
      | other => Err(anyhow!(
        "invalid backend setting: \
         {other}"
      ))
    }
  }

  pub fn rest_settings(
    &self
  ) -> anyhow::Result<RestSettings> {
    let url =
      self.get("backend.url").ok_or_else(
        || {
          anyhow!(
            "backend.url must be set \
             to use the rest backend"
          )
        }
      )?;
    let api_key = self
      .get("backend.key")
      .ok_or_else(|| {
        anyhow!(
          "backend.key must be set to \
           use the rest backend"
        )
      })?;
    let timeout = self
      .get("backend.timeout")
      .unwrap_or_else(|| {
        "30".to_string()
      })
      .trim()
      .parse::<u64>()
      .context(
        "backend.timeout must be a \
         whole number of seconds"
      )?;

    Ok(RestSettings {
      url,
      api_key,
      timeout: Duration::from_secs(
        timeout
      )
    })
  }

  pub fn store_settings(
    &self
  ) -> anyhow::Result<StoreSettings> {
    let rule = match self
      .get("task.validation")
      .unwrap_or_default()
      .to_ascii_lowercase()
      .as_str()
    {
      | "basic" | "" => {
        TextRule::NonBlank
      }
      | "strict" => {
        TextRule::LongerThanThree
      }
      | other => {
        return Err(anyhow!(
          "invalid task.validation \
           setting: {other}"
        ));
      }
    };

    let order = match self
      .get("task.order")
      .unwrap_or_default()
      .to_ascii_lowercase()
      .as_str()
    {
      | "newest" | "" => {
        TaskOrder::NewestFirst
      }
      | "oldest" => {
        TaskOrder::OldestFirst
      }
      | other => {
        return Err(anyhow!(
          "invalid task.order \
           setting: {other}"
        ));
      }
    };

    Ok(StoreSettings {
      rule,
      order
    })
  }

  #[tracing::instrument(skip(self))]
  fn load_file(
    &mut self,
    path: &Path
  ) -> anyhow::Result<()> {
    let path = expand_tilde(path);
    let text =
      fs::read_to_string(&path)
        .with_context(|| {
          format!(
            "failed to read {}",
            path.display()
          )
        })?;

    self
      .loaded_files
      .push(path.clone());

    let base_dir = path
      .parent()
      .map(|p| p.to_path_buf())
      .unwrap_or_else(|| {
        PathBuf::from(".")
      });

    for (line_num, raw_line) in
      text.lines().enumerate()
    {
      let mut line = raw_line.trim();
      if line.is_empty()
        || line.starts_with('#')
      {
        continue;
      }

      if let Some((before, _)) =
        line.split_once('#')
      {
        line = before.trim();
      }

      if line.is_empty() {
        continue;
      }

      if let Some(include_rest) =
        line.strip_prefix("include ")
      {
        let include_path =
          resolve_include_path(
            &base_dir,
            include_rest.trim()
          )?;
        debug!(
            file = %path.display(),
            include = %include_path.display(),
            line = line_num + 1,
            "processing include"
        );

        if include_path.exists() {
          self
            .load_file(&include_path)?;
        } else {
          warn!(include = %include_path.display(), "include file does not exist; skipping");
        }
        continue;
      }

      let (k, v) = line
        .split_once('=')
        .ok_or_else(|| {
          anyhow!(
            "invalid config line \
             {}:{}: {}",
            path.display(),
            line_num + 1,
            raw_line
          )
        })?;

      let key = k.trim().to_string();
      let value = v.trim().to_string();
      trace!(key = %key, "loaded config key");
      self.map.insert(key, value);
    }

    Ok(())
  }
}

#[tracing::instrument(skip(
  cfg,
  override_dir
))]
pub fn resolve_data_dir(
  cfg: &Config,
  override_dir: Option<&Path>
) -> anyhow::Result<PathBuf> {
  let dir = if let Some(path) =
    override_dir
  {
    path.to_path_buf()
  } else if let Some(cfg_value) =
    cfg.get("data.location")
  {
    expand_tilde(Path::new(&cfg_value))
  } else {
    default_data_dir()?
  };

  if !dir.exists() {
    info!(dir = %dir.display(), "creating data directory");
    fs::create_dir_all(&dir)
      .with_context(|| {
        format!(
          "failed to create {}",
          dir.display()
        )
      })?;
  }

  Ok(dir)
}

#[tracing::instrument(skip(
  override_path
))]
fn resolve_rc_path(
  override_path: Option<&Path>
) -> anyhow::Result<Option<PathBuf>> {
  if let Some(path) = override_path {
    return Ok(Some(path.to_path_buf()));
  }

  if let Ok(rc_env) =
    std::env::var("TALLYRC")
  {
    if rc_env == "/dev/null" {
      return Ok(None);
    }
    return Ok(Some(PathBuf::from(
      rc_env
    )));
  }

  let Some(home) = dirs::home_dir()
  else {
    warn!(
      "cannot determine home \
       directory; skipping tallyrc"
    );
    return Ok(None);
  };
  let candidate = home.join(".tallyrc");
  if candidate.exists() {
    return Ok(Some(candidate));
  }

  Ok(None)
}

fn default_data_dir()
-> anyhow::Result<PathBuf> {
  let home = dirs::home_dir()
    .ok_or_else(|| {
      anyhow!(
        "cannot determine home \
         directory"
      )
    })?;
  Ok(home.join(".tally"))
}

fn resolve_include_path(
  base_dir: &Path,
  include: &str
) -> anyhow::Result<PathBuf> {
  if include.trim().is_empty() {
    return Err(anyhow!(
      "include path cannot be empty"
    ));
  }

  let raw = PathBuf::from(include);
  let expanded = expand_tilde(&raw);
  if expanded.is_absolute() {
    Ok(expanded)
  } else {
    Ok(base_dir.join(expanded))
  }
}

fn expand_tilde(
  path: &Path
) -> PathBuf {
  let text = path.to_string_lossy();
  if let Some(rest) =
    text.strip_prefix("~/")
    && let Some(home) = dirs::home_dir()
  {
    return home.join(rest);
  }
  path.to_path_buf()
}

fn parse_bool(s: &str) -> bool {
  matches!(
    s.trim()
      .to_ascii_lowercase()
      .as_str(),
    "1" | "y" | "yes" | "on" | "true"
  )
}
