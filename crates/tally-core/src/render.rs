use std::io::{self, IsTerminal, Write};

use unicode_width::UnicodeWidthStr;

use crate::config::Config;
use crate::session::{AuthMode, GateView};
use crate::store::{FailedSync, SyncState, TaskStore};
use crate::task::{Category, Status};
use crate::views::CategoryFilter;

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> Self {
        let color = cfg.get_bool("color").unwrap_or(true) && io::stdout().is_terminal();
        Self { color }
    }

    pub fn plain() -> Self {
        Self { color: false }
    }

    /// Visible tasks under the store's filter and tab, then the summary line.
    #[tracing::instrument(skip_all)]
    pub fn print_tasks<W: Write>(&self, out: &mut W, store: &TaskStore) -> anyhow::Result<()> {
        let visible = store.visible();
        if visible.is_empty() {
            writeln!(out, "No tasks.")?;
        } else {
            let headers = ["ID", "Status", "Category", "Task", "Sync"];
            let rows = visible
                .iter()
                .map(|entry| {
                    let task = &entry.row;
                    let category = store
                        .category_of(task)
                        .map(|category| self.category_label(category))
                        .unwrap_or_default();
                    vec![
                        self.paint(&task.id.to_string(), "33"),
                        self.status_label(task.status),
                        category,
                        task.text.clone(),
                        self.sync_label(entry.sync),
                    ]
                })
                .collect();
            write_table(&mut *out, &headers, rows)?;
        }
        writeln!(out)?;
        writeln!(out, "{}", store.summary())?;
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    pub fn print_categories<W: Write>(
        &self,
        out: &mut W,
        store: &TaskStore,
    ) -> anyhow::Result<()> {
        let headers = ["Category", "Color", "Tasks", "Not started", "In progress", "Done"];
        let mut rows: Vec<Vec<String>> = store
            .categories()
            .iter()
            .map(|category| {
                let counts = store.status_counts(CategoryFilter::Category(category.id));
                vec![
                    self.category_label(category),
                    category.color.as_str().to_string(),
                    counts.total().to_string(),
                    counts.not_started.to_string(),
                    counts.in_progress.to_string(),
                    counts.completed.to_string(),
                ]
            })
            .collect();

        let loose = store.status_counts(CategoryFilter::Uncategorized);
        if loose.total() > 0 {
            rows.push(vec![
                "(none)".to_string(),
                String::new(),
                loose.total().to_string(),
                loose.not_started.to_string(),
                loose.in_progress.to_string(),
                loose.completed.to_string(),
            ]);
        }

        if rows.is_empty() {
            writeln!(out, "No categories.")?;
            return Ok(());
        }
        write_table(out, &headers, rows)
    }

    pub fn print_stats<W: Write>(&self, out: &mut W, store: &TaskStore) -> anyhow::Result<()> {
        let all = store.status_counts(CategoryFilter::All);
        writeln!(out, "{}", store.summary())?;
        writeln!(out, "not started  {}", all.not_started)?;
        writeln!(out, "in progress  {}", all.in_progress)?;
        writeln!(out, "completed    {}", all.completed)?;
        writeln!(out, "categories   {}", store.categories().len())?;
        writeln!(
            out,
            "uncategorized {}",
            store.count_in(CategoryFilter::Uncategorized)
        )?;
        Ok(())
    }

    pub fn print_failed<W: Write>(&self, out: &mut W, failed: &[FailedSync]) -> anyhow::Result<()> {
        if failed.is_empty() {
            writeln!(out, "All changes are synced.")?;
            return Ok(());
        }
        let rows = failed
            .iter()
            .map(|entry| {
                vec![
                    self.paint(&entry.seq.to_string(), "33"),
                    entry.message.clone(),
                ]
            })
            .collect();
        write_table(out, &["#", "Change"], rows)
    }

    pub fn print_gate<W: Write>(&self, out: &mut W, view: GateView<'_>) -> anyhow::Result<()> {
        match view {
            GateView::Loading => writeln!(out, "Checking session...")?,
            GateView::Tasks(user) => writeln!(
                out,
                "Signed in as {}",
                user.email.as_deref().unwrap_or("(no email)")
            )?,
            GateView::CredentialForm(form) => {
                let action = match form.mode {
                    AuthMode::SignIn => "tally login <email>",
                    AuthMode::SignUp => "tally signup <email>",
                };
                writeln!(out, "Not signed in. Use `{action}`.")?;
                if let Some(error) = &form.error {
                    writeln!(out, "{}", self.paint(error, "31"))?;
                }
            }
        }
        Ok(())
    }

    /// Store error and warning, if any, for stderr.
    pub fn print_messages<W: Write>(&self, out: &mut W, store: &TaskStore) -> anyhow::Result<()> {
        if let Some(warning) = store.warning() {
            writeln!(out, "{}", self.paint(warning, "33"))?;
        }
        if let Some(error) = store.error() {
            writeln!(out, "{}", self.paint(error, "31"))?;
        }
        Ok(())
    }

    pub fn status_label(&self, status: Status) -> String {
        match status {
            Status::NotStarted => "not started".to_string(),
            Status::InProgress => self.paint("in progress", "36"),
            Status::Completed => self.paint("completed", "32"),
        }
    }

    fn sync_label(&self, sync: SyncState) -> String {
        match sync {
            SyncState::Confirmed => String::new(),
            SyncState::Pending => "pending".to_string(),
            SyncState::Failed => self.paint("failed", "31"),
            SyncState::Sample => self.paint("sample", "90"),
        }
    }

    fn category_label(&self, category: &Category) -> String {
        self.paint(&category.name, category.color.ansi_code())
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

fn write_table<W: Write>(
    mut writer: W,
    headers: &[&str],
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let mut widths: Vec<usize> = headers
        .iter()
        .map(|header| UnicodeWidthStr::width(*header))
        .collect();

    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    let mut line = String::new();
    for (header, width) in headers.iter().zip(widths.iter().copied()) {
        line.push_str(&format!("{header:width$} "));
    }
    writeln!(writer, "{}", line.trim_end())?;

    line.clear();
    for width in widths.iter().copied() {
        line.push_str(&format!("{:-<width$} ", ""));
    }
    writeln!(writer, "{}", line.trim_end())?;

    for row in rows {
        line.clear();
        for (cell, width) in row.iter().zip(&widths) {
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = width.saturating_sub(visible_width);
            line.push_str(cell);
            line.push_str(&" ".repeat(padding));
            line.push(' ');
        }
        writeln!(writer, "{}", line.trim_end())?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}
