//! Pure projections over the task list: filters, tabs and counters.

use std::fmt;

use crate::task::{Category, CategoryId, Status, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CategoryFilter {
    #[default]
    All,
    Uncategorized,
    Category(CategoryId),
}

impl CategoryFilter {
    pub fn matches(self, task: &Task) -> bool {
        match self {
            CategoryFilter::All => true,
            CategoryFilter::Uncategorized => task.category_id.is_none(),
            CategoryFilter::Category(id) => task.category_id == Some(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tab {
    #[default]
    All,
    Active,
    Completed,
}

impl Tab {
    pub fn matches(self, task: &Task) -> bool {
        match self {
            Tab::All => true,
            Tab::Active => !task.completed(),
            Tab::Completed => task.completed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusCounts {
    pub not_started: usize,
    pub in_progress: usize,
    pub completed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.not_started + self.in_progress + self.completed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub active: usize,
    pub completed: usize,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} active, {} completed", self.active, self.completed)
    }
}

fn row<T: AsRef<Task>>(item: &T) -> &Task {
    item.as_ref()
}

pub fn active_count<T: AsRef<Task>>(tasks: &[T]) -> usize {
    tasks.iter().filter(|t| !row(*t).completed()).count()
}

pub fn completed_count<T: AsRef<Task>>(tasks: &[T]) -> usize {
    tasks.iter().filter(|t| row(*t).completed()).count()
}

pub fn summary<T: AsRef<Task>>(tasks: &[T]) -> Summary {
    Summary {
        active: active_count(tasks),
        completed: completed_count(tasks),
    }
}

pub fn count_in<T: AsRef<Task>>(tasks: &[T], scope: CategoryFilter) -> usize {
    tasks.iter().filter(|t| scope.matches(row(*t))).count()
}

pub fn status_counts<T: AsRef<Task>>(tasks: &[T], scope: CategoryFilter) -> StatusCounts {
    tasks
        .iter()
        .map(row)
        .filter(|task| scope.matches(task))
        .fold(StatusCounts::default(), |mut counts, task| {
            match task.status {
                Status::NotStarted => counts.not_started += 1,
                Status::InProgress => counts.in_progress += 1,
                Status::Completed => counts.completed += 1,
            }
            counts
        })
}

/// Tasks passing both selectors, in list order.
pub fn visible<T: AsRef<Task>>(tasks: &[T], filter: CategoryFilter, tab: Tab) -> Vec<&T> {
    tasks
        .iter()
        .filter(|t| filter.matches(row(*t)) && tab.matches(row(*t)))
        .collect()
}

/// Categories whose name contains `input`, ignoring case; all of them for
/// empty input.
pub fn category_suggestions<'a>(categories: &'a [Category], input: &str) -> Vec<&'a Category> {
    let needle = input.trim().to_lowercase();
    categories
        .iter()
        .filter(|category| needle.is_empty() || category.name.to_lowercase().contains(&needle))
        .collect()
}

pub fn category_of<'a>(categories: &'a [Category], task: &Task) -> Option<&'a Category> {
    let id = task.category_id?;
    categories.iter().find(|category| category.id == id)
}
