//! Display lists derived from a single snapshot.
//!
//! Every projection is pure and returns a finite iterator that can be cloned
//! and replayed. Records missing a sort key always come after records that
//! have one; ties keep snapshot order.

use crate::models::{Note, NoteCategory, Project, Snapshot, Task, Transaction};
use chrono::{Datelike, NaiveDate};
use std::cmp::Ordering;

/// Open tasks, most urgent first: priority rank descending, then newest first.
pub fn recent_pending(tasks: &Snapshot<Task>, limit: usize) -> impl Iterator<Item = &Task> + Clone {
    let mut open: Vec<&Task> = tasks.iter().filter(|task| !task.status.is_done()).collect();
    open.sort_by(|a, b| {
        descending(&a.priority.map(|p| p.rank()), &b.priority.map(|p| p.rank()))
            .then_with(|| descending(&a.created_at, &b.created_at))
    });
    open.into_iter().take(limit)
}

pub fn active_projects(projects: &Snapshot<Project>, limit: usize) -> impl Iterator<Item = &Project> + Clone {
    let mut active: Vec<&Project> = projects
        .iter()
        .filter(|project| !project.status.is_done())
        .collect();
    active.sort_by(|a, b| descending(&a.created_at, &b.created_at));
    active.into_iter().take(limit)
}

pub fn recent_transactions(
    transactions: &Snapshot<Transaction>,
    limit: usize,
) -> impl Iterator<Item = &Transaction> + Clone {
    let mut ordered: Vec<&Transaction> = transactions.iter().collect();
    ordered.sort_by(|a, b| descending(&a.date, &b.date));
    ordered.into_iter().take(limit)
}

/// Task list ordering: earliest deadline first, undated tasks last.
pub fn tasks_by_deadline(tasks: &Snapshot<Task>) -> impl Iterator<Item = &Task> + Clone {
    let mut ordered: Vec<&Task> = tasks.iter().collect();
    ordered.sort_by(|a, b| ascending(&a.deadline, &b.deadline));
    ordered.into_iter()
}

pub fn tasks_due_on(tasks: &Snapshot<Task>, date: NaiveDate) -> impl Iterator<Item = &Task> + Clone {
    tasks.iter().filter(move |task| task.deadline == Some(date))
}

/// Tasks with a deadline inside the given calendar month, by deadline.
pub fn tasks_in_month(tasks: &Snapshot<Task>, year: i32, month: u32) -> impl Iterator<Item = &Task> + Clone {
    let mut due: Vec<&Task> = tasks
        .iter()
        .filter(|task| {
            task.deadline
                .is_some_and(|deadline| deadline.year() == year && deadline.month() == month)
        })
        .collect();
    due.sort_by(|a, b| ascending(&a.deadline, &b.deadline));
    due.into_iter()
}

/// Case-insensitive match on title, content or any tag. A blank term matches
/// every note; `category` narrows the result further when given.
pub fn search_notes<'a>(
    notes: &'a Snapshot<Note>,
    term: &str,
    category: Option<NoteCategory>,
) -> impl Iterator<Item = &'a Note> + Clone {
    let needle = term.trim().to_lowercase();
    notes.iter().filter(move |note| {
        if category.is_some_and(|category| note.category != category) {
            return false;
        }
        needle.is_empty()
            || note.title.to_lowercase().contains(&needle)
            || note.content.to_lowercase().contains(&needle)
            || note.tags.iter().any(|tag| tag.to_lowercase().contains(&needle))
    })
}

pub fn project_tasks<'a>(tasks: &'a Snapshot<Task>, project_id: &'a str) -> impl Iterator<Item = &'a Task> + Clone {
    tasks
        .iter()
        .filter(move |task| task.project_id.as_deref() == Some(project_id))
}

pub fn project_notes<'a>(notes: &'a Snapshot<Note>, project_id: &'a str) -> impl Iterator<Item = &'a Note> + Clone {
    notes
        .iter()
        .filter(move |note| note.project_id.as_deref() == Some(project_id))
}

fn descending<T: Ord>(a: &Option<T>, b: &Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn ascending<T: Ord>(a: &Option<T>, b: &Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
