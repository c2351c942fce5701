use std::fmt::Write as _;

use core_types::{AuthUser, Note, SessionContext};
use i18n::I18n;
use note_sync::NoteView;

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Sidebar listing: pinned notes, then the rest, numbered in display order.
pub fn note_list(view: &NoteView, i18n: &I18n) -> String {
    if view.loading {
        return i18n.t("shell.loading").to_string();
    }
    let mut out = String::new();
    if let Some(error) = &view.error {
        let _ = writeln!(out, "{}: {error}", i18n.t("shell.error"));
    }
    if let Some(search) = &view.search {
        let _ = writeln!(out, "{} \"{}\"", i18n.t("shell.search_results"), search.query);
    }

    let notes = view.displayed_notes();
    if notes.is_empty() {
        out.push_str(i18n.t("shell.no_notes"));
        return out;
    }

    let active = view.active_id();
    let pinned = notes.iter().filter(|note| note.pinned).count();
    for (index, note) in notes.iter().enumerate() {
        if index == 0 && pinned > 0 {
            let _ = writeln!(out, "{}", i18n.t("shell.pinned"));
        }
        if index == pinned {
            let _ = writeln!(out, "{}", i18n.t("shell.notes"));
        }
        let marker = if Some(&note.id) == active { '>' } else { ' ' };
        let _ = writeln!(out, "{marker}{:>3}. {}", index + 1, summary_line(note));
        let preview = note.preview();
        if !preview.is_empty() {
            let _ = writeln!(out, "       {preview}");
        }
    }
    out.truncate(out.trim_end().len());
    out
}

fn summary_line(note: &Note) -> String {
    let mut line = note.display_title().to_string();
    if let Some(category) = &note.category {
        let _ = write!(line, " [{category}]");
    }
    for tag in &note.tags {
        let _ = write!(line, " #{tag}");
    }
    let _ = write!(line, "  {}", note.updated_at.format(DATE_FORMAT));
    line
}

/// Full view of the open note.
pub fn note_detail(note: &Note, i18n: &I18n) -> String {
    let mut out = String::new();
    let pin = if note.pinned {
        format!(" ({})", i18n.t("shell.pinned"))
    } else {
        String::new()
    };
    let _ = writeln!(out, "# {}{pin}", note.display_title());
    let _ = writeln!(
        out,
        "{}  {}",
        note.category.as_deref().unwrap_or("-"),
        note.updated_at.format(DATE_FORMAT)
    );
    if !note.tags.is_empty() {
        let tags: Vec<&str> = note.tags.iter().map(String::as_str).collect();
        let _ = writeln!(out, "{}: {}", i18n.t("shell.tags"), tags.join(", "));
    }
    out.push_str(&note.content);
    out
}

pub fn categories(view: &NoteView, i18n: &I18n) -> String {
    let mark = |selected: bool| if selected { "*" } else { "" };
    let categories: Vec<String> = view
        .categories
        .iter()
        .map(|category| format!("{category}{}", mark(*category == view.filter.category)))
        .collect();
    let tags: Vec<String> = view
        .tags
        .iter()
        .map(|tag| format!("#{tag}{}", mark(view.filter.tags.contains(tag))))
        .collect();
    format!(
        "{}: {}\n{}: {}",
        i18n.t("shell.categories"),
        categories.join(", "),
        i18n.t("shell.tags"),
        tags.join(" ")
    )
}

/// Profile badge: `[A] Ada`.
pub fn user_badge(user: &AuthUser) -> String {
    format!("[{}] {}", user.initial(), user.display_label())
}

pub fn session_status(session: &SessionContext, i18n: &I18n) -> String {
    let plan = if session.plan.is_premium() {
        "Premium"
    } else {
        "Free"
    };
    let who = session
        .user
        .as_ref()
        .map(user_badge)
        .unwrap_or_else(|| i18n.t("shell.sign_in_required").to_string());
    format!(
        "{who}  {}: {plan}  {}: {:?}",
        i18n.t("shell.plan"),
        i18n.t("shell.theme"),
        session.theme
    )
}
