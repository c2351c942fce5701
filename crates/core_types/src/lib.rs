use std::collections::BTreeSet;
use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type UserId = String;
pub type NoteSnapshotStream =
    Pin<Box<dyn Stream<Item = Result<Vec<Note>, StoreError>> + Send + 'static>>;

pub const UNTITLED_NOTE_TITLE: &str = "Untitled Note";
const PREVIEW_CHARS: usize = 150;

/// Current time at the precision the stores persist (microseconds).
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UiLanguage {
    ZhCn,
    EnUs,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    System,
}

impl Theme {
    pub fn toggle(self) -> Self {
        match self {
            Theme::Dark => Theme::Light,
            Theme::Light | Theme::System => Theme::Dark,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    #[default]
    Free,
    Premium,
}

impl Plan {
    pub fn is_premium(self) -> bool {
        matches!(self, Plan::Premium)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NoteId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Note {
    pub id: NoteId,
    pub title: String,
    /// HTML rich text.
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub pinned: bool,
    pub owner_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl Note {
    pub fn from_draft(id: NoteId, draft: NoteDraft) -> Self {
        Self {
            id,
            title: draft.title,
            content: draft.content,
            created_at: draft.created_at,
            updated_at: draft.updated_at,
            pinned: draft.pinned,
            owner_id: draft.owner_id,
            category: draft.category,
            tags: draft.tags,
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    /// Tag set with `tag` inserted. Adding a present tag changes nothing.
    pub fn with_tag(&self, tag: &str) -> BTreeSet<String> {
        let mut tags = self.tags.clone();
        tags.insert(tag.to_string());
        tags
    }

    pub fn without_tag(&self, tag: &str) -> BTreeSet<String> {
        let mut tags = self.tags.clone();
        tags.remove(tag);
        tags
    }

    pub fn matches_text(&self, query: &str) -> bool {
        let needle = query.to_lowercase();
        self.title.to_lowercase().contains(&needle) || self.content.to_lowercase().contains(&needle)
    }

    pub fn display_title(&self) -> &str {
        if self.title.trim().is_empty() {
            "Untitled"
        } else {
            &self.title
        }
    }

    /// Plain-text excerpt of the content for list rendering.
    pub fn preview(&self) -> String {
        let mut plain = String::with_capacity(self.content.len());
        let mut in_tag = false;
        for ch in self.content.chars() {
            match ch {
                '<' => in_tag = true,
                '>' if in_tag => in_tag = false,
                _ if !in_tag => plain.push(ch),
                _ => {}
            }
        }

        if plain.chars().count() > PREVIEW_CHARS {
            let mut truncated: String = plain.chars().take(PREVIEW_CHARS).collect();
            truncated.push_str("...");
            truncated
        } else {
            plain
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoteDraft {
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub pinned: bool,
    pub owner_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl NoteDraft {
    pub fn blank(owner_id: impl Into<UserId>, category: impl Into<String>) -> Self {
        let now = now();
        Self {
            title: UNTITLED_NOTE_TITLE.to_string(),
            content: String::new(),
            created_at: now,
            updated_at: now,
            pinned: false,
            owner_id: owner_id.into(),
            category: Some(category.into()),
            tags: BTreeSet::new(),
        }
    }
}

/// Partial field set for an update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pinned: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<BTreeSet<String>>,
}

impl NotePatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Self::default()
        }
    }

    pub fn content(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn pinned(pinned: bool) -> Self {
        Self {
            pinned: Some(pinned),
            ..Self::default()
        }
    }

    pub fn category(category: impl Into<String>) -> Self {
        Self {
            category: Some(category.into()),
            ..Self::default()
        }
    }

    pub fn tags(tags: BTreeSet<String>) -> Self {
        Self {
            tags: Some(tags),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.content.is_none()
            && self.pinned.is_none()
            && self.category.is_none()
            && self.tags.is_none()
    }

    /// Coalesces a later patch into this one; fields set by `later` win.
    pub fn merge(&mut self, later: NotePatch) {
        if later.title.is_some() {
            self.title = later.title;
        }
        if later.content.is_some() {
            self.content = later.content;
        }
        if later.pinned.is_some() {
            self.pinned = later.pinned;
        }
        if later.category.is_some() {
            self.category = later.category;
        }
        if later.tags.is_some() {
            self.tags = later.tags;
        }
    }

    pub fn apply_to(&self, note: &mut Note) {
        if let Some(title) = &self.title {
            note.title = title.clone();
        }
        if let Some(content) = &self.content {
            note.content = content.clone();
        }
        if let Some(pinned) = self.pinned {
            note.pinned = pinned;
        }
        if let Some(category) = &self.category {
            note.category = Some(category.clone());
        }
        if let Some(tags) = &self.tags {
            note.tags = tags.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QueryOrder {
    /// Server-side pinned-then-recency order; needs a composite index.
    PinnedThenRecent,
    /// Owner predicate only.
    Unordered,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NoteQuery {
    pub owner_id: UserId,
    pub order: QueryOrder,
}

impl NoteQuery {
    pub fn ordered(owner_id: impl Into<UserId>) -> Self {
        Self {
            owner_id: owner_id.into(),
            order: QueryOrder::PinnedThenRecent,
        }
    }

    pub fn owner_only(owner_id: impl Into<UserId>) -> Self {
        Self {
            owner_id: owner_id.into(),
            order: QueryOrder::Unordered,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("note `{0}` not found")]
    NotFound(NoteId),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_missing_index(&self) -> bool {
        matches!(self, StoreError::FailedPrecondition(message) if message.to_lowercase().contains("index"))
    }
}

/// Remote document store holding every user's notes.
#[async_trait]
pub trait NoteStore: Send + Sync {
    /// Live note-set snapshots for one owner, first item is the current set.
    async fn subscribe(&self, query: NoteQuery) -> Result<NoteSnapshotStream, StoreError>;
    async fn query(&self, query: NoteQuery) -> Result<Vec<Note>, StoreError>;
    async fn create(&self, draft: NoteDraft) -> Result<NoteId, StoreError>;
    async fn update(
        &self,
        id: &NoteId,
        patch: NotePatch,
        stamped_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    async fn delete(&self, id: &NoteId) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuthUser {
    pub uid: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl AuthUser {
    pub fn display_label(&self) -> String {
        if let Some(name) = self.display_name.as_deref().filter(|name| !name.is_empty()) {
            return name.to_string();
        }
        match self.email.as_deref().and_then(|email| email.split('@').next()) {
            Some(local) if !local.is_empty() => local.to_string(),
            _ => "User".to_string(),
        }
    }

    pub fn initial(&self) -> char {
        self.display_name
            .as_deref()
            .or(self.email.as_deref())
            .and_then(|value| value.chars().next())
            .map(|ch| ch.to_ascii_uppercase())
            .unwrap_or('U')
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FederatedProvider {
    Google,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid email address `{0}`")]
    InvalidEmail(String),
    #[error("password must be at least {min} characters")]
    WeakPassword { min: usize },
    #[error("an account already exists for `{0}`")]
    AccountExists(String),
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("sign-in provider {0:?} is not supported")]
    Unsupported(FederatedProvider),
    #[error("auth backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn current_user(&self) -> Option<AuthUser>;
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthUser, AuthError>;
    async fn sign_up(&self, email: &str, password: &str) -> Result<AuthUser, AuthError>;
    async fn sign_out(&self) -> Result<(), AuthError>;
    async fn sign_in_federated(&self, provider: FederatedProvider) -> Result<AuthUser, AuthError>;
}

/// Per-session state handed to the sync manager and the presentation layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionContext {
    #[serde(default)]
    pub user: Option<AuthUser>,
    #[serde(default)]
    pub theme: Theme,
    #[serde(default)]
    pub plan: Plan,
}

impl SessionContext {
    pub fn signed_in(user: AuthUser) -> Self {
        Self {
            user: Some(user),
            ..Self::default()
        }
    }

    pub fn owner_id(&self) -> Option<&str> {
        self.user.as_ref().map(|user| user.uid.as_str())
    }
}
