use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use core_types::{
    Note, NoteDraft, NoteId, NotePatch, NoteQuery, NoteSnapshotStream, NoteStore,
    SessionContext, StoreError, UserId, now,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::debounce::Debouncer;
use crate::view::{
    ALL_CATEGORIES, ViewFilter, apply_filter, collect_categories, collect_tags, reselect_active,
    search_notes, sort_notes,
};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(750);
pub const DEFAULT_CATEGORY: &str = "Uncategorized";
const NOTIFICATION_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub debounce: Duration,
    pub default_category: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            default_category: DEFAULT_CATEGORY.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no user is signed in")]
    NotSignedIn,
    #[error("note `{0}` not found")]
    NoteNotFound(NoteId),
    #[error("tag must not be empty")]
    EmptyTag,
    #[error("category must not be empty")]
    EmptyCategory,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKey {
    NoteCreated,
    NoteDeleted,
    TagAdded,
    TagRemoved,
    CreateFailed,
    UpdateFailed,
    DeleteFailed,
    TagFailed,
    SearchFailed,
    SyncFailed,
}

impl NotificationKey {
    /// Message catalogue key.
    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKey::NoteCreated => "notify.note_created",
            NotificationKey::NoteDeleted => "notify.note_deleted",
            NotificationKey::TagAdded => "notify.tag_added",
            NotificationKey::TagRemoved => "notify.tag_removed",
            NotificationKey::CreateFailed => "notify.create_failed",
            NotificationKey::UpdateFailed => "notify.update_failed",
            NotificationKey::DeleteFailed => "notify.delete_failed",
            NotificationKey::TagFailed => "notify.tag_failed",
            NotificationKey::SearchFailed => "notify.search_failed",
            NotificationKey::SyncFailed => "notify.sync_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Notification {
    pub level: NotificationLevel,
    pub key: NotificationKey,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchResults {
    pub query: String,
    pub notes: Vec<Note>,
}

/// Everything the presentation layer renders.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoteView {
    /// Sorted notes that pass the category and tag filters.
    pub notes: Vec<Note>,
    pub active: Option<Note>,
    pub tags: Vec<String>,
    pub categories: Vec<String>,
    pub filter: ViewFilter,
    pub search: Option<SearchResults>,
    pub loading: bool,
    pub error: Option<String>,
}

impl NoteView {
    pub fn displayed_notes(&self) -> &[Note] {
        match &self.search {
            Some(results) => &results.notes,
            None => &self.notes,
        }
    }

    pub fn active_id(&self) -> Option<&NoteId> {
        self.active.as_ref().map(|note| &note.id)
    }

    pub fn pinned(&self) -> impl Iterator<Item = &Note> {
        self.displayed_notes().iter().filter(|note| note.pinned)
    }

    pub fn unpinned(&self) -> impl Iterator<Item = &Note> {
        self.displayed_notes().iter().filter(|note| !note.pinned)
    }
}

/// A write sent to the store whose effect no snapshot has shown yet.
struct Unconfirmed {
    patch: NotePatch,
    stamped_at: DateTime<Utc>,
}

#[derive(Default)]
struct SyncState {
    /// Last snapshot delivered by the store.
    known: Vec<Note>,
    /// Created here, not yet seen in a snapshot.
    created: HashMap<NoteId, Note>,
    /// Deleted here, still present in the last snapshot.
    deleted: HashSet<NoteId>,
    /// Debounced edits not yet written.
    pending: HashMap<NoteId, NotePatch>,
    /// Kept until a snapshot carries `updated_at >= stamped_at`; a failed
    /// write stays here.
    unconfirmed: HashMap<NoteId, Unconfirmed>,
    custom_categories: BTreeSet<String>,
    active_id: Option<NoteId>,
    generation: u64,
    view: NoteView,
}

impl SyncState {
    fn full_set(&self) -> Vec<Note> {
        let mut notes: Vec<Note> = self
            .known
            .iter()
            .filter(|note| !self.deleted.contains(&note.id))
            .map(|note| self.settled(note))
            .collect();
        for (id, note) in &self.created {
            if !self.deleted.contains(id) && !notes.iter().any(|known| &known.id == id) {
                notes.push(self.settled(note));
            }
        }
        sort_notes(&mut notes);
        notes
    }

    fn find(&self, id: &NoteId) -> Option<Note> {
        if self.deleted.contains(id) {
            return None;
        }
        self.known
            .iter()
            .find(|note| &note.id == id)
            .or_else(|| self.created.get(id))
            .map(|note| self.overlaid(&self.settled(note)))
    }

    fn settled(&self, note: &Note) -> Note {
        let mut note = note.clone();
        if let Some(edit) = self.unconfirmed.get(&note.id) {
            edit.patch.apply_to(&mut note);
            note.updated_at = note.updated_at.max(edit.stamped_at);
        }
        note
    }

    fn overlaid(&self, note: &Note) -> Note {
        let mut note = note.clone();
        if let Some(patch) = self.pending.get(&note.id) {
            patch.apply_to(&mut note);
        }
        note
    }

    fn apply_snapshot(&mut self, notes: Vec<Note>) {
        let ids: HashSet<NoteId> = notes.iter().map(|note| note.id.clone()).collect();
        self.created.retain(|id, _| !ids.contains(id));
        self.deleted.retain(|id| ids.contains(id));
        let created = &self.created;
        self.unconfirmed
            .retain(|id, edit| match notes.iter().find(|note| &note.id == id) {
                Some(note) => note.updated_at < edit.stamped_at,
                None => created.contains_key(id),
            });
        self.known = notes;
    }

    fn record_unconfirmed(&mut self, id: &NoteId, patch: NotePatch, stamped_at: DateTime<Utc>) {
        match self.unconfirmed.get_mut(id) {
            Some(edit) => {
                edit.patch.merge(patch);
                edit.stamped_at = edit.stamped_at.max(stamped_at);
            }
            None => {
                self.unconfirmed
                    .insert(id.clone(), Unconfirmed { patch, stamped_at });
            }
        }
    }

    fn recompute(&mut self, default_category: &str) {
        let full = self.full_set();
        self.view.tags = collect_tags(&full);
        self.view.categories =
            collect_categories(&full, &self.custom_categories, default_category);
        self.view.notes = apply_filter(&full, &self.view.filter);

        let next = reselect_active(self.active_id.as_ref(), &self.view.notes)
            .map(|note| self.overlaid(note));
        self.active_id = next.as_ref().map(|note| note.id.clone());
        self.view.active = next;
    }

    fn activate(&mut self, id: &NoteId) -> bool {
        match self.find(id) {
            Some(note) => {
                self.active_id = Some(id.clone());
                self.view.active = Some(note);
                true
            }
            None => false,
        }
    }

    fn refresh_active(&mut self) {
        if let Some(id) = self.active_id.clone() {
            if let Some(note) = self.find(&id) {
                self.view.active = Some(note);
            }
        }
    }
}

struct Inner {
    store: Arc<dyn NoteStore>,
    session: SessionContext,
    config: SyncConfig,
    state: Mutex<SyncState>,
    view_tx: watch::Sender<NoteView>,
    notify_tx: broadcast::Sender<Notification>,
    debouncer: Debouncer<NoteId>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().take() {
            handle.abort();
        }
    }
}

/// Keeps a sorted, filtered view of one user's notes in step with the
/// store's live snapshots and tracks the note open for editing.
#[derive(Clone)]
pub struct NoteSyncManager {
    inner: Arc<Inner>,
}

impl NoteSyncManager {
    pub fn new(store: Arc<dyn NoteStore>, session: SessionContext, config: SyncConfig) -> Self {
        let (view_tx, _) = watch::channel(NoteView::default());
        let (notify_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let debouncer = Debouncer::new(config.debounce);
        Self {
            inner: Arc::new(Inner {
                store,
                session,
                config,
                state: Mutex::new(SyncState::default()),
                view_tx,
                notify_tx,
                debouncer,
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.inner.session
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn view(&self) -> NoteView {
        self.inner.state.lock().view.clone()
    }

    pub fn watch(&self) -> watch::Receiver<NoteView> {
        self.inner.view_tx.subscribe()
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notify_tx.subscribe()
    }

    /// Opens the live subscription for the session's user. Without a user the
    /// view is simply empty.
    pub async fn start(&self) -> Result<(), SyncError> {
        let generation = self.inner.reset();
        let Some(owner) = self.inner.session.owner_id().map(str::to_string) else {
            debug!("no signed-in user, note view stays empty");
            return Ok(());
        };

        {
            let mut state = self.inner.state.lock();
            state.view.loading = true;
            self.inner.publish(&state);
        }

        let (stream, fallback) = match self.inner.open_stream(&owner).await {
            Ok(opened) => opened,
            Err(err) => {
                self.inner.fail_subscription(generation, &err);
                return Err(err.into());
            }
        };

        info!(owner = %owner, fallback, "note subscription opened");
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(listen(weak, generation, owner, stream, fallback));
        if let Some(previous) = self.inner.listener.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Stops snapshot delivery. Batches already in flight are discarded.
    pub fn stop(&self) {
        self.inner.state.lock().generation += 1;
        if let Some(handle) = self.inner.listener.lock().take() {
            handle.abort();
            debug!("note subscription stopped");
        }
    }

    /// Writes every pending edit, then stops the subscription.
    pub async fn shutdown(&self) {
        let mut ids: HashSet<NoteId> = self.inner.debouncer.cancel_all().into_iter().collect();
        ids.extend(self.inner.state.lock().pending.keys().cloned());
        for id in ids {
            let _ = self.inner.flush(&id).await;
        }
        self.stop();
    }

    pub fn select_note(&self, id: &NoteId) -> Result<(), SyncError> {
        let mut state = self.inner.state.lock();
        if !state.activate(id) {
            // Search hits may sit outside the filtered view.
            let hit = state
                .view
                .search
                .as_ref()
                .and_then(|results| results.notes.iter().find(|note| &note.id == id))
                .cloned();
            let Some(hit) = hit else {
                return Err(SyncError::NoteNotFound(id.clone()));
            };
            let note = state.overlaid(&hit);
            state.active_id = Some(note.id.clone());
            state.view.active = Some(note);
        }
        self.inner.publish(&state);
        Ok(())
    }

    /// Creates a blank note in the selected category (or the default one)
    /// and makes it active as soon as the store assigns its id.
    pub async fn create_note(&self) -> Result<Note, SyncError> {
        let owner = self.inner.owner()?;
        let category = {
            let state = self.inner.state.lock();
            if state.view.filter.category == ALL_CATEGORIES {
                self.inner.config.default_category.clone()
            } else {
                state.view.filter.category.clone()
            }
        };
        let draft = NoteDraft::blank(owner, category);

        let id = match self.inner.store.create(draft.clone()).await {
            Ok(id) => id,
            Err(err) => {
                error!(error = %err, "failed to create note");
                self.inner
                    .notify_error(NotificationKey::CreateFailed, err.to_string());
                return Err(err.into());
            }
        };

        let note = Note::from_draft(id.clone(), draft);
        {
            let mut state = self.inner.state.lock();
            if !state.known.iter().any(|known| known.id == id) {
                state.created.insert(id.clone(), note.clone());
            }
            state.recompute(&self.inner.config.default_category);
            state.activate(&id);
            self.inner.publish(&state);
        }
        info!(note_id = %id, "note created");
        self.inner
            .notify_info(NotificationKey::NoteCreated, String::new());
        Ok(note)
    }

    /// Debounced partial update. Edits to the same note inside the window are
    /// coalesced into one write; the active copy shows them immediately.
    pub fn update_note(&self, id: &NoteId, patch: NotePatch) -> Result<(), SyncError> {
        if patch.is_empty() {
            return Ok(());
        }
        {
            let mut state = self.inner.state.lock();
            if state.find(id).is_none() {
                return Err(SyncError::NoteNotFound(id.clone()));
            }
            state.pending.entry(id.clone()).or_default().merge(patch);
            state.refresh_active();
            self.inner.publish(&state);
        }
        self.inner.schedule_flush(id);
        Ok(())
    }

    /// Writes the pending edit for `id` now instead of waiting for the window.
    pub async fn save_now(&self, id: &NoteId) -> Result<(), SyncError> {
        self.inner.debouncer.cancel(id);
        self.inner.flush(id).await
    }

    pub fn has_pending_edit(&self, id: &NoteId) -> bool {
        self.inner.state.lock().pending.contains_key(id)
    }

    /// Appends a transcribed paragraph to the note content.
    pub fn append_transcript(&self, id: &NoteId, text: &str) -> Result<(), SyncError> {
        let content = {
            let state = self.inner.state.lock();
            let note = state
                .find(id)
                .ok_or_else(|| SyncError::NoteNotFound(id.clone()))?;
            format!("{}<p>{}</p>", note.content, escape_html(text))
        };
        self.update_note(id, NotePatch::content(content))
    }

    pub async fn set_pinned(&self, id: &NoteId, pinned: bool) -> Result<(), SyncError> {
        self.inner.require(id)?;
        self.inner
            .write_now(id, NotePatch::pinned(pinned), NotificationKey::UpdateFailed)
            .await
    }

    pub async fn toggle_pin(&self, id: &NoteId) -> Result<(), SyncError> {
        let note = self.inner.require(id)?;
        self.set_pinned(id, !note.pinned).await
    }

    pub async fn set_category(&self, id: &NoteId, category: &str) -> Result<(), SyncError> {
        let category = category.trim();
        if category.is_empty() {
            return Err(SyncError::EmptyCategory);
        }
        self.inner.require(id)?;
        self.inner
            .write_now(id, NotePatch::category(category), NotificationKey::UpdateFailed)
            .await
    }

    pub async fn add_tag(&self, id: &NoteId, tag: &str) -> Result<(), SyncError> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(SyncError::EmptyTag);
        }
        let note = self.inner.require_for_tag(id)?;
        self.inner
            .write_now(id, NotePatch::tags(note.with_tag(tag)), NotificationKey::TagFailed)
            .await?;
        self.inner
            .notify_info(NotificationKey::TagAdded, tag.to_string());
        Ok(())
    }

    pub async fn remove_tag(&self, id: &NoteId, tag: &str) -> Result<(), SyncError> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(SyncError::EmptyTag);
        }
        let note = self.inner.require_for_tag(id)?;
        self.inner
            .write_now(
                id,
                NotePatch::tags(note.without_tag(tag)),
                NotificationKey::TagFailed,
            )
            .await?;
        self.inner
            .notify_info(NotificationKey::TagRemoved, tag.to_string());
        Ok(())
    }

    /// Deletes the note. When it was active, the first note of the current
    /// view becomes active instead.
    pub async fn delete_note(&self, id: &NoteId) -> Result<(), SyncError> {
        self.inner.debouncer.cancel(id);
        if let Err(err) = self.inner.store.delete(id).await {
            error!(note_id = %id, error = %err, "failed to delete note");
            if self.has_pending_edit(id) {
                self.inner.schedule_flush(id);
            }
            self.inner
                .notify_error(NotificationKey::DeleteFailed, err.to_string());
            return Err(err.into());
        }

        {
            let mut state = self.inner.state.lock();
            state.deleted.insert(id.clone());
            state.created.remove(id);
            state.pending.remove(id);
            state.unconfirmed.remove(id);
            if state.active_id.as_ref() == Some(id) {
                state.active_id = None;
            }
            if let Some(results) = state.view.search.as_mut() {
                results.notes.retain(|note| &note.id != id);
            }
            state.recompute(&self.inner.config.default_category);
            self.inner.publish(&state);
        }
        info!(note_id = %id, "note deleted");
        self.inner
            .notify_info(NotificationKey::NoteDeleted, String::new());
        Ok(())
    }

    pub fn toggle_tag_filter(&self, tag: &str) {
        self.inner.update_filter(|filter| filter.toggle_tag(tag));
    }

    pub fn clear_tag_filters(&self) {
        self.inner.update_filter(|filter| filter.tags.clear());
    }

    pub fn select_category(&self, category: &str) -> Result<(), SyncError> {
        let category = category.trim();
        if category.is_empty() {
            return Err(SyncError::EmptyCategory);
        }
        self.inner
            .update_filter(|filter| filter.category = category.to_string());
        Ok(())
    }

    pub fn add_category(&self, category: &str) -> Result<(), SyncError> {
        let category = category.trim();
        if category.is_empty() {
            return Err(SyncError::EmptyCategory);
        }
        let mut state = self.inner.state.lock();
        state.custom_categories.insert(category.to_string());
        state.recompute(&self.inner.config.default_category);
        self.inner.publish(&state);
        Ok(())
    }

    /// One-shot search over the owner's full note set. Category and tag
    /// filters do not apply. An empty query clears the search.
    pub async fn search(&self, query: &str) -> Result<Vec<Note>, SyncError> {
        if query.trim().is_empty() {
            self.clear_search();
            return Ok(self.view().notes);
        }
        let Some(owner) = self.inner.session.owner_id().map(str::to_string) else {
            return Ok(self.view().notes);
        };

        let all = match self.inner.store.query(NoteQuery::owner_only(owner)).await {
            Ok(all) => all,
            Err(err) => {
                error!(error = %err, "note search failed");
                self.inner
                    .notify_error(NotificationKey::SearchFailed, err.to_string());
                return Err(err.into());
            }
        };

        let mut state = self.inner.state.lock();
        let visible: Vec<Note> = all
            .into_iter()
            .filter(|note| !state.deleted.contains(&note.id))
            .collect();
        let hits = search_notes(visible, query);
        debug!(query, hits = hits.len(), "note search finished");
        state.view.search = Some(SearchResults {
            query: query.to_string(),
            notes: hits.clone(),
        });
        self.inner.publish(&state);
        Ok(hits)
    }

    pub fn clear_search(&self) {
        let mut state = self.inner.state.lock();
        if state.view.search.take().is_some() {
            self.inner.publish(&state);
        }
    }
}

impl Inner {
    fn owner(&self) -> Result<UserId, SyncError> {
        self.session
            .owner_id()
            .map(str::to_string)
            .ok_or(SyncError::NotSignedIn)
    }

    fn require(&self, id: &NoteId) -> Result<Note, SyncError> {
        self.state
            .lock()
            .find(id)
            .ok_or_else(|| SyncError::NoteNotFound(id.clone()))
    }

    fn require_for_tag(&self, id: &NoteId) -> Result<Note, SyncError> {
        self.require(id).inspect_err(|err| {
            self.notify_error(NotificationKey::TagFailed, err.to_string());
        })
    }

    fn publish(&self, state: &SyncState) {
        self.view_tx.send_replace(state.view.clone());
    }

    fn notify_info(&self, key: NotificationKey, detail: String) {
        let _ = self.notify_tx.send(Notification {
            level: NotificationLevel::Info,
            key,
            detail,
        });
    }

    fn notify_error(&self, key: NotificationKey, detail: String) {
        let _ = self.notify_tx.send(Notification {
            level: NotificationLevel::Error,
            key,
            detail,
        });
    }

    /// Drops the current listener and local view; returns the new generation.
    fn reset(&self) -> u64 {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
        let mut state = self.state.lock();
        let custom_categories = std::mem::take(&mut state.custom_categories);
        let generation = state.generation + 1;
        *state = SyncState {
            custom_categories,
            generation,
            view: NoteView {
                filter: state.view.filter.clone(),
                ..NoteView::default()
            },
            ..SyncState::default()
        };
        state.recompute(&self.config.default_category);
        self.publish(&state);
        generation
    }

    async fn open_stream(&self, owner: &str) -> Result<(NoteSnapshotStream, bool), StoreError> {
        match self.store.subscribe(NoteQuery::ordered(owner)).await {
            Ok(stream) => Ok((stream, false)),
            Err(err) if err.is_missing_index() => {
                warn!(error = %err, "composite index missing, sorting notes locally");
                let stream = self.store.subscribe(NoteQuery::owner_only(owner)).await?;
                Ok((stream, true))
            }
            Err(err) => Err(err),
        }
    }

    fn apply_snapshot(&self, generation: u64, notes: Vec<Note>) {
        let mut state = self.state.lock();
        if state.generation != generation {
            debug!("discarding snapshot from a stopped subscription");
            return;
        }
        debug!(count = notes.len(), "note snapshot received");
        state.apply_snapshot(notes);
        state.recompute(&self.config.default_category);
        state.view.loading = false;
        state.view.error = None;
        self.publish(&state);
    }

    fn fail_subscription(&self, generation: u64, err: &StoreError) {
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                return;
            }
            state.view.loading = false;
            state.view.error = Some(format!("Failed to fetch notes: {err}"));
            self.publish(&state);
        }
        error!(error = %err, "note subscription failed");
        self.notify_error(NotificationKey::SyncFailed, err.to_string());
    }

    fn update_filter(&self, change: impl FnOnce(&mut ViewFilter)) {
        let mut state = self.state.lock();
        change(&mut state.view.filter);
        state.recompute(&self.config.default_category);
        self.publish(&state);
    }

    fn schedule_flush(self: &Arc<Self>, id: &NoteId) {
        let inner = Arc::clone(self);
        let key = id.clone();
        self.debouncer.schedule(id.clone(), async move {
            let _ = inner.flush(&key).await;
        });
    }

    async fn flush(&self, id: &NoteId) -> Result<(), SyncError> {
        let pending = self.state.lock().pending.remove(id);
        let Some(patch) = pending else {
            return Ok(());
        };
        let stamped_at = now();
        {
            // The edit stays applied locally whether or not the write succeeds.
            let mut state = self.state.lock();
            state.record_unconfirmed(id, patch.clone(), stamped_at);
            state.recompute(&self.config.default_category);
            self.publish(&state);
        }

        match self.store.update(id, patch, stamped_at).await {
            Ok(()) => {
                debug!(note_id = %id, "debounced edit written");
                Ok(())
            }
            Err(err) => {
                error!(note_id = %id, error = %err, "failed to write note edit");
                self.notify_error(NotificationKey::UpdateFailed, err.to_string());
                Err(err.into())
            }
        }
    }

    async fn write_now(
        &self,
        id: &NoteId,
        patch: NotePatch,
        failure: NotificationKey,
    ) -> Result<(), SyncError> {
        let stamped_at = now();
        if let Err(err) = self.store.update(id, patch.clone(), stamped_at).await {
            error!(note_id = %id, error = %err, "failed to update note");
            self.notify_error(failure, err.to_string());
            return Err(err.into());
        }

        let mut state = self.state.lock();
        state.record_unconfirmed(id, patch, stamped_at);
        state.recompute(&self.config.default_category);
        self.publish(&state);
        Ok(())
    }
}

async fn listen(
    weak: Weak<Inner>,
    generation: u64,
    owner: UserId,
    mut stream: NoteSnapshotStream,
    mut fallback: bool,
) {
    while let Some(item) = stream.next().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        match item {
            Ok(notes) => inner.apply_snapshot(generation, notes),
            Err(err) if err.is_missing_index() && !fallback => {
                warn!(error = %err, "composite index missing, sorting notes locally");
                fallback = true;
                match inner.store.subscribe(NoteQuery::owner_only(owner.as_str())).await {
                    Ok(next) => stream = next,
                    Err(err) => {
                        inner.fail_subscription(generation, &err);
                        return;
                    }
                }
            }
            Err(err) => {
                inner.fail_subscription(generation, &err);
                return;
            }
        }
    }
    debug!(owner = %owner, "note snapshot stream ended");
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use chrono::TimeZone;
    use core_types::AuthUser;

    use super::*;
    use crate::testing::FakeStore;

    fn session() -> SessionContext {
        SessionContext::signed_in(AuthUser {
            uid: "u1".to_string(),
            email: Some("ada@example.com".to_string()),
            display_name: None,
        })
    }

    fn manager(store: &Arc<FakeStore>) -> NoteSyncManager {
        NoteSyncManager::new(store.clone(), session(), SyncConfig::default())
    }

    fn seeded(id: &str, owner: &str, minutes: i64, tags: &[&str]) -> Note {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
            + chrono::Duration::minutes(minutes);
        let mut draft = NoteDraft::blank(owner, DEFAULT_CATEGORY);
        draft.title = format!("note {id}");
        draft.created_at = at;
        draft.updated_at = at;
        draft.tags = tags.iter().map(|tag| tag.to_string()).collect();
        Note::from_draft(NoteId::from(id), draft)
    }

    fn ids(notes: &[Note]) -> Vec<&str> {
        notes.iter().map(|note| note.id.as_str()).collect()
    }

    async fn wait_until(
        manager: &NoteSyncManager,
        predicate: impl Fn(&NoteView) -> bool,
    ) -> NoteView {
        let mut rx = manager.watch();
        let view = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|view| predicate(view)))
            .await
            .expect("view condition timed out")
            .expect("view channel closed");
        view.clone()
    }

    async fn started(store: &Arc<FakeStore>) -> NoteSyncManager {
        let manager = manager(store);
        manager.start().await.expect("start");
        wait_until(&manager, |view| !view.loading).await;
        manager
    }

    #[tokio::test(start_paused = true)]
    async fn start_without_user_yields_empty_view() {
        let store = FakeStore::new();
        store.seed(seeded("n1", "u1", 0, &[]));
        let manager = NoteSyncManager::new(
            store.clone(),
            SessionContext::default(),
            SyncConfig::default(),
        );

        manager.start().await.expect("start");
        let view = manager.view();
        assert!(view.notes.is_empty());
        assert!(view.active.is_none());
        assert!(!view.loading);
        assert!(view.error.is_none());
        assert_eq!(store.subscribe_calls.load(Ordering::SeqCst), 0);
        assert!(matches!(manager.create_note().await, Err(SyncError::NotSignedIn)));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_back_to_owner_query_when_index_is_missing() {
        let store = FakeStore::new();
        store.seed(seeded("n1", "u1", 1, &[]));
        let mut pinned = seeded("n2", "u1", 0, &[]);
        pinned.pinned = true;
        store.seed(pinned);
        store.seed(seeded("foreign", "u2", 5, &[]));

        let manager = started(&store).await;
        let view = wait_until(&manager, |view| view.notes.len() == 2).await;
        assert_eq!(ids(&view.notes), ["n2", "n1"]);
        assert!(view.error.is_none());
        assert_eq!(view.active_id().map(NoteId::as_str), Some("n2"));
        assert_eq!(store.subscribe_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ordered_subscription_is_kept_when_index_exists() {
        let store = FakeStore::with_composite_index();
        store.seed(seeded("n1", "u1", 1, &[]));

        let manager = started(&store).await;
        assert_eq!(ids(&manager.view().notes), ["n1"]);
        assert_eq!(store.subscribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn subscription_error_is_sticky_and_not_retried() {
        let store = FakeStore::new();
        *store.fail_subscribe.lock() = Some(StoreError::Transport("offline".to_string()));
        let manager = manager(&store);
        let mut notifications = manager.notifications();

        let err = manager.start().await.expect_err("must fail");
        assert!(matches!(err, SyncError::Store(StoreError::Transport(_))));

        let view = manager.view();
        assert!(!view.loading);
        assert!(view.error.as_deref().is_some_and(|msg| msg.contains("offline")));
        let notification = notifications.recv().await.expect("notification");
        assert_eq!(notification.key, NotificationKey::SyncFailed);
        assert_eq!(notification.level, NotificationLevel::Error);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(store.subscribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn create_pin_create_delete_keeps_active_note_consistent() {
        let store = FakeStore::new();
        let manager = started(&store).await;

        let n1 = manager.create_note().await.expect("create n1");
        assert_eq!(n1.title, core_types::UNTITLED_NOTE_TITLE);
        assert!(n1.content.is_empty());
        assert!(!n1.pinned);
        assert_eq!(manager.view().active_id(), Some(&n1.id));

        manager.set_pinned(&n1.id, true).await.expect("pin");
        let n2 = manager.create_note().await.expect("create n2");
        let view = manager.view();
        assert_eq!(view.active_id(), Some(&n2.id));
        assert_eq!(ids(&view.notes), [n1.id.as_str(), n2.id.as_str()]);
        assert!(view.notes[0].pinned);

        manager.delete_note(&n2.id).await.expect("delete");
        let view = manager.view();
        assert_eq!(view.active_id(), Some(&n1.id));
        assert_eq!(ids(&view.notes), [n1.id.as_str()]);

        let view = wait_until(&manager, |view| view.notes.len() == 1 && view.notes[0].pinned).await;
        assert_eq!(view.active_id(), Some(&n1.id));
    }

    #[tokio::test(start_paused = true)]
    async fn realtime_echo_of_created_note_is_not_duplicated() {
        let store = FakeStore::new();
        let manager = started(&store).await;
        let mut notifications = manager.notifications();

        let note = manager.create_note().await.expect("create");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let view = manager.view();
        assert_eq!(ids(&view.notes), [note.id.as_str()]);
        assert_eq!(view.active_id(), Some(&note.id));
        assert_eq!(
            notifications.recv().await.expect("notification").key,
            NotificationKey::NoteCreated
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tag_filter_narrows_view_and_clearing_restores_recency_order() {
        let store = FakeStore::new();
        store.seed(seeded("n1", "u1", 2, &["work"]));
        store.seed(seeded("n2", "u1", 1, &["home"]));
        let manager = started(&store).await;
        wait_until(&manager, |view| view.notes.len() == 2).await;
        assert_eq!(manager.view().tags, ["home", "work"]);

        manager.toggle_tag_filter("work");
        assert_eq!(ids(&manager.view().notes), ["n1"]);

        manager.clear_tag_filters();
        assert_eq!(ids(&manager.view().notes), ["n1", "n2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn active_note_filtered_out_moves_to_first_of_view() {
        let store = FakeStore::new();
        store.seed(seeded("n1", "u1", 1, &["a"]));
        store.seed(seeded("n2", "u1", 2, &["b"]));
        let manager = started(&store).await;
        wait_until(&manager, |view| view.notes.len() == 2).await;

        manager.select_note(&NoteId::from("n1")).expect("select");
        assert_eq!(manager.view().active_id().map(NoteId::as_str), Some("n1"));

        manager.toggle_tag_filter("b");
        assert_eq!(manager.view().active_id().map(NoteId::as_str), Some("n2"));

        manager.toggle_tag_filter("a");
        let view = manager.view();
        assert!(view.notes.is_empty());
        assert!(view.active.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn search_ignores_category_and_tag_filters() {
        let store = FakeStore::new();
        let mut a = seeded("a", "u1", 1, &[]);
        a.title = "Team Meeting".to_string();
        a.category = Some("Work".to_string());
        let mut b = seeded("b", "u1", 2, &[]);
        b.content = "<p>meeting agenda</p>".to_string();
        b.category = Some("Home".to_string());
        store.seed(a);
        store.seed(b);
        store.seed(seeded("c", "u1", 3, &[]));
        let manager = started(&store).await;

        manager.select_category("Work").expect("category");
        manager.toggle_tag_filter("unrelated");
        let hits = manager.search("MEETING").await.expect("search");
        assert_eq!(ids(&hits), ["b", "a"]);
        assert_eq!(ids(manager.view().displayed_notes()), ["b", "a"]);

        manager.clear_search();
        assert!(manager.view().displayed_notes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_edits_coalesce_into_one_write() {
        let store = FakeStore::new();
        store.seed(seeded("n1", "u1", 0, &[]));
        let manager = started(&store).await;
        let id = NoteId::from("n1");

        manager.update_note(&id, NotePatch::title("Draft")).expect("edit");
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager
            .update_note(&id, NotePatch::content("<p>body</p>"))
            .expect("edit");
        manager.update_note(&id, NotePatch::title("Final")).expect("edit");

        let active = manager.view().active.expect("active");
        assert_eq!(active.title, "Final");
        assert_eq!(active.content, "<p>body</p>");
        assert_eq!(store.update_count(), 0);

        tokio::time::sleep(DEFAULT_DEBOUNCE * 2).await;
        let updates = store.updates.lock().clone();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].1.title.as_deref(), Some("Final"));
        assert_eq!(updates[0].1.content.as_deref(), Some("<p>body</p>"));
        assert_eq!(store.get(&id).expect("stored").title, "Final");
        assert!(!manager.has_pending_edit(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn save_now_flushes_pending_edit_immediately() {
        let store = FakeStore::new();
        store.seed(seeded("n1", "u1", 0, &[]));
        let manager = started(&store).await;
        let id = NoteId::from("n1");

        manager.update_note(&id, NotePatch::title("Saved")).expect("edit");
        manager.save_now(&id).await.expect("save");
        assert_eq!(store.update_count(), 1);

        tokio::time::sleep(DEFAULT_DEBOUNCE * 2).await;
        assert_eq!(store.update_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn tag_add_and_remove_are_idempotent_and_bump_updated_at() {
        let store = FakeStore::new();
        let original = seeded("n1", "u1", 0, &["work"]);
        let seeded_at = original.updated_at;
        store.seed(original);
        let manager = started(&store).await;
        let id = NoteId::from("n1");

        manager.add_tag(&id, " work ").await.expect("add");
        let stored = store.get(&id).expect("stored");
        assert_eq!(stored.tags.iter().collect::<Vec<_>>(), ["work"]);
        assert!(stored.updated_at > seeded_at);

        manager.remove_tag(&id, "home").await.expect("remove");
        assert_eq!(store.get(&id).expect("stored").tags.len(), 1);
        assert_eq!(store.update_count(), 2);

        manager.add_tag(&id, "urgent").await.expect("add");
        assert!(manager.view().active.expect("active").has_tag("urgent"));

        assert!(matches!(manager.add_tag(&id, "  ").await, Err(SyncError::EmptyTag)));
        assert_eq!(store.update_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_is_reported_and_local_edit_kept() {
        let store = FakeStore::new();
        store.seed(seeded("n1", "u1", 0, &[]));
        let manager = started(&store).await;
        let mut notifications = manager.notifications();
        let id = NoteId::from("n1");

        store.fail_writes.store(true, Ordering::SeqCst);
        manager.update_note(&id, NotePatch::title("Offline")).expect("edit");
        tokio::time::sleep(DEFAULT_DEBOUNCE * 2).await;

        let notification = notifications.recv().await.expect("notification");
        assert_eq!(notification.key, NotificationKey::UpdateFailed);
        assert_eq!(notification.level, NotificationLevel::Error);
        assert_eq!(manager.view().active.expect("active").title, "Offline");
        assert_eq!(store.get(&id).expect("stored").title, "note n1");

        // A later snapshot for an unrelated change must not undo the edit.
        store.seed(seeded("n2", "u1", -5, &[]));
        let view = wait_until(&manager, |view| view.notes.len() == 2).await;
        assert_eq!(view.active_id(), Some(&id));
        assert_eq!(view.active.expect("active").title, "Offline");
        let n1 = view.notes.iter().find(|note| note.id == id).expect("n1 listed");
        assert_eq!(n1.title, "Offline");

        let err = manager.delete_note(&id).await.expect_err("delete fails");
        assert!(matches!(err, SyncError::Store(StoreError::Transport(_))));
        assert_eq!(ids(&manager.view().notes), ["n1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_edit_follows_later_remote_changes() {
        let store = FakeStore::new();
        store.seed(seeded("n1", "u1", 0, &[]));
        let manager = started(&store).await;
        let id = NoteId::from("n1");

        manager.update_note(&id, NotePatch::title("Local")).expect("edit");
        manager.save_now(&id).await.expect("save");
        wait_until(&manager, |view| {
            view.notes.first().is_some_and(|note| note.title == "Local")
        })
        .await;

        // Once a snapshot has shown the write, the store is authoritative again.
        store
            .update(&id, NotePatch::title("Remote"), now())
            .await
            .expect("remote edit");
        let view = wait_until(&manager, |view| {
            view.notes.first().is_some_and(|note| note.title == "Remote")
        })
        .await;
        assert_eq!(view.active.expect("active").title, "Remote");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_create_is_reported_and_view_unchanged() {
        let store = FakeStore::new();
        store.seed(seeded("n1", "u1", 0, &[]));
        let manager = started(&store).await;
        let before = manager.view();
        let mut notifications = manager.notifications();

        store.fail_writes.store(true, Ordering::SeqCst);
        let err = manager.create_note().await.expect_err("create fails");
        assert!(matches!(err, SyncError::Store(StoreError::Transport(_))));

        let notification = notifications.recv().await.expect("notification");
        assert_eq!(notification.key, NotificationKey::CreateFailed);
        assert_eq!(notification.level, NotificationLevel::Error);
        assert_eq!(manager.view(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_search_is_reported_and_view_unchanged() {
        let store = FakeStore::new();
        store.seed(seeded("n1", "u1", 0, &[]));
        let manager = started(&store).await;
        let before = manager.view();
        let mut notifications = manager.notifications();

        store.fail_queries.store(true, Ordering::SeqCst);
        let err = manager.search("note").await.expect_err("search fails");
        assert!(matches!(err, SyncError::Store(StoreError::Transport(_))));

        let notification = notifications.recv().await.expect("notification");
        assert_eq!(notification.key, NotificationKey::SearchFailed);
        assert_eq!(notification.level, NotificationLevel::Error);
        let view = manager.view();
        assert!(view.search.is_none());
        assert_eq!(view, before);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_subscription_ignores_late_batches() {
        let store = FakeStore::new();
        let manager = started(&store).await;

        manager.stop();
        store.seed(seeded("late", "u1", 0, &[]));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(manager.view().notes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn new_notes_take_selected_category_or_default() {
        let store = FakeStore::new();
        let manager = started(&store).await;

        manager.select_category("Work").expect("select");
        let work = manager.create_note().await.expect("create");
        assert_eq!(work.category.as_deref(), Some("Work"));

        manager.select_category(ALL_CATEGORIES).expect("select");
        let plain = manager.create_note().await.expect("create");
        assert_eq!(plain.category.as_deref(), Some(DEFAULT_CATEGORY));

        manager.add_category("Ideas").expect("add");
        assert_eq!(
            manager.view().categories,
            ["All", "Ideas", "Uncategorized", "Work"]
        );
        assert!(matches!(manager.add_category(" "), Err(SyncError::EmptyCategory)));
    }

    #[tokio::test(start_paused = true)]
    async fn transcript_is_appended_as_escaped_paragraph() {
        let store = FakeStore::new();
        let mut note = seeded("n1", "u1", 0, &[]);
        note.content = "<p>intro</p>".to_string();
        store.seed(note);
        let manager = started(&store).await;
        let id = NoteId::from("n1");

        manager.append_transcript(&id, "a < b").expect("append");
        assert_eq!(
            manager.view().active.expect("active").content,
            "<p>intro</p><p>a &lt; b</p>"
        );
        manager.shutdown().await;
        assert_eq!(
            store.get(&id).expect("stored").content,
            "<p>intro</p><p>a &lt; b</p>"
        );
    }

    #[tokio::test]
    async fn sqlite_store_round_trip_without_composite_index() {
        let store = Arc::new(
            storage_sqlite::SqliteNoteStore::in_memory(storage_sqlite::StoreOptions::default())
                .await
                .expect("store"),
        );
        let config = SyncConfig {
            debounce: Duration::from_millis(20),
            ..SyncConfig::default()
        };
        let manager = NoteSyncManager::new(store.clone(), session(), config);
        manager.start().await.expect("start");
        wait_until(&manager, |view| !view.loading).await;

        let note = manager.create_note().await.expect("create");
        manager
            .update_note(&note.id, NotePatch::title("Shopping"))
            .expect("edit");
        manager.add_tag(&note.id, "home").await.expect("tag");
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stored = store
            .query(NoteQuery::owner_only("u1"))
            .await
            .expect("query");
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].title, "Shopping");
        assert!(stored[0].has_tag("home"));
        let view = wait_until(&manager, |view| {
            view.notes.len() == 1 && view.notes[0].title == "Shopping"
        })
        .await;
        assert_eq!(view.tags, ["home"]);

        manager.delete_note(&note.id).await.expect("delete");
        assert!(manager.view().notes.is_empty());
        assert!(
            store
                .query(NoteQuery::owner_only("u1"))
                .await
                .expect("query")
                .is_empty()
        );
    }
}
