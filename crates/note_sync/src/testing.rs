use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{
    Note, NoteDraft, NoteId, NotePatch, NoteQuery, NoteSnapshotStream, NoteStore, QueryOrder,
    StoreError,
};
use futures::StreamExt;
use futures::channel::mpsc;
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// In-memory store with failure switches for exercising the manager.
pub(crate) struct FakeStore {
    notes: Arc<Mutex<Vec<Note>>>,
    changes: broadcast::Sender<()>,
    next_id: AtomicU64,
    composite_index: bool,
    pub(crate) updates: Mutex<Vec<(NoteId, NotePatch)>>,
    pub(crate) subscribe_calls: AtomicUsize,
    pub(crate) fail_writes: AtomicBool,
    pub(crate) fail_queries: AtomicBool,
    pub(crate) fail_subscribe: Mutex<Option<StoreError>>,
}

impl FakeStore {
    pub(crate) fn new() -> Arc<Self> {
        Self::build(false)
    }

    pub(crate) fn with_composite_index() -> Arc<Self> {
        Self::build(true)
    }

    fn build(composite_index: bool) -> Arc<Self> {
        let (changes, _) = broadcast::channel(64);
        Arc::new(Self {
            notes: Arc::new(Mutex::new(Vec::new())),
            changes,
            next_id: AtomicU64::new(1),
            composite_index,
            updates: Mutex::new(Vec::new()),
            subscribe_calls: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            fail_queries: AtomicBool::new(false),
            fail_subscribe: Mutex::new(None),
        })
    }

    /// Inserts a note directly, as another session would.
    pub(crate) fn seed(&self, note: Note) {
        self.notes.lock().push(note);
        let _ = self.changes.send(());
    }

    pub(crate) fn get(&self, id: &NoteId) -> Option<Note> {
        self.notes.lock().iter().find(|note| &note.id == id).cloned()
    }

    pub(crate) fn update_count(&self) -> usize {
        self.updates.lock().len()
    }

    fn snapshot(&self, owner: &str) -> Vec<Note> {
        snapshot(&self.notes, owner)
    }

    fn check_writes(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("connection reset".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl NoteStore for FakeStore {
    async fn subscribe(&self, query: NoteQuery) -> Result<NoteSnapshotStream, StoreError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.fail_subscribe.lock().clone() {
            return Err(err);
        }
        if query.order == QueryOrder::PinnedThenRecent && !self.composite_index {
            let err = StoreError::FailedPrecondition("The query requires an index".to_string());
            return Ok(futures::stream::iter([Err::<Vec<Note>, StoreError>(err)]).boxed());
        }

        let (tx, rx) = mpsc::unbounded();
        let notes = Arc::clone(&self.notes);
        let mut changes = self.changes.subscribe();
        tokio::spawn(async move {
            if tx.unbounded_send(Ok(snapshot(&notes, &query.owner_id))).is_err() {
                return;
            }
            while changes.recv().await.is_ok() {
                if tx.unbounded_send(Ok(snapshot(&notes, &query.owner_id))).is_err() {
                    return;
                }
            }
        });
        Ok(rx.boxed())
    }

    async fn query(&self, query: NoteQuery) -> Result<Vec<Note>, StoreError> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(StoreError::Transport("deadline exceeded".to_string()));
        }
        Ok(self.snapshot(&query.owner_id))
    }

    async fn create(&self, draft: NoteDraft) -> Result<NoteId, StoreError> {
        self.check_writes()?;
        let id = NoteId::new(format!("note-{}", self.next_id.fetch_add(1, Ordering::SeqCst)));
        self.seed(Note::from_draft(id.clone(), draft));
        Ok(id)
    }

    async fn update(
        &self,
        id: &NoteId,
        patch: NotePatch,
        stamped_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_writes()?;
        {
            let mut notes = self.notes.lock();
            let note = notes
                .iter_mut()
                .find(|note| &note.id == id)
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            patch.apply_to(note);
            note.updated_at = note.updated_at.max(stamped_at);
        }
        self.updates.lock().push((id.clone(), patch));
        let _ = self.changes.send(());
        Ok(())
    }

    async fn delete(&self, id: &NoteId) -> Result<(), StoreError> {
        self.check_writes()?;
        let removed = {
            let mut notes = self.notes.lock();
            let before = notes.len();
            notes.retain(|note| &note.id != id);
            before != notes.len()
        };
        if !removed {
            return Err(StoreError::NotFound(id.clone()));
        }
        let _ = self.changes.send(());
        Ok(())
    }
}

fn snapshot(notes: &Mutex<Vec<Note>>, owner: &str) -> Vec<Note> {
    notes
        .lock()
        .iter()
        .filter(|note| note.owner_id == owner)
        .cloned()
        .collect()
}
