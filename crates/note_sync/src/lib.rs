pub mod debounce;
pub mod manager;
pub mod view;

#[cfg(test)]
pub(crate) mod testing;

pub use debounce::Debouncer;
pub use manager::{
    NoteSyncManager, NoteView, Notification, NotificationKey, NotificationLevel, SearchResults,
    SyncConfig, SyncError,
};
pub use view::{ALL_CATEGORIES, ViewFilter};
