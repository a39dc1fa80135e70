//! Client-side conversation sync: snapshot loading, live push routing,
//! optimistic sends and reconnect resync behind one actor.

pub mod config;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod message_store;
pub mod presence;
pub mod read_receipts;
pub mod transport;
pub mod typing;
pub mod view;

pub use config::{load_settings, load_settings_from, SyncSettings};
pub use engine::SyncEngine;
pub use error::SyncError;
pub use transport::{
    ChannelSession, EventChannel, HttpSnapshotApi, SnapshotApi, WebSocketChannel,
};
pub use view::{ConversationSummary, MessageView, SyncMode, SyncUpdate, SyncView};
