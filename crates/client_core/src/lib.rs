//! Client core for commission conversations: the optimistic message store,
//! real-time room membership, the HTTP message API and the per-screen
//! session that ties them together.

pub mod api;
pub mod channel;
pub mod config;
pub mod error;
pub mod layout;
pub mod message;
pub mod session;
pub mod store;
pub mod timeline;

pub use api::{AuthToken, HttpMessageApi, ImageUpload, MessageApi};
pub use channel::{ChannelEvent, ChannelHub, RealtimeChannel, RoomLease, WsChannel};
pub use config::{load_settings, ClientSettings};
pub use error::{ChatError, SendFailure};
pub use layout::{MasonryColumns, MasonryItem, MasonryLayout, MediaTile};
pub use message::{MessageRecord, OutgoingMessage, UploadedMedia};
pub use session::{ConversationSession, SessionEvent, SessionOptions};
pub use store::{MessageStore, Reconciled};
pub use timeline::{
    build_timeline, day_boundary, day_boundary_in, delivery_status, DeliveryStatus, TimelineItem,
};
