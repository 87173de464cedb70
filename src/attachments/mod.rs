// Attachments module - media library records, derived sizes and flags
mod error;
mod store;
mod types;

pub use error::AttachmentError;
pub use store::{AttachmentStore, JsonAttachmentStore};
pub use types::*;

use std::sync::Arc;

pub type SharedAttachmentStore = Arc<dyn AttachmentStore>;
