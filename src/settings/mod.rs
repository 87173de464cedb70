// Settings module - persisted plugin settings and their validation
mod error;
mod handler;
mod store;
mod types;

pub use error::SettingsError;
pub use handler::{SettingsHandler, SettingsInput};
pub use store::{JsonSettingsStore, SettingsStore};
pub use types::*;

use std::sync::Arc;

pub type SharedSettingsHandler = Arc<SettingsHandler>;
