pub mod conversation_store;
pub mod denied_ids;

pub use conversation_store::{ConversationStore, JsonConversationStore};
pub use denied_ids::{DeniedEntry, DeniedIds};
