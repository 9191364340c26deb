pub mod checker;
pub mod lookup;
pub mod telegram;

pub use checker::{HttpStatusChecker, StatusChecker, MAX_BATCH_DOMAINS};
pub use lookup::{LookupClient, LookupError, LookupVerdict};
pub use telegram::{TelegramClient, TelegramError};
