use std::sync::Arc;

use crate::jobs::apply_retry::Applier;
use crate::notification::Notifier;
use crate::store::SqliteStore;
use crate::token::TokenCodec;

/// Shared state handed to the action endpoint's handlers.
pub struct AppState {
    pub store: SqliteStore,
    pub codec: Arc<TokenCodec>,
    pub notifier: Arc<dyn Notifier>,
    pub applier: Applier,
    /// GET renders a confirm form; only POST acts.
    pub require_confirm: bool,
}
