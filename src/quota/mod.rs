/*!
 * Per-user quota admission control
 *
 * The service talks to its collaborators only through the
 * [`QuotaRepository`], [`QuotaCache`] and [`EventBus`] traits; in-memory
 * implementations of all three are provided.
 */

pub mod cache;
pub mod error;
pub mod events;
pub mod model;
pub mod repository;
pub mod service;

pub use cache::{quota_cache_key, InMemoryCache, QuotaCache};
pub use error::{CacheError, QuotaError, StoreError};
pub use events::{BroadcastEventBus, EventBus, QuotaEvent, QuotaWarningEvent};
pub use model::{
    QuotaStatus, QuotaTransaction, QuotaType, TransactionKind, UserQuota, UserRole, WarningLevel,
};
pub use repository::{InMemoryQuotaRepository, QuotaRepository};
pub use service::{QuotaService, QuotaSettings};
