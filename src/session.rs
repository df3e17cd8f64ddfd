use crate::types::SessionId;
use std::sync::atomic::{AtomicU64, Ordering};

/// Pluggable random-identifier source. Injected into the conversation
/// context so tests can use a deterministic sequence and production gets
/// 128-bit-class randomness.
pub trait IdProvider: Send + Sync {
    fn generate(&self) -> String;
}

/// Production provider: uuid v4.
#[derive(Debug, Default)]
pub struct UuidProvider;

impl IdProvider for UuidProvider {
    fn generate(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Non-cryptographic fallback. Acceptable only for identifiers that are
/// never used for authorization.
#[derive(Debug, Default)]
pub struct FastrandProvider;

impl IdProvider for FastrandProvider {
    fn generate(&self) -> String {
        format!("{:032x}", fastrand::u128(..))
    }
}

/// Deterministic sequence for tests.
#[derive(Debug)]
pub struct SequenceProvider {
    prefix: String,
    counter: AtomicU64,
}

impl SequenceProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            counter: AtomicU64::new(0),
        }
    }
}

impl IdProvider for SequenceProvider {
    fn generate(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.prefix, n)
    }
}

/// Process-wide per-client conversation identity. Created once when the chat
/// surface initializes, attached to every stream-open and decision request,
/// never rotated and never persisted: losing it simply starts a new
/// conversation server-side.
#[derive(Debug, Clone)]
pub struct SessionContext {
    id: SessionId,
}

impl SessionContext {
    pub fn new(ids: &dyn IdProvider) -> Self {
        let id = SessionId(ids.generate());
        tracing::debug!("[session] created {}", id.short());
        Self { id }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }
}
