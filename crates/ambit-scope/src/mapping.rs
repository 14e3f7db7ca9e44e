// Live scope mappings and their one-shot expiration signal.
use ambit_api::ScopeSelector;
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;

/// Why a mapping (or a watch gate derived from one) stopped being valid.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpireReason {
    /// A newer generation of the scope replaced this mapping.
    #[error("scope configuration changed")]
    ConfigurationChanged,
    /// Reconciliation failed partway; the message is deliberately terse as
    /// it is shown to watch clients.
    #[error("internal error")]
    Internal,
    /// The watch began before the fleet finished acknowledging the current
    /// mapping generation; the client must re-list.
    #[error("initial resource version {initial} is older than minimum resource version {minimum}")]
    MinimumRevisionExceeded { initial: u64, minimum: u64 },
    /// The request context ended; a clean exit, not an error condition.
    #[error("request closed")]
    RequestClosed,
}

/// One-shot broadcast used to expire mappings and terminate watch gates.
///
/// The signal completes exactly once with a cached reason; later `expire`
/// calls are no-ops. Readers observe either "pending" or
/// "completed(reason)", never an intermediate state.
#[derive(Debug, Clone)]
pub struct ExpirySignal {
    inner: Arc<SignalInner>,
}

#[derive(Debug)]
struct SignalInner {
    reason: OnceLock<ExpireReason>,
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl ExpirySignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            inner: Arc::new(SignalInner {
                reason: OnceLock::new(),
                tx,
                rx,
            }),
        }
    }

    /// Completes the signal. Returns true if this call won the one-shot.
    pub fn expire(&self, reason: ExpireReason) -> bool {
        if self.inner.reason.set(reason).is_ok() {
            // The reason is published before the flag flips, so any reader
            // woken by the flag always observes it.
            let _ = self.inner.tx.send(true);
            return true;
        }
        false
    }

    pub fn reason(&self) -> Option<ExpireReason> {
        self.inner.reason.get().cloned()
    }

    pub fn is_expired(&self) -> bool {
        self.inner.reason.get().is_some()
    }

    /// Waits until the signal completes and returns the cached reason.
    pub async fn expired(&self) -> ExpireReason {
        let mut rx = self.inner.rx.clone();
        // The sender lives inside `inner`, so wait_for cannot observe a
        // dropped channel while we hold a clone of the signal.
        let _ = rx.wait_for(|fired| *fired).await;
        self.inner
            .reason
            .get()
            .cloned()
            .unwrap_or(ExpireReason::Internal)
    }
}

impl Default for ExpirySignal {
    fn default() -> Self {
        Self::new()
    }
}

/// The in-process, currently-published generation of a scope.
///
/// Immutable after construction except for the one-shot expiration
/// transition. Replaced, never mutated, when a new generation arrives.
#[derive(Debug)]
pub struct ScopeMapping {
    selector: ScopeSelector,
    scope_id: String,
    // Sorted on the definition's status; frozen here.
    namespaces: Vec<String>,
    expiry: ExpirySignal,
}

impl ScopeMapping {
    pub fn new(selector: ScopeSelector, scope_id: String, namespaces: Vec<String>) -> Self {
        Self {
            selector,
            scope_id,
            namespaces,
            expiry: ExpirySignal::new(),
        }
    }

    pub fn selector(&self) -> &ScopeSelector {
        &self.selector
    }

    /// Opaque identifier for this generation of the mapping.
    pub fn scope_id(&self) -> &str {
        &self.scope_id
    }

    pub fn namespaces(&self) -> &[String] {
        &self.namespaces
    }

    pub fn expire(&self, reason: ExpireReason) {
        self.expiry.expire(reason);
    }

    pub fn expired(&self) -> Option<ExpireReason> {
        self.expiry.reason()
    }

    pub fn is_expired(&self) -> bool {
        self.expiry.is_expired()
    }

    pub async fn wait_expired(&self) -> ExpireReason {
        self.expiry.expired().await
    }
}
