// Per-watch gates enforcing mapping expiry and resource version floors.
//
// Every scoped watch gets a gate bound to the live mapping it started from.
// A dedicated supervisor task waits for the first of: the parent mapping
// expiring, a fleet minimum resource version overtaking the watch's starting
// point, or the request context ending. Whichever fires first becomes the
// gate's termination cause; the stream owner tears the watch down with it.
use crate::mapping::{ExpireReason, ScopeMapping};
use crate::resolver::{ResolveError, ScopeResolver};
use ambit_api::GroupResource;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;

// Bounded buffer for minimum resource version updates; publishers never
// block on a slow gate.
const MINIMUM_RESOURCE_VERSION_CHANNEL_SIZE: usize = 10;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    #[error("initial resource version already set in scoped watch gate")]
    InitialAlreadySet,
    #[error("scope watch gate processing blocked, minimum resource version not acknowledged")]
    ProcessingBlocked,
}

/// Supervisor for one scoped watch.
pub struct ScopeWatchGate {
    parent: Arc<ScopeMapping>,
    signal: crate::mapping::ExpirySignal,
    minimum_tx: mpsc::Sender<u64>,
    initial_tx: Mutex<Option<oneshot::Sender<u64>>>,
}

impl ScopeWatchGate {
    /// Creates the gate and starts its supervisor. `cancel` is the request
    /// context; flipping it (or dropping its sender) ends the watch cleanly.
    pub fn spawn(parent: Arc<ScopeMapping>, cancel: watch::Receiver<bool>) -> Arc<Self> {
        let (minimum_tx, minimum_rx) = mpsc::channel(MINIMUM_RESOURCE_VERSION_CHANNEL_SIZE);
        let (initial_tx, initial_rx) = oneshot::channel();
        let gate = Arc::new(Self {
            parent,
            signal: crate::mapping::ExpirySignal::new(),
            minimum_tx,
            initial_tx: Mutex::new(Some(initial_tx)),
        });
        {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                let cause = supervise(&gate, cancel, minimum_rx, initial_rx).await;
                gate.signal.expire(cause);
            });
        }
        gate
    }

    pub fn parent(&self) -> &Arc<ScopeMapping> {
        &self.parent
    }

    /// Records the watch's starting resource version. May be called at most
    /// once; the supervisor waits for it before enforcing floors.
    pub fn set_initial_resource_version(&self, resource_version: u64) -> Result<(), GateError> {
        let sender = self
            .initial_tx
            .lock()
            .expect("gate lock poisoned")
            .take()
            .ok_or(GateError::InitialAlreadySet)?;
        // A send failure means the supervisor already terminated; the cause
        // it settled on stands.
        let _ = sender.send(resource_version);
        Ok(())
    }

    /// Delivers an updated fleet minimum. Fails with `ProcessingBlocked`
    /// when the gate is not keeping up, in which case the caller must tear
    /// the watch down rather than silently degrade.
    pub fn set_minimum_resource_version(&self, resource_version: u64) -> Result<(), GateError> {
        match self.minimum_tx.try_send(resource_version) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(GateError::ProcessingBlocked),
            // The supervisor is gone; the gate already has its cause.
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(()),
        }
    }

    /// Force-terminates the gate, e.g. on publisher backpressure.
    pub fn expire(&self, reason: ExpireReason) {
        self.signal.expire(reason);
    }

    pub fn cause(&self) -> Option<ExpireReason> {
        self.signal.reason()
    }

    pub fn is_terminated(&self) -> bool {
        self.signal.is_expired()
    }

    /// Waits for the gate to terminate and returns the cause.
    pub async fn terminated(&self) -> ExpireReason {
        self.signal.expired().await
    }
}

async fn supervise(
    gate: &ScopeWatchGate,
    mut cancel: watch::Receiver<bool>,
    mut minimum_rx: mpsc::Receiver<u64>,
    initial_rx: oneshot::Receiver<u64>,
) -> ExpireReason {
    // Nothing can be enforced until the stream owner tells us where the
    // watch started.
    let initial = tokio::select! {
        biased;
        reason = gate.parent.wait_expired() => return reason,
        resource_version = initial_rx => match resource_version {
            Ok(resource_version) => resource_version,
            // Sender dropped without a value: the gate itself was torn down.
            Err(_) => return ExpireReason::RequestClosed,
        },
        _ = cancel.wait_for(|cancelled| *cancelled) => return ExpireReason::RequestClosed,
    };

    loop {
        tokio::select! {
            biased;
            reason = gate.parent.wait_expired() => return reason,
            update = minimum_rx.recv() => match update {
                Some(minimum) if initial < minimum => {
                    return ExpireReason::MinimumRevisionExceeded { initial, minimum };
                }
                // Floor not violated; keep watching.
                Some(_) => {}
                None => return ExpireReason::RequestClosed,
            },
            _ = cancel.wait_for(|cancelled| *cancelled) => return ExpireReason::RequestClosed,
        }
    }
}

/// Periodically feeds the fleet minimum for one store into a gate.
///
/// The checker stops itself once the gate terminates; dropping the checker
/// cancels it.
pub struct MinimumVersionChecker {
    cancel: watch::Sender<bool>,
}

impl MinimumVersionChecker {
    pub fn spawn(
        resolver: Arc<dyn ScopeResolver>,
        gate: Arc<ScopeWatchGate>,
        resource: GroupResource,
        interval: Duration,
    ) -> Self {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel_rx.wait_for(|cancelled| *cancelled) => return,
                    _ = ticker.tick() => {}
                }
                if gate.is_terminated() {
                    return;
                }
                let selector = gate.parent().selector().clone();
                match resolver.minimum_resource_version(&selector, &resource).await {
                    Ok(minimum) => {
                        if let Err(err) = gate.set_minimum_resource_version(minimum) {
                            tracing::warn!(
                                scope = %selector,
                                error = %err,
                                "watch gate not keeping up with minimum resource version updates"
                            );
                            gate.expire(ExpireReason::Internal);
                            return;
                        }
                    }
                    // The scope has not transitioned anywhere yet; no floor.
                    Err(ResolveError::MissingMinimum(_)) => {}
                    Err(err) => {
                        tracing::debug!(scope = %selector, error = %err, "minimum resource version lookup failed");
                    }
                }
            }
        });
        Self { cancel: cancel_tx }
    }

    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }
}

impl Drop for MinimumVersionChecker {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ambit_api::ScopeSelector;

    fn mapping(scope_id: &str) -> Arc<ScopeMapping> {
        Arc::new(ScopeMapping::new(
            ScopeSelector::new("workspace", "alpha").expect("selector"),
            scope_id.into(),
            vec!["ns-a".into(), "ns-b".into()],
        ))
    }

    #[tokio::test]
    async fn parent_expiry_terminates_with_parent_reason() {
        let parent = mapping("g1");
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let gate = ScopeWatchGate::spawn(Arc::clone(&parent), cancel_rx);
        gate.set_initial_resource_version(50).expect("initial");

        parent.expire(ExpireReason::ConfigurationChanged);
        assert_eq!(gate.terminated().await, ExpireReason::ConfigurationChanged);
    }

    #[tokio::test]
    async fn minimum_above_initial_terminates_with_both_versions() {
        let parent = mapping("g2");
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let gate = ScopeWatchGate::spawn(parent, cancel_rx);
        gate.set_initial_resource_version(50).expect("initial");

        // A floor below the start is fine; the watch keeps running.
        gate.set_minimum_resource_version(40).expect("benign floor");
        assert!(!gate.is_terminated());

        gate.set_minimum_resource_version(100).expect("floor");
        assert_eq!(
            gate.terminated().await,
            ExpireReason::MinimumRevisionExceeded {
                initial: 50,
                minimum: 100
            }
        );
    }

    #[tokio::test]
    async fn cancellation_is_a_clean_exit() {
        let parent = mapping("g1");
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let gate = ScopeWatchGate::spawn(parent, cancel_rx);
        gate.set_initial_resource_version(50).expect("initial");

        cancel_tx.send(true).expect("cancel");
        assert_eq!(gate.terminated().await, ExpireReason::RequestClosed);
    }

    #[tokio::test]
    async fn cancellation_before_initial_version_is_clean() {
        let parent = mapping("g1");
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let gate = ScopeWatchGate::spawn(parent, cancel_rx);
        drop(cancel_tx);
        assert_eq!(gate.terminated().await, ExpireReason::RequestClosed);
    }

    #[tokio::test]
    async fn initial_resource_version_is_set_once() {
        let parent = mapping("g1");
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let gate = ScopeWatchGate::spawn(parent, cancel_rx);
        gate.set_initial_resource_version(50).expect("first");
        assert_eq!(
            gate.set_initial_resource_version(60),
            Err(GateError::InitialAlreadySet)
        );
    }

    #[tokio::test]
    async fn gate_terminates_at_most_once_with_the_first_cause() {
        let parent = mapping("g1");
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let gate = ScopeWatchGate::spawn(Arc::clone(&parent), cancel_rx);
        gate.set_initial_resource_version(50).expect("initial");

        parent.expire(ExpireReason::ConfigurationChanged);
        let first = gate.terminated().await;

        // Later events cannot change the recorded cause.
        cancel_tx.send(true).expect("cancel");
        gate.set_minimum_resource_version(1000).expect("late floor");
        assert_eq!(gate.terminated().await, first);
        assert_eq!(gate.cause(), Some(ExpireReason::ConfigurationChanged));
    }

    #[tokio::test]
    async fn full_minimum_channel_reports_backpressure() {
        let parent = mapping("g1");
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let gate = ScopeWatchGate::spawn(parent, cancel_rx);
        // No initial version: the supervisor is parked before the floor
        // loop, so nothing drains the channel.
        let mut blocked = false;
        for _ in 0..=MINIMUM_RESOURCE_VERSION_CHANNEL_SIZE {
            if gate.set_minimum_resource_version(1) == Err(GateError::ProcessingBlocked) {
                blocked = true;
                break;
            }
        }
        assert!(blocked, "channel never filled");
    }
}
