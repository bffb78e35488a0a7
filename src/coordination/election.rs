//! Lease-based leader election.
//!
//! Provides leader election with:
//! - Terms as fencing tokens for split-brain prevention
//! - Periodic lease renewal; any failed renewal ends leadership immediately
//! - Leadership transitions delivered as events over a channel
//! - Lease release only after the consumer confirms leadership work stopped
//!
//! # State Machine
//!
//! ```text
//! Standby -> Acquiring -> Leading { term } -> Released -> Standby
//!                 |                                  \-> (exit on shutdown)
//!                 \-> Standby (held by other / transient error)
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::api::KeyValueStore;
use crate::coordination::error::LeaseError;
use crate::coordination::lock::AcquireOutcome;
use crate::coordination::lock::LeaseLock;
use crate::coordination::lock::ReleaseOutcome;
use crate::coordination::lock::RenewOutcome;
use crate::coordination::pure::compute_backoff_ms;
use crate::coordination::pure::compute_jittered_delay_ms;
use crate::coordination::pure::compute_renew_budget_ms;
use crate::coordination::pure::compute_state_after_acquire;
use crate::coordination::types::Term;

/// Configuration for leader election.
#[derive(Debug, Clone)]
pub struct ElectionConfig {
    /// How long a lease protects its holder without renewal.
    pub lease_duration_ms: u64,
    /// How often the leader renews (must be < lease_duration_ms).
    pub renew_interval_ms: u64,
    /// Base delay between acquisition attempts while standing by.
    pub retry_period_ms: u64,
    /// Random jitter added to retries, as a fraction of the delay.
    pub jitter_factor: f64,
    /// Upper bound for backoff after consecutive transient errors.
    pub max_backoff_ms: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration_ms: 15_000, // 15 seconds
            renew_interval_ms: 5_000,  // renew 3x per lease
            retry_period_ms: 2_000,
            jitter_factor: 0.2,
            max_backoff_ms: 30_000,
        }
    }
}

/// Local view of this replica's election progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    /// Not leading; waiting to retry acquisition.
    Standby,
    /// An acquisition attempt is in flight.
    Acquiring,
    /// Holding the lease for `term`.
    Leading {
        /// Current leadership term.
        term: Term,
    },
    /// Leadership ended; draining work and releasing the lease.
    Released,
}

impl ElectionState {
    /// Returns true if currently the leader.
    pub fn is_leader(&self) -> bool {
        matches!(self, ElectionState::Leading { .. })
    }

    /// Get the term if leader.
    pub fn term(&self) -> Option<Term> {
        match self {
            ElectionState::Leading { term } => Some(*term),
            _ => None,
        }
    }
}

/// Why a leadership period ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    /// Another replica holds the lease now.
    Superseded,
    /// A renewal failed or was ambiguous.
    RenewFailed,
    /// The parent cancellation token fired.
    Shutdown,
}

/// Leadership transitions emitted by [`LeaderElector::run`].
#[derive(Debug)]
pub enum LeadershipEvent {
    /// Sent once per leadership period before any leader-only work starts.
    BecameLeader {
        /// The acquired term.
        term: Term,
        /// Cancelled when this leadership period ends.
        leadership: CancellationToken,
    },
    /// Sent once per leadership period after `leadership` is cancelled.
    ///
    /// The elector does not release the lease until `stopped` is answered
    /// (or dropped), so the receiver must reply only after all
    /// leadership-scoped work has fully stopped.
    LostLeadership {
        /// The term that ended.
        term: Term,
        /// Why it ended.
        reason: LossReason,
        /// Acknowledge that leader-only work has ceased.
        stopped: oneshot::Sender<()>,
    },
}

/// Leader election participant for one replica.
///
/// Owns the replica's [`ElectionState`]; other components observe it through
/// [`LeaderElector::subscribe`].
///
/// # Example
///
/// ```ignore
/// let lock = LeaseLock::new(store, "kube-bind", "konnector", 15_000);
/// let elector = LeaderElector::new(lock, "replica-a", ElectionConfig::default());
/// let (tx, mut rx) = tokio::sync::mpsc::channel(4);
/// tokio::spawn(elector.run(cancel.clone(), tx));
///
/// while let Some(event) = rx.recv().await {
///     match event {
///         LeadershipEvent::BecameLeader { term, leadership } => { /* start work under `leadership` */ }
///         LeadershipEvent::LostLeadership { stopped, .. } => { /* stop work */ let _ = stopped.send(()); }
///     }
/// }
/// ```
pub struct LeaderElector<S: KeyValueStore + ?Sized + 'static> {
    lock: LeaseLock<S>,
    identity: String,
    config: ElectionConfig,
    state_tx: watch::Sender<ElectionState>,
}

impl<S: KeyValueStore + ?Sized + Send + Sync + 'static> LeaderElector<S> {
    /// Create an elector contending for `lock` as `identity`.
    pub fn new(lock: LeaseLock<S>, identity: impl Into<String>, config: ElectionConfig) -> Self {
        let (state_tx, _) = watch::channel(ElectionState::Standby);
        Self {
            lock,
            identity: identity.into(),
            config,
            state_tx,
        }
    }

    /// Subscribe to election state changes.
    pub fn subscribe(&self) -> watch::Receiver<ElectionState> {
        self.state_tx.subscribe()
    }

    /// Participate in the election until `cancel` fires.
    ///
    /// On cancellation while leading, the elector cancels the leadership
    /// token, waits for the `LostLeadership` acknowledgement, releases the
    /// lease (best-effort), then returns.
    pub async fn run(self, cancel: CancellationToken, events: mpsc::Sender<LeadershipEvent>) {
        let mut consecutive_errors: u32 = 0;

        info!(identity = %self.identity, lease = %self.lock.key(), "trying to acquire the lease");

        while !cancel.is_cancelled() {
            self.set_state(ElectionState::Acquiring);

            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                attempt = self.bounded(self.config.lease_duration_ms, self.lock.try_acquire(&self.identity)) => attempt,
            };

            let delay_ms = match attempt {
                Ok(AcquireOutcome::Acquired { term, deadline_ms }) if !self.is_deadline_ahead(deadline_ms) => {
                    // The answer arrived too late to act on; the record expires on its own.
                    warn!(
                        identity = %self.identity,
                        term = term.value(),
                        deadline_ms,
                        "acquired lease already expired, not leading"
                    );
                    self.set_state(ElectionState::Standby);
                    self.retry_delay_ms()
                }
                Ok(AcquireOutcome::Acquired { term, deadline_ms }) => {
                    consecutive_errors = 0;
                    info!(
                        identity = %self.identity,
                        lease = %self.lock.key(),
                        term = term.value(),
                        deadline_ms,
                        "acquired lease"
                    );
                    self.set_state(compute_state_after_acquire(Some(term)));
                    self.lead(term, deadline_ms, &cancel, &events).await;
                    self.set_state(ElectionState::Standby);
                    self.retry_delay_ms()
                }
                Ok(AcquireOutcome::HeldByOther { holder, deadline_ms }) => {
                    consecutive_errors = 0;
                    debug!(
                        identity = %self.identity,
                        current_leader = %holder,
                        deadline_ms,
                        "lease held by another replica"
                    );
                    self.set_state(compute_state_after_acquire(None));
                    self.retry_delay_ms()
                }
                Err(e) => {
                    let delay_ms = self.backoff_delay_ms(consecutive_errors);
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        consecutive_errors,
                        retry_in_ms = delay_ms,
                        "lease acquisition failed"
                    );
                    self.set_state(ElectionState::Standby);
                    delay_ms
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            }
        }

        info!(identity = %self.identity, "leader election stopped");
    }

    /// Hold leadership for `term` until it is lost or cancelled, then hand
    /// off to the event consumer and release.
    async fn lead(
        &self,
        term: Term,
        mut deadline_ms: u64,
        cancel: &CancellationToken,
        events: &mpsc::Sender<LeadershipEvent>,
    ) {
        let leadership = cancel.child_token();

        let announced = events
            .send(LeadershipEvent::BecameLeader {
                term,
                leadership: leadership.clone(),
            })
            .await
            .is_ok();

        let reason = if announced {
            self.maintain_leadership(term, &mut deadline_ms, cancel).await
        } else {
            warn!(identity = %self.identity, "no consumer for leadership events, stepping down");
            LossReason::Shutdown
        };

        self.set_state(ElectionState::Released);
        leadership.cancel();
        info!(identity = %self.identity, term = term.value(), reason = ?reason, "lost leadership");

        if announced {
            let (stopped_tx, stopped_rx) = oneshot::channel();
            let delivered = events
                .send(LeadershipEvent::LostLeadership {
                    term,
                    reason,
                    stopped: stopped_tx,
                })
                .await
                .is_ok();
            if delivered {
                self.await_work_stopped(term, deadline_ms, reason, stopped_rx).await;
            }
        }

        self.release(term).await;
    }

    /// Renew on a fixed interval until the lease is lost or `cancel` fires.
    ///
    /// Each renewal must finish before `deadline_ms`; one that cannot is a
    /// failed renewal, since other replicas may already treat the lease as free.
    async fn maintain_leadership(&self, term: Term, deadline_ms: &mut u64, cancel: &CancellationToken) -> LossReason {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.renew_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately; the lease was just written.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return LossReason::Shutdown,
                _ = interval.tick() => {}
            }

            let Some(budget_ms) = self.renew_budget_ms(*deadline_ms) else {
                warn!(identity = %self.identity, term = term.value(), deadline_ms = *deadline_ms, "lease expired before renewal");
                return LossReason::RenewFailed;
            };

            let renewal = tokio::select! {
                _ = cancel.cancelled() => return LossReason::Shutdown,
                renewal = self.bounded(budget_ms, self.lock.renew(&self.identity, term)) => renewal,
            };

            match renewal {
                Ok(RenewOutcome::Renewed { deadline_ms: next }) if self.is_deadline_ahead(next) => {
                    *deadline_ms = next;
                    debug!(identity = %self.identity, term = term.value(), deadline_ms = next, "renewed lease");
                }
                Ok(RenewOutcome::Renewed { deadline_ms: next }) => {
                    warn!(identity = %self.identity, term = term.value(), deadline_ms = next, "renewal landed after its own deadline");
                    return LossReason::RenewFailed;
                }
                Ok(RenewOutcome::Lost { current_holder }) => {
                    warn!(
                        identity = %self.identity,
                        term = term.value(),
                        new_leader = current_holder.as_deref().unwrap_or("none"),
                        "lease taken over by another replica"
                    );
                    return LossReason::Superseded;
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        term = term.value(),
                        error = %e,
                        "lease renewal failed, giving up leadership"
                    );
                    return LossReason::RenewFailed;
                }
            }
        }
    }

    /// Wait for the consumer to confirm leader-only work has stopped.
    ///
    /// On shutdown the lease is still ours, so keep renewing while work
    /// drains; otherwise another replica could start before we stop.
    async fn await_work_stopped(
        &self,
        term: Term,
        mut deadline_ms: u64,
        reason: LossReason,
        mut stopped: oneshot::Receiver<()>,
    ) {
        if reason != LossReason::Shutdown {
            let _ = stopped.await;
            return;
        }

        let mut interval = tokio::time::interval(Duration::from_millis(self.config.renew_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = &mut stopped => return,
                _ = interval.tick() => {}
            }

            let renewal = match self.renew_budget_ms(deadline_ms) {
                Some(budget_ms) => self.bounded(budget_ms, self.lock.renew(&self.identity, term)).await,
                None => Ok(RenewOutcome::Lost { current_holder: None }),
            };
            match renewal {
                Ok(RenewOutcome::Renewed { deadline_ms: next }) if self.is_deadline_ahead(next) => {
                    deadline_ms = next;
                    debug!(identity = %self.identity, term = term.value(), "renewed lease while draining");
                }
                other => {
                    warn!(identity = %self.identity, term = term.value(), result = ?other, "lease renewal failed while draining");
                    let _ = stopped.await;
                    return;
                }
            }
        }
    }

    /// Best-effort release; the lease expires on its own if this fails.
    async fn release(&self, term: Term) {
        let timeout = Duration::from_millis(self.config.renew_interval_ms);
        match tokio::time::timeout(timeout, self.lock.release(&self.identity, term)).await {
            Ok(Ok(ReleaseOutcome::Released)) => {
                info!(identity = %self.identity, term = term.value(), "released lease");
            }
            Ok(Ok(ReleaseOutcome::AlreadyReleased)) => {
                debug!(identity = %self.identity, term = term.value(), "lease already released");
            }
            Ok(Err(e)) => {
                warn!(identity = %self.identity, term = term.value(), error = %e, "failed to release lease, it will expire");
            }
            Err(_) => {
                warn!(identity = %self.identity, term = term.value(), "lease release timed out, it will expire");
            }
        }
    }

    /// Run a lease call, failing with [`LeaseError::Timeout`] after `limit_ms`.
    async fn bounded<T>(&self, limit_ms: u64, call: impl Future<Output = Result<T, LeaseError>>) -> Result<T, LeaseError> {
        match tokio::time::timeout(Duration::from_millis(limit_ms), call).await {
            Ok(result) => result,
            Err(_) => Err(LeaseError::Timeout {
                key: self.lock.key().to_string(),
                timeout_ms: limit_ms,
            }),
        }
    }

    fn renew_budget_ms(&self, deadline_ms: u64) -> Option<u64> {
        compute_renew_budget_ms(deadline_ms, self.lock.now_unix_ms(), self.config.renew_interval_ms)
    }

    fn is_deadline_ahead(&self, deadline_ms: u64) -> bool {
        self.renew_budget_ms(deadline_ms).is_some()
    }

    fn set_state(&self, state: ElectionState) {
        self.state_tx.send_replace(state);
    }

    fn retry_delay_ms(&self) -> u64 {
        let random: f64 = rand::rng().random();
        compute_jittered_delay_ms(self.config.retry_period_ms, self.config.jitter_factor, random)
    }

    fn backoff_delay_ms(&self, consecutive_errors: u32) -> u64 {
        let base = compute_backoff_ms(consecutive_errors, self.config.retry_period_ms, self.config.max_backoff_ms);
        let random: f64 = rand::rng().random();
        compute_jittered_delay_ms(base, self.config.jitter_factor, random)
    }
}
