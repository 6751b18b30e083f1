use std::{future::Future, time::Duration};

use chrono::{DateTime, Utc};
use k8s_openapi::{
    api::{coordination::v1::{Lease, LeaseSpec}, core::v1::Pod},
    apimachinery::pkg::apis::meta::v1::MicroTime,
};
use kube::{
    api::{PatchParams, PostParams},
    core::ObjectMeta,
    Api, Client,
};
use log::{error, info, warn};
use macpool_core::{
    kubernetes::{operations::patch_resource_labels, GetApi},
    resources::labels::get_leader_labels,
    FIELD_MANAGER,
};
use thiserror::Error;
use tokio::time::{sleep_until, timeout, timeout_at, Instant};

use super::LeadershipGate;

#[derive(Debug, Error)]
pub enum ElectionError {
    #[error("Couldn't read or write the election lease! Reason: {}", .0)]
    KubeApiError(kube::Error),
    #[error("Lease update didn't finish before the renew deadline!")]
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct ElectorConfig {
    pub namespace: String,
    pub lease_name: String,
    pub identity: String,
    pub lease_duration: Duration,
    /// shorter than `lease_duration`, the leader steps down once it couldn't
    /// renew for this long, before any rival may take the lease over
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

/// Competes for a coordination Lease and reflects the outcome in a
/// [`LeadershipGate`].
pub struct LeaderElector {
    config: ElectorConfig,
    leases: Api<Lease>,
    pods: Api<Pod>,
    gate: LeadershipGate,
}

impl LeaderElector {
    pub fn new(client: &Client, config: ElectorConfig, gate: LeadershipGate) -> Self {
        Self {
            leases: client.namespaced_api(&config.namespace),
            pods: client.namespaced_api(&config.namespace),
            config,
            gate,
        }
    }

    pub async fn run(self) {
        info!(
            "Competing for '{}' lease in '{}' namespace as '{}'...",
            self.config.lease_name, self.config.namespace, self.config.identity
        );

        self.label_own_pod(false).await;

        run_election(
            &self.gate,
            &self.config,
            |now| self.try_acquire_or_renew(now),
            |is_leader| self.label_own_pod(is_leader),
        )
        .await
    }

    async fn try_acquire_or_renew(&self, now: DateTime<Utc>) -> Result<bool, ElectionError> {
        let existing = self
            .leases
            .get_opt(&self.config.lease_name)
            .await
            .map_err(ElectionError::KubeApiError)?;

        let Some(mut lease) = existing else {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(self.config.lease_name.to_owned()),
                    namespace: Some(self.config.namespace.to_owned()),
                    ..Default::default()
                },
                spec: Some(next_lease_spec(None, &self.config, now)),
            };

            return match self.leases.create(&PostParams::default(), &lease).await {
                Ok(_) => Ok(true),
                Err(err) if is_conflict(&err) => Ok(false),
                Err(err) => Err(ElectionError::KubeApiError(err)),
            };
        };

        if !can_acquire(lease.spec.as_ref(), &self.config.identity, now) {
            return Ok(false);
        }

        lease.spec = Some(next_lease_spec(lease.spec.as_ref(), &self.config, now));

        // carries the observed resourceVersion, a concurrent writer makes this fail
        match self
            .leases
            .replace(&self.config.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(err) if is_conflict(&err) => Ok(false),
            Err(err) => Err(ElectionError::KubeApiError(err)),
        }
    }

    /// The webhook Service selects the leader's pod through this label.
    async fn label_own_pod(&self, is_leader: bool) {
        let result = patch_resource_labels(
            &self.pods,
            &self.config.identity,
            &get_leader_labels(is_leader),
            &PatchParams::apply(FIELD_MANAGER),
        )
        .await;

        if let Err(err) = result {
            warn!("Couldn't label '{}' pod (leader: {is_leader})! {err}", self.config.identity);
        }
    }
}

/// Drives the gate from repeated acquire/renew attempts.
///
/// Every attempt and every label update of a leader is bounded by the renew
/// deadline counted from the start of the last successful attempt, which is
/// also the renew time written to the lease. Leadership is dropped as soon as
/// that deadline passes without a renewal, whether the attempt failed, was
/// refused or hung.
async fn run_election<A, AF, L, LF>(
    gate: &LeadershipGate,
    config: &ElectorConfig,
    mut attempt: A,
    mut label: L,
) where
    A: FnMut(DateTime<Utc>) -> AF,
    AF: Future<Output = Result<bool, ElectionError>>,
    L: FnMut(bool) -> LF,
    LF: Future<Output = ()>,
{
    let mut deadline: Option<Instant> = None;

    loop {
        let started = Instant::now();
        let attempt_deadline = match (gate.is_leader(), deadline) {
            (true, Some(deadline)) => deadline,
            _ => started + config.renew_deadline,
        };

        let outcome = timeout_at(attempt_deadline, attempt(Utc::now()))
            .await
            .unwrap_or_else(|_| Err(ElectionError::DeadlineExceeded));

        match outcome {
            Ok(true) => {
                deadline = Some(started + config.renew_deadline);

                if !gate.is_leader() {
                    let epoch = gate.promote();
                    info!("Became the leader (epoch {})!", epoch.id());

                    let label_deadline = started + config.renew_deadline;
                    if timeout_at(label_deadline, label(true)).await.is_err() {
                        warn!("Couldn't label own pod as the leader in time!");
                    }
                }
            }
            Ok(false) => {
                if gate.is_leader() {
                    warn!("The lease was taken over by another replica!");
                    step_down(gate, config, &mut label).await;
                }
            }
            Err(err) => warn!("Leader election attempt failed! {err}"),
        }

        if gate.is_leader() && deadline.map_or(true, |deadline| Instant::now() >= deadline) {
            error!("Couldn't renew the lease before the deadline, stepping down!");
            step_down(gate, config, &mut label).await;
        }

        let next_attempt = Instant::now() + config.retry_period;
        match (gate.is_leader(), deadline) {
            (true, Some(deadline)) => sleep_until(next_attempt.min(deadline)).await,
            _ => sleep_until(next_attempt).await,
        }
    }
}

async fn step_down<L, LF>(gate: &LeadershipGate, config: &ElectorConfig, label: &mut L)
where
    L: FnMut(bool) -> LF,
    LF: Future<Output = ()>,
{
    gate.demote();

    if timeout(config.renew_deadline, label(false)).await.is_err() {
        warn!("Couldn't remove the leader label from own pod in time!");
    }
}

fn is_conflict(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 409)
}

pub fn can_acquire(spec: Option<&LeaseSpec>, identity: &str, now: DateTime<Utc>) -> bool {
    let Some(spec) = spec else {
        return true;
    };

    match spec.holder_identity.as_deref() {
        None | Some("") => true,
        Some(holder) if holder == identity => true,
        Some(_) => is_expired(spec, now),
    }
}

fn is_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    let duration = chrono::Duration::seconds(spec.lease_duration_seconds.unwrap_or(0).into());

    match &spec.renew_time {
        Some(MicroTime(renewed)) => *renewed + duration < now,
        None => true,
    }
}

fn next_lease_spec(current: Option<&LeaseSpec>, config: &ElectorConfig, now: DateTime<Utc>) -> LeaseSpec {
    let holds = current
        .and_then(|spec| spec.holder_identity.as_deref())
        .is_some_and(|holder| holder == config.identity);
    let transitions = current
        .and_then(|spec| spec.lease_transitions)
        .unwrap_or(0);

    LeaseSpec {
        holder_identity: Some(config.identity.to_owned()),
        lease_duration_seconds: Some(config.lease_duration.as_secs().try_into().unwrap_or(i32::MAX)),
        acquire_time: match holds {
            true => current.and_then(|spec| spec.acquire_time.clone()),
            false => Some(MicroTime(now)),
        },
        renew_time: Some(MicroTime(now)),
        lease_transitions: Some(match holds {
            true => transitions,
            false => transitions + 1,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use chrono::{TimeZone, Utc};
    use k8s_openapi::{api::coordination::v1::LeaseSpec, apimachinery::pkg::apis::meta::v1::MicroTime};

    use crate::leadership::LeadershipGate;

    use super::{can_acquire, next_lease_spec, run_election, ElectionError, ElectorConfig};

    fn config(identity: &str) -> ElectorConfig {
        ElectorConfig {
            namespace: "kubemacpool-system".to_owned(),
            lease_name: "kubemacpool-election".to_owned(),
            identity: identity.to_owned(),
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }

    fn held_by(identity: &str, renewed_secs: u32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(identity.to_owned()),
            lease_duration_seconds: Some(15),
            renew_time: Some(MicroTime(Utc.with_ymd_and_hms(2023, 7, 1, 12, 0, renewed_secs).unwrap())),
            lease_transitions: Some(2),
            ..Default::default()
        }
    }

    #[test]
    fn free_or_own_lease_can_be_taken() {
        let now = Utc.with_ymd_and_hms(2023, 7, 1, 12, 0, 5).unwrap();

        assert!(can_acquire(None, "a", now));
        assert!(can_acquire(Some(&LeaseSpec::default()), "a", now));
        assert!(can_acquire(Some(&held_by("a", 0)), "a", now));
    }

    #[test]
    fn foreign_lease_is_respected_until_it_expires() {
        let lease = held_by("b", 0);

        assert!(!can_acquire(Some(&lease), "a", Utc.with_ymd_and_hms(2023, 7, 1, 12, 0, 15).unwrap()));
        assert!(can_acquire(Some(&lease), "a", Utc.with_ymd_and_hms(2023, 7, 1, 12, 0, 16).unwrap()));
    }

    #[test]
    fn takeover_counts_a_transition() {
        let now = Utc.with_ymd_and_hms(2023, 7, 1, 12, 1, 0).unwrap();

        let renewed = next_lease_spec(Some(&held_by("a", 0)), &config("a"), now);
        let taken = next_lease_spec(Some(&held_by("b", 0)), &config("a"), now);

        assert_eq!(renewed.lease_transitions, Some(2));
        assert_eq!(taken.lease_transitions, Some(3));
        assert_eq!(taken.holder_identity.as_deref(), Some("a"));
        assert_eq!(taken.acquire_time, Some(MicroTime(now)));
        assert_eq!(taken.renew_time, Some(MicroTime(now)));
    }

    /// Runs the election loop in the background; the n-th attempt (from 0)
    /// resolves to `outcome(n)`, `None` never resolves.
    fn spawn_election(
        gate: &LeadershipGate,
        outcome: fn(usize) -> Option<Result<bool, ElectionError>>,
    ) -> Arc<AtomicUsize> {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let gate = gate.clone();

        tokio::spawn(async move {
            run_election(
                &gate,
                &config("a"),
                |_| {
                    let outcome = outcome(counter.fetch_add(1, Ordering::SeqCst));

                    async move {
                        match outcome {
                            Some(outcome) => outcome,
                            None => std::future::pending().await,
                        }
                    }
                },
                |_| async {},
            )
            .await
        });

        attempts
    }

    #[tokio::test(start_paused = true)]
    async fn leader_keeps_renewing() {
        let gate = LeadershipGate::new();
        let attempts = spawn_election(&gate, |_| Some(Ok(true)));

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert!(gate.is_leader());
        assert!(attempts.load(Ordering::SeqCst) >= 20);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_renewal_steps_down_at_the_deadline() {
        let gate = LeadershipGate::new();
        spawn_election(&gate, |attempt| match attempt {
            0 => Some(Ok(true)),
            _ => None,
        });

        tokio::time::sleep(Duration::from_millis(9_500)).await;
        assert!(gate.is_leader());

        // a rival may only take the lease over after 15s
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!gate.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn failing_renewals_step_down_at_the_deadline() {
        let gate = LeadershipGate::new();
        spawn_election(&gate, |attempt| match attempt {
            0 => Some(Ok(true)),
            _ => Some(Err(ElectionError::DeadlineExceeded)),
        });

        tokio::time::sleep(Duration::from_millis(9_500)).await;
        assert!(gate.is_leader());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!gate.is_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn takeover_steps_down_immediately() {
        let gate = LeadershipGate::new();
        spawn_election(&gate, |attempt| Some(Ok(attempt == 0)));

        tokio::time::sleep(Duration::from_millis(2_500)).await;

        assert!(!gate.is_leader());
    }
}
