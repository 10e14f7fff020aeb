use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Envelope: what subscribers receive, JSON-encoded. `kind` is `metrics`,
/// `stats`, or `ping`.
#[derive(Serialize, Debug, Clone)]
pub struct Envelope {
    pub job_id: Uuid,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// One live subscriber. Dropping the subscription (or falling behind) removes
/// it from the hub.
pub struct Subscription {
    pub id: u64,
    pub job_id: Uuid,
    pub receiver: mpsc::Receiver<String>,
}

enum HubCommand {
    Register {
        job_id: Uuid,
        subscriber_id: u64,
        sender: mpsc::Sender<String>,
    },
    Unregister {
        job_id: Uuid,
        subscriber_id: u64,
    },
}

type SubscriberMap = HashMap<Uuid, HashMap<u64, mpsc::Sender<String>>>;

/// MetricsHub: fan-out of metric envelopes to live subscribers. A single
/// coordinator task owns every map mutation; broadcasters only take the read
/// side and enqueue without blocking. A subscriber whose buffer is full is
/// deregistered rather than awaited (slow-consumer policy).
pub struct MetricsHub {
    subscribers: Arc<RwLock<SubscriberMap>>,
    commands: mpsc::UnboundedSender<HubCommand>,
    next_subscriber_id: AtomicU64,
    buffer_size: usize,
    shutdown: CancellationToken,
}

impl MetricsHub {
    pub fn new(buffer_size: usize, ping_interval: Duration) -> Self {
        let subscribers: Arc<RwLock<SubscriberMap>> = Arc::new(RwLock::new(HashMap::new()));
        let (commands, mut command_rx) = mpsc::unbounded_channel::<HubCommand>();
        let shutdown = CancellationToken::new();

        // Coordinator: the only task that mutates the subscriber map.
        let coordinator_map = subscribers.clone();
        let coordinator_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = coordinator_shutdown.cancelled() => break,
                    command = command_rx.recv() => {
                        let Some(command) = command else { break };
                        let mut map = coordinator_map.write().unwrap_or_else(|poisoned| poisoned.into_inner());
                        match command {
                            HubCommand::Register { job_id, subscriber_id, sender } => {
                                map.entry(job_id).or_default().insert(subscriber_id, sender);
                            }
                            HubCommand::Unregister { job_id, subscriber_id } => {
                                if let Some(per_job) = map.get_mut(&job_id) {
                                    per_job.remove(&subscriber_id);
                                    if per_job.is_empty() {
                                        map.remove(&job_id);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });

        let hub = MetricsHub {
            subscribers,
            commands,
            next_subscriber_id: AtomicU64::new(1),
            buffer_size,
            shutdown,
        };
        hub.spawn_ping_task(ping_interval);
        hub
    }

    fn spawn_ping_task(&self, ping_interval: Duration) {
        let subscribers = self.subscribers.clone();
        let commands = self.commands.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let snapshot: Vec<(Uuid, u64, mpsc::Sender<String>)> = {
                    let map = subscribers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
                    map.iter()
                        .flat_map(|(job_id, per_job)| {
                            per_job.iter().map(|(id, sender)| (*job_id, *id, sender.clone()))
                        })
                        .collect()
                };

                for (job_id, subscriber_id, sender) in snapshot {
                    let envelope = Envelope {
                        job_id,
                        kind: "ping".to_string(),
                        payload: serde_json::Value::Null,
                        timestamp: Utc::now(),
                    };
                    let Ok(encoded) = serde_json::to_string(&envelope) else { continue };
                    if sender.try_send(encoded).is_err() {
                        let _ = commands.send(HubCommand::Unregister { job_id, subscriber_id });
                    }
                }
            }
        });
    }

    pub fn subscribe(&self, job_id: Uuid) -> Subscription {
        let subscriber_id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.buffer_size);
        let _ = self.commands.send(HubCommand::Register {
            job_id,
            subscriber_id,
            sender,
        });

        Subscription {
            id: subscriber_id,
            job_id,
            receiver,
        }
    }

    pub fn unsubscribe(&self, job_id: Uuid, subscriber_id: u64) {
        let _ = self.commands.send(HubCommand::Unregister { job_id, subscriber_id });
    }

    /// Non-blocking fan-out to every subscriber of `job_id`. Subscribers with
    /// a full buffer are dropped from the hub.
    pub fn broadcast(&self, job_id: Uuid, kind: &str, payload: serde_json::Value) {
        let targets: Vec<(u64, mpsc::Sender<String>)> = {
            let map = self.subscribers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
            match map.get(&job_id) {
                Some(per_job) => per_job.iter().map(|(id, sender)| (*id, sender.clone())).collect(),
                None => return,
            }
        };

        let envelope = Envelope {
            job_id,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        let encoded = match serde_json::to_string(&envelope) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!("cannot encode {} envelope for job {}: {}", kind, job_id, err);
                return;
            }
        };

        for (subscriber_id, sender) in targets {
            match sender.try_send(encoded.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        "subscriber {} of job {} cannot keep up, deregistering",
                        subscriber_id, job_id
                    );
                    let _ = self.commands.send(HubCommand::Unregister { job_id, subscriber_id });
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    let _ = self.commands.send(HubCommand::Unregister { job_id, subscriber_id });
                }
            }
        }
    }

    /// Number of live subscribers for a job. Eventually consistent: pending
    /// register/unregister commands may not be applied yet.
    pub fn subscriber_count(&self, job_id: Uuid) -> usize {
        let map = self.subscribers.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        map.get(&job_id).map(|per_job| per_job.len()).unwrap_or(0)
    }
}

impl Drop for MetricsHub {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
