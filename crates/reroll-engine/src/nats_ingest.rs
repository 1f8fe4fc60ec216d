//! NATS ingestion of heartbeats and commands.
//!
//! # Subject Convention
//!
//! - **Heartbeats:** `reroll.heartbeat`, payload is a `HeartbeatReport`.
//!   Fire-and-forget; a reply is sent only if the publisher asked for one.
//! - **Commands:** `reroll.command`, payload is a tagged `Command`.
//!   Request/reply; the reply is the `{"ok": ..}` envelope from
//!   [`dispatch`].
//!
//! # Ordering
//!
//! Decoded messages that write to an entity go to one of a fixed set of
//! [`Lanes`], picked by hashing the entity key. Each lane applies its
//! messages one at a time in arrival order, so two heartbeats from the
//! same instance reach the engine in the order NATS delivered them, while
//! different entities still proceed in parallel. Read-only queries skip
//! the lanes.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use async_nats::Subject;
use futures::StreamExt as _;
use reroll_core::store::EntityKey;
use reroll_core::{Command, Engine, dispatch};
use reroll_types::HeartbeatReport;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::EngineBinError;

/// Subject heartbeats arrive on.
pub const HEARTBEAT_SUBJECT: &str = "reroll.heartbeat";

/// Subject commands arrive on.
pub const COMMAND_SUBJECT: &str = "reroll.command";

/// Number of ordered lanes.
pub const LANE_COUNT: usize = 16;

/// Messages a lane buffers before the listener waits for it.
const LANE_DEPTH: usize = 256;

/// A reply waiting to be published.
#[derive(Debug)]
pub struct Reply {
    /// Subject the requester listens on.
    pub to: Subject,
    /// The `{"ok": ..}` envelope.
    pub body: Value,
}

struct Job {
    command: Command,
    reply_to: Option<Subject>,
}

/// Lane a message for `key` runs on, out of `lanes`.
pub fn lane_index(key: &EntityKey, lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    let lanes = u64::try_from(lanes.max(1)).unwrap_or(u64::MAX);
    usize::try_from(hasher.finish() % lanes).unwrap_or(0)
}

/// Ordered per-key workers in front of the engine.
pub struct Lanes {
    engine: Arc<Engine>,
    senders: Vec<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    replies: mpsc::UnboundedSender<Reply>,
}

impl Lanes {
    /// Start `count` lane workers. Replies go to `replies`.
    pub fn start(engine: &Arc<Engine>, count: usize, replies: mpsc::UnboundedSender<Reply>) -> Self {
        let count = count.max(1);
        let mut senders = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);
        for lane in 0..count {
            let (tx, mut rx) = mpsc::channel::<Job>(LANE_DEPTH);
            let engine = Arc::clone(engine);
            let replies = replies.clone();
            workers.push(tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    run_job(&engine, job, &replies).await;
                }
                debug!(lane, "Lane drained");
            }));
            senders.push(tx);
        }
        Self {
            engine: Arc::clone(engine),
            senders,
            workers,
            replies,
        }
    }

    /// Queue `command` behind earlier commands for the same entity.
    ///
    /// Waits while the lane is full.
    pub async fn submit(&self, command: Command, reply_to: Option<Subject>) {
        let job = Job { command, reply_to };
        let Some(key) = job.command.routing_key() else {
            let engine = Arc::clone(&self.engine);
            let replies = self.replies.clone();
            tokio::spawn(async move { run_job(&engine, job, &replies).await });
            return;
        };
        let lane = lane_index(&key, self.senders.len());
        match self.senders.get(lane) {
            Some(sender) => {
                if sender.send(job).await.is_err() {
                    warn!(%key, lane, "Lane worker gone, message dropped");
                }
            }
            None => warn!(%key, lane, "No such lane, message dropped"),
        }
    }

    /// Stop accepting work and wait for every queued message to finish.
    pub async fn shutdown(self) {
        drop(self.senders);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Lane worker failed");
            }
        }
    }
}

async fn run_job(engine: &Engine, job: Job, replies: &mpsc::UnboundedSender<Reply>) {
    let body = dispatch(engine, job.command).await;
    if let Some(to) = job.reply_to
        && replies.send(Reply { to, body }).is_err()
    {
        debug!("Reply publisher gone, reply dropped");
    }
}

/// Subscribe to both ingestion subjects and feed them into `lanes`.
///
/// Returns the two listener tasks; abort them to stop ingestion.
///
/// # Errors
///
/// Returns [`EngineBinError::Nats`] if a subscription fails.
pub async fn spawn_listeners(
    client: &async_nats::Client,
    lanes: &Arc<Lanes>,
) -> Result<Vec<JoinHandle<()>>, EngineBinError> {
    let mut handles = Vec::with_capacity(2);
    for subject in [HEARTBEAT_SUBJECT, COMMAND_SUBJECT] {
        let mut sub = client
            .subscribe(subject.to_owned())
            .await
            .map_err(|e| EngineBinError::Nats {
                message: format!("failed to subscribe to {subject}: {e}"),
            })?;

        let client = client.clone();
        let lanes = Arc::clone(lanes);
        handles.push(tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let decoded = if subject == HEARTBEAT_SUBJECT {
                    decode_heartbeat(&msg.payload)
                } else {
                    decode_command(&msg.payload)
                };
                match decoded {
                    Ok(command) => lanes.submit(command, msg.reply).await,
                    Err(rejection) => {
                        if let Some(reply_to) = msg.reply {
                            send_reply(&client, reply_to, &rejection).await;
                        }
                    }
                }
            }
            info!(subject, "NATS subscription closed");
        }));
        info!(subject, "Listening");
    }
    Ok(handles)
}

/// Publish queued replies until every lane is gone.
///
/// Returns how many replies were published.
pub async fn publish_replies(client: async_nats::Client, mut replies: mpsc::UnboundedReceiver<Reply>) -> u64 {
    let mut published: u64 = 0;
    while let Some(reply) = replies.recv().await {
        send_reply(&client, reply.to, &reply.body).await;
        published = published.saturating_add(1);
    }
    published
}

/// Decode a heartbeat payload into its command.
///
/// # Errors
///
/// Returns the `decode` error envelope for an unreadable payload.
pub fn decode_heartbeat(payload: &[u8]) -> Result<Command, Value> {
    serde_json::from_slice::<HeartbeatReport>(payload)
        .map(|report| Command::Heartbeat(Box::new(report)))
        .map_err(|e| {
            warn!(error = %e, "Undecodable heartbeat dropped");
            decode_error(&e)
        })
}

/// Decode a command payload.
///
/// # Errors
///
/// Returns the `decode` error envelope for an unreadable payload.
pub fn decode_command(payload: &[u8]) -> Result<Command, Value> {
    serde_json::from_slice::<Command>(payload)
        .inspect(|command| debug!(command = command.name(), "Command received"))
        .map_err(|e| {
            warn!(error = %e, "Undecodable command rejected");
            decode_error(&e)
        })
}

/// Decode and ingest one heartbeat, bypassing the lanes.
pub async fn handle_heartbeat(engine: &Engine, payload: &[u8]) -> Value {
    match decode_heartbeat(payload) {
        Ok(command) => dispatch(engine, command).await,
        Err(rejection) => rejection,
    }
}

/// Decode and run one command, bypassing the lanes.
pub async fn handle_command(engine: &Engine, payload: &[u8]) -> Value {
    match decode_command(payload) {
        Ok(command) => dispatch(engine, command).await,
        Err(rejection) => rejection,
    }
}

fn decode_error(err: &serde_json::Error) -> Value {
    json!({
        "ok": false,
        "error": { "code": "decode", "message": err.to_string() },
    })
}

async fn send_reply(client: &async_nats::Client, reply_to: Subject, reply: &Value) {
    let payload = match serde_json::to_vec(reply) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Failed to encode reply");
            return;
        }
    };
    if let Err(e) = client.publish(reply_to, payload.into()).await {
        warn!(error = %e, "Failed to publish reply");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::DateTime;
    use reroll_core::clock::ManualClock;
    use reroll_core::config::RerollConfig;
    use reroll_core::notify::NullSink;
    use reroll_core::store::MemoryStore;
    use reroll_types::ParticipantId;

    use super::*;

    fn engine() -> Engine {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(DateTime::from_timestamp(1_000, 0).unwrap()));
        Engine::new(
            RerollConfig::default(),
            store.clone(),
            store,
            Arc::new(NullSink),
            clock,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn heartbeat_payload_is_ingested() {
        let engine = engine();
        let payload = br#"{"participant_id": 9, "instance_name": "Main", "timestamp": "1970-01-01T00:16:40Z", "fields": {"online_instances": ["Main"], "packs_opened_delta": 0}}"#;

        let reply = handle_heartbeat(&engine, payload).await;
        assert_eq!(reply["ok"], true);
        assert_eq!(reply["data"]["promoted"]["to"], "Active");
    }

    #[tokio::test]
    async fn garbage_is_a_decode_error() {
        let engine = engine();
        let reply = handle_command(&engine, b"{not json").await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"]["code"], "decode");

        let reply = handle_heartbeat(&engine, br#"{"participant_id": 1}"#).await;
        assert_eq!(reply["error"]["code"], "decode");
    }

    #[tokio::test]
    async fn command_errors_keep_their_code() {
        let engine = engine();
        let reply = handle_command(&engine, br#"{"command": "get_god_pack", "id": 4}"#).await;
        assert_eq!(reply["ok"], false);
        assert_eq!(reply["error"]["code"], "not_found");
    }

    #[test]
    fn an_entity_always_lands_on_the_same_lane() {
        let key = EntityKey::Participant(ParticipantId(42));
        let lane = lane_index(&key, LANE_COUNT);
        assert!(lane < LANE_COUNT);
        for _ in 0..10 {
            assert_eq!(lane_index(&key, LANE_COUNT), lane);
        }
        assert_eq!(lane_index(&key, 1), 0);
        assert_eq!(lane_index(&key, 0), 0);
    }

    #[tokio::test]
    async fn heartbeats_from_one_instance_apply_in_arrival_order() {
        let engine = Arc::new(engine());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lanes = Lanes::start(&engine, 4, tx);

        for secs in 901..=950 {
            let timestamp = DateTime::from_timestamp(secs, 0).unwrap().to_rfc3339();
            let payload = format!(
                r#"{{"participant_id": 7, "instance_name": "Main", "timestamp": "{timestamp}", "fields": {{"online_instances": ["Main"], "packs_opened_delta": 1}}}}"#
            );
            let command = decode_heartbeat(payload.as_bytes()).unwrap();
            lanes.submit(command, Some(Subject::from(format!("reply.{secs}")))).await;
        }
        lanes.shutdown().await;

        let mut replies = Vec::new();
        while let Some(reply) = rx.recv().await {
            replies.push(reply);
        }
        assert_eq!(replies.len(), 50);
        assert!(replies.iter().all(|r| r.body["ok"] == true));

        let participant = engine.get_participant(ParticipantId(7)).await.unwrap();
        assert_eq!(participant.packs_opened, 50);
    }

    #[tokio::test]
    async fn queries_bypass_the_lanes() {
        let engine = Arc::new(engine());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lanes = Lanes::start(&engine, 2, tx);

        let command = decode_command(br#"{"command": "get_god_pack", "id": 4}"#).unwrap();
        assert!(command.routing_key().is_none());
        lanes.submit(command, Some(Subject::from("reply.query"))).await;

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.to.as_str(), "reply.query");
        assert_eq!(reply.body["error"]["code"], "not_found");
        lanes.shutdown().await;
    }
}
