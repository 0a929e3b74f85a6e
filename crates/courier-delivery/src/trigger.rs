//! Immediate trigger: one round per accepted message.
//!
//! The accepting request only enqueues the message's destination id on a
//! bounded channel and returns. A dispatcher task drains the channel and
//! spawns a round per id, so a slow destination never holds up another.
//! A burst of requests for one destination costs at most two rounds.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use courier_core::{DestinationId, Message};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::{self, JoinError, JoinSet},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{DeliveryEngine, RoundReport};

/// Sending half of the immediate trigger. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TriggerHandle {
    sender: mpsc::Sender<DestinationId>,
}

impl TriggerHandle {
    /// Requests a round for the message's destination without waiting.
    ///
    /// Returns `false` when the request was dropped because the queue is
    /// full or the dispatcher has stopped. The message stays queued either
    /// way and is picked up by the next sweep.
    pub fn fire(&self, message: &Message) -> bool {
        match self.sender.try_send(message.destination_id) {
            Ok(()) => {
                debug!(
                    message_id = %message.id,
                    destination_id = %message.destination_id,
                    "immediate trigger fired"
                );
                true
            },
            Err(TrySendError::Full(id)) => {
                warn!(destination_id = %id, "trigger queue full, deferring to next sweep");
                false
            },
            Err(TrySendError::Closed(id)) => {
                warn!(destination_id = %id, "trigger dispatcher stopped, deferring to next sweep");
                false
            },
        }
    }
}

/// Receiving half of the immediate trigger.
#[derive(Debug)]
pub struct ImmediateTrigger {
    receiver: mpsc::Receiver<DestinationId>,
}

impl ImmediateTrigger {
    /// Creates a trigger queue holding at most `capacity` pending requests.
    pub fn new(capacity: usize) -> (TriggerHandle, Self) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (TriggerHandle { sender }, Self { receiver })
    }

    /// Dispatches rounds until `token` is cancelled or every handle is gone,
    /// then waits for rounds still in flight.
    ///
    /// Requests for a destination whose round is already running collapse
    /// into a single follow-up round, started once the current one ends.
    pub async fn run(mut self, engine: Arc<DeliveryEngine>, token: CancellationToken) {
        info!("trigger dispatcher started");

        let mut rounds = Rounds::new(engine);

        loop {
            tokio::select! {
                () = token.cancelled() => break,
                received = self.receiver.recv() => match received {
                    Some(id) => rounds.request(id),
                    None => break,
                },
                Some(joined) = rounds.tasks.join_next_with_id(), if !rounds.tasks.is_empty() => {
                    rounds.finished(joined, true);
                },
            }
        }

        self.receiver.close();

        while let Some(joined) = rounds.tasks.join_next_with_id().await {
            rounds.finished(joined, false);
        }

        info!("trigger dispatcher stopped");
    }
}

/// Rounds spawned by the dispatcher, at most one running per destination.
struct Rounds {
    engine: Arc<DeliveryEngine>,
    tasks: JoinSet<RoundReport>,
    running: HashMap<task::Id, DestinationId>,
    follow_up: HashSet<DestinationId>,
}

impl Rounds {
    fn new(engine: Arc<DeliveryEngine>) -> Self {
        Self {
            engine,
            tasks: JoinSet::new(),
            running: HashMap::new(),
            follow_up: HashSet::new(),
        }
    }

    fn request(&mut self, id: DestinationId) {
        if self.running.values().any(|running| *running == id) {
            if self.follow_up.insert(id) {
                debug!(destination_id = %id, "round already running, queued one follow-up");
            }
            return;
        }

        self.spawn(id);
    }

    fn spawn(&mut self, id: DestinationId) {
        let engine = Arc::clone(&self.engine);
        let handle = self.tasks.spawn(async move { engine.process_destination(id).await });
        self.running.insert(handle.id(), id);
    }

    fn finished(&mut self, joined: Result<(task::Id, RoundReport), JoinError>, accepting: bool) {
        let task = match &joined {
            Ok((task, _)) => *task,
            Err(e) => e.id(),
        };
        let Some(id) = self.running.remove(&task) else {
            return;
        };

        match joined {
            Ok((_, report)) => debug!(
                destination_id = %id,
                outcome = ?report.outcome,
                "triggered round finished"
            ),
            Err(e) => error!(destination_id = %id, error = %e, "triggered round panicked"),
        }

        // Once stopping, pending follow-ups are left to the next sweep.
        if self.follow_up.remove(&id) && accepting {
            self.spawn(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use courier_core::MessageId;

    use super::*;

    fn message(destination_id: i64) -> Message {
        Message {
            id: MessageId(1),
            destination_id: DestinationId(destination_id),
            body: b"x".to_vec(),
            content_type: "text/plain".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn fire_enqueues_destination_id() {
        let (handle, mut trigger) = ImmediateTrigger::new(4);

        assert!(handle.fire(&message(9)));
        assert_eq!(trigger.receiver.recv().await, Some(DestinationId(9)));
    }

    #[tokio::test]
    async fn fire_on_full_queue_is_dropped() {
        let (handle, _trigger) = ImmediateTrigger::new(1);

        assert!(handle.fire(&message(1)));
        assert!(!handle.fire(&message(2)));
    }

    #[tokio::test]
    async fn fire_after_dispatcher_gone_is_dropped() {
        let (handle, trigger) = ImmediateTrigger::new(1);
        drop(trigger);

        assert!(!handle.fire(&message(1)));
    }
}
