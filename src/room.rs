//! Broadcast room.
//!
//! The room tracks joined connections and a bounded replay history. All
//! mutation happens inside a single actor task fed by an mpsc queue, so
//! `join`, `leave` and `deliver` are totally ordered no matter which worker
//! thread submits them. A member that joins concurrently with a delivery
//! therefore sees the frame exactly once: either in its join-time replay or
//! in the fan-out, depending on which command the actor processes first.
//!
//! The room never owns connections. Members are held as weak [`Peer`]
//! handles and are dropped as soon as a delivery finds them gone.

use crate::connection::{ConnectionId, Peer};
use crate::frame::MessageFrame;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Maximum number of frames kept for replay.
pub const MAX_HISTORY: usize = 100;

/// Commands accepted by the room actor.
#[derive(Debug)]
enum RoomCommand {
    Join { id: ConnectionId, peer: Peer },
    Leave { id: ConnectionId },
    Deliver { frame: MessageFrame },
    Stats { reply: oneshot::Sender<RoomStats> },
}

/// Point-in-time view of the room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomStats {
    /// Currently joined members.
    pub members: usize,
    /// Frames held in the replay history.
    pub history: usize,
    /// Frames delivered since the room started.
    pub delivered: u64,
}

/// Handle to the room actor. Cheap to clone; the actor stops once every
/// handle is dropped.
#[derive(Debug, Clone)]
pub struct Room {
    tx: mpsc::UnboundedSender<RoomCommand>,
}

impl Room {
    /// Start the room actor on the current runtime.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(RoomState::new().run(rx));
        Room { tx }
    }

    /// Add a member and replay the current history to it.
    pub fn join(&self, id: ConnectionId, peer: Peer) {
        self.submit(RoomCommand::Join { id, peer });
    }

    /// Remove a member. Leaving twice is harmless.
    pub fn leave(&self, id: ConnectionId) {
        self.submit(RoomCommand::Leave { id });
    }

    /// Record a frame in history and send it to every member.
    pub fn deliver(&self, frame: MessageFrame) {
        self.submit(RoomCommand::Deliver { frame });
    }

    /// Fetch room statistics. Every command submitted before this call has
    /// been applied by the time the result is returned.
    pub async fn stats(&self) -> Option<RoomStats> {
        let (reply, rx) = oneshot::channel();
        self.submit(RoomCommand::Stats { reply });
        rx.await.ok()
    }

    fn submit(&self, command: RoomCommand) {
        if self.tx.send(command).is_err() {
            warn!("Room actor has stopped, command dropped");
        }
    }
}

/// State owned by the room actor.
struct RoomState {
    members: BTreeMap<ConnectionId, Peer>,
    history: VecDeque<MessageFrame>,
    delivered: u64,
}

impl RoomState {
    fn new() -> Self {
        Self {
            members: BTreeMap::new(),
            history: VecDeque::with_capacity(MAX_HISTORY),
            delivered: 0,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomCommand>) {
        while let Some(command) = rx.recv().await {
            self.apply(command);
        }
        debug!(members = self.members.len(), "Room actor stopped");
    }

    fn apply(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::Join { id, peer } => self.join(id, peer),
            RoomCommand::Leave { id } => self.leave(id),
            RoomCommand::Deliver { frame } => self.deliver(frame),
            RoomCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    fn join(&mut self, id: ConnectionId, peer: Peer) {
        for frame in &self.history {
            if !peer.deliver(frame.clone()) {
                debug!(conn_id = id, "Connection gone before replay finished");
                return;
            }
        }
        trace!(conn_id = id, replayed = self.history.len(), "Member joined");
        self.members.insert(id, peer);
    }

    fn leave(&mut self, id: ConnectionId) {
        if self.members.remove(&id).is_some() {
            trace!(conn_id = id, members = self.members.len(), "Member left");
        }
    }

    fn deliver(&mut self, frame: MessageFrame) {
        self.history.push_back(frame.clone());
        while self.history.len() > MAX_HISTORY {
            self.history.pop_front();
        }
        self.delivered += 1;

        let mut gone = Vec::new();
        for (&id, peer) in &self.members {
            if !peer.deliver(frame.clone()) {
                gone.push(id);
            }
        }
        for id in gone {
            debug!(conn_id = id, "Dropping member whose connection is gone");
            self.members.remove(&id);
        }

        trace!(
            msg_type = frame.msg_type(),
            body_size = frame.body_size(),
            members = self.members.len(),
            "Frame delivered"
        );
    }

    fn stats(&self) -> RoomStats {
        RoomStats {
            members: self.members.len(),
            history: self.history.len(),
            delivered: self.delivered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Outbox;

    fn frame(n: usize) -> MessageFrame {
        MessageFrame::new(9, n.to_string().into_bytes()).unwrap()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<MessageFrame>) -> Vec<MessageFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_history_is_bounded() {
        let mut room = RoomState::new();
        for n in 0..=MAX_HISTORY {
            room.deliver(frame(n));
            assert!(room.history.len() <= MAX_HISTORY);
        }

        assert_eq!(room.history.len(), MAX_HISTORY);
        assert_eq!(room.history.front(), Some(&frame(1)));
        assert_eq!(room.history.back(), Some(&frame(MAX_HISTORY)));
        assert!(!room.history.contains(&frame(0)));
    }

    #[test]
    fn test_join_replays_history_in_order() {
        let mut room = RoomState::new();
        for n in 0..3 {
            room.deliver(frame(n));
        }

        let (outbox, mut rx) = Outbox::new();
        room.join(1, outbox.peer());
        assert_eq!(drain(&mut rx), vec![frame(0), frame(1), frame(2)]);

        room.deliver(frame(3));
        assert_eq!(drain(&mut rx), vec![frame(3)]);
    }

    #[test]
    fn test_late_join_sees_last_hundred() {
        let mut room = RoomState::new();
        for n in 0..150 {
            room.deliver(frame(n));
        }

        let (outbox, mut rx) = Outbox::new();
        room.join(7, outbox.peer());
        let replayed = drain(&mut rx);
        assert_eq!(replayed.len(), MAX_HISTORY);
        assert_eq!(replayed.first(), Some(&frame(50)));
        assert_eq!(replayed.last(), Some(&frame(149)));
    }

    #[test]
    fn test_fan_out_reaches_each_member_once() {
        let mut room = RoomState::new();
        let (a, mut rx_a) = Outbox::new();
        let (b, mut rx_b) = Outbox::new();
        room.join(1, a.peer());
        room.join(2, b.peer());

        room.deliver(frame(42));
        assert_eq!(drain(&mut rx_a), vec![frame(42)]);
        assert_eq!(drain(&mut rx_b), vec![frame(42)]);
    }

    #[test]
    fn test_leave_is_idempotent() {
        let mut room = RoomState::new();
        let (outbox, mut rx) = Outbox::new();
        room.join(1, outbox.peer());

        room.leave(1);
        room.leave(1);
        room.leave(99);
        assert_eq!(room.stats().members, 0);

        room.deliver(frame(0));
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_vanished_member_is_dropped() {
        let mut room = RoomState::new();
        let (outbox, rx) = Outbox::new();
        room.join(1, outbox.peer());
        drop(outbox);
        drop(rx);

        room.deliver(frame(0));
        assert_eq!(room.stats().members, 0);
        assert_eq!(room.stats().history, 1);
    }

    #[tokio::test]
    async fn test_actor_orders_join_and_deliver() {
        let room = Room::spawn();
        let (a, mut rx_a) = Outbox::new();
        room.join(1, a.peer());
        room.deliver(frame(0));

        // B joins after the first delivery and before the second
        let (b, mut rx_b) = Outbox::new();
        room.join(2, b.peer());
        room.deliver(frame(1));

        let stats = room.stats().await.unwrap();
        assert_eq!(
            stats,
            RoomStats {
                members: 2,
                history: 2,
                delivered: 2
            }
        );

        assert_eq!(drain(&mut rx_a), vec![frame(0), frame(1)]);
        assert_eq!(drain(&mut rx_b), vec![frame(0), frame(1)]);
    }

    #[tokio::test]
    async fn test_concurrent_joins_see_every_frame_once() {
        let room = Room::spawn();
        let mut receivers = Vec::new();
        let mut outboxes = Vec::new();

        let mut tasks = Vec::new();
        for id in 0..8 {
            let (outbox, rx) = Outbox::new();
            receivers.push(rx);
            let peer = outbox.peer();
            outboxes.push(outbox);

            let room = room.clone();
            tasks.push(tokio::spawn(async move {
                room.deliver(frame(id));
                room.join(id, peer);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        room.stats().await.unwrap();

        for rx in &mut receivers {
            let mut seen: Vec<MessageFrame> = drain(rx);
            assert_eq!(seen.len(), 8);
            seen.sort_by(|a, b| a.body().cmp(b.body()));
            seen.dedup();
            assert_eq!(seen.len(), 8);
        }
    }
}
