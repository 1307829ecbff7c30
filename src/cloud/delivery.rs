//! Single tracked delivery with bounded waiting
//!
//! At most one publish is tracked at a time. A publisher first [`arm`]s the
//! tracker (before handing bytes to the transport), then calls
//! [`track_and_wait`] with the id the transport returned. Acknowledgements that
//! race ahead of `track_and_wait` are buffered on the armed slot so they are not
//! lost. Arming again supersedes whatever was tracked before.
//!
//! [`arm`]: DeliveryTracker::arm
//! [`track_and_wait`]: DeliveryTracker::track_and_wait

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::transport::{DeliveryId, QoS};

/// Acknowledgements buffered while armed; older ones are dropped past this
const MAX_EARLY_ACKS: usize = 64;

/// Transport acknowledgement kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// The message left the client
    Published,
    /// The broker confirmed the message
    Confirmed,
}

/// Result of waiting on a tracked delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Confirmed,
    TimedOut,
    /// A newer tracked publish replaced this one before it resolved
    Superseded,
}

/// Handle returned by [`DeliveryTracker::arm`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTicket {
    generation: u64,
}

#[derive(Debug, Clone, PartialEq)]
enum Slot {
    Idle,
    Armed {
        generation: u64,
        qos: QoS,
        early: Vec<(DeliveryId, Ack)>,
    },
    Awaiting {
        generation: u64,
        id: DeliveryId,
        qos: QoS,
    },
}

#[derive(Debug, Clone, PartialEq)]
struct TrackerState {
    slot: Slot,
    last_resolved: Option<u64>,
}

fn clears(qos: QoS, ack: Ack) -> bool {
    match ack {
        Ack::Confirmed => true,
        Ack::Published => qos == QoS::AtMostOnce,
    }
}

#[derive(Debug)]
pub struct DeliveryTracker {
    state: watch::Sender<TrackerState>,
    generations: AtomicU64,
}

impl Default for DeliveryTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryTracker {
    pub fn new() -> Self {
        let (state, _) = watch::channel(TrackerState {
            slot: Slot::Idle,
            last_resolved: None,
        });
        Self {
            state,
            generations: AtomicU64::new(0),
        }
    }

    /// Reset the tracked id and start a new tracked publish
    pub fn arm(&self, qos: QoS) -> DeliveryTicket {
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_modify(|state| {
            if let Slot::Awaiting { id, .. } = &state.slot {
                debug!(delivery_id = %id, "Tracked delivery superseded by a newer publish");
            }
            state.slot = Slot::Armed {
                generation,
                qos,
                early: Vec::new(),
            };
        });
        DeliveryTicket { generation }
    }

    /// Release an armed slot whose publish never reached the transport
    pub fn disarm(&self, ticket: DeliveryTicket) {
        self.state.send_if_modified(|state| match &state.slot {
            Slot::Armed { generation, .. } if *generation == ticket.generation => {
                state.slot = Slot::Idle;
                true
            }
            _ => false,
        });
    }

    /// Record the transport's id for the armed publish and wait (bounded) for it to resolve
    pub async fn track_and_wait(
        &self,
        ticket: DeliveryTicket,
        id: DeliveryId,
        timeout: Duration,
    ) -> DeliveryOutcome {
        let generation = ticket.generation;
        let mut outcome = None;

        self.state.send_if_modified(|state| {
            let armed = match &state.slot {
                Slot::Armed {
                    generation: current,
                    qos,
                    early,
                } if *current == generation => Some((
                    *qos,
                    early.iter().any(|(early_id, ack)| *early_id == id && clears(*qos, *ack)),
                )),
                _ => None,
            };

            match armed {
                Some((_, true)) => {
                    state.slot = Slot::Idle;
                    state.last_resolved = Some(generation);
                    outcome = Some(DeliveryOutcome::Confirmed);
                    true
                }
                Some((qos, false)) => {
                    state.slot = Slot::Awaiting { generation, id, qos };
                    true
                }
                None => {
                    outcome = Some(DeliveryOutcome::Superseded);
                    false
                }
            }
        });

        if let Some(outcome) = outcome {
            return outcome;
        }

        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|state| {
                !matches!(state.slot, Slot::Awaiting { generation: current, .. } if current == generation)
            }),
        )
        .await;

        match waited {
            Ok(Ok(state)) => {
                if state.last_resolved == Some(generation) {
                    DeliveryOutcome::Confirmed
                } else {
                    DeliveryOutcome::Superseded
                }
            }
            Ok(Err(_)) => DeliveryOutcome::Superseded,
            Err(_) => {
                let mut outcome = DeliveryOutcome::Superseded;
                self.state.send_if_modified(|state| {
                    if state.last_resolved == Some(generation) {
                        outcome = DeliveryOutcome::Confirmed;
                        return false;
                    }
                    match state.slot {
                        Slot::Awaiting {
                            generation: current,
                            ..
                        } if current == generation => {
                            state.slot = Slot::Idle;
                            outcome = DeliveryOutcome::TimedOut;
                            true
                        }
                        _ => false,
                    }
                });
                if outcome == DeliveryOutcome::TimedOut {
                    warn!(
                        delivery_id = %id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Timed out waiting for delivery confirmation"
                    );
                }
                outcome
            }
        }
    }

    /// Apply an acknowledgement. Returns true when it resolved the tracked delivery.
    pub fn resolve(&self, id: DeliveryId, ack: Ack) -> bool {
        let mut matched = false;
        self.state.send_if_modified(|state| {
            let resolves = match &mut state.slot {
                Slot::Awaiting {
                    generation,
                    id: tracked,
                    qos,
                } if *tracked == id && clears(*qos, ack) => Some(*generation),
                Slot::Armed { early, .. } => {
                    if early.len() >= MAX_EARLY_ACKS {
                        early.remove(0);
                    }
                    early.push((id, ack));
                    None
                }
                _ => None,
            };

            match resolves {
                Some(generation) => {
                    state.slot = Slot::Idle;
                    state.last_resolved = Some(generation);
                    matched = true;
                    true
                }
                None => false,
            }
        });
        matched
    }

    /// Id currently awaited, if any
    pub fn tracked(&self) -> Option<DeliveryId> {
        match self.state.borrow().slot {
            Slot::Awaiting { id, .. } => Some(id),
            _ => None,
        }
    }
}
