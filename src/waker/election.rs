//! Bully election as a pure state machine.
//!
//! The elector never touches the network or the clock. Every input returns a
//! `Step` listing the datagrams to send and, when an election round starts,
//! the round whose timeout the caller must arm. Stale timeouts are ignored by
//! round number, so re-delivered or reordered messages are harmless.

use super::types::{ElectionState, WakerMessage};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Step {
    /// `(peer id, message)` pairs.
    pub outgoing: Vec<(String, WakerMessage)>,
    pub arm_timer: Option<u64>,
}

impl Step {
    fn merge(&mut self, other: Step) {
        self.outgoing.extend(other.outgoing);
        if other.arm_timer.is_some() {
            self.arm_timer = other.arm_timer;
        }
    }
}

pub struct Elector {
    id: String,
    peers: Vec<String>,
    state: ElectionState,
    round: u64,
}

impl Elector {
    pub fn new(id: impl Into<String>, peers: Vec<String>) -> Self {
        let id = id.into();
        let peers = peers.into_iter().filter(|p| *p != id).collect();
        Self {
            id,
            peers,
            state: ElectionState::Electing { acked: false },
            round: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &ElectionState {
        &self.state
    }

    pub fn leader(&self) -> Option<&str> {
        match &self.state {
            ElectionState::Leader => Some(&self.id),
            ElectionState::Follower { leader } => Some(leader),
            ElectionState::Electing { .. } => None,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.state == ElectionState::Leader
    }

    pub fn round(&self) -> u64 {
        self.round
    }

    /// Challenges every higher peer; with none, claims leadership at once.
    pub fn start_election(&mut self) -> Step {
        self.round += 1;
        let higher: Vec<&String> = self.peers.iter().filter(|p| **p > self.id).collect();
        if higher.is_empty() {
            return self.proclaim();
        }
        tracing::debug!("{} starts election round {}", self.id, self.round);
        self.state = ElectionState::Electing { acked: false };
        Step {
            outgoing: higher
                .into_iter()
                .map(|peer| {
                    (
                        peer.clone(),
                        WakerMessage::Election {
                            from: self.id.clone(),
                        },
                    )
                })
                .collect(),
            arm_timer: Some(self.round),
        }
    }

    fn proclaim(&mut self) -> Step {
        if self.state != ElectionState::Leader {
            tracing::info!("{} is the new leader", self.id);
        }
        self.state = ElectionState::Leader;
        Step {
            outgoing: self
                .peers
                .iter()
                .map(|peer| {
                    (
                        peer.clone(),
                        WakerMessage::Coordinator {
                            from: self.id.clone(),
                        },
                    )
                })
                .collect(),
            arm_timer: None,
        }
    }

    pub fn on_message(&mut self, msg: &WakerMessage) -> Step {
        match msg {
            WakerMessage::Election { from } if *from < self.id => {
                let mut step = Step {
                    outgoing: vec![(
                        from.clone(),
                        WakerMessage::Ack {
                            from: self.id.clone(),
                        },
                    )],
                    arm_timer: None,
                };
                if !matches!(self.state, ElectionState::Electing { .. }) {
                    step.merge(self.start_election());
                }
                step
            }
            WakerMessage::Ack { from } if *from > self.id => {
                if let ElectionState::Electing { acked } = &mut self.state {
                    *acked = true;
                }
                Step::default()
            }
            WakerMessage::Coordinator { from } if *from > self.id => {
                if self.leader() != Some(from.as_str()) {
                    tracing::info!("{} follows leader {}", self.id, from);
                }
                self.state = ElectionState::Follower {
                    leader: from.clone(),
                };
                Step::default()
            }
            WakerMessage::Coordinator { from } if *from < self.id => {
                if self.is_leader() {
                    Step {
                        outgoing: vec![(
                            from.clone(),
                            WakerMessage::Coordinator {
                                from: self.id.clone(),
                            },
                        )],
                        arm_timer: None,
                    }
                } else {
                    self.start_election()
                }
            }
            _ => Step::default(),
        }
    }

    /// Without an `Ack` the round is won; with one, the promised
    /// `Coordinator` never came and the election starts over.
    pub fn on_election_timeout(&mut self, round: u64) -> Step {
        if round != self.round {
            return Step::default();
        }
        match self.state {
            ElectionState::Electing { acked: false } => self.proclaim(),
            ElectionState::Electing { acked: true } => self.start_election(),
            _ => Step::default(),
        }
    }

    pub fn on_leader_lost(&mut self) -> Step {
        tracing::warn!("{} lost its leader, re-electing", self.id);
        self.start_election()
    }
}
