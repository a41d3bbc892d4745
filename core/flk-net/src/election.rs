//! Master election.
//!
//! A liveness-oriented bully-style protocol for a trusted LAN. Every node
//! carries a priority; silence from the master forces a new election term,
//! candidates broadcast their candidacy, voters pick the best candidate they
//! have heard in the term and the tally resolves ties deterministically by
//! (priority descending, identity ascending).
//!
//! The state machine is pure: callers feed it messages and clock readings
//! and it returns the actions (broadcasts, role changes) to perform.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info};

use flk_protocol::{
    MasterAnnouncePayload, MasterElectionPayload, MasterResignPayload, MasterVotePayload,
    RoleChangePayload,
};

use crate::{ELECTION_TIMEOUT_SECS, MASTER_ANNOUNCE_INTERVAL_SECS, MASTER_TIMEOUT_SECS};

/// Current role of this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// Known master, as last announced.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterInfo {
    pub identity: String,
    pub priority: f32,
    pub term: i32,
}

/// Election state. Transitions are serialized through the protocol tick.
#[derive(Debug, Clone)]
pub enum MasterState {
    Follower {
        master: Option<MasterInfo>,
        last_announcement_secs: f64,
    },
    Electing {
        term: i32,
        /// Candidates heard this term, with their priorities.
        candidates: BTreeMap<String, f32>,
        /// Last vote heard per voter.
        votes: HashMap<String, String>,
        started_secs: f64,
        /// What we last voted for, to avoid re-broadcasting the same vote.
        our_vote: Option<String>,
    },
    Leader {
        term: i32,
        last_announce_secs: f64,
    },
}

/// Actions the caller must perform after feeding the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ElectionAction {
    Announce(MasterAnnouncePayload),
    StartElection(MasterElectionPayload),
    Vote(MasterVotePayload),
    RoleChange(RoleChangePayload),
    BecameLeader { term: i32 },
    BecameFollower { master: Option<String>, term: i32 },
}

/// The election state machine for one node.
pub struct Election {
    identity: String,
    priority: f32,
    can_be_master: bool,
    state: MasterState,
    highest_term_heard: i32,
}

impl Election {
    pub fn new(identity: String, priority: f32, can_be_master: bool, now_secs: f64) -> Self {
        Self {
            identity,
            priority,
            can_be_master,
            state: MasterState::Follower {
                master: None,
                last_announcement_secs: now_secs,
            },
            highest_term_heard: 0,
        }
    }

    pub fn role(&self) -> Role {
        match self.state {
            MasterState::Leader { .. } => Role::Leader,
            _ => Role::Follower,
        }
    }

    pub fn is_master(&self) -> bool {
        self.role() == Role::Leader
    }

    pub fn current_term(&self) -> i32 {
        match &self.state {
            MasterState::Leader { term, .. } | MasterState::Electing { term, .. } => *term,
            MasterState::Follower { master, .. } => master.as_ref().map_or(0, |m| m.term),
        }
    }

    pub fn master_identity(&self) -> Option<String> {
        match &self.state {
            MasterState::Leader { .. } => Some(self.identity.clone()),
            MasterState::Follower { master, .. } => master.as_ref().map(|m| m.identity.clone()),
            MasterState::Electing { .. } => None,
        }
    }

    pub fn master_info(&self) -> Option<MasterInfo> {
        match &self.state {
            MasterState::Leader { term, .. } => Some(MasterInfo {
                identity: self.identity.clone(),
                priority: self.priority,
                term: *term,
            }),
            MasterState::Follower { master, .. } => master.clone(),
            MasterState::Electing { .. } => None,
        }
    }

    pub fn set_priority(&mut self, priority: f32) {
        self.priority = priority.clamp(0.0, 1.0);
    }

    pub fn set_can_be_master(&mut self, can_be_master: bool) {
        self.can_be_master = can_be_master;
    }

    /// Periodic driver. Checks master silence, election timeouts and the
    /// announce cadence.
    pub fn tick(&mut self, now_secs: f64) -> Vec<ElectionAction> {
        match &mut self.state {
            MasterState::Follower {
                last_announcement_secs,
                ..
            } => {
                if now_secs - *last_announcement_secs > MASTER_TIMEOUT_SECS && self.can_be_master {
                    return self.start_election(now_secs);
                }
                Vec::new()
            }

            MasterState::Electing { started_secs, .. } => {
                if now_secs - *started_secs >= ELECTION_TIMEOUT_SECS {
                    return self.finish_election(now_secs);
                }
                Vec::new()
            }

            MasterState::Leader {
                last_announce_secs, ..
            } => {
                if now_secs - *last_announce_secs >= MASTER_ANNOUNCE_INTERVAL_SECS {
                    *last_announce_secs = now_secs;
                    return vec![ElectionAction::Announce(self.announce_payload())];
                }
                Vec::new()
            }
        }
    }

    /// Force this node to become the master immediately (operator override).
    pub fn force_leadership(&mut self, now_secs: f64) -> Vec<ElectionAction> {
        let term = self.highest_term_heard + 1;
        self.become_leader(term, now_secs)
    }

    /// Voluntary step-down: rejoin as a follower and tell the LAN.
    pub fn resign(&mut self, now_secs: f64) -> Vec<ElectionAction> {
        if !self.is_master() {
            return Vec::new();
        }
        let term = self.current_term();
        info!(term, "resigning master role");
        self.state = MasterState::Follower {
            master: None,
            last_announcement_secs: now_secs,
        };
        vec![
            ElectionAction::BecameFollower { master: None, term },
            ElectionAction::RoleChange(RoleChangePayload {
                identity: self.identity.clone(),
                is_master: false,
                term,
            }),
        ]
    }

    /// A master announced itself.
    pub fn handle_announcement(
        &mut self,
        payload: &MasterAnnouncePayload,
        now_secs: f64,
    ) -> Vec<ElectionAction> {
        self.highest_term_heard = self.highest_term_heard.max(payload.term);

        if payload.identity == self.identity {
            return Vec::new();
        }

        match &mut self.state {
            MasterState::Leader { term, .. } => {
                let demote = payload.term > *term
                    || (payload.term == *term && Self::outranks(payload, &self.identity, self.priority));
                if demote {
                    info!(
                        new_master = %payload.identity,
                        term = payload.term,
                        "demoting: saw a stronger announcement"
                    );
                    let term = payload.term;
                    self.state = MasterState::Follower {
                        master: Some(MasterInfo {
                            identity: payload.identity.clone(),
                            priority: payload.priority,
                            term,
                        }),
                        last_announcement_secs: now_secs,
                    };
                    return vec![
                        ElectionAction::BecameFollower {
                            master: Some(payload.identity.clone()),
                            term,
                        },
                        ElectionAction::RoleChange(RoleChangePayload {
                            identity: self.identity.clone(),
                            is_master: false,
                            term,
                        }),
                    ];
                }
                Vec::new()
            }

            MasterState::Electing { term, .. } => {
                if payload.term >= *term {
                    debug!(master = %payload.identity, "announcement ends election");
                    let term = payload.term;
                    self.state = MasterState::Follower {
                        master: Some(MasterInfo {
                            identity: payload.identity.clone(),
                            priority: payload.priority,
                            term,
                        }),
                        last_announcement_secs: now_secs,
                    };
                    return vec![ElectionAction::BecameFollower {
                        master: Some(payload.identity.clone()),
                        term,
                    }];
                }
                Vec::new()
            }

            MasterState::Follower {
                master,
                last_announcement_secs,
            } => {
                let current_term = master.as_ref().map_or(-1, |m| m.term);
                if payload.term >= current_term {
                    let changed = master.as_ref().map(|m| m.identity.as_str())
                        != Some(payload.identity.as_str());
                    *master = Some(MasterInfo {
                        identity: payload.identity.clone(),
                        priority: payload.priority,
                        term: payload.term,
                    });
                    *last_announcement_secs = now_secs;
                    if changed {
                        return vec![ElectionAction::BecameFollower {
                            master: Some(payload.identity.clone()),
                            term: payload.term,
                        }];
                    }
                }
                Vec::new()
            }
        }
    }

    /// A candidacy was broadcast.
    pub fn handle_election(
        &mut self,
        payload: &MasterElectionPayload,
        now_secs: f64,
    ) -> Vec<ElectionAction> {
        self.highest_term_heard = self.highest_term_heard.max(payload.term);

        if payload.candidate == self.identity {
            return Vec::new();
        }

        let mut actions = Vec::new();

        // Enter the election if the candidacy is for a newer term than
        // whatever we are doing; stale candidacies are ignored.
        let join = match &self.state {
            MasterState::Electing { term, .. } => payload.term > *term,
            MasterState::Leader { term, .. } => payload.term > *term,
            MasterState::Follower { master, .. } => {
                payload.term > master.as_ref().map_or(0, |m| m.term)
            }
        };
        if join {
            if self.is_master() {
                // A newer term supersedes our leadership.
                actions.push(ElectionAction::BecameFollower {
                    master: None,
                    term: payload.term,
                });
            }
            actions.extend(self.enter_election(payload.term, now_secs));
        }

        if let MasterState::Electing {
            term,
            candidates,
            votes,
            our_vote,
            ..
        } = &mut self.state
        {
            if payload.term == *term {
                candidates.insert(payload.candidate.clone(), payload.priority);

                // Vote for the best candidate heard so far this term.
                let best = Self::best_candidate(candidates);
                if let Some(best) = best {
                    if our_vote.as_deref() != Some(best.as_str()) {
                        *our_vote = Some(best.clone());
                        votes.insert(self.identity.clone(), best.clone());
                        actions.push(ElectionAction::Vote(MasterVotePayload {
                            candidate: best,
                            voter: self.identity.clone(),
                            term: *term,
                        }));
                    }
                }
            }
        }

        actions
    }

    /// A vote was broadcast.
    pub fn handle_vote(&mut self, payload: &MasterVotePayload) {
        self.highest_term_heard = self.highest_term_heard.max(payload.term);

        if let MasterState::Electing { term, votes, .. } = &mut self.state {
            if payload.term == *term {
                votes.insert(payload.voter.clone(), payload.candidate.clone());
            }
        }
    }

    /// The master stepped down. Resignations carrying our own identity are
    /// echoes of our own past leadership and are ignored.
    pub fn handle_resign(
        &mut self,
        payload: &MasterResignPayload,
        now_secs: f64,
    ) -> Vec<ElectionAction> {
        if payload.identity == self.identity {
            return Vec::new();
        }

        if let MasterState::Follower { master, .. } = &self.state {
            if master.as_ref().map(|m| m.identity.as_str()) == Some(payload.identity.as_str())
                && self.can_be_master
            {
                info!(master = %payload.identity, "master resigned, starting election");
                return self.start_election(now_secs);
            }
        }
        Vec::new()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn announce_payload(&self) -> MasterAnnouncePayload {
        MasterAnnouncePayload {
            identity: self.identity.clone(),
            priority: self.priority,
            term: self.current_term(),
        }
    }

    /// True when `payload` beats `(identity, priority)` in the
    /// deterministic tie-break: priority descending, identity ascending.
    fn outranks(payload: &MasterAnnouncePayload, identity: &str, priority: f32) -> bool {
        payload.priority > priority
            || (payload.priority == priority && payload.identity.as_str() < identity)
    }

    fn best_candidate(candidates: &BTreeMap<String, f32>) -> Option<String> {
        candidates
            .iter()
            .max_by(|(id_a, prio_a), (id_b, prio_b)| {
                prio_a
                    .total_cmp(prio_b)
                    .then_with(|| id_b.cmp(id_a)) // smaller identity wins
            })
            .map(|(id, _)| id.clone())
    }

    fn start_election(&mut self, now_secs: f64) -> Vec<ElectionAction> {
        let term = self.highest_term_heard + 1;
        self.highest_term_heard = term;

        info!(term, "starting master election");

        let mut candidates = BTreeMap::new();
        let mut votes = HashMap::new();
        let mut actions = Vec::new();
        let mut our_vote = None;

        if self.can_be_master {
            candidates.insert(self.identity.clone(), self.priority);
            votes.insert(self.identity.clone(), self.identity.clone());
            our_vote = Some(self.identity.clone());
            actions.push(ElectionAction::StartElection(MasterElectionPayload {
                candidate: self.identity.clone(),
                priority: self.priority,
                term,
            }));
            actions.push(ElectionAction::Vote(MasterVotePayload {
                candidate: self.identity.clone(),
                voter: self.identity.clone(),
                term,
            }));
        }

        self.state = MasterState::Electing {
            term,
            candidates,
            votes,
            started_secs: now_secs,
            our_vote,
        };
        actions
    }

    /// Join an election started elsewhere, declaring our own candidacy if
    /// we are eligible.
    fn enter_election(&mut self, term: i32, now_secs: f64) -> Vec<ElectionAction> {
        self.highest_term_heard = self.highest_term_heard.max(term);

        let mut candidates = BTreeMap::new();
        let mut votes = HashMap::new();
        let mut actions = Vec::new();

        if self.can_be_master {
            candidates.insert(self.identity.clone(), self.priority);
            votes.insert(self.identity.clone(), self.identity.clone());
            actions.push(ElectionAction::StartElection(MasterElectionPayload {
                candidate: self.identity.clone(),
                priority: self.priority,
                term,
            }));
        }

        self.state = MasterState::Electing {
            term,
            candidates,
            votes,
            started_secs: now_secs,
            our_vote: self.can_be_master.then(|| self.identity.clone()),
        };
        actions
    }

    fn finish_election(&mut self, now_secs: f64) -> Vec<ElectionAction> {
        let MasterState::Electing {
            term,
            candidates,
            votes,
            ..
        } = &self.state
        else {
            return Vec::new();
        };
        let term = *term;

        // Tally: votes per candidate, ties by (priority desc, identity asc).
        let mut counts: HashMap<&str, u32> = HashMap::new();
        for candidate in votes.values() {
            *counts.entry(candidate.as_str()).or_default() += 1;
        }

        let winner = candidates
            .iter()
            .map(|(id, prio)| (counts.get(id.as_str()).copied().unwrap_or(0), *prio, id))
            .max_by(|(votes_a, prio_a, id_a), (votes_b, prio_b, id_b)| {
                votes_a
                    .cmp(votes_b)
                    .then_with(|| prio_a.total_cmp(prio_b))
                    .then_with(|| id_b.cmp(id_a)) // smaller identity wins
            })
            .map(|(_, _, id)| id.clone());

        match winner {
            Some(winner) if winner == self.identity => self.become_leader(term, now_secs),
            Some(winner) => {
                info!(master = %winner, term, "election finished, following winner");
                let priority = candidates.get(&winner).copied().unwrap_or(0.0);
                self.state = MasterState::Follower {
                    master: Some(MasterInfo {
                        identity: winner.clone(),
                        priority,
                        term,
                    }),
                    last_announcement_secs: now_secs,
                };
                vec![ElectionAction::BecameFollower {
                    master: Some(winner),
                    term,
                }]
            }
            // No candidates at all (nobody eligible): wait for someone.
            None => {
                self.state = MasterState::Follower {
                    master: None,
                    last_announcement_secs: now_secs,
                };
                vec![ElectionAction::BecameFollower { master: None, term }]
            }
        }
    }

    fn become_leader(&mut self, term: i32, now_secs: f64) -> Vec<ElectionAction> {
        info!(term, "assuming master role");
        self.highest_term_heard = self.highest_term_heard.max(term);
        self.state = MasterState::Leader {
            term,
            last_announce_secs: now_secs,
        };
        vec![
            ElectionAction::BecameLeader { term },
            ElectionAction::Announce(self.announce_payload()),
            ElectionAction::RoleChange(RoleChangePayload {
                identity: self.identity.clone(),
                is_master: true,
                term,
            }),
        ]
    }
}
