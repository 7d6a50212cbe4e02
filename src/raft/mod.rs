//! Raft leader election core: term/vote state machine, randomized election
//! timer, and leader heartbeats. Log replication is limited to the
//! consistency checks the append-entries receiver performs; there is no
//! leader-side replication driver yet.

mod grpc;
mod transport;

pub use grpc::{raft_service, GrpcRaftTransport, RaftRpcService};
pub use transport::{InMemoryNetwork, RaftTransport};

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

/// Base election timeout; each reset adds up to [`ELECTION_JITTER`] on top.
pub const DEFAULT_ELECTION_TIMEOUT: Duration = Duration::from_millis(150);
/// Randomized addition that keeps candidates from colliding forever.
pub const ELECTION_JITTER: Duration = Duration::from_millis(150);
/// Leader heartbeat period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
#[error("raft transport error: {0}")]
pub struct TransportError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct RequestVoteRequest {
    pub term: u64,
    pub candidate_id: String,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesRequest {
    pub term: u64,
    pub leader_id: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesResponse {
    pub term: u64,
    pub success: bool,
    pub conflict_term: u64,
    pub conflict_index: u64,
}

#[derive(Debug, Clone)]
pub struct RaftConfig {
    pub id: String,
    /// Peer node ids, excluding this node.
    pub peers: Vec<String>,
    pub election_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl RaftConfig {
    pub fn new(id: impl Into<String>, peers: Vec<String>) -> Self {
        RaftConfig {
            id: id.into(),
            peers,
            election_timeout: DEFAULT_ELECTION_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

struct RaftState {
    // Persistent in a full implementation; process-local here.
    current_term: u64,
    voted_for: Option<String>,
    /// log[0] is a sentinel entry at (index 0, term 0).
    log: Vec<LogEntry>,

    // Volatile.
    commit_index: u64,
    #[allow(dead_code)]
    last_applied: u64,
    role: NodeState,

    // Leader-only, reinitialized on every election win.
    next_index: HashMap<String, u64>,
    match_index: HashMap<String, u64>,
}

/// Cheaply cloneable node handle; clones share all state.
#[derive(Clone)]
pub struct RaftNode {
    id: String,
    peers: Vec<String>,
    election_timeout: Duration,
    heartbeat_interval: Duration,
    transport: Arc<dyn RaftTransport>,
    state: Arc<Mutex<RaftState>>,
    election_deadline: Arc<Mutex<Instant>>,
    shutdown: watch::Sender<bool>,
}

impl RaftNode {
    pub fn new(config: RaftConfig, transport: Arc<dyn RaftTransport>) -> Self {
        let (shutdown, _) = watch::channel(false);
        RaftNode {
            id: config.id,
            peers: config.peers,
            election_timeout: config.election_timeout,
            heartbeat_interval: config.heartbeat_interval,
            transport,
            state: Arc::new(Mutex::new(RaftState {
                current_term: 0,
                voted_for: None,
                log: vec![LogEntry {
                    index: 0,
                    term: 0,
                    command: Vec::new(),
                }],
                commit_index: 0,
                last_applied: 0,
                role: NodeState::Follower,
                next_index: HashMap::new(),
                match_index: HashMap::new(),
            })),
            election_deadline: Arc::new(Mutex::new(Instant::now())),
            shutdown,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current term and whether this node believes it is the leader.
    pub fn current_state(&self) -> (u64, bool) {
        let st = self.state.lock().unwrap();
        (st.current_term, st.role == NodeState::Leader)
    }

    pub fn role(&self) -> NodeState {
        self.state.lock().unwrap().role
    }

    pub fn commit_index(&self) -> u64 {
        self.state.lock().unwrap().commit_index
    }

    /// Start the event loop. The node stays a follower until its first
    /// election timeout fires.
    pub fn start(&self) {
        self.reset_election_timer();
        let node = self.clone();
        tokio::spawn(async move {
            node.run().await;
        });
        info!(node = %self.id, "raft node started");
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn run(self) {
        let mut shutdown_rx = self.shutdown.subscribe();
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let deadline = *self.election_deadline.lock().unwrap();
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    // A vote grant or heartbeat may have pushed the deadline
                    // while we slept.
                    if *self.election_deadline.lock().unwrap() > deadline {
                        continue;
                    }
                    if self.role() != NodeState::Leader {
                        debug!(node = %self.id, "election timeout");
                        self.run_election().await;
                    }
                    self.reset_election_timer();
                }
                _ = heartbeat.tick() => {
                    if self.role() == NodeState::Leader {
                        self.broadcast_heartbeats();
                    }
                }
                _ = shutdown_rx.changed() => return,
            }
        }
    }

    /// Become candidate, vote for self, and solicit the peers in parallel.
    /// Wins on a strict majority of the full cluster.
    async fn run_election(&self) {
        let (term, last_log_index, last_log_term) = {
            let mut st = self.state.lock().unwrap();
            st.role = NodeState::Candidate;
            st.current_term += 1;
            st.voted_for = Some(self.id.clone());
            let last = (st.log.len() - 1) as u64;
            (st.current_term, last, st.log[last as usize].term)
        };
        info!(node = %self.id, term, "starting election");
        self.reset_election_timer();

        let votes_needed = (self.peers.len() + 1) / 2 + 1;
        let mut votes = 1; // own vote
        if votes >= votes_needed {
            self.become_leader(term);
            return;
        }

        let (tx, mut rx) = mpsc::channel(self.peers.len());
        for peer in &self.peers {
            let node = self.clone();
            let peer = peer.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let granted = node
                    .solicit_vote(&peer, term, last_log_index, last_log_term)
                    .await;
                let _ = tx.send(granted).await;
            });
        }
        drop(tx);

        let deadline = tokio::time::sleep(self.election_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                outcome = rx.recv() => match outcome {
                    Some(true) => {
                        votes += 1;
                        if votes >= votes_needed {
                            self.become_leader(term);
                            return;
                        }
                    }
                    Some(false) => {}
                    None => break,
                },
                _ = &mut deadline => break,
            }
        }
        info!(node = %self.id, term, votes, needed = votes_needed, "election not won");
    }

    async fn solicit_vote(
        &self,
        peer: &str,
        term: u64,
        last_log_index: u64,
        last_log_term: u64,
    ) -> bool {
        let request = RequestVoteRequest {
            term,
            candidate_id: self.id.clone(),
            last_log_index,
            last_log_term,
        };
        match self.transport.request_vote(peer, request).await {
            Ok(response) => {
                if response.term > term {
                    self.step_down(response.term);
                    false
                } else {
                    response.vote_granted
                }
            }
            Err(e) => {
                debug!(node = %self.id, peer, error = %e, "vote request failed");
                false
            }
        }
    }

    fn become_leader(&self, term: u64) {
        {
            let mut st = self.state.lock().unwrap();
            // A higher term may have arrived while votes were in flight.
            if st.current_term != term || st.role != NodeState::Candidate {
                return;
            }
            st.role = NodeState::Leader;
            let last = (st.log.len() - 1) as u64;
            for peer in &self.peers {
                st.next_index.insert(peer.clone(), last + 1);
                st.match_index.insert(peer.clone(), 0);
            }
        }
        info!(node = %self.id, term, "became leader");
        // Establish authority before the first heartbeat tick.
        self.broadcast_heartbeats();
    }

    fn broadcast_heartbeats(&self) {
        let (term, commit_index) = {
            let st = self.state.lock().unwrap();
            if st.role != NodeState::Leader {
                return;
            }
            (st.current_term, st.commit_index)
        };

        for peer in &self.peers {
            let node = self.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                let (prev_log_index, prev_log_term) = {
                    let st = node.state.lock().unwrap();
                    let next = st
                        .next_index
                        .get(&peer)
                        .copied()
                        .unwrap_or(st.log.len() as u64);
                    let prev = next.saturating_sub(1);
                    let prev_term = st.log.get(prev as usize).map_or(0, |e| e.term);
                    (prev, prev_term)
                };
                let request = AppendEntriesRequest {
                    term,
                    leader_id: node.id.clone(),
                    prev_log_index,
                    prev_log_term,
                    entries: Vec::new(),
                    leader_commit: commit_index,
                };
                if let Ok(response) = node.transport.append_entries(&peer, request).await {
                    if response.term > term {
                        node.step_down(response.term);
                    }
                }
            });
        }
    }

    /// Observe a higher term: adopt it, clear the vote, return to follower.
    fn step_down(&self, term: u64) {
        let stepped = {
            let mut st = self.state.lock().unwrap();
            if term > st.current_term {
                info!(node = %self.id, old_term = st.current_term, new_term = term, "stepping down");
                st.current_term = term;
                st.voted_for = None;
                st.role = NodeState::Follower;
                true
            } else {
                false
            }
        };
        if stepped {
            self.reset_election_timer();
        }
    }

    /// Vote iff we have not voted for anyone else this term and the
    /// candidate's log is at least as up to date as ours.
    pub fn handle_request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        let (response, granted) = {
            let mut st = self.state.lock().unwrap();

            if request.term < st.current_term {
                (
                    RequestVoteResponse {
                        term: st.current_term,
                        vote_granted: false,
                    },
                    false,
                )
            } else {
                if request.term > st.current_term {
                    st.current_term = request.term;
                    st.voted_for = None;
                    st.role = NodeState::Follower;
                }

                let can_vote = match &st.voted_for {
                    None => true,
                    Some(candidate) => candidate == &request.candidate_id,
                };
                let last = (st.log.len() - 1) as u64;
                let last_term = st.log[last as usize].term;
                // Higher last-log term wins; same term, longer log wins.
                let log_up_to_date = if request.last_log_term != last_term {
                    request.last_log_term >= last_term
                } else {
                    request.last_log_index >= last
                };

                let granted = can_vote && log_up_to_date;
                if granted {
                    st.voted_for = Some(request.candidate_id.clone());
                    info!(node = %self.id, candidate = %request.candidate_id, term = request.term, "vote granted");
                } else {
                    debug!(
                        node = %self.id,
                        candidate = %request.candidate_id,
                        term = request.term,
                        voted_for = ?st.voted_for,
                        log_up_to_date,
                        "vote denied"
                    );
                }
                (
                    RequestVoteResponse {
                        term: st.current_term,
                        vote_granted: granted,
                    },
                    granted,
                )
            }
        };

        if granted {
            self.reset_election_timer();
        }
        response
    }

    /// Heartbeat/replication receiver with the full log consistency check:
    /// the entry at `prev_log_index` must carry `prev_log_term`, conflicting
    /// suffixes are truncated, and the commit index follows the leader.
    pub fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let (response, accepted_leader) = {
            let mut st = self.state.lock().unwrap();

            if request.term < st.current_term {
                (
                    AppendEntriesResponse {
                        term: st.current_term,
                        success: false,
                        conflict_term: 0,
                        conflict_index: 0,
                    },
                    false,
                )
            } else {
                if request.term > st.current_term {
                    st.current_term = request.term;
                    st.voted_for = None;
                }
                st.role = NodeState::Follower;

                let last = (st.log.len() - 1) as u64;
                let response = if request.prev_log_index > last {
                    // Log too short: tell the leader where ours ends.
                    AppendEntriesResponse {
                        term: st.current_term,
                        success: false,
                        conflict_term: 0,
                        conflict_index: last + 1,
                    }
                } else if st.log[request.prev_log_index as usize].term != request.prev_log_term {
                    let conflict_term = st.log[request.prev_log_index as usize].term;
                    let conflict_index = st
                        .log
                        .iter()
                        .position(|e| e.term == conflict_term)
                        .unwrap_or(0) as u64;
                    AppendEntriesResponse {
                        term: st.current_term,
                        success: false,
                        conflict_term,
                        conflict_index,
                    }
                } else {
                    let mut idx = request.prev_log_index as usize;
                    for entry in &request.entries {
                        idx += 1;
                        if idx < st.log.len() {
                            if st.log[idx].term != entry.term {
                                st.log.truncate(idx);
                                st.log.push(entry.clone());
                            }
                        } else {
                            st.log.push(entry.clone());
                        }
                    }

                    if request.leader_commit > st.commit_index {
                        let last_new = request.prev_log_index + request.entries.len() as u64;
                        st.commit_index = request.leader_commit.min(last_new);
                    }

                    if request.entries.is_empty() {
                        debug!(node = %self.id, leader = %request.leader_id, term = request.term, "heartbeat received");
                    } else {
                        debug!(
                            node = %self.id,
                            leader = %request.leader_id,
                            term = request.term,
                            entries = request.entries.len(),
                            "entries appended"
                        );
                    }
                    AppendEntriesResponse {
                        term: st.current_term,
                        success: true,
                        conflict_term: 0,
                        conflict_index: 0,
                    }
                };
                (response, true)
            }
        };

        // We heard from a live leader for this term.
        if accepted_leader {
            self.reset_election_timer();
        }
        response
    }

    fn reset_election_timer(&self) {
        let jitter = rand::thread_rng().gen_range(0..=ELECTION_JITTER.as_millis() as u64);
        let deadline = Instant::now() + self.election_timeout + Duration::from_millis(jitter);
        *self.election_deadline.lock().unwrap() = deadline;
    }
}
