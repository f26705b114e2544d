use log::{debug, info, warn};

use crate::clock::RequestVector;
use crate::protocol::{
    ActionSpec, ContentKind, ElectionLeader, ElectionToken, MsgContent, ACTION_ELECTION_LEADER,
    ACTION_ELECTION_TOKEN,
};

use super::{Server, State};

/// The action table of the election algorithm.
pub(crate) const ACTIONS: &[ActionSpec<Server>] = &[
    ActionSpec {
        id: ACTION_ELECTION_TOKEN,
        kind: ContentKind::ElectionToken,
        handler: receive_token,
    },
    ActionSpec {
        id: ACTION_ELECTION_LEADER,
        kind: ContentKind::ElectionLeader,
        handler: receive_leader,
    },
];

/// Enters candidacy on the operator's `election` command and emits the
/// initial token to the next server of the ring. Restarting an election from
/// a terminal state reopens the machine.
pub(crate) fn start_election(server: &mut Server) {
    info!("{}: becoming initiator of an election", server.id);
    server.state = State::Initiator;
    server.leader = None;
    let token = ElectionToken {
        sender: server.id,
        candidate: server.id,
    };
    forward_token(server, None, token);
}

fn forward_token(server: &mut Server, exclude: Option<crate::wire::ConnId>, token: ElectionToken) {
    match server.next_server_conn(exclude) {
        Some(conn) => {
            debug!(
                "{}: sending election token with candidate {} on connection {}",
                server.id, token.candidate, conn
            );
            let envelope = server.envelope(MsgContent::ElectionToken(token));
            server.send_on(conn, envelope);
        }
        None => warn!(
            "{}: no neighbouring server to circulate the election token to",
            server.id
        ),
    }
}

/* Token rules, for a receiver r and a carried candidate c:
   - r initiator, c > r: a stronger candidacy, forward unchanged.
   - r initiator, c < r: swallow the weaker candidacy, forward r instead.
   - r initiator, c = r: r's candidacy went around the ring; r is elected.
   - r not a participant: relay unchanged and join the round passively. A
     leader only relays tokens stronger than itself; anything else reaching
     a leader is a candidacy that already lost, and is dropped there.
   Only initiators compare, so a lone initiator is elected regardless of the
   identities of the servers that merely relay its token. */
fn receive_token(server: &mut Server, content: MsgContent) {
    let MsgContent::ElectionToken(token) = content else {
        return;
    };
    let arrival = server.current_conn;
    debug!(
        "{}: received election token with candidate {} in state {:?}",
        server.id, token.candidate, server.state
    );
    match server.state {
        State::Initiator => {
            if token.candidate > server.id {
                forward_token(server, arrival, token);
            } else if token.candidate < server.id {
                debug!(
                    "{}: swallowing weaker candidacy of {}",
                    server.id, token.candidate
                );
                let own = ElectionToken {
                    sender: server.id,
                    candidate: server.id,
                };
                forward_token(server, arrival, own);
            } else {
                become_leader(server);
            }
        }
        State::Sleeping | State::Candidate | State::Nonleader => {
            server.state = State::Candidate;
            server.leader = None;
            forward_token(server, arrival, token);
        }
        State::Leader => {
            if token.candidate > server.id {
                //a new, stronger round is in flight; step back into it
                server.state = State::Candidate;
                server.leader = None;
                forward_token(server, arrival, token);
            } else {
                debug!("{}: dropping stale election token", server.id);
            }
        }
    }
}

/// The candidacy returned unchanged: this server wins the election, creates
/// the initial mutual-exclusion token and floods the leader announcement.
fn become_leader(server: &mut Server) {
    info!("{}: elected as leader", server.id);
    server.state = State::Leader;
    server.leader = Some(server.id);
    server.token = Some(RequestVector::new());
    server.critical = true;
    server.waiting = false;
    server.pending_requests = RequestVector::new();
    let announcement = server.envelope(MsgContent::ElectionLeader(ElectionLeader {
        sender: server.id,
        initiator: server.id,
    }));
    server.send_to_all_servers(None, &announcement);
}

/* The leader announcement floods the overlay; a server forwards a given
   round's announcement exactly once (the recorded leader identity doubles as
   the already-seen marker). Becoming nonleader also buries any mutex state
   of the previous round: the new leader owns the fresh token. */
fn receive_leader(server: &mut Server, content: MsgContent) {
    let MsgContent::ElectionLeader(leader) = content else {
        return;
    };
    let arrival = server.current_conn;
    if leader.initiator == server.id {
        debug!("{}: own leader announcement came back, dropping", server.id);
        return;
    }
    if server.leader == Some(leader.initiator) {
        debug!(
            "{}: already aware of leader {}, dropping announcement",
            server.id, leader.initiator
        );
        return;
    }
    info!("{}: leader is {}, becoming nonleader", server.id, leader.initiator);
    server.state = State::Nonleader;
    server.leader = Some(leader.initiator);
    server.token = None;
    server.critical = false;
    server.waiting = false;
    server.pending_requests = RequestVector::new();
    let envelope = server.envelope(MsgContent::ElectionLeader(ElectionLeader {
        sender: server.id,
        initiator: leader.initiator,
    }));
    server.send_to_all_servers(arrival, &envelope);
}

#[cfg(test)]
mod tests {
    use super::super::tests::fake_conn;
    use super::*;
    use crate::types::ProcessId;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn token(candidate: u32) -> MsgContent {
        MsgContent::ElectionToken(ElectionToken {
            sender: ProcessId(candidate),
            candidate: ProcessId(candidate),
        })
    }

    fn announcement(initiator: u32) -> MsgContent {
        MsgContent::ElectionLeader(ElectionLeader {
            sender: ProcessId(initiator),
            initiator: ProcessId(initiator),
        })
    }

    fn candidate_of(envelope: &crate::protocol::Envelope) -> ProcessId {
        match &envelope.content {
            MsgContent::ElectionToken(t) => t.candidate,
            other => panic!("expected an election token, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn sleeping_server_relays_token_unchanged() {
        let server_arc = Arc::new(Mutex::new(Server::new(ProcessId(5))));
        let mut server = server_arc.lock().await;
        let _upstream = fake_conn(&mut server, 1, false);
        let mut downstream = fake_conn(&mut server, 2, false);

        server.current_conn = Some(1);
        receive_token(&mut server, token(1));
        assert_eq!(server.state(), State::Candidate);
        // the carried candidate must not be replaced, even by a larger id
        assert_eq!(candidate_of(&downstream.try_recv().unwrap()), ProcessId(1));
    }

    #[tokio::test]
    async fn initiator_swallows_weaker_candidacy() {
        let server_arc = Arc::new(Mutex::new(Server::new(ProcessId(5))));
        let mut server = server_arc.lock().await;
        let _upstream = fake_conn(&mut server, 1, false);
        let mut downstream = fake_conn(&mut server, 2, false);

        server.state = State::Initiator;
        server.current_conn = Some(1);
        receive_token(&mut server, token(2));
        assert_eq!(candidate_of(&downstream.try_recv().unwrap()), ProcessId(5));
    }

    #[tokio::test]
    async fn initiator_forwards_stronger_candidacy() {
        let server_arc = Arc::new(Mutex::new(Server::new(ProcessId(2))));
        let mut server = server_arc.lock().await;
        let _upstream = fake_conn(&mut server, 1, false);
        let mut downstream = fake_conn(&mut server, 2, false);

        server.state = State::Initiator;
        server.current_conn = Some(1);
        receive_token(&mut server, token(5));
        assert_eq!(candidate_of(&downstream.try_recv().unwrap()), ProcessId(5));
    }

    #[tokio::test]
    async fn returned_candidacy_elects_and_floods() {
        let server_arc = Arc::new(Mutex::new(Server::new(ProcessId(1))));
        let mut server = server_arc.lock().await;
        let mut peer_a = fake_conn(&mut server, 1, false);
        let mut peer_b = fake_conn(&mut server, 2, false);

        server.state = State::Initiator;
        server.current_conn = Some(1);
        receive_token(&mut server, token(1));
        assert_eq!(server.state(), State::Leader);
        assert_eq!(server.leader(), Some(ProcessId(1)));
        assert!(server.has_token());
        assert!(server.critical());
        for peer in [&mut peer_a, &mut peer_b] {
            let envelope = peer.try_recv().unwrap();
            assert!(matches!(envelope.content, MsgContent::ElectionLeader(_)));
        }
    }

    #[tokio::test]
    async fn announcement_forwarded_exactly_once() {
        let server_arc = Arc::new(Mutex::new(Server::new(ProcessId(2))));
        let mut server = server_arc.lock().await;
        let _upstream = fake_conn(&mut server, 1, false);
        let mut downstream = fake_conn(&mut server, 2, false);

        server.current_conn = Some(1);
        receive_leader(&mut server, announcement(5));
        assert_eq!(server.state(), State::Nonleader);
        assert_eq!(server.leader(), Some(ProcessId(5)));
        assert!(downstream.try_recv().is_ok());

        // a second copy, e.g. around the cycle, must not be re-flooded
        receive_leader(&mut server, announcement(5));
        assert!(downstream.try_recv().is_err());
    }

    #[tokio::test]
    async fn announcement_buries_the_previous_round_token() {
        let server_arc = Arc::new(Mutex::new(Server::new(ProcessId(2))));
        let mut server = server_arc.lock().await;
        let _upstream = fake_conn(&mut server, 1, false);

        // leader of a previous round, still holding the token
        server.state = State::Leader;
        server.leader = Some(ProcessId(2));
        server.token = Some(RequestVector::new());
        server.critical = true;

        server.current_conn = Some(1);
        receive_leader(&mut server, announcement(5));
        assert_eq!(server.state(), State::Nonleader);
        assert!(!server.has_token(), "only the new leader may hold a token");
        assert!(!server.critical());
    }

    #[tokio::test]
    async fn leader_relays_a_stronger_candidacy_and_drops_weaker_ones() {
        let server_arc = Arc::new(Mutex::new(Server::new(ProcessId(3))));
        let mut server = server_arc.lock().await;
        let _upstream = fake_conn(&mut server, 1, false);
        let mut downstream = fake_conn(&mut server, 2, false);

        server.state = State::Leader;
        server.leader = Some(ProcessId(3));
        server.current_conn = Some(1);

        receive_token(&mut server, token(1));
        assert!(downstream.try_recv().is_err(), "a lost candidacy dies at the leader");
        assert_eq!(server.state(), State::Leader);

        receive_token(&mut server, token(5));
        assert_eq!(candidate_of(&downstream.try_recv().unwrap()), ProcessId(5));
        assert_eq!(server.state(), State::Candidate);
    }
}
