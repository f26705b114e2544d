use log::{debug, info, warn};

use crate::protocol::{
    ActionSpec, ContentKind, MsgContent, MutexRequest, MutexToken, ACTION_MUTEX_REQUEST,
    ACTION_MUTEX_TOKEN,
};

use super::Server;

/// The action table of the mutual-exclusion algorithm.
pub(crate) const ACTIONS: &[ActionSpec<Server>] = &[
    ActionSpec {
        id: ACTION_MUTEX_REQUEST,
        kind: ContentKind::MutexRequest,
        handler: receive_request,
    },
    ActionSpec {
        id: ACTION_MUTEX_TOKEN,
        kind: ContentKind::MutexToken,
        handler: receive_token,
    },
];

/// Requests the critical section on the operator's `mutex` command: stamps
/// the request with the incremented scalar clock, records it locally, and
/// either enters directly (the token is already here) or broadcasts the
/// request to the other servers.
pub(crate) fn request_critical_section(server: &mut Server) {
    server.ns += 1;
    let ns = server.ns;
    let id = server.id;
    server.pending_requests.set_entry(id, ns);
    server.waiting = true;
    info!("{}: requesting the critical section with clock {}", id, ns);
    if server.token.is_some() {
        enter_critical_section(server);
        return;
    }
    let envelope = server.envelope(MsgContent::MutexRequest(MutexRequest { sender: id, ns }));
    server.send_to_all_servers(None, &envelope);
}

fn enter_critical_section(server: &mut Server) {
    info!("{}: entering the critical section", server.id);
    server.critical = true;
    server.waiting = false;
}

/* A request is recorded when its clock is ahead of the last one seen from
   that requester (which also absorbs duplicate deliveries). At the token
   holder it triggers the hand-off; a holder still inside the critical
   section leaves it first, the competing request marking the end of its
   turn. */
fn receive_request(server: &mut Server, content: MsgContent) {
    let MsgContent::MutexRequest(request) = content else {
        return;
    };
    if request.ns <= server.pending_requests.entry(request.sender) {
        debug!(
            "{}: stale or duplicate request from {} with clock {}, dropping",
            server.id, request.sender, request.ns
        );
        return;
    }
    debug!(
        "{}: recording request of {} with clock {}",
        server.id, request.sender, request.ns
    );
    server
        .pending_requests
        .set_entry(request.sender, request.ns);
    if server.token.is_some() {
        if server.critical {
            info!("{}: leaving the critical section", server.id);
            server.critical = false;
        }
        hand_off(server);
    }
}

/* Receiving the token makes this server the unique holder: it enters the
   critical section if it was waiting for it, and otherwise immediately scans
   for the next pending requester. */
fn receive_token(server: &mut Server, content: MsgContent) {
    let MsgContent::MutexToken(token) = content else {
        return;
    };
    debug!("{}: received the token from {}", server.id, token.sender);
    server.token = Some(token.granted);
    if server.waiting {
        enter_critical_section(server);
    } else {
        hand_off(server);
    }
}

/// Scans the identities with a pending request in increasing order starting
/// just after this server's own identity, wrapping around, and forwards the
/// token to the first requester whose request clock is ahead of the token's
/// granted entry. The order makes the hand-off fair and independent of
/// request arrival order.
fn hand_off(server: &mut Server) {
    if server.critical {
        return;
    }
    let next = match &server.token {
        None => return,
        Some(token) => server
            .pending_requests
            .wrapping_keys_after(server.id)
            .into_iter()
            .find(|q| server.pending_requests.entry(*q) > token.entry(*q)),
    };
    let Some(grantee) = next else {
        debug!("{}: no pending request, keeping the token", server.id);
        return;
    };
    let Some(mut granted) = server.token.take() else {
        return;
    };
    granted.set_entry(grantee, server.pending_requests.entry(grantee));
    info!("{}: granting the token to {}", server.id, grantee);
    match server.server_routes.get(&grantee).copied() {
        Some(conn) => {
            let envelope = server.envelope(MsgContent::MutexToken(MutexToken {
                sender: server.id,
                granted,
            }));
            server.send_on(conn, envelope);
        }
        None => {
            warn!(
                "{}: no route towards requester {}, keeping the token",
                server.id, grantee
            );
            server.token = Some(granted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::fake_conn;
    use super::*;
    use crate::clock::RequestVector;
    use crate::types::ProcessId;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn request(sender: u32, ns: u64) -> MsgContent {
        MsgContent::MutexRequest(MutexRequest {
            sender: ProcessId(sender),
            ns,
        })
    }

    fn granted_of(envelope: &crate::protocol::Envelope) -> &RequestVector {
        match &envelope.content {
            MsgContent::MutexToken(t) => &t.granted,
            other => panic!("expected a mutex token, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn competing_request_moves_the_token_out_of_the_critical_section() {
        let server_arc = Arc::new(Mutex::new(Server::new(ProcessId(1))));
        let mut server = server_arc.lock().await;
        let mut to_requester = fake_conn(&mut server, 1, false);

        // elected holder sitting in the critical section
        server.token = Some(RequestVector::new());
        server.critical = true;
        server.server_routes.insert(ProcessId(2), 1);

        server.current_conn = Some(1);
        receive_request(&mut server, request(2, 1));
        assert!(!server.critical(), "the competing request ends the turn");
        assert!(!server.has_token(), "the token must have been handed off");
        let envelope = to_requester.try_recv().unwrap();
        assert_eq!(granted_of(&envelope).entry(ProcessId(2)), 1);
    }

    #[tokio::test]
    async fn duplicate_request_is_idempotent() {
        let server_arc = Arc::new(Mutex::new(Server::new(ProcessId(1))));
        let mut server = server_arc.lock().await;
        let _peer = fake_conn(&mut server, 1, false);

        server.current_conn = Some(1);
        receive_request(&mut server, request(2, 1));
        assert_eq!(server.pending_requests.entry(ProcessId(2)), 1);
        receive_request(&mut server, request(2, 1));
        assert_eq!(server.pending_requests.entry(ProcessId(2)), 1);
    }

    #[tokio::test]
    async fn waiting_server_enters_the_critical_section_on_token_receipt() {
        let server_arc = Arc::new(Mutex::new(Server::new(ProcessId(2))));
        let mut server = server_arc.lock().await;
        server.ns = 1;
        server.pending_requests.set_entry(ProcessId(2), 1);
        server.waiting = true;

        let mut granted = RequestVector::new();
        granted.set_entry(ProcessId(2), 1);
        receive_token(
            &mut server,
            MsgContent::MutexToken(MutexToken {
                sender: ProcessId(1),
                granted,
            }),
        );
        assert!(server.critical());
        assert!(server.has_token());
        assert!(!server.waiting);
    }

    #[tokio::test]
    async fn holder_with_token_enters_directly_on_own_request() {
        let server_arc = Arc::new(Mutex::new(Server::new(ProcessId(1))));
        let mut server = server_arc.lock().await;
        server.token = Some(RequestVector::new());
        request_critical_section(&mut server);
        assert!(server.critical());
    }

    #[tokio::test]
    async fn hand_off_scans_upward_from_own_identity_and_wraps() {
        let server_arc = Arc::new(Mutex::new(Server::new(ProcessId(3))));
        let mut server = server_arc.lock().await;
        let _to_one = fake_conn(&mut server, 1, false);
        let mut to_five = fake_conn(&mut server, 2, false);
        server.server_routes.insert(ProcessId(1), 1);
        server.server_routes.insert(ProcessId(5), 2);

        // both 1 and 5 have pending requests; 5 comes first after 3
        server.token = Some(RequestVector::new());
        server.pending_requests.set_entry(ProcessId(1), 1);
        server.pending_requests.set_entry(ProcessId(5), 1);
        hand_off(&mut server);
        let envelope = to_five.try_recv().unwrap();
        assert_eq!(granted_of(&envelope).entry(ProcessId(5)), 1);
    }

    #[tokio::test]
    async fn granted_request_is_not_granted_twice() {
        let server_arc = Arc::new(Mutex::new(Server::new(ProcessId(1))));
        let mut server = server_arc.lock().await;
        let mut peer = fake_conn(&mut server, 1, false);
        server.server_routes.insert(ProcessId(2), 1);

        let mut token = RequestVector::new();
        token.set_entry(ProcessId(2), 1);
        server.token = Some(token);
        // the recorded request was already granted at clock 1
        server.pending_requests.set_entry(ProcessId(2), 1);
        hand_off(&mut server);
        assert!(server.has_token(), "nothing to grant");
        assert!(peer.try_recv().is_err());
    }
}
