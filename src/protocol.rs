use serde::{Deserialize, Serialize};

use crate::clock::{RequestVector, VectorClock};
use crate::error::Result;
use crate::types::ProcessId;

//Action identifiers are partitioned by role and algorithm so that the ranges
//never collide: server algorithms start at 0, client algorithms at 1000.
pub const OFFSET_SERVER_ALGORITHMS: u32 = 0;
pub const OFFSET_ELECTION_ALGORITHM: u32 = 0;
pub const OFFSET_MUTEX_ALGORITHM: u32 = 10;
pub const OFFSET_CLIENT_ALGORITHMS: u32 = 1000;
pub const OFFSET_CHAT_ALGORITHM: u32 = 0;

pub const ACTION_ELECTION_TOKEN: u32 = OFFSET_SERVER_ALGORITHMS + OFFSET_ELECTION_ALGORITHM;
pub const ACTION_ELECTION_LEADER: u32 = OFFSET_SERVER_ALGORITHMS + OFFSET_ELECTION_ALGORITHM + 1;
pub const ACTION_MUTEX_REQUEST: u32 = OFFSET_SERVER_ALGORITHMS + OFFSET_MUTEX_ALGORITHM;
pub const ACTION_MUTEX_TOKEN: u32 = OFFSET_SERVER_ALGORITHMS + OFFSET_MUTEX_ALGORITHM + 1;
pub const ACTION_CHAT_MESSAGE: u32 = OFFSET_CLIENT_ALGORITHMS + OFFSET_CHAT_ALGORITHM;
pub const ACTION_CLIENT_IDENTITY: u32 = OFFSET_CLIENT_ALGORITHMS + OFFSET_CHAT_ALGORITHM + 1;

/// A chat line, stamped with the snapshot of the sender's vector clock taken
/// at send time so that receivers can reconstruct the causal order.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct ChatMsg {
    pub sender: ProcessId,
    pub seq: u64,
    pub text: String,
    pub clock: VectorClock,
}

/// Election candidacy circulating hop by hop along the overlay ring.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct ElectionToken {
    pub sender: ProcessId,
    pub candidate: ProcessId,
}

/// Announcement flooded by the elected server to terminate the election.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct ElectionLeader {
    pub sender: ProcessId,
    pub initiator: ProcessId,
}

/// Request for the critical section, broadcast to the other servers.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct MutexRequest {
    pub sender: ProcessId,
    //scalar clock of the requester at request time
    pub ns: u64,
}

/// The circulating mutual-exclusion token: last granted timestamp per server.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct MutexToken {
    pub sender: ProcessId,
    pub granted: RequestVector,
}

/// Identity assigned by a server to a freshly accepted client.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct IdentityMsg {
    pub sender: ProcessId,
    pub identity: ProcessId,
}

/// The payload of a wire message, one variant per action kind.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub enum MsgContent {
    Chat(ChatMsg),
    ElectionToken(ElectionToken),
    ElectionLeader(ElectionLeader),
    MutexRequest(MutexRequest),
    MutexToken(MutexToken),
    Identity(IdentityMsg),
}

/// The payload kind expected by an action, used to match a received content
/// against the registry without invoking the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Chat,
    ElectionToken,
    ElectionLeader,
    MutexRequest,
    MutexToken,
    Identity,
}

impl MsgContent {
    pub fn sender(&self) -> ProcessId {
        match self {
            MsgContent::Chat(m) => m.sender,
            MsgContent::ElectionToken(m) => m.sender,
            MsgContent::ElectionLeader(m) => m.sender,
            MsgContent::MutexRequest(m) => m.sender,
            MsgContent::MutexToken(m) => m.sender,
            MsgContent::Identity(m) => m.sender,
        }
    }

    pub fn kind(&self) -> ContentKind {
        match self {
            MsgContent::Chat(_) => ContentKind::Chat,
            MsgContent::ElectionToken(_) => ContentKind::ElectionToken,
            MsgContent::ElectionLeader(_) => ContentKind::ElectionLeader,
            MsgContent::MutexRequest(_) => ContentKind::MutexRequest,
            MsgContent::MutexToken(_) => ContentKind::MutexToken,
            MsgContent::Identity(_) => ContentKind::Identity,
        }
    }
}

/// The framed wire message: action identifier, originating identity, sequence
/// number used by the flooding dedup, and the payload.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Envelope {
    pub action: u32,
    pub sender: ProcessId,
    pub seq: u64,
    pub content: MsgContent,
}

impl Envelope {
    pub fn new(action: u32, sender: ProcessId, seq: u64, content: MsgContent) -> Envelope {
        Envelope {
            action,
            sender,
            seq,
            content,
        }
    }

    /// Server-algorithm messages fall below the client action range.
    pub fn is_for_server(&self) -> bool {
        self.action < OFFSET_CLIENT_ALGORITHMS
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Envelope> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// The action identifier a payload travels under.
pub fn action_of(content: &MsgContent) -> u32 {
    match content {
        MsgContent::ElectionToken(_) => ACTION_ELECTION_TOKEN,
        MsgContent::ElectionLeader(_) => ACTION_ELECTION_LEADER,
        MsgContent::MutexRequest(_) => ACTION_MUTEX_REQUEST,
        MsgContent::MutexToken(_) => ACTION_MUTEX_TOKEN,
        MsgContent::Chat(_) => ACTION_CHAT_MESSAGE,
        MsgContent::Identity(_) => ACTION_CLIENT_IDENTITY,
    }
}

/// One entry of an algorithm's immutable action table: the identifier, the
/// payload kind the handler expects, and the handler itself.
pub struct ActionSpec<T> {
    pub id: u32,
    pub kind: ContentKind,
    pub handler: fn(&mut T, MsgContent),
}

/// Searches the action tables of a role for the single entry matching both
/// the action identifier and the payload kind. `None` is a silent no-op at
/// the call sites (unknown actions are tolerated for forward compatibility).
pub fn find_action<'a, T>(
    tables: &[&'a [ActionSpec<T>]],
    id: u32,
    kind: ContentKind,
) -> Option<&'a ActionSpec<T>> {
    tables
        .iter()
        .flat_map(|table| table.iter())
        .find(|spec| spec.id == id && spec.kind == kind)
}
