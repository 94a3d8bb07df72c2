//! The spanning tree: every server and user this node knows about.
//!
//! Nodes live in an id-keyed arena. Each node records the local connection
//! it was learned through (`from`) and its immediate upstream (`up`); the
//! local server is the root and is the only node with neither. Servers keep
//! their downstream servers and users so a split can drop a whole subtree.

use std::collections::HashMap;
use std::fmt;

use super::matching::fold_key;

/// Identifier of a local connection (socket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Identifier of a node in the tree. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

/// Link-state flags carried by server nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerFlags {
    /// Still sending its net.burst.
    pub burst: bool,
    /// Finished its burst, waiting for our acknowledgement to travel back.
    pub burst_ack: bool,
    /// Joined the network through a fresh net junction.
    pub junction: bool,
    pub hub: bool,
    pub service: bool,
}

impl ServerFlags {
    /// Parse the `+hs` flag field of a SERVER line.
    pub fn from_field(field: &str) -> Self {
        let mut flags = Self::default();
        if let Some(letters) = field.strip_prefix('+') {
            flags.hub = letters.contains('h');
            flags.service = letters.contains('s');
        }
        flags
    }

    /// The `+hs` flag field for a SERVER line.
    pub fn to_field(self) -> String {
        let mut out = String::from("+");
        if self.hub {
            out.push('h');
        }
        if self.service {
            out.push('s');
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct Server {
    /// Link timestamp (for the root: our start time).
    pub timestamp: i64,
    pub protocol: u16,
    pub capacity: u32,
    pub flags: ServerFlags,
    /// When this link last caused a ghost.
    pub ghost: i64,
    pub down: Vec<NodeId>,
    pub users: Vec<NodeId>,
}

/// User mode flags relevant to routing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserModes {
    pub oper: bool,
    pub invisible: bool,
    pub wallops: bool,
}

impl UserModes {
    /// Parse a `+oiw` string; unknown letters are ignored.
    pub fn parse(s: &str) -> Self {
        let mut modes = Self::default();
        for c in s.trim_start_matches('+').chars() {
            match c {
                'o' | 'O' => modes.oper = true,
                'i' => modes.invisible = true,
                'w' => modes.wallops = true,
                _ => {}
            }
        }
        modes
    }

    /// Mode letters without the `+`; empty when no mode is set.
    pub fn letters(self) -> String {
        let mut out = String::new();
        if self.oper {
            out.push('o');
        }
        if self.invisible {
            out.push('i');
        }
        if self.wallops {
            out.push('w');
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub username: String,
    pub host: String,
    /// Base64-encoded IP as carried in NICK bursts.
    pub ip: String,
    pub modes: UserModes,
    /// Timestamp of the last nick change, used for collisions.
    pub lastnick: i64,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Server(Server),
    User(User),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub numeric: String,
    pub info: String,
    pub hop: u32,
    /// Local connection this node is reached through; `None` for the root.
    pub from: Option<ConnId>,
    /// Immediate upstream node; `None` for the root.
    pub up: Option<NodeId>,
    pub kind: NodeKind,
}

impl Node {
    pub fn server(&self) -> Option<&Server> {
        match &self.kind {
            NodeKind::Server(s) => Some(s),
            NodeKind::User(_) => None,
        }
    }

    pub fn user(&self) -> Option<&User> {
        match &self.kind {
            NodeKind::User(u) => Some(u),
            NodeKind::Server(_) => None,
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self.kind, NodeKind::Server(_))
    }

    /// Link timestamp for servers, zero for users.
    pub fn timestamp(&self) -> i64 {
        self.server().map_or(0, |s| s.timestamp)
    }
}

/// What a new server brings with it.
#[derive(Debug, Clone)]
pub struct NewServer {
    pub name: String,
    pub numeric: String,
    pub info: String,
    pub hop: u32,
    pub from: ConnId,
    pub timestamp: i64,
    pub protocol: u16,
    pub capacity: u32,
    pub flags: ServerFlags,
}

/// What a new user brings with it.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub nick: String,
    pub numeric: String,
    pub info: String,
    pub hop: u32,
    pub from: ConnId,
    pub user: User,
}

/// The node arena plus name and numeric indexes.
#[derive(Debug)]
pub struct Topology {
    nodes: HashMap<NodeId, Node>,
    by_name: HashMap<String, NodeId>,
    by_numeric: HashMap<String, NodeId>,
    root: NodeId,
    next_id: u64,
}

impl Topology {
    /// Create a tree holding only the local server.
    pub fn new(name: &str, numeric: &str, info: &str, start: i64, flags: ServerFlags) -> Self {
        let root = NodeId(0);
        let node = Node {
            id: root,
            name: name.to_owned(),
            numeric: numeric.to_owned(),
            info: info.to_owned(),
            hop: 0,
            from: None,
            up: None,
            kind: NodeKind::Server(Server {
                timestamp: start,
                protocol: 10,
                capacity: super::numeric::MAX_CAPACITY,
                flags,
                ghost: 0,
                down: Vec::new(),
                users: Vec::new(),
            }),
        };
        let mut topo = Self {
            nodes: HashMap::new(),
            by_name: HashMap::new(),
            by_numeric: HashMap::new(),
            root,
            next_id: 1,
        };
        topo.index(node);
        topo
    }

    fn index(&mut self, node: Node) {
        self.by_name.insert(fold_key(&node.name), node.id);
        self.by_numeric.insert(node.numeric.clone(), node.id);
        self.nodes.insert(node.id, node);
    }

    fn alloc(&mut self) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn me(&self) -> &Node {
        // The root is inserted at construction and never removed.
        &self.nodes[&self.root]
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn server_mut(&mut self, id: NodeId) -> Option<&mut Server> {
        match &mut self.nodes.get_mut(&id)?.kind {
            NodeKind::Server(s) => Some(s),
            NodeKind::User(_) => None,
        }
    }

    pub fn user_mut(&mut self, id: NodeId) -> Option<&mut User> {
        match &mut self.nodes.get_mut(&id)?.kind {
            NodeKind::User(u) => Some(u),
            NodeKind::Server(_) => None,
        }
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(&fold_key(name)).copied()
    }

    pub fn find_by_numeric(&self, numeric: &str) -> Option<NodeId> {
        self.by_numeric.get(numeric).copied()
    }

    /// Downstream servers of `id`.
    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.get(id)
            .and_then(Node::server)
            .map_or(&[], |s| s.down.as_slice())
    }

    /// Users attached directly to server `id`.
    pub fn users_of(&self, id: NodeId) -> &[NodeId] {
        self.get(id)
            .and_then(Node::server)
            .map_or(&[], |s| s.users.as_slice())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Servers of the subtree rooted at `id`, parents before children.
    pub fn servers_from(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if self.get(next).is_some_and(Node::is_server) {
                out.push(next);
                stack.extend(self.children(next).iter().rev());
            }
        }
        out
    }

    /// Users of the subtree rooted at `id`, grouped by server in
    /// [`Topology::servers_from`] order.
    pub fn users_from(&self, id: NodeId) -> Vec<NodeId> {
        self.servers_from(id)
            .into_iter()
            .flat_map(|s| self.users_of(s).iter().copied())
            .collect()
    }

    /// Whether `ancestor` is `node` or lies on its path to the root.
    pub fn is_ancestor(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cur = Some(node);
        while let Some(id) = cur {
            if id == ancestor {
                return true;
            }
            cur = self.get(id).and_then(|n| n.up);
        }
        false
    }

    /// Whether any local client currently holds operator privilege.
    pub fn has_local_oper(&self) -> bool {
        self.users_of(self.root).iter().any(|id| {
            self.get(*id)
                .and_then(Node::user)
                .is_some_and(|u| u.modes.oper)
        })
    }

    /// Attach a server below `up`. Returns `None` if `up` is not a server.
    pub fn add_server(&mut self, up: NodeId, new: NewServer) -> Option<NodeId> {
        self.nodes.get(&up).and_then(Node::server)?;
        let id = self.alloc();
        self.index(Node {
            id,
            name: new.name,
            numeric: new.numeric,
            info: new.info,
            hop: new.hop,
            from: Some(new.from),
            up: Some(up),
            kind: NodeKind::Server(Server {
                timestamp: new.timestamp,
                protocol: new.protocol,
                capacity: new.capacity,
                flags: new.flags,
                ghost: 0,
                down: Vec::new(),
                users: Vec::new(),
            }),
        });
        self.server_mut(up)?.down.push(id);
        Some(id)
    }

    /// Attach a user to server `server`.
    pub fn add_user(&mut self, server: NodeId, new: NewUser) -> Option<NodeId> {
        self.nodes.get(&server).and_then(Node::server)?;
        let id = self.alloc();
        self.index(Node {
            id,
            name: new.nick,
            numeric: new.numeric,
            info: new.info,
            hop: new.hop,
            from: Some(new.from),
            up: Some(server),
            kind: NodeKind::User(new.user),
        });
        self.server_mut(server)?.users.push(id);
        Some(id)
    }

    /// Re-key a user under a new nick.
    pub fn rename(&mut self, id: NodeId, nick: &str) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        self.by_name.remove(&fold_key(&node.name));
        node.name = nick.to_owned();
        self.by_name.insert(fold_key(nick), id);
    }

    /// Detach and drop `id` with everything below it. The removed nodes are
    /// returned, deepest first, so callers can clean up references.
    pub fn remove(&mut self, id: NodeId) -> Vec<Node> {
        if id == self.root {
            return Vec::new();
        }
        if let Some(up) = self.get(id).and_then(|n| n.up) {
            if let Some(parent) = self.server_mut(up) {
                parent.down.retain(|d| *d != id);
                parent.users.retain(|u| *u != id);
            }
        }

        let mut removed = Vec::new();
        let mut order = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            order.push(next);
            if let Some(server) = self.get(next).and_then(Node::server) {
                stack.extend(server.users.iter().copied());
                stack.extend(server.down.iter().copied());
            }
        }
        for victim in order.into_iter().rev() {
            if let Some(node) = self.nodes.remove(&victim) {
                if self.by_name.get(&fold_key(&node.name)) == Some(&victim) {
                    self.by_name.remove(&fold_key(&node.name));
                }
                if self.by_numeric.get(&node.numeric) == Some(&victim) {
                    self.by_numeric.remove(&node.numeric);
                }
                removed.push(node);
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(name: &str, numeric: &str, from: u64, ts: i64) -> NewServer {
        NewServer {
            name: name.into(),
            numeric: numeric.into(),
            info: "test".into(),
            hop: 1,
            from: ConnId(from),
            timestamp: ts,
            protocol: 10,
            capacity: 4095,
            flags: ServerFlags::default(),
        }
    }

    fn user(nick: &str, numeric: &str, from: u64) -> NewUser {
        NewUser {
            nick: nick.into(),
            numeric: numeric.into(),
            info: "real".into(),
            hop: 1,
            from: ConnId(from),
            user: User {
                username: "u".into(),
                host: "h".into(),
                ip: "AAAAAA".into(),
                modes: UserModes::default(),
                lastnick: 1,
            },
        }
    }

    fn tree() -> (Topology, NodeId, NodeId) {
        let mut t = Topology::new("hub.lagun.co", "AA", "hub", 900_000_000, ServerFlags::default());
        let a = t.add_server(t.root(), server("a.lagun.co", "AB", 1, 900_000_100)).unwrap();
        let b = t.add_server(a, server("b.lagun.co", "AC", 1, 900_000_200)).unwrap();
        (t, a, b)
    }

    #[test]
    fn lookups_fold_case() {
        let (t, a, _) = tree();
        assert_eq!(t.find_by_name("A.LAGUN.CO"), Some(a));
        assert_eq!(t.find_by_numeric("AB"), Some(a));
        assert_eq!(t.find_by_name("nowhere.lagun.co"), None);
    }

    #[test]
    fn servers_from_is_preorder() {
        let (mut t, a, b) = tree();
        let c = t.add_server(t.root(), server("c.lagun.co", "AD", 2, 900_000_300)).unwrap();
        assert_eq!(t.servers_from(t.root()), vec![t.root(), a, b, c]);
        assert_eq!(t.children(t.root()), &[a, c]);
    }

    #[test]
    fn ancestor_walk() {
        let (t, a, b) = tree();
        assert!(t.is_ancestor(a, b));
        assert!(t.is_ancestor(b, b));
        assert!(!t.is_ancestor(b, a));
    }

    #[test]
    fn remove_drops_whole_subtree() {
        let (mut t, a, b) = tree();
        let u = t.add_user(b, user("wings", "ACAAA", 1)).unwrap();
        let removed = t.remove(a);
        assert_eq!(removed.len(), 3);
        assert_eq!(removed.last().map(|n| n.id), Some(a));
        assert!(t.get(u).is_none());
        assert!(t.find_by_name("wings").is_none());
        assert!(t.find_by_numeric("AC").is_none());
        assert!(t.children(t.root()).is_empty());
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn root_cannot_be_removed() {
        let (mut t, _, _) = tree();
        let root = t.root();
        assert!(t.remove(root).is_empty());
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn rename_rekeys_user() {
        let (mut t, a, _) = tree();
        let u = t.add_user(a, user("wings", "ABAAA", 1)).unwrap();
        t.rename(u, "Feathers");
        assert_eq!(t.find_by_name("feathers"), Some(u));
        assert_eq!(t.find_by_name("wings"), None);
    }

    #[test]
    fn local_oper_detection() {
        let mut t = Topology::new("hub.lagun.co", "AA", "hub", 900_000_000, ServerFlags::default());
        let root = t.root();
        let u = t.add_user(root, user("wings", "AAAAA", 7)).unwrap();
        assert!(!t.has_local_oper());
        t.user_mut(u).unwrap().modes.oper = true;
        assert!(t.has_local_oper());
    }

    #[test]
    fn server_flag_field() {
        let flags = ServerFlags::from_field("+hs");
        assert!(flags.hub && flags.service);
        assert_eq!(flags.to_field(), "+hs");
        assert_eq!(ServerFlags::default().to_field(), "+");
    }
}
