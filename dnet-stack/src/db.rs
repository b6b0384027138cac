//! The node database: everything the stack knows about other nodes,
//! keyed by address and by name.  Entries are created on demand the
//! first time an address is referenced and live for the lifetime of
//! the node.

use dnet_wire::NodeAddr;

pub type NodeName = heapless::String<6>;
pub type VerifString = heapless::Vec<u8, 64>;

/// What the node knows about one peer.
#[derive(Clone, Default, Debug)]
pub struct NodeInfo {
    pub name: Option<NodeName>,
    /// Verification we require from this node when it initializes to
    /// us.
    pub iverif: Option<VerifString>,
    /// Verification we present when this node requests it.
    pub overif: Option<VerifString>,
    /// Times this node's adjacency went down.
    pub adj_down: u32,
}

const CAP: usize = 64;

/// Process-wide node database.
pub struct NodeDb {
    nodes: heapless::FnvIndexMap<NodeAddr, NodeInfo, CAP>,
}

impl Default for NodeDb {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeDb {
    pub fn new() -> Self {
        Self {
            nodes: heapless::FnvIndexMap::new(),
        }
    }

    /// Look up by address, creating an empty entry on first
    /// reference.  A full database makes room by dropping an unnamed
    /// entry; when every entry is named the reference is declined
    /// rather than wired to an unrelated record.
    pub fn nodeinfo(&mut self, addr: NodeAddr) -> Option<&mut NodeInfo> {
        if !self.nodes.contains_key(&addr) {
            if self.nodes.len() == self.nodes.capacity() {
                let victim = self
                    .nodes
                    .iter()
                    .find_map(|(k, v)| v.name.is_none().then_some(*k))?;
                self.nodes.remove(&victim);
                log::warn!("node database full, evicted {}", victim);
            }
            // Space was just ensured
            let _ = self.nodes.insert(addr, NodeInfo::default());
        }
        self.nodes.get_mut(&addr)
    }

    pub fn get(&self, addr: NodeAddr) -> Option<&NodeInfo> {
        self.nodes.get(&addr)
    }

    pub fn set_name(&mut self, addr: NodeAddr, name: &str) {
        let mut n = NodeName::new();
        if n.push_str(name).is_ok() {
            if let Some(info) = self.nodeinfo(addr) {
                info.name = Some(n);
            }
        }
    }

    /// Reverse lookup by name.
    pub fn by_name(&self, name: &str) -> Option<NodeAddr> {
        self.nodes
            .iter()
            .find_map(|(k, v)| (v.name.as_deref() == Some(name)).then_some(*k))
    }

    /// The display name of a node: its registered name or nothing.
    pub fn name_of(&self, addr: NodeAddr) -> Option<&str> {
        self.nodes.get(&addr).and_then(|n| n.name.as_deref())
    }

    /// The verification string we present to `addr` on request.
    pub fn outbound_verification(&self, addr: NodeAddr) -> &[u8] {
        self.nodes
            .get(&addr)
            .and_then(|n| n.overif.as_ref())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// The verification string we require from `addr`, if configured.
    pub fn inbound_verification(&self, addr: NodeAddr) -> Option<&[u8]> {
        self.nodes
            .get(&addr)
            .and_then(|n| n.iverif.as_ref())
            .map(|v| v.as_slice())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn on_demand_creation_and_names() {
        let mut db = NodeDb::new();
        let a = NodeAddr::new(1, 3);
        assert!(db.get(a).is_none());
        db.nodeinfo(a).unwrap().adj_down = 2;
        assert_eq!(db.get(a).unwrap().adj_down, 2);

        db.set_name(a, "NODE3");
        assert_eq!(db.by_name("NODE3"), Some(a));
        assert_eq!(db.by_name("OTHER"), None);
        assert_eq!(db.name_of(a), Some("NODE3"));
    }

    #[test]
    fn verification_defaults() {
        let mut db = NodeDb::new();
        let a = NodeAddr::new(1, 3);
        assert_eq!(db.outbound_verification(a), b"");
        assert_eq!(db.inbound_verification(a), None);

        let mut v = VerifString::new();
        v.extend_from_slice(b"secret").unwrap();
        db.nodeinfo(a).unwrap().overif = Some(v);
        assert_eq!(db.outbound_verification(a), b"secret");
    }

    #[test]
    fn full_database_evicts_unnamed_then_declines() {
        let mut db = NodeDb::new();
        // Fill the table: all but one entry named
        for i in 1..=CAP as u16 {
            let addr = NodeAddr::new(1, i);
            db.nodeinfo(addr).unwrap();
            if i > 1 {
                db.set_name(addr, "N");
            }
        }

        // The unnamed entry makes room
        let newcomer = NodeAddr::new(2, 1);
        assert!(db.nodeinfo(newcomer).is_some());
        assert!(db.get(NodeAddr::new(1, 1)).is_none());

        // All named now: a further reference is declined and no
        // existing record is touched
        db.set_name(newcomer, "NEW");
        let refused = NodeAddr::new(2, 2);
        assert!(db.nodeinfo(refused).is_none());
        assert!(db.get(refused).is_none());
        assert_eq!(db.by_name("NEW"), Some(newcomer));
    }
}
