use glam::Mat4;
use lyra_common::collections::Bitmap;
use tracing::trace_span;

/// Initial arena size in nodes. Must be a multiple of the occupancy
/// bitmap's word size.
const FIRST_GROW: usize = 32;

/// User data attached to a scene node.
pub trait NodeData {
    /// The node's local transform.
    fn local(&self) -> Mat4;

    /// Whether the local transform changed since the last call.
    ///
    /// [`Graph::update`] calls this exactly once per node per pass;
    /// implementations typically clear an internal dirty flag here.
    fn changed(&mut self) -> bool;
}

/// A scene node identifier.
///
/// Live identifiers are 1-based arena indices; [`Node::NIL`] is the zero
/// sentinel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Node(u32);

impl Node {
    pub const NIL: Self = Self(0);

    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }

    fn index(self) -> usize {
        debug_assert!(!self.is_nil());
        self.0 as usize - 1
    }

    fn from_index(index: usize) -> Self {
        Self(index as u32 + 1)
    }
}

/// Arena entry of one node. Links are node ids; 0 is nil.
///
/// `prev` encodes two relations: for a first child it points at the
/// parent, otherwise at the previous sibling. The cases are told apart by
/// testing `nodes[prev].sub == self`.
#[derive(Copy, Clone, Debug, Default)]
struct NodeRec {
    next: u32,
    prev: u32,
    sub: u32,
    /// Index into the packed data vector.
    data: u32,
}

struct DataRec {
    data: Box<dyn NodeData>,
    world: Mat4,
    /// Owning node id.
    node: u32,
}

/// An arena-backed tree propagating world transforms through dirty
/// flags.
///
/// Mutations and [`update`] must be externally serialized; the graph has
/// no internal locking.
///
/// [`update`]: Graph::update
#[derive(Default)]
pub struct Graph {
    /// Head of the root list.
    root: u32,
    world: Mat4,
    /// Sticky once [`set_world`] was called.
    ///
    /// [`set_world`]: Graph::set_world
    world_set: bool,
    /// Global dirty bit; forces recomputation of every node on the next
    /// [`update`].
    ///
    /// [`update`]: Graph::update
    dirty: bool,
    nodes: Vec<NodeRec>,
    map: Bitmap<u32>,
    data: Vec<DataRec>,
    // Reusable traversal caches.
    node_stack: Vec<u32>,
    data_stack: Vec<u32>,
    changed_stack: Vec<bool>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            world: Mat4::IDENTITY,
            ..Default::default()
        }
    }

    /// The number of live nodes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn contains(&self, n: Node) -> bool {
        !n.is_nil() && n.index() < self.map.len() && self.map.is_set(n.index())
    }

    fn rec(&self, n: Node) -> &NodeRec {
        &self.nodes[n.index()]
    }

    /// Inserts a node carrying `data`.
    ///
    /// With `prev == Node::NIL` the node is prepended to the root list;
    /// otherwise it becomes the new first child of `prev`, pushing the
    /// previous first child to the second position. The world transform
    /// starts as identity until the next [`update`].
    ///
    /// [`update`]: Graph::update
    pub fn insert(&mut self, data: Box<dyn NodeData>, prev: Node) -> Node {
        if !prev.is_nil() {
            assert!(self.contains(prev), "insert under a dead node");
        }

        let index = match self.map.search() {
            Some(index) => index,
            None => {
                let add = if self.nodes.is_empty() {
                    FIRST_GROW
                } else {
                    self.nodes.len()
                };
                self.map.grow(add / 32);
                self.nodes.resize(self.nodes.len() + add, NodeRec::default());
                self.map.search().unwrap()
            }
        };
        self.map.set(index);
        let n = Node::from_index(index);

        self.data.push(DataRec {
            data,
            world: Mat4::IDENTITY,
            node: n.0,
        });

        let rec = &mut self.nodes[index];
        rec.sub = 0;
        rec.data = self.data.len() as u32 - 1;

        if prev.is_nil() {
            rec.next = self.root;
            rec.prev = 0;
            let head = self.root;
            self.root = n.0;
            if head != 0 {
                self.nodes[head as usize - 1].prev = n.0;
            }
        } else {
            let first = self.nodes[prev.index()].sub;
            let rec = &mut self.nodes[index];
            rec.next = first;
            rec.prev = prev.0;
            self.nodes[prev.index()].sub = n.0;
            if first != 0 {
                self.nodes[first as usize - 1].prev = n.0;
            }
        }

        n
    }

    /// Removes `n` and its whole subtree, returning the removed data
    /// with every node ordered before its descendants.
    pub fn remove(&mut self, n: Node) -> Vec<Box<dyn NodeData>> {
        assert!(self.contains(n), "removing a dead node");

        // Unlink from the parent or sibling position.
        let rec = *self.rec(n);
        if rec.prev == 0 {
            if self.root == n.0 {
                self.root = rec.next;
            }
        } else {
            let prev = rec.prev as usize - 1;
            if self.nodes[prev].sub == n.0 {
                self.nodes[prev].sub = rec.next;
            } else {
                self.nodes[prev].next = rec.next;
            }
        }
        if rec.next != 0 {
            self.nodes[rec.next as usize - 1].prev = rec.prev;
        }

        // Collect the subtree depth-first; pushing next before sub means
        // every node is recorded before its descendants.
        let mut order = vec![n.0];
        self.node_stack.clear();
        if rec.sub != 0 {
            self.node_stack.push(rec.sub);
        }
        while let Some(id) = self.node_stack.pop() {
            order.push(id);
            let rec = self.nodes[id as usize - 1];
            if rec.next != 0 {
                self.node_stack.push(rec.next);
            }
            if rec.sub != 0 {
                self.node_stack.push(rec.sub);
            }
        }

        let mut removed = Vec::with_capacity(order.len());
        for id in order {
            let index = id as usize - 1;
            let slot = self.nodes[index].data as usize;

            // Compact the data vector by swapping in the last entry.
            let entry = self.data.swap_remove(slot);
            if slot < self.data.len() {
                let moved = self.data[slot].node;
                self.nodes[moved as usize - 1].data = slot as u32;
            }

            self.map.unset(index);
            self.nodes[index] = NodeRec::default();
            removed.push(entry.data);
        }

        if self.data.is_empty() {
            self.nodes.clear();
            self.map = Bitmap::new();
            self.root = 0;
        }

        removed
    }

    pub fn get(&self, n: Node) -> &dyn NodeData {
        assert!(self.contains(n));
        &*self.data[self.rec(n).data as usize].data
    }

    pub fn get_mut(&mut self, n: Node) -> &mut dyn NodeData {
        assert!(self.contains(n));
        let slot = self.rec(n).data as usize;
        &mut *self.data[slot].data
    }

    /// The node's world transform as of the last [`update`].
    ///
    /// [`update`]: Graph::update
    pub fn world(&self, n: Node) -> Mat4 {
        assert!(self.contains(n));
        self.data[self.rec(n).data as usize].world
    }

    /// Sets the global world transform applied above every root.
    pub fn set_world(&mut self, world: Mat4) {
        self.world = world;
        self.world_set = true;
        self.dirty = true;
    }

    /// Propagates world transforms.
    ///
    /// Walks each node exactly once, evaluating [`NodeData::changed`]
    /// exactly once per node, and recomputes the world of every node
    /// whose data changed, whose ancestor changed, or — while the global
    /// dirty bit is set — unconditionally.
    pub fn update(&mut self) {
        let _span = trace_span!("Graph::update").entered();

        let mut root = self.root;
        while root != 0 {
            let index = root as usize - 1;
            let slot = self.nodes[index].data as usize;

            let changed = self.data[slot].data.changed() || self.dirty;
            if changed {
                let local = self.data[slot].data.local();
                self.data[slot].world = if self.world_set {
                    self.world * local
                } else {
                    local
                };
            }

            let sub = self.nodes[index].sub;
            if sub != 0 {
                self.node_stack.push(sub);
                self.data_stack.push(slot as u32);
                self.changed_stack.push(changed);
            }

            while let Some(id) = self.node_stack.pop() {
                let parent_slot = self.data_stack.pop().unwrap() as usize;
                let inherited = self.changed_stack.pop().unwrap();

                let rec = self.nodes[id as usize - 1];

                // The sibling shares the parent's data index and the
                // inherited flag, not this node's.
                if rec.next != 0 {
                    self.node_stack.push(rec.next);
                    self.data_stack.push(parent_slot as u32);
                    self.changed_stack.push(inherited);
                }

                let slot = rec.data as usize;
                let changed = self.data[slot].data.changed() || inherited;
                if changed {
                    let local = self.data[slot].data.local();
                    let parent_world = self.data[parent_slot].world;
                    self.data[slot].world = parent_world * local;
                }

                if rec.sub != 0 {
                    self.node_stack.push(rec.sub);
                    self.data_stack.push(slot as u32);
                    self.changed_stack.push(changed);
                }
            }

            root = self.nodes[index].next;
        }

        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use glam::{Mat4, Vec3};

    use super::{Graph, Node, NodeData};

    struct TestData {
        local: Arc<std::sync::Mutex<Mat4>>,
        dirty: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
    }

    #[derive(Clone)]
    struct Probe {
        local: Arc<std::sync::Mutex<Mat4>>,
        dirty: Arc<AtomicBool>,
        calls: Arc<AtomicUsize>,
    }

    impl Probe {
        fn set_local(&self, local: Mat4) {
            *self.local.lock().unwrap() = local;
            self.dirty.store(true, Ordering::Relaxed);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::Relaxed)
        }
    }

    fn test_data(local: Mat4) -> (Box<dyn NodeData>, Probe) {
        let probe = Probe {
            local: Arc::new(std::sync::Mutex::new(local)),
            dirty: Arc::new(AtomicBool::new(true)),
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let data = TestData {
            local: probe.local.clone(),
            dirty: probe.dirty.clone(),
            calls: probe.calls.clone(),
        };
        (Box::new(data), probe)
    }

    impl NodeData for TestData {
        fn local(&self) -> Mat4 {
            *self.local.lock().unwrap()
        }

        fn changed(&mut self) -> bool {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.dirty.swap(false, Ordering::Relaxed)
        }
    }

    fn live_invariants(graph: &Graph) {
        let mut popcount = 0;
        for i in 0..graph.map.len() {
            if graph.map.is_set(i) {
                popcount += 1;
                let slot = graph.nodes[i].data as usize;
                assert_eq!(graph.data[slot].node as usize, i + 1);
            }
        }
        assert_eq!(graph.len(), popcount);
    }

    #[test]
    fn graph_insert_links() {
        let mut graph = Graph::new();

        let (d, _) = test_data(Mat4::IDENTITY);
        let a = graph.insert(d, Node::NIL);
        let (d, _) = test_data(Mat4::IDENTITY);
        let b = graph.insert(d, Node::NIL);

        // The newest root heads the list.
        assert_eq!(graph.root, b.0);
        assert_eq!(graph.rec(b).next, a.0);
        assert_eq!(graph.rec(a).prev, b.0);
        assert_eq!(graph.rec(b).prev, 0);

        // First child, then a second child pushed in front of it.
        let (d, _) = test_data(Mat4::IDENTITY);
        let c = graph.insert(d, a);
        let (d, _) = test_data(Mat4::IDENTITY);
        let e = graph.insert(d, a);

        assert_eq!(graph.rec(a).sub, e.0);
        assert_eq!(graph.rec(e).next, c.0);
        // First child back-links to the parent, second to its sibling.
        assert_eq!(graph.rec(e).prev, a.0);
        assert_eq!(graph.rec(c).prev, e.0);

        assert_eq!(graph.len(), 4);
        live_invariants(&graph);
    }

    #[test]
    fn graph_remove_subtree() {
        let mut graph = Graph::new();

        let (d, _) = test_data(Mat4::IDENTITY);
        let root = graph.insert(d, Node::NIL);
        let (d, _) = test_data(Mat4::IDENTITY);
        let a = graph.insert(d, root);
        let (d, _) = test_data(Mat4::IDENTITY);
        let b = graph.insert(d, root);
        let (d, _) = test_data(Mat4::IDENTITY);
        let _leaf = graph.insert(d, a);

        let (d, _) = test_data(Mat4::IDENTITY);
        let other = graph.insert(d, Node::NIL);

        assert_eq!(graph.len(), 5);
        live_invariants(&graph);

        let removed = graph.remove(root);
        assert_eq!(removed.len(), 4);
        assert_eq!(graph.len(), 1);
        assert!(graph.contains(other));
        assert!(!graph.contains(root));
        assert!(!graph.contains(a));
        assert!(!graph.contains(b));
        live_invariants(&graph);

        // Removing the last node resets the arena.
        graph.remove(other);
        assert!(graph.is_empty());
        assert_eq!(graph.nodes.len(), 0);
        assert_eq!(graph.map.len(), 0);

        // The graph is usable afterwards.
        let (d, _) = test_data(Mat4::IDENTITY);
        let n = graph.insert(d, Node::NIL);
        assert!(graph.contains(n));
        live_invariants(&graph);
    }

    #[test]
    fn graph_remove_middle_sibling() {
        let mut graph = Graph::new();

        let (d, _) = test_data(Mat4::IDENTITY);
        let parent = graph.insert(d, Node::NIL);
        let (d, _) = test_data(Mat4::IDENTITY);
        let c = graph.insert(d, parent);
        let (d, _) = test_data(Mat4::IDENTITY);
        let b = graph.insert(d, parent);
        let (d, _) = test_data(Mat4::IDENTITY);
        let a = graph.insert(d, parent);

        // Children are a, b, c front to back.
        graph.remove(b);

        assert_eq!(graph.rec(parent).sub, a.0);
        assert_eq!(graph.rec(a).next, c.0);
        assert_eq!(graph.rec(c).prev, a.0);
        live_invariants(&graph);

        // Removing the first child promotes its sibling.
        graph.remove(a);
        assert_eq!(graph.rec(parent).sub, c.0);
        assert_eq!(graph.rec(c).prev, parent.0);
    }

    #[test]
    fn graph_chain_update() {
        let mut graph = Graph::new();

        // A straight chain of five nodes, all local = identity.
        let mut probes = Vec::new();
        let mut prev = Node::NIL;
        let mut nodes = Vec::new();
        for _ in 0..5 {
            let (d, probe) = test_data(Mat4::IDENTITY);
            prev = graph.insert(d, prev);
            probes.push(probe);
            nodes.push(prev);
        }

        graph.update();
        for &n in &nodes {
            assert_eq!(graph.world(n), Mat4::IDENTITY);
        }
        for probe in &probes {
            assert_eq!(probe.calls(), 1);
        }

        let s = Mat4::from_scale(Vec3::new(2.0, 2.0, 2.0));
        graph.set_world(s);
        graph.update();

        // Identity locals collapse every world to the global transform.
        for &n in &nodes {
            assert_eq!(graph.world(n), s);
        }
        for probe in &probes {
            assert_eq!(probe.calls(), 2);
        }

        // Mutating the third node's local leaves the first two worlds
        // untouched and propagates to the chain below it.
        let t = Mat4::from_translation(Vec3::new(1.0, 0.0, 0.0));
        probes[2].set_local(t);
        graph.update();

        assert_eq!(graph.world(nodes[0]), s);
        assert_eq!(graph.world(nodes[1]), s);
        assert_eq!(graph.world(nodes[2]), s * t);
        assert_eq!(graph.world(nodes[3]), s * t);
        assert_eq!(graph.world(nodes[4]), s * t);

        // Changed() ran exactly once per node per update.
        for probe in &probes {
            assert_eq!(probe.calls(), 3);
        }
    }

    #[test]
    fn graph_update_siblings_inherit_parent_flag() {
        let mut graph = Graph::new();

        let (d, root_probe) = test_data(Mat4::IDENTITY);
        let root = graph.insert(d, Node::NIL);
        let (d, _) = test_data(Mat4::from_translation(Vec3::X));
        let b = graph.insert(d, root);
        let (d, _) = test_data(Mat4::from_translation(Vec3::Y));
        let a = graph.insert(d, root);

        graph.update();
        assert_eq!(graph.world(a), Mat4::from_translation(Vec3::Y));
        assert_eq!(graph.world(b), Mat4::from_translation(Vec3::X));

        // A root change recomputes both children against the root world,
        // not against each other.
        root_probe.set_local(Mat4::from_translation(Vec3::Z));
        graph.update();

        assert_eq!(graph.world(root), Mat4::from_translation(Vec3::Z));
        assert_eq!(
            graph.world(a),
            Mat4::from_translation(Vec3::Z) * Mat4::from_translation(Vec3::Y),
        );
        assert_eq!(
            graph.world(b),
            Mat4::from_translation(Vec3::Z) * Mat4::from_translation(Vec3::X),
        );
    }

    #[test]
    fn graph_arena_growth() {
        let mut graph = Graph::new();

        let mut nodes = Vec::new();
        for _ in 0..100 {
            let (d, _) = test_data(Mat4::IDENTITY);
            nodes.push(graph.insert(d, Node::NIL));
        }
        assert_eq!(graph.len(), 100);
        live_invariants(&graph);

        for n in nodes.drain(50..) {
            graph.remove(n);
        }
        assert_eq!(graph.len(), 50);
        live_invariants(&graph);

        // Freed slots are reused.
        let before = graph.nodes.len();
        for _ in 0..10 {
            let (d, _) = test_data(Mat4::IDENTITY);
            graph.insert(d, Node::NIL);
        }
        assert_eq!(graph.nodes.len(), before);
        live_invariants(&graph);
    }
}
