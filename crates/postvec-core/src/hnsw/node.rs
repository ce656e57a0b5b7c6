//! Node representation in the HNSW graph

/// Adjacency of one label in the graph.
///
/// The node's label is its position in the index's node list, so only the
/// per-layer neighbor lists are stored.
/// - `layers[0]` = neighbors at layer 0 (base, everyone)
/// - `layers[n]` = neighbors at layer n (express, fewer nodes)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub layers: Vec<Vec<u32>>,
}

impl Node {
    /// Create a node present on layers `0..=top_layer`
    pub fn new(top_layer: usize) -> Self {
        Self {
            layers: vec![Vec::new(); top_layer + 1],
        }
    }

    /// Highest layer this node exists on
    pub fn top_layer(&self) -> usize {
        self.layers.len().saturating_sub(1)
    }

    /// Neighbors at `layer`, empty if the node does not reach that layer
    pub fn neighbors(&self, layer: usize) -> &[u32] {
        self.layers.get(layer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Add a neighbor at a layer, ignoring duplicates
    pub fn link(&mut self, layer: usize, neighbor: u32) {
        if let Some(list) = self.layers.get_mut(layer) {
            if !list.contains(&neighbor) {
                list.push(neighbor);
            }
        }
    }

    /// Replace the neighbor list at a layer
    pub fn set_neighbors(&mut self, layer: usize, neighbors: Vec<u32>) {
        if let Some(list) = self.layers.get_mut(layer) {
            *list = neighbors;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_layers() {
        let node = Node::new(3);
        assert_eq!(node.layers.len(), 4);
        assert_eq!(node.top_layer(), 3);
        assert!(node.neighbors(7).is_empty());
    }

    #[test]
    fn test_link_dedups() {
        let mut node = Node::new(1);
        node.link(0, 4);
        node.link(0, 4);
        node.link(1, 2);
        node.link(5, 9);
        assert_eq!(node.neighbors(0), &[4]);
        assert_eq!(node.neighbors(1), &[2]);
    }

    #[test]
    fn test_set_neighbors() {
        let mut node = Node::new(0);
        node.link(0, 1);
        node.set_neighbors(0, vec![3, 2]);
        assert_eq!(node.neighbors(0), &[3, 2]);
    }
}
