//! Dense clump arena with union by size.
//!
//! Clumps live in a flat vector and refer to each other by index, never by
//! reference; a clump points at most at one parent, so the structure is
//! acyclic by construction. The vertex count of a component is maintained at
//! its root.

use serde::{Deserialize, Serialize};

/// Union-find arena over clumps.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClumpArena {
  /// Parent clump index; a root points at itself.
  parent: Vec<u32>,
  /// Component vertex count, valid at roots.
  vertices: Vec<u64>,
}

impl ClumpArena {
  pub fn new() -> Self {
    ClumpArena::default()
  }

  pub fn len(&self) -> usize {
    self.parent.len()
  }

  pub fn is_empty(&self) -> bool {
    self.parent.is_empty()
  }

  /// Create a fresh clump holding `vertices` vertices.
  pub fn make_clump(&mut self, vertices: u64) -> u32 {
    let index = self.parent.len() as u32;
    self.parent.push(index);
    self.vertices.push(vertices);
    index
  }

  /// Root of the component containing `clump`, with path halving.
  pub fn find(&mut self, mut clump: u32) -> u32 {
    while self.parent[clump as usize] != clump {
      let grandparent = self.parent[self.parent[clump as usize] as usize];
      self.parent[clump as usize] = grandparent;
      clump = grandparent;
    }
    clump
  }

  /// Merge the components of `a` and `b`; returns the surviving root.
  pub fn union(&mut self, a: u32, b: u32) -> u32 {
    let ra = self.find(a);
    let rb = self.find(b);
    if ra == rb {
      return ra;
    }
    // Attach the smaller component under the larger one.
    let (big, small) = if self.vertices[ra as usize] >= self.vertices[rb as usize] {
      (ra, rb)
    } else {
      (rb, ra)
    };
    self.parent[small as usize] = big;
    self.vertices[big as usize] += self.vertices[small as usize];
    big
  }

  /// Vertex count of the component rooted at `root`.
  pub fn component_vertices(&mut self, clump: u32) -> u64 {
    let root = self.find(clump);
    self.vertices[root as usize]
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_union_accumulates_vertices() {
    let mut arena = ClumpArena::new();
    let a = arena.make_clump(5);
    let b = arena.make_clump(3);
    let c = arena.make_clump(1);

    assert_ne!(arena.find(a), arena.find(b));
    let root = arena.union(a, b);
    assert_eq!(arena.find(a), root);
    assert_eq!(arena.find(b), root);
    assert_eq!(arena.component_vertices(a), 8);

    arena.union(b, c);
    assert_eq!(arena.component_vertices(c), 9);
    assert_eq!(arena.find(c), arena.find(a));
  }

  #[test]
  fn test_self_union_is_noop() {
    let mut arena = ClumpArena::new();
    let a = arena.make_clump(4);
    let root = arena.union(a, a);
    assert_eq!(root, a);
    assert_eq!(arena.component_vertices(a), 4);
  }

  #[test]
  fn test_long_chain_finds_root() {
    let mut arena = ClumpArena::new();
    let clumps: Vec<u32> = (0..100).map(|_| arena.make_clump(1)).collect();
    for pair in clumps.windows(2) {
      arena.union(pair[0], pair[1]);
    }
    let root = arena.find(clumps[0]);
    for &clump in &clumps {
      assert_eq!(arena.find(clump), root);
    }
    assert_eq!(arena.component_vertices(root), 100);
  }
}
