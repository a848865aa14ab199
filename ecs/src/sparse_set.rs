/// Sparse set keyed by entity slot index.
///
/// Uses a sparse array (entity index → dense index) and a dense array
/// (contiguous values + entity mapping) for O(1) insert/remove/get and
/// cache-friendly iteration. Removal swaps the last element into the hole,
/// so dense order is stable only between removals.
pub struct SparseSet<V> {
    /// Sparse array: `entity_index -> dense_index`. `None` means the entity
    /// has no value in this set.
    sparse: Vec<Option<u32>>,
    /// Dense array of values (contiguous for iteration).
    dense: Vec<V>,
    /// Entity indices corresponding to each dense element.
    entities: Vec<u32>,
}

impl<V> SparseSet<V> {
    pub fn new() -> Self {
        Self {
            sparse: Vec::new(),
            dense: Vec::new(),
            entities: Vec::new(),
        }
    }

    /// Inserts a value for the given entity index, returning the value it
    /// replaced, if any.
    pub fn insert(&mut self, entity_index: u32, value: V) -> Option<V> {
        let idx = entity_index as usize;

        // Grow sparse array if needed
        if idx >= self.sparse.len() {
            self.sparse.resize(idx + 1, None);
        }

        if let Some(dense_idx) = self.sparse[idx] {
            Some(std::mem::replace(&mut self.dense[dense_idx as usize], value))
        } else {
            let dense_idx = self.dense.len() as u32;
            self.sparse[idx] = Some(dense_idx);
            self.dense.push(value);
            self.entities.push(entity_index);
            None
        }
    }

    /// Removes the value for the given entity index.
    pub fn remove(&mut self, entity_index: u32) -> Option<V> {
        let idx = entity_index as usize;
        if idx >= self.sparse.len() {
            return None;
        }

        let dense_idx = self.sparse[idx]? as usize;
        self.sparse[idx] = None;

        let last_dense = self.dense.len() - 1;
        if dense_idx != last_dense {
            // Swap-remove: move last element into the removed slot
            let swapped_entity = self.entities[last_dense];
            self.sparse[swapped_entity as usize] = Some(dense_idx as u32);
            self.entities[dense_idx] = swapped_entity;
        }

        self.entities.pop();
        Some(self.dense.swap_remove(dense_idx))
    }

    pub fn get(&self, entity_index: u32) -> Option<&V> {
        let dense_idx = (*self.sparse.get(entity_index as usize)?)? as usize;
        Some(&self.dense[dense_idx])
    }

    pub fn get_mut(&mut self, entity_index: u32) -> Option<&mut V> {
        let dense_idx = (*self.sparse.get(entity_index as usize)?)? as usize;
        Some(&mut self.dense[dense_idx])
    }

    pub fn contains(&self, entity_index: u32) -> bool {
        let idx = entity_index as usize;
        idx < self.sparse.len() && self.sparse[idx].is_some()
    }

    /// Returns the `(entity_index, value)` pair at a dense position.
    pub fn get_dense(&self, position: usize) -> Option<(u32, &V)> {
        Some((*self.entities.get(position)?, &self.dense[position]))
    }

    pub fn len(&self) -> usize {
        self.dense.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dense.is_empty()
    }

    /// Pre-grows the sparse array to cover `entity_count` slots.
    pub fn reserve_entities(&mut self, entity_count: usize) {
        if entity_count > self.sparse.len() {
            self.sparse.resize(entity_count, None);
        }
    }

    /// Iterates over `(entity_index, &value)` pairs in dense order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &V)> {
        self.entities.iter().copied().zip(self.dense.iter())
    }

    /// Returns a slice of entity indices in dense order.
    pub fn entities(&self) -> &[u32] {
        &self.entities
    }
}

impl<V> Default for SparseSet<V> {
    fn default() -> Self {
        Self::new()
    }
}
