//! Ordered upstream lists with explicit re-indexing.
//!
//! A registry's upstreams are kept as a dense vector; the 1-based index of an
//! upstream in the vector is its position. Every mutation re-derives the full
//! position assignment so callers can persist it in one transaction.

use crate::registry::MAX_UPSTREAMS_PER_REGISTRY;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpstreamOrder {
    ids: Vec<Uuid>,
    capacity: usize,
}

impl Default for UpstreamOrder {
    fn default() -> Self {
        Self {
            ids: Vec::new(),
            capacity: MAX_UPSTREAMS_PER_REGISTRY,
        }
    }
}

impl UpstreamOrder {
    /// Build from `(id, position)` pairs as stored. Gaps and duplicates in the
    /// stored positions are collapsed; ties keep their input order.
    pub fn from_positions(mut rows: Vec<(Uuid, i32)>) -> Self {
        rows.sort_by_key(|(_, pos)| *pos);
        Self {
            ids: rows.into_iter().map(|(id, _)| id).collect(),
            capacity: MAX_UPSTREAMS_PER_REGISTRY,
        }
    }

    /// Override the maximum length.
    pub fn with_capacity_limit(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[Uuid] {
        &self.ids
    }

    /// 1-based position of an id.
    pub fn position_of(&self, id: Uuid) -> Option<u32> {
        self.ids.iter().position(|x| *x == id).map(|i| i as u32 + 1)
    }

    /// Insert at a 1-based position, or append when `None`.
    pub fn insert(&mut self, id: Uuid, position: Option<u32>) -> crate::Result<u32> {
        if self.ids.len() >= self.capacity {
            return Err(crate::Error::TooManyUpstreams(self.capacity));
        }
        if self.ids.contains(&id) {
            return self.position_of(id).ok_or(crate::Error::UnknownUpstream(id));
        }
        let max = self.ids.len() as u32 + 1;
        let pos = position.unwrap_or(max);
        if pos == 0 || pos > max {
            return Err(crate::Error::InvalidPosition { position: pos, max });
        }
        self.ids.insert(pos as usize - 1, id);
        Ok(pos)
    }

    /// Remove an id; later entries shift up by one.
    pub fn remove(&mut self, id: Uuid) -> crate::Result<()> {
        let idx = self
            .ids
            .iter()
            .position(|x| *x == id)
            .ok_or(crate::Error::UnknownUpstream(id))?;
        self.ids.remove(idx);
        Ok(())
    }

    /// Move an id to a new 1-based position.
    pub fn move_to(&mut self, id: Uuid, position: u32) -> crate::Result<()> {
        let max = self.ids.len() as u32;
        if position == 0 || position > max {
            return Err(crate::Error::InvalidPosition { position, max });
        }
        self.remove(id)?;
        self.ids.insert(position as usize - 1, id);
        Ok(())
    }

    /// Contiguous 1-based position assignment.
    pub fn positions(&self) -> Vec<(Uuid, i32)> {
        self.ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, i as i32 + 1))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|_| Uuid::new_v4()).collect()
    }

    fn assert_contiguous(order: &UpstreamOrder) {
        let positions: Vec<i32> = order.positions().into_iter().map(|(_, p)| p).collect();
        let expected: Vec<i32> = (1..=order.len() as i32).collect();
        assert_eq!(positions, expected);
    }

    #[test]
    fn test_from_positions_collapses_gaps() {
        let u = ids(3);
        let order = UpstreamOrder::from_positions(vec![(u[2], 9), (u[0], 1), (u[1], 4)]);
        assert_eq!(order.ids(), &[u[0], u[1], u[2]]);
        assert_contiguous(&order);
    }

    #[test]
    fn test_insert_append_and_middle() {
        let u = ids(3);
        let mut order = UpstreamOrder::default();
        assert_eq!(order.insert(u[0], None).unwrap(), 1);
        assert_eq!(order.insert(u[1], None).unwrap(), 2);
        assert_eq!(order.insert(u[2], Some(1)).unwrap(), 1);
        assert_eq!(order.ids(), &[u[2], u[0], u[1]]);
        assert_contiguous(&order);
    }

    #[test]
    fn test_insert_rejects_out_of_range() {
        let mut order = UpstreamOrder::default();
        assert!(matches!(
            order.insert(Uuid::new_v4(), Some(3)),
            Err(crate::Error::InvalidPosition { .. })
        ));
    }

    #[test]
    fn test_capacity_limit() {
        let mut order = UpstreamOrder::default().with_capacity_limit(2);
        order.insert(Uuid::new_v4(), None).unwrap();
        order.insert(Uuid::new_v4(), None).unwrap();
        assert!(matches!(
            order.insert(Uuid::new_v4(), None),
            Err(crate::Error::TooManyUpstreams(2))
        ));
    }

    #[test]
    fn test_remove_reindexes() {
        let u = ids(4);
        let mut order = UpstreamOrder::from_positions(
            u.iter().enumerate().map(|(i, id)| (*id, i as i32 + 1)).collect(),
        );
        order.remove(u[1]).unwrap();
        assert_eq!(order.position_of(u[2]), Some(2));
        assert_eq!(order.position_of(u[3]), Some(3));
        assert_contiguous(&order);
        assert!(order.remove(u[1]).is_err());
    }

    #[test]
    fn test_move_to_front_and_back() {
        let u = ids(4);
        let mut order = UpstreamOrder::from_positions(
            u.iter().enumerate().map(|(i, id)| (*id, i as i32 + 1)).collect(),
        );
        order.move_to(u[3], 1).unwrap();
        assert_eq!(order.ids(), &[u[3], u[0], u[1], u[2]]);
        order.move_to(u[3], 4).unwrap();
        assert_eq!(order.ids(), &[u[0], u[1], u[2], u[3]]);
        assert!(order.move_to(u[0], 5).is_err());
        assert_contiguous(&order);
    }
}
