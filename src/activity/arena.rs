//! Generational arena of activity records with explicit handle counts.

use std::collections::VecDeque;

use super::{ActivityId, ActivityRecord};

struct Slot {
    generation: u32,
    record: Option<ActivityRecord>,
}

/// Owns every live activity record.
///
/// Handle counts are adjusted explicitly with [`retain`](Self::retain) and
/// [`release`](Self::release). Nothing is freed until [`sweep`](Self::sweep),
/// which maestro calls once per scheduling pass while every actor is
/// suspended, so freeing order is deterministic.
#[derive(Default)]
pub(crate) struct ActivityArena {
    slots: Vec<Slot>,
    free: VecDeque<u32>,
    live: usize,
}

impl ActivityArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new record built for its freshly minted id.
    pub fn insert(&mut self, build: impl FnOnce(ActivityId) -> ActivityRecord) -> ActivityId {
        let index = match self.free.pop_front() {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    record: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        let id = ActivityId::new(index, slot.generation);
        slot.record = Some(build(id));
        self.live += 1;
        id
    }

    pub fn get(&self, id: ActivityId) -> Option<&ActivityRecord> {
        self.slots
            .get(id.index() as usize)
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.record.as_ref())
    }

    pub fn get_mut(&mut self, id: ActivityId) -> Option<&mut ActivityRecord> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.record.as_mut())
    }

    pub fn contains(&self, id: ActivityId) -> bool {
        self.get(id).is_some()
    }

    /// Count one more holder of `id`.
    pub fn retain(&mut self, id: ActivityId) {
        if let Some(rec) = self.get_mut(id) {
            rec.refs += 1;
        }
    }

    /// Drop one holder of `id`. Returns `false` for an unknown id or a
    /// count that was already zero.
    pub fn release(&mut self, id: ActivityId) -> bool {
        match self.get_mut(id) {
            Some(rec) if rec.refs > 0 => {
                rec.refs -= 1;
                true
            }
            _ => false,
        }
    }

    /// Free every record nobody holds any more, in slot order.
    pub fn sweep(&mut self) -> Vec<ActivityRecord> {
        let mut freed = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let unheld = slot.record.as_ref().is_some_and(|r| r.refs == 0);
            if unheld {
                if let Some(rec) = slot.record.take() {
                    slot.generation = slot.generation.wrapping_add(1);
                    self.free.push_back(index as u32);
                    freed.push(rec);
                }
            }
        }
        self.live -= freed.len();
        freed
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Ids of every live record, in slot order.
    pub fn ids(&self) -> Vec<ActivityId> {
        self.slots
            .iter()
            .filter_map(|s| s.record.as_ref().map(|r| r.id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::{ActivityDetail, ExecRecord};
    use crate::platform::HostId;
    use crate::time::VirtualTime;

    fn record(id: ActivityId) -> ActivityRecord {
        ActivityRecord::new(
            id,
            ActivityDetail::Exec(ExecRecord {
                hosts: vec![HostId::new(0)],
                flops: 1.0,
                priority: 1.0,
                bound: None,
            }),
            VirtualTime::ZERO,
        )
    }

    #[test]
    fn test_insert_and_get() {
        let mut arena = ActivityArena::new();
        let a = arena.insert(record);
        let b = arena.insert(record);
        assert_ne!(a, b);
        assert_eq!(arena.get(a).map(|r| r.id), Some(a));
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_sweep_frees_only_unheld() {
        let mut arena = ActivityArena::new();
        let a = arena.insert(record);
        let b = arena.insert(record);
        arena.retain(b);

        let freed: Vec<ActivityId> = arena.sweep().iter().map(|r| r.id).collect();
        assert_eq!(freed, vec![a]);
        assert!(!arena.contains(a));
        assert!(arena.contains(b));

        assert!(arena.release(b));
        assert!(!arena.release(b));
        assert_eq!(arena.sweep().len(), 1);
        assert!(arena.is_empty());
    }

    #[test]
    fn test_reused_slot_gets_new_generation() {
        let mut arena = ActivityArena::new();
        let a = arena.insert(record);
        arena.sweep();
        let b = arena.insert(record);
        assert_eq!(a.index(), b.index());
        assert_ne!(a.generation(), b.generation());
        assert!(arena.get(a).is_none());
        assert!(arena.get(b).is_some());
    }

    #[test]
    fn test_release_unknown_id() {
        let mut arena = ActivityArena::new();
        assert!(!arena.release(ActivityId::new(9, 0)));
        assert!(arena.ids().is_empty());
    }
}
