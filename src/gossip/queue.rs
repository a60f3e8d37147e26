use crate::{
    common::{Address, MemberId},
    member::Member,
};
use bincode::{serialized_size, Result};
use std::{
    cmp::Ordering,
    collections::{BTreeSet, HashMap},
};
use tracing::error;

#[derive(Debug, Clone)]
struct LimitedUpdate {
    transmits: u64,
    id: u64,
    member: Member,
}

// Order by number of transmits followed by decreasing id as id increases
// for every generation.
//
// - [transmits=0, ..., transmits=inf]
// - [transmits=0:id=999, ..., transmits=0:id=1, ...]
impl Ord for LimitedUpdate {
    fn cmp(&self, other: &LimitedUpdate) -> Ordering {
        self.transmits
            .cmp(&other.transmits)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for LimitedUpdate {
    fn partial_cmp(&self, other: &LimitedUpdate) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for LimitedUpdate {
    fn eq(&self, other: &LimitedUpdate) -> bool {
        self.transmits == other.transmits && self.id == other.id
    }
}

impl Eq for LimitedUpdate {}

impl LimitedUpdate {
    fn bound(transmits: u64, id: u64, member: &Member) -> Self {
        Self {
            transmits,
            id,
            member: member.clone(),
        }
    }
}

/// TransmitQueue holds member records waiting to be piggy-backed on gossip
/// pushes and limits how many times each one is sent. It prioritizes records
/// with lower transmit counts and, within a tier, newer records, so the items
/// yielded by the queue are ordered newest first. Queuing a record for a
/// member that already has one queued replaces the older record.
#[derive(Debug)]
pub(crate) struct TransmitQueue {
    set: BTreeSet<LimitedUpdate>,
    /// Queue position of the record held for each member.
    index: HashMap<MemberId, (u64, u64)>,
    gen: u64,
    max_transmits: u64,
}

impl TransmitQueue {
    pub(crate) fn new(max_transmits: u64) -> Self {
        Self {
            set: BTreeSet::new(),
            index: HashMap::new(),
            gen: 0,
            max_transmits,
        }
    }

    /// Return the number of records currently present in the queue.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.set.len()
    }

    fn add(&mut self, val: LimitedUpdate) {
        self.index
            .insert(val.member.id().clone(), (val.transmits, val.id));
        self.set.insert(val);
    }

    fn delete(&mut self, val: &LimitedUpdate) {
        self.index.remove(val.member.id());
        self.set.remove(val);
    }

    /// Queue `member` for dissemination, invalidating any older record of the
    /// same member. A record older than the one already queued is dropped.
    pub(crate) fn enqueue(&mut self, member: Member) {
        if let Some(&(transmits, id)) = self.index.get(member.id()) {
            let key = LimitedUpdate::bound(transmits, id, &member);

            if let Some(held) = self.set.get(&key) {
                if held.member.incarnation() > member.incarnation() {
                    return;
                }
            }

            self.index.remove(member.id());
            self.set.remove(&key);
        }

        self.gen = self.gen.wrapping_add(1);

        self.add(LimitedUpdate {
            member,
            transmits: 0,
            id: self.gen,
        });
    }

    /// Returns records ordered by fewest transmits, then newest first. The
    /// total serialized size of the returned `Vec` stays within
    /// `size_limit`.
    pub(crate) fn get_updates(&mut self, size_limit: usize) -> Result<Vec<Member>> {
        let mut reinsert = vec![];
        let mut updates: Vec<Member> = vec![];

        // An empty vec still costs its length prefix.
        let mut used = serialized_size(&updates)?;
        let limit = size_limit as u64;

        let (min, max) = match (self.set.iter().next(), self.set.iter().next_back()) {
            (Some(first), Some(last)) => (first.transmits, last.transmits),
            _ => return Ok(updates),
        };
        let marker = Member::new("", Address::new("", 0));

        // Walk the queue one transmit tier at a time. Every record that fits
        // the remaining budget is taken and pruned; records that have not yet
        // reached `max_transmits` are put back once the walk is over so the
        // same call never yields them twice.
        for transmits in min..=max {
            if used >= limit {
                break;
            }

            // Ids sort in decreasing order, so `u64::MAX` opens a tier.
            let start = LimitedUpdate::bound(transmits, u64::MAX, &marker);
            let end = LimitedUpdate::bound(transmits + 1, u64::MAX, &marker);

            let mut prune = vec![];

            for item in self.set.range(start..end) {
                let size = match serialized_size(&item.member) {
                    Ok(n) => n,
                    Err(e) => {
                        error!("serialization error: {:?}", e);
                        prune.push(item.clone());
                        continue;
                    }
                };

                if used + size > limit {
                    continue;
                }

                used += size;
                updates.push(item.member.clone());
                prune.push(item.clone());

                if item.transmits + 1 < self.max_transmits {
                    reinsert.push(item.clone())
                }
            }

            for item in &prune {
                self.delete(item);
            }
        }

        for mut item in reinsert {
            item.transmits += 1;
            self.add(item);
        }

        Ok(updates)
    }
}
