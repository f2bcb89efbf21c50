use crate::config::{InitialOffset, RebalanceStrategy};
use crate::memory::broker::{Event, Record};
use bytes::Bytes;
use log::{debug, trace};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;

pub(crate) type EventSink = mpsc::UnboundedSender<Event>;

/// Distributes the partitions among the members. Members are expected in a stable order.
pub(crate) fn assign(strategy: RebalanceStrategy, members: &[&str], partitions: u32) -> HashMap<String, Vec<u32>> {
    let mut assignment: HashMap<String, Vec<u32>> = members.iter().map(|m| (m.to_string(), vec![])).collect();

    if members.is_empty() {
        return assignment;
    }

    let n = members.len() as u32;

    match strategy {
        RebalanceStrategy::RoundRobin => {
            for p in 0..partitions {
                if let Some(owned) = assignment.get_mut(members[(p % n) as usize]) {
                    owned.push(p);
                }
            }
        }
        RebalanceStrategy::Range => {
            let per_member = partitions / n;
            let extra = partitions % n;
            let mut next = 0u32;

            for (i, member) in members.iter().enumerate() {
                let len = per_member + u32::from((i as u32) < extra);

                if let Some(owned) = assignment.get_mut(*member) {
                    owned.extend(next..next + len);
                }

                next += len;
            }
        }
    }

    assignment
}

struct Member {
    sink: Option<EventSink>,
    /// The generation the member joined, `None` if it needs to rejoin.
    joined: Option<u64>,
    partitions: Vec<u32>,
    /// Next offset to push per assigned partition.
    positions: HashMap<u32, u64>,
}

/// A consumer group of one topic.
pub(crate) struct Group {
    topic: String,
    strategy: RebalanceStrategy,
    initial_offset: InitialOffset,
    pub(crate) generation: u64,
    pub(crate) closed: bool,
    members: BTreeMap<String, Member>,
    committed: HashMap<u32, u64>,
    /// Offsets a fresh group starts from if it reads from the newest records.
    start_offsets: HashMap<u32, u64>,
    attempts: HashMap<(u32, u64), u32>,
}

impl Group {
    pub(crate) fn new(topic: &str, strategy: RebalanceStrategy, initial_offset: InitialOffset) -> Self {
        Group {
            topic: topic.to_string(),
            strategy,
            initial_offset,
            generation: 0,
            closed: false,
            members: BTreeMap::new(),
            committed: HashMap::new(),
            start_offsets: HashMap::new(),
            attempts: HashMap::new(),
        }
    }

    pub(crate) fn is_member(&self, member_id: &str) -> bool {
        self.members.contains_key(member_id)
    }

    /// Joins or rejoins a member and pushes the available records of its partitions. Returns the
    /// generation and the assigned partitions.
    pub(crate) fn join(&mut self, member_id: &str, sink: EventSink, log: &[Vec<Bytes>]) -> (u64, Vec<u32>) {
        if !self.members.contains_key(member_id) {
            self.members.insert(
                member_id.to_string(),
                Member {
                    sink: None,
                    joined: None,
                    partitions: vec![],
                    positions: HashMap::new(),
                },
            );

            self.rebalance(log.len() as u32);
        }

        let generation = self.generation;
        let mut positions = HashMap::new();

        let partitions = match self.members.get(member_id) {
            Some(member) => member.partitions.clone(),
            None => vec![],
        };

        for p in &partitions {
            positions.insert(*p, self.start_position(*p, log));
        }

        if let Some(member) = self.members.get_mut(member_id) {
            member.sink = Some(sink);
            member.joined = Some(generation);
            member.positions = positions;
        }

        debug!(
            "Member {} joined group of {} gen {} partitions {:?}",
            member_id, self.topic, generation, partitions
        );

        for p in &partitions {
            self.push(member_id, *p, log);
        }

        (generation, partitions)
    }

    /// Removes a member, the rest of the group needs to rejoin. Returns `false` if it wasn't a
    /// member.
    pub(crate) fn leave(&mut self, member_id: &str, partitions: u32) -> bool {
        if self.members.remove(member_id).is_none() {
            return false;
        }

        debug!("Member {} left group of {}", member_id, self.topic);

        self.rebalance(partitions);

        true
    }

    /// Starts a new generation: the partitions are reassigned and every joined member is told to
    /// rejoin.
    pub(crate) fn rebalance(&mut self, partitions: u32) {
        self.generation += 1;

        let ids: Vec<String> = self.members.keys().cloned().collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let mut assignment = assign(self.strategy, &refs, partitions);

        for (id, member) in self.members.iter_mut() {
            member.partitions = assignment.remove(id).unwrap_or_default();
            member.positions.clear();

            if member.joined.take().is_some() {
                if let Some(sink) = &member.sink {
                    let _ = sink.send(Event::Revoked);
                }
            }
        }

        debug!("Group of {} rebalanced, generation {}", self.topic, self.generation);
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;

        for (_, member) in std::mem::take(&mut self.members) {
            if let Some(sink) = member.sink {
                let _ = sink.send(Event::GroupClosed);
            }
        }
    }

    pub(crate) fn commit(&mut self, partition: u32, offset: u64) {
        let next = offset + 1;
        let committed = self.committed.entry(partition).or_insert(0);

        if next > *committed {
            *committed = next;

            // records below the committed offset are never delivered to the group again
            self.attempts.retain(|(p, o), _| *p != partition || *o >= next);
        }
    }

    pub(crate) fn committed(&self, partition: u32) -> Option<u64> {
        self.committed.get(&partition).copied()
    }

    /// Pushes the not yet delivered records of a partition to its owner, if the owner has joined
    /// the current generation.
    pub(crate) fn push_partition(&mut self, partition: u32, log: &[Vec<Bytes>]) {
        let owner = self
            .members
            .iter()
            .find(|(_, m)| m.joined == Some(self.generation) && m.partitions.contains(&partition))
            .map(|(id, _)| id.clone());

        if let Some(id) = owner {
            self.push(&id, partition, log);
        }
    }

    fn start_position(&mut self, partition: u32, log: &[Vec<Bytes>]) -> u64 {
        if let Some(committed) = self.committed.get(&partition) {
            return *committed;
        }

        match self.initial_offset {
            InitialOffset::Oldest => 0,
            InitialOffset::Newest => {
                let end = log.get(partition as usize).map(|l| l.len() as u64).unwrap_or(0);

                *self.start_offsets.entry(partition).or_insert(end)
            }
        }
    }

    fn push(&mut self, member_id: &str, partition: u32, log: &[Vec<Bytes>]) {
        let records = match log.get(partition as usize) {
            Some(records) => records,
            None => return,
        };

        let member = match self.members.get_mut(member_id) {
            Some(member) => member,
            None => return,
        };

        let sink = match &member.sink {
            Some(sink) => sink,
            None => return,
        };

        let position = member.positions.entry(partition).or_insert(0);

        while (*position as usize) < records.len() {
            let offset = *position;
            let attempt = self.attempts.entry((partition, offset)).or_insert(0);
            *attempt += 1;

            trace!("Push {}/{}/{} to {}", self.topic, partition, offset, member_id);

            let record = Record {
                topic: self.topic.clone(),
                partition,
                offset,
                payload: records[offset as usize].clone(),
                attempt: *attempt,
            };

            if sink.send(Event::Record(record)).is_err() {
                // The member dropped its receiver, it will rejoin with a new one.
                break;
            }

            *position += 1;
        }
    }
}
