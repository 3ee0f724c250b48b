//! Classification of requests: priority, traffic class, persistence and
//! which scheduler a request belongs to.

use crate::KeyType;

/// Priority class of a request. Lower is more urgent.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum PriorityClass {
    /// Reserved for the node's own housekeeping fetches.
    Maximum = 0,
    /// A user is waiting on this right now.
    Interactive = 1,
    /// Blocks of a download a user is waiting on.
    ImmediateSplitfile = 2,
    /// Polling for updated signed documents.
    Update = 3,
    /// Background downloads.
    BulkSplitfile = 4,
    /// Speculative fetches.
    Prefetch = 5,
    /// Least urgent.
    Minimum = 6,
}

impl PriorityClass {
    /// Number of priority classes.
    pub const COUNT: usize = 7;

    /// All priority classes, most urgent first.
    pub const ALL: [PriorityClass; Self::COUNT] = [
        PriorityClass::Maximum,
        PriorityClass::Interactive,
        PriorityClass::ImmediateSplitfile,
        PriorityClass::Update,
        PriorityClass::BulkSplitfile,
        PriorityClass::Prefetch,
        PriorityClass::Minimum,
    ];

    /// Index of this class into per-class tables.
    pub fn index(self) -> usize {
        self as usize
    }

    /// The class at a table index, if in range.
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

/// Two independent priority universes, so interactive and background
/// transfers do not starve each other.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum TrafficClass {
    /// Throughput-oriented background traffic.
    Bulk,
    /// Latency-sensitive traffic.
    RealTime,
}

impl TrafficClass {
    /// Both traffic classes.
    pub const ALL: [TrafficClass; 2] = [TrafficClass::Bulk, TrafficClass::RealTime];

    /// Select the class from a real-time flag.
    pub fn from_real_time(real_time: bool) -> Self {
        if real_time {
            TrafficClass::RealTime
        } else {
            TrafficClass::Bulk
        }
    }

    /// Returns true for [TrafficClass::RealTime].
    pub fn is_real_time(&self) -> bool {
        matches!(self, TrafficClass::RealTime)
    }
}

/// Whether a request's state must survive a restart.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum Persistence {
    /// State is checkpointed. Mutations go through the checkpointing
    /// job runner.
    Durable,
    /// State is abandoned on restart. Mutations run immediately.
    Ephemeral,
}

impl Persistence {
    /// Returns true for [Persistence::Durable].
    pub fn is_durable(&self) -> bool {
        matches!(self, Persistence::Durable)
    }
}

/// Whether an operation reads or writes blocks.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum OpKind {
    /// Fetch blocks.
    Fetch,
    /// Insert blocks.
    Insert,
}

/// Identity of one scheduler: key type × fetch/insert × traffic class.
///
/// Persistence is not part of the identity: each scheduler serves both
/// durable and ephemeral requests.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerId {
    /// Key type served.
    pub key_type: KeyType,
    /// Fetch or insert.
    pub op_kind: OpKind,
    /// Traffic class served.
    pub traffic: TrafficClass,
}

impl SchedulerId {
    /// Construct a scheduler id.
    pub fn new(key_type: KeyType, op_kind: OpKind, traffic: TrafficClass) -> Self {
        Self {
            key_type,
            op_kind,
            traffic,
        }
    }

    /// All 8 scheduler identities.
    pub fn all() -> Vec<SchedulerId> {
        let mut out = Vec::with_capacity(8);
        for key_type in KeyType::ALL {
            for op_kind in [OpKind::Fetch, OpKind::Insert] {
                for traffic in TrafficClass::ALL {
                    out.push(SchedulerId::new(key_type, op_kind, traffic));
                }
            }
        }
        out
    }

    /// Returns true if this scheduler handles inserts.
    pub fn is_insert(&self) -> bool {
        matches!(self.op_kind, OpKind::Insert)
    }
}

impl std::fmt::Display for SchedulerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self.op_kind {
            OpKind::Fetch => "fetch",
            OpKind::Insert => "insert",
        };
        let traffic = match self.traffic {
            TrafficClass::Bulk => "bulk",
            TrafficClass::RealTime => "realtime",
        };
        write!(f, "{}-{op}-{traffic}", self.key_type)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lower_class_is_more_urgent() {
        assert!(PriorityClass::Maximum < PriorityClass::Interactive);
        assert!(PriorityClass::Prefetch < PriorityClass::Minimum);
        for (i, class) in PriorityClass::ALL.iter().enumerate() {
            assert_eq!(i, class.index());
            assert_eq!(Some(*class), PriorityClass::from_index(i));
        }
        assert_eq!(None, PriorityClass::from_index(PriorityClass::COUNT));
    }

    #[test]
    fn eight_distinct_schedulers() {
        let all = SchedulerId::all();
        assert_eq!(8, all.len());
        let set = all.iter().collect::<std::collections::HashSet<_>>();
        assert_eq!(8, set.len());
        assert_eq!(
            "SSK-insert-realtime",
            SchedulerId::new(KeyType::Ssk, OpKind::Insert, TrafficClass::RealTime)
                .to_string()
        );
    }
}
