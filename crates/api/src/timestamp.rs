/// Wall-clock timestamp used for cooldown wake-up times and offer expiry.
///
/// Internally i64 microseconds from unix epoch. Wake-up times are
/// persisted alongside durable requests, so a monotonic `Instant` would
/// not survive a restart.
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
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Construct a new timestamp of "now".
    pub fn now() -> Self {
        std::time::SystemTime::now().into()
    }

    /// Construct a timestamp from i64 microseconds since unix epoch.
    pub fn from_micros(micros: i64) -> Self {
        Self(micros)
    }

    /// Get the i64 microseconds since unix epoch.
    pub fn as_micros(&self) -> i64 {
        self.0
    }

    /// Time remaining from `earlier` until this timestamp, or zero if
    /// this timestamp is not after `earlier`.
    pub fn saturating_duration_since(
        &self,
        earlier: Timestamp,
    ) -> std::time::Duration {
        if self.0 <= earlier.0 {
            std::time::Duration::ZERO
        } else {
            std::time::Duration::from_micros((self.0 - earlier.0) as u64)
        }
    }
}

impl std::ops::Add<std::time::Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: std::time::Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_micros() as i64))
    }
}

impl std::ops::AddAssign<std::time::Duration> for Timestamp {
    fn add_assign(&mut self, rhs: std::time::Duration) {
        *self = *self + rhs;
    }
}

impl From<std::time::SystemTime> for Timestamp {
    fn from(t: std::time::SystemTime) -> Self {
        // Clocks set before the epoch are clamped to it.
        Self(
            t.duration_since(std::time::SystemTime::UNIX_EPOCH)
                .map(|d| d.as_micros() as i64)
                .unwrap_or(0),
        )
    }
}
