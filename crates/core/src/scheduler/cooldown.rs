use std::{
    cmp,
    collections::{hash_map::Entry, HashMap},
    time::Duration,
};

use backon::BackoffBuilder;
use blockswarm_api::{ItemToken, RequestId, Timestamp};

/// Per-item cooldown state, grouped by owning request so that a success
/// can wake all siblings at once.
#[derive(Debug)]
pub(crate) struct CooldownList {
    pub(crate) state: HashMap<RequestId, HashMap<ItemToken, Cooldown>>,
    first_cooldown_ms: u32,
    last_cooldown_ms: u32,
    num_cooldown_intervals: usize,
}

impl CooldownList {
    pub fn new(
        first_cooldown_ms: u32,
        last_cooldown_ms: u32,
        num_cooldown_intervals: usize,
    ) -> Self {
        Self {
            state: HashMap::new(),
            first_cooldown_ms,
            last_cooldown_ms,
            num_cooldown_intervals,
        }
    }

    /// Put an item on cooldown after a failure. Returns the new wake-up
    /// time and the number of retries consumed so far.
    ///
    /// The wake-up time never moves backwards while failures continue.
    pub fn cool_down(
        &mut self,
        request: RequestId,
        item: ItemToken,
        now: Timestamp,
        consume_retry: bool,
    ) -> (Timestamp, u32) {
        let items = self.state.entry(request).or_default();
        let cooldown = match items.entry(item) {
            Entry::Occupied(o) => o.into_mut(),
            Entry::Vacant(v) => v.insert(Cooldown::new(
                self.first_cooldown_ms,
                self.last_cooldown_ms,
                self.num_cooldown_intervals,
                now,
            )),
        };
        let interval = cooldown.next_interval();
        if consume_retry {
            cooldown.retries += 1;
        }
        cooldown.wakeup = cmp::max(cooldown.wakeup, now + interval);
        (cooldown.wakeup, cooldown.retries)
    }

    pub fn is_cooling_down(
        &self,
        request: RequestId,
        item: ItemToken,
        now: Timestamp,
    ) -> bool {
        match self.get(request, item) {
            Some(cooldown) => cooldown.wakeup > now,
            None => false,
        }
    }

    pub fn wakeup_time(
        &self,
        request: RequestId,
        item: ItemToken,
    ) -> Option<Timestamp> {
        self.get(request, item).map(|c| c.wakeup)
    }

    /// Bring the wake-up time forward to `wakeup`. Never pushes it back.
    /// Returns the new wake-up time if it changed.
    pub fn reduce_wakeup_time(
        &mut self,
        request: RequestId,
        item: ItemToken,
        wakeup: Timestamp,
    ) -> Option<Timestamp> {
        let cooldown = self.state.get_mut(&request)?.get_mut(&item)?;
        if wakeup < cooldown.wakeup {
            cooldown.wakeup = wakeup;
            Some(wakeup)
        } else {
            None
        }
    }

    /// Make every cooling item of a request selectable at `now`. Retry
    /// counts are kept. Returns the items that were woken.
    pub fn wake_request(
        &mut self,
        request: RequestId,
        now: Timestamp,
    ) -> Vec<ItemToken> {
        let mut woken = Vec::new();
        if let Some(items) = self.state.get_mut(&request) {
            for (token, cooldown) in items.iter_mut() {
                if cooldown.wakeup > now {
                    cooldown.wakeup = now;
                    woken.push(*token);
                }
            }
        }
        woken
    }

    pub fn remove_item(&mut self, request: RequestId, item: ItemToken) {
        if let Entry::Occupied(mut o) = self.state.entry(request) {
            o.get_mut().remove(&item);
            if o.get().is_empty() {
                o.remove();
            }
        }
    }

    pub fn remove_request(&mut self, request: RequestId) {
        self.state.remove(&request);
    }

    /// The earliest wake-up time still in the future, if any.
    pub fn next_wakeup(&self, now: Timestamp) -> Option<Timestamp> {
        self.state
            .values()
            .flat_map(|items| items.values())
            .map(|c| c.wakeup)
            .filter(|w| *w > now)
            .min()
    }

    fn get(&self, request: RequestId, item: ItemToken) -> Option<&Cooldown> {
        self.state.get(&request)?.get(&item)
    }
}

#[derive(Debug)]
pub(crate) struct Cooldown {
    back_off: backon::ExponentialBackoff,
    pub(crate) current_interval: Duration,
    pub(crate) wakeup: Timestamp,
    pub(crate) retries: u32,
}

impl Cooldown {
    fn new(
        first_cooldown_ms: u32,
        last_cooldown_ms: u32,
        num_cooldown_intervals: usize,
        now: Timestamp,
    ) -> Self {
        let back_off = backon::ExponentialBuilder::default()
            .with_factor(2.0)
            .with_min_delay(Duration::from_millis(first_cooldown_ms as u64))
            .with_max_delay(Duration::from_millis(last_cooldown_ms as u64))
            .with_max_times(num_cooldown_intervals)
            .build();
        Self {
            back_off,
            current_interval: Duration::from_millis(first_cooldown_ms as u64),
            wakeup: now,
            retries: 0,
        }
    }

    /// Advance along the curve. Once the curve is exhausted the last
    /// interval repeats.
    ///
    /// Intervals are rounded to whole milliseconds, since backon's float
    /// arithmetic lands just short of exact doublings.
    fn next_interval(&mut self) -> Duration {
        if let Some(interval) = self.back_off.next() {
            let ms = (interval.as_secs_f64() * 1000.0).round() as u64;
            self.current_interval = Duration::from_millis(ms);
        }
        self.current_interval
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn t(ms: i64) -> Timestamp {
        Timestamp::from_micros(ms * 1000)
    }

    #[test]
    fn cooldown_grows_and_never_moves_back() {
        let mut list = CooldownList::new(10, 40, 4);
        let req = RequestId::next();
        let item = ItemToken(0);

        let mut wakeups = Vec::new();
        for _ in 0..6 {
            let (wakeup, _) = list.cool_down(req, item, t(0), true);
            wakeups.push(wakeup);
        }
        assert_eq!(vec![t(10), t(20), t(40), t(40), t(40), t(40)], wakeups);

        // exact doublings, capped at the last interval
        let intervals: Vec<Duration> = {
            let mut list = CooldownList::new(1000, 30_000, 8);
            let req = RequestId::next();
            (0..7)
                .map(|i| {
                    let now = t(i * 100_000);
                    let (wakeup, _) = list.cool_down(req, item, now, false);
                    wakeup.saturating_duration_since(now)
                })
                .collect()
        };
        assert_eq!(
            [1, 2, 4, 8, 16, 30, 30]
                .map(|s: u64| Duration::from_millis(s * 1000))
                .to_vec(),
            intervals
        );

        // A failure reported with an earlier clock reading keeps the
        // later wake-up time.
        let (wakeup, retries) = list.cool_down(req, item, t(-100), true);
        assert_eq!(t(40), wakeup);
        assert_eq!(7, retries);
    }

    #[test]
    fn cooling_down_until_wakeup() {
        let mut list = CooldownList::new(10, 10, 2);
        let req = RequestId::next();
        let item = ItemToken(3);
        assert!(!list.is_cooling_down(req, item, t(0)));

        list.cool_down(req, item, t(0), false);
        assert!(list.is_cooling_down(req, item, t(9)));
        assert!(!list.is_cooling_down(req, item, t(10)));
        assert_eq!(0, list.state[&req][&item].retries);
    }

    #[test]
    fn wake_request_resets_only_that_request() {
        let mut list = CooldownList::new(100, 100, 2);
        let a = RequestId::next();
        let b = RequestId::next();
        list.cool_down(a, ItemToken(0), t(0), true);
        list.cool_down(a, ItemToken(1), t(0), true);
        list.cool_down(b, ItemToken(0), t(0), true);

        let mut woken = list.wake_request(a, t(5));
        woken.sort();
        assert_eq!(vec![ItemToken(0), ItemToken(1)], woken);
        assert!(!list.is_cooling_down(a, ItemToken(0), t(5)));
        assert!(!list.is_cooling_down(a, ItemToken(1), t(5)));
        assert!(list.is_cooling_down(b, ItemToken(0), t(5)));

        // retry counts survive the reset
        assert_eq!(1, list.state[&a][&ItemToken(0)].retries);
    }

    #[test]
    fn reduce_only_brings_forward() {
        let mut list = CooldownList::new(100, 100, 2);
        let req = RequestId::next();
        let item = ItemToken(0);
        assert_eq!(None, list.reduce_wakeup_time(req, item, t(1)));

        list.cool_down(req, item, t(0), false);
        assert_eq!(None, list.reduce_wakeup_time(req, item, t(200)));
        assert_eq!(Some(t(50)), list.reduce_wakeup_time(req, item, t(50)));
        assert_eq!(Some(t(50)), list.wakeup_time(req, item));
        assert_eq!(Some(t(50)), list.next_wakeup(t(0)));
        assert_eq!(None, list.next_wakeup(t(50)));

        list.remove_item(req, item);
        assert!(list.state.is_empty());
    }
}
