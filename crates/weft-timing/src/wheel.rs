use std::collections::HashSet;

pub type TimerId = i64;

const SLOTS: usize = 256;

struct Entry<T> {
    id: TimerId,
    rounds: u64,
    interval_ms: i64,
    /// Remaining fires after this one; negative means unbounded.
    repeats: i64,
    payload: T,
}

/// A hashed timer wheel with millisecond ticks.
///
/// Expired entries are drained into a caller-supplied vec rather than
/// dispatched through stored callbacks, so handlers are free to borrow the
/// structure that owns the wheel. Repeating timers re-arm themselves until
/// they run out of repeats or are cancelled.
pub struct TimerWheel<T> {
    slots: Vec<Vec<Entry<T>>>,
    cursor: usize,
    next_id: TimerId,
    cancelled: HashSet<TimerId>,
    live: usize,
}

impl<T: Clone> TimerWheel<T> {
    pub fn new() -> Self {
        Self {
            slots: (0..SLOTS).map(|_| Vec::new()).collect(),
            cursor: 0,
            next_id: 0,
            cancelled: HashSet::new(),
            live: 0,
        }
    }

    /// Arms a timer firing after `delay_ms`, then every `interval_ms` for the
    /// remaining `repeats` fires (negative repeats never run out).
    pub fn add(&mut self, delay_ms: i64, interval_ms: i64, repeats: i64, payload: T) -> TimerId {
        self.next_id += 1;
        let id = self.next_id;
        self.insert(Entry { id, rounds: 0, interval_ms, repeats, payload }, delay_ms);
        self.live += 1;
        id
    }

    pub fn cancel(&mut self, id: TimerId) {
        if id > 0 && id <= self.next_id {
            self.cancelled.insert(id);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Advances the wheel by `delta_ms`, collecting every fire into
    /// `expired` in tick order.
    pub fn advance(&mut self, delta_ms: i64, expired: &mut Vec<(TimerId, T)>) {
        for _ in 0..delta_ms.max(0) {
            self.cursor = (self.cursor + 1) % SLOTS;
            let mut due = Vec::new();
            let slot = &mut self.slots[self.cursor];
            let mut i = 0;
            while i < slot.len() {
                if slot[i].rounds == 0 {
                    due.push(slot.swap_remove(i));
                } else {
                    slot[i].rounds -= 1;
                    i += 1;
                }
            }
            for entry in due {
                if self.cancelled.remove(&entry.id) {
                    self.live -= 1;
                    continue;
                }
                expired.push((entry.id, entry.payload.clone()));
                if entry.repeats == 0 {
                    self.live -= 1;
                    continue;
                }
                let rearmed = Entry {
                    repeats: if entry.repeats < 0 { entry.repeats } else { entry.repeats - 1 },
                    ..entry
                };
                let delay = rearmed.interval_ms;
                self.insert(rearmed, delay);
            }
        }
    }

    fn insert(&mut self, mut entry: Entry<T>, delay_ms: i64) {
        let ticks = delay_ms.max(1) as u64;
        entry.rounds = (ticks - 1) / SLOTS as u64;
        let slot = (self.cursor as u64 + ticks) % SLOTS as u64;
        self.slots[slot as usize].push(entry);
    }
}

impl<T: Clone> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn drain(wheel: &mut TimerWheel<u32>, delta: i64) -> Vec<u32> {
        let mut fired = Vec::new();
        wheel.advance(delta, &mut fired);
        fired.into_iter().map(|(_, p)| p).collect()
    }

    #[test]
    fn one_shot_fires_once() {
        let mut wheel = TimerWheel::new();
        wheel.add(5, 0, 0, 1u32);
        assert!(drain(&mut wheel, 4).is_empty());
        assert_eq!(drain(&mut wheel, 1), vec![1]);
        assert!(drain(&mut wheel, 1000).is_empty());
        assert!(wheel.is_empty());
    }

    #[test]
    fn repeating_rearms() {
        let mut wheel = TimerWheel::new();
        wheel.add(10, 10, -1, 7u32);
        assert_eq!(drain(&mut wheel, 35).len(), 3);
        assert!(!wheel.is_empty());
    }

    #[test]
    fn bounded_repeats_run_out() {
        let mut wheel = TimerWheel::new();
        wheel.add(1, 1, 2, 9u32);
        assert_eq!(drain(&mut wheel, 100).len(), 3);
        assert!(wheel.is_empty());
    }

    #[test]
    fn cancel_suppresses_fire() {
        let mut wheel = TimerWheel::new();
        let id = wheel.add(5, 5, -1, 3u32);
        wheel.cancel(id);
        assert!(drain(&mut wheel, 20).is_empty());
        assert!(wheel.is_empty());
    }

    #[test]
    fn long_delays_wrap_rounds() {
        let mut wheel = TimerWheel::new();
        wheel.add(600, 0, 0, 2u32);
        assert!(drain(&mut wheel, 599).is_empty());
        assert_eq!(drain(&mut wheel, 1), vec![2]);
    }
}
