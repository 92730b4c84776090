use std::collections::HashSet;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

/// Set of keys currently being worked on inside this process.
///
/// [`SingleFlight::try_acquire`] claims several keys at once or none of them;
/// the returned guard releases them on drop.
#[derive(Debug)]
pub struct SingleFlight<K: Eq + Hash + Clone> {
    busy: Arc<Mutex<HashSet<K>>>,
}

impl<K: Eq + Hash + Clone> Default for SingleFlight<K> {
    fn default() -> Self {
        Self {
            busy: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

fn lock<K>(set: &Mutex<HashSet<K>>) -> MutexGuard<'_, HashSet<K>> {
    // The set holds no invariant a panicking holder could break.
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<K: Eq + Hash + Clone> SingleFlight<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, keys: &[K]) -> Option<FlightGuard<K>> {
        let mut busy = lock(&self.busy);
        if keys.iter().any(|k| busy.contains(k)) {
            return None;
        }
        busy.extend(keys.iter().cloned());
        Some(FlightGuard {
            busy: self.busy.clone(),
            keys: keys.to_vec(),
        })
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.busy).len()
    }
}

#[derive(Debug)]
pub struct FlightGuard<K: Eq + Hash + Clone> {
    busy: Arc<Mutex<HashSet<K>>>,
    keys: Vec<K>,
}

impl<K: Eq + Hash + Clone> Drop for FlightGuard<K> {
    fn drop(&mut self) {
        let mut busy = lock(&self.busy);
        for k in &self.keys {
            busy.remove(k);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_keys_are_refused_until_release() {
        let flights = SingleFlight::new();
        let guard = flights.try_acquire(&[1, 2]).unwrap();
        assert!(flights.try_acquire(&[2, 3]).is_none());
        assert!(flights.try_acquire(&[3]).is_some());

        drop(guard);
        assert_eq!(flights.in_flight(), 0);
        assert!(flights.try_acquire(&[2, 3]).is_some());
    }

    #[test]
    fn refused_acquire_claims_nothing() {
        let flights = SingleFlight::new();
        let _held = flights.try_acquire(&["a"]).unwrap();
        assert!(flights.try_acquire(&["b", "a"]).is_none());
        assert!(flights.try_acquire(&["b"]).is_some());
    }
}
