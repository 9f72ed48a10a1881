//! Next / previous / random station selection with a session-scoped history.

use rand::Rng;

/// Computes navigation targets over a fixed catalog ordering (catalog index
/// order).  History is pushed by forward moves and popped by `previous`.
#[derive(Debug, Clone, Default)]
pub struct Navigator {
    len: usize,
    history: Vec<usize>,
}

impl Navigator {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            history: Vec::new(),
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// The station after `current`, wrapping past the end.  With nothing
    /// current, starts at the first station.
    pub fn next(&mut self, current: Option<usize>) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        let target = match current {
            Some(idx) => {
                self.history.push(idx);
                (idx + 1) % self.len
            }
            None => 0,
        };
        Some(target)
    }

    /// The most recent history entry, or the station before `current`
    /// (wrapping) when history is empty.
    pub fn previous(&mut self, current: Option<usize>) -> Option<usize> {
        if let Some(idx) = self.history.pop() {
            return Some(idx);
        }
        if self.len == 0 {
            return None;
        }
        Some(match current {
            Some(0) | None => self.len - 1,
            Some(idx) => idx - 1,
        })
    }

    pub fn random(&mut self, current: Option<usize>) -> Option<usize> {
        self.random_with(current, &mut rand::thread_rng())
    }

    /// Uniform choice among all stations except `current`.  `None` when no
    /// alternative exists.
    pub fn random_with<R: Rng>(&mut self, current: Option<usize>, rng: &mut R) -> Option<usize> {
        match current {
            None if self.len > 0 => Some(rng.gen_range(0..self.len)),
            None => None,
            Some(_) if self.len < 2 => None,
            Some(idx) => {
                let pick = rng.gen_range(0..self.len - 1);
                let target = if pick >= idx { pick + 1 } else { pick };
                self.history.push(idx);
                Some(target)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn next_cycles_back_to_start() {
        for n in 1..6 {
            let mut nav = Navigator::new(n);
            for start in 0..n {
                let mut current = start;
                for _ in 0..n {
                    current = nav.next(Some(current)).unwrap();
                }
                assert_eq!(current, start, "n={n} start={start}");
            }
        }
    }

    #[test]
    fn previous_undoes_next_and_random() {
        let mut nav = Navigator::new(7);
        let mut rng = StdRng::seed_from_u64(7);
        let mut current = 3;
        for step in 0..50 {
            let before = current;
            current = if step % 3 == 0 {
                nav.random_with(Some(current), &mut rng).unwrap()
            } else {
                nav.next(Some(current)).unwrap()
            };
            assert_eq!(nav.previous(Some(current)), Some(before));
            current = before;
        }
        assert_eq!(nav.history_len(), 0);
    }

    #[test]
    fn previous_pops_in_lifo_order() {
        let mut nav = Navigator::new(5);
        let a = nav.next(Some(0)).unwrap();
        let b = nav.next(Some(a)).unwrap();
        assert_eq!(b, 2);
        assert_eq!(nav.previous(Some(b)), Some(1));
        assert_eq!(nav.previous(Some(1)), Some(0));
    }

    #[test]
    fn previous_without_history_wraps_and_keeps_history_empty() {
        let mut nav = Navigator::new(4);
        assert_eq!(nav.previous(Some(0)), Some(3));
        assert_eq!(nav.previous(Some(2)), Some(1));
        assert_eq!(nav.history_len(), 0);
    }

    #[test]
    fn random_never_repeats_current() {
        let mut nav = Navigator::new(3);
        let mut rng = StdRng::seed_from_u64(42);
        let mut seen = [false; 3];
        for _ in 0..300 {
            let target = nav.random_with(Some(1), &mut rng).unwrap();
            assert_ne!(target, 1);
            seen[target] = true;
        }
        assert!(seen[0] && seen[2]);
    }

    #[test]
    fn random_with_single_station_is_noop() {
        let mut nav = Navigator::new(1);
        assert_eq!(nav.random(Some(0)), None);
        assert_eq!(nav.history_len(), 0);
        assert_eq!(nav.random(None), Some(0));
    }

    #[test]
    fn empty_catalog_yields_nothing() {
        let mut nav = Navigator::new(0);
        assert_eq!(nav.next(None), None);
        assert_eq!(nav.previous(None), None);
        assert_eq!(nav.random(None), None);
    }

    #[test]
    fn next_from_nothing_starts_at_first() {
        let mut nav = Navigator::new(3);
        assert_eq!(nav.next(None), Some(0));
        assert_eq!(nav.history_len(), 0);
    }
}
