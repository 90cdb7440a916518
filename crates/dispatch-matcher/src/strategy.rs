//! Worker selection strategies.
//!
//! Pure functions over eligible worker snapshots. Ties resolve toward the
//! higher rank score, then toward the earlier registration (candidates
//! arrive in registration order and the first best wins).

use dispatch_registry::{Worker, WorkerId};

/// Guards the weighted ratio against a zero rank score.
const MIN_RANK: f64 = 1e-6;

/// Minimize `in_flight / effective_limit`; ties go to the higher rank score.
pub fn least_loaded(candidates: &[Worker]) -> Option<&Worker> {
    pick(candidates, Worker::load_ratio)
}

/// Minimize the rolling average response time.
pub fn fastest_response(candidates: &[Worker]) -> Option<&Worker> {
    pick(candidates, |w| w.metrics.avg_response_ms)
}

/// Minimize the load ratio weighted by rank: a low-ranked worker must be
/// proportionally less loaded to win over a higher-ranked one.
pub fn weighted_by_rank(candidates: &[Worker]) -> Option<&Worker> {
    pick(candidates, |w| w.load_ratio() / w.rank_score().max(MIN_RANK))
}

/// Pick the next eligible worker after `last`, walking the registry
/// iteration order cyclically.
pub fn next_round_robin<'a>(
    candidates: &'a [Worker],
    order: &[WorkerId],
    last: Option<&WorkerId>,
) -> Option<&'a Worker> {
    if candidates.is_empty() || order.is_empty() {
        return None;
    }
    let start = last
        .and_then(|id| order.iter().position(|o| o == id))
        .map(|p| p + 1)
        .unwrap_or(0);

    for offset in 0..order.len() {
        let id = &order[(start + offset) % order.len()];
        if let Some(worker) = candidates.iter().find(|w| &w.id == id) {
            return Some(worker);
        }
    }
    None
}

fn pick(candidates: &[Worker], key: impl Fn(&Worker) -> f64) -> Option<&Worker> {
    candidates.iter().fold(None, |best, worker| match best {
        None => Some(worker),
        Some(current) => {
            let (w, c) = (key(worker), key(current));
            if w < c || (w == c && worker.rank_score() > current.rank_score()) {
                Some(worker)
            } else {
                Some(current)
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(id: &str, in_flight: u32, limit: u32) -> Worker {
        let mut w = Worker::new(id, ["dry_van"], limit);
        w.in_flight = in_flight;
        w
    }

    #[test]
    fn least_loaded_prefers_lowest_ratio() {
        let candidates = vec![worker("w1", 2, 4), worker("w2", 1, 4), worker("w3", 3, 4)];
        assert_eq!(least_loaded(&candidates).unwrap().id, "w2");
    }

    #[test]
    fn least_loaded_ties_break_on_rank() {
        let mut seasoned = worker("w2", 1, 4);
        seasoned.completed_total = 50;
        let candidates = vec![worker("w1", 1, 4), seasoned];
        assert_eq!(least_loaded(&candidates).unwrap().id, "w2");
    }

    #[test]
    fn least_loaded_full_tie_keeps_registration_order() {
        let candidates = vec![worker("w1", 1, 4), worker("w2", 1, 4)];
        assert_eq!(least_loaded(&candidates).unwrap().id, "w1");
    }

    #[test]
    fn fastest_response_prefers_low_latency() {
        let mut slow = worker("w1", 0, 4);
        slow.metrics.avg_response_ms = 900.0;
        let mut fast = worker("w2", 0, 4);
        fast.metrics.avg_response_ms = 80.0;
        let candidates = vec![slow, fast];
        assert_eq!(fastest_response(&candidates).unwrap().id, "w2");
    }

    #[test]
    fn weighted_needs_proportionally_less_load_to_beat_rank() {
        // Same load ratio: the higher-ranked worker wins.
        let mut high_rank = worker("w1", 2, 4);
        high_rank.completed_total = 200;
        let low_rank = worker("w2", 2, 4);
        let candidates = vec![low_rank.clone(), high_rank.clone()];
        assert_eq!(weighted_by_rank(&candidates).unwrap().id, "w1");

        // A much lighter low-ranked worker overtakes.
        let idle_low_rank = worker("w2", 0, 4);
        let candidates = vec![idle_low_rank, high_rank];
        assert_eq!(weighted_by_rank(&candidates).unwrap().id, "w2");
    }

    #[test]
    fn round_robin_walks_registration_order() {
        let order: Vec<WorkerId> = vec!["w1".into(), "w2".into(), "w3".into()];
        let candidates = vec![worker("w1", 0, 4), worker("w2", 0, 4), worker("w3", 0, 4)];

        let first = next_round_robin(&candidates, &order, None).unwrap();
        assert_eq!(first.id, "w1");

        let second = next_round_robin(&candidates, &order, Some(&"w1".into())).unwrap();
        assert_eq!(second.id, "w2");

        // Wraps around.
        let wrapped = next_round_robin(&candidates, &order, Some(&"w3".into())).unwrap();
        assert_eq!(wrapped.id, "w1");
    }

    #[test]
    fn round_robin_skips_ineligible_workers() {
        let order: Vec<WorkerId> = vec!["w1".into(), "w2".into(), "w3".into()];
        // w2 is not among the eligible candidates.
        let candidates = vec![worker("w1", 0, 4), worker("w3", 0, 4)];

        let picked = next_round_robin(&candidates, &order, Some(&"w1".into())).unwrap();
        assert_eq!(picked.id, "w3");
    }

    #[test]
    fn round_robin_restarts_when_last_was_deregistered() {
        let order: Vec<WorkerId> = vec!["w1".into(), "w2".into()];
        let candidates = vec![worker("w1", 0, 4), worker("w2", 0, 4)];

        let picked = next_round_robin(&candidates, &order, Some(&"gone".into())).unwrap();
        assert_eq!(picked.id, "w1");
    }

    #[test]
    fn empty_candidates_select_nothing() {
        assert!(least_loaded(&[]).is_none());
        assert!(fastest_response(&[]).is_none());
        assert!(weighted_by_rank(&[]).is_none());
        assert!(next_round_robin(&[], &["w1".into()], None).is_none());
    }
}
