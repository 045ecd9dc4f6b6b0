use crate::model::*;

use super::availability::merge_overlapping;

/// Candidate start times for one day.
///
/// Each open window is walked from its start in `step` increments; a
/// candidate `[t, t + duration)` survives if it ends by the window's end,
/// does not start before `now`, and overlaps nothing in `busy`. A window
/// shorter than `step` yields nothing. Output is sorted by start and
/// deduplicated, so overlapping windows never produce a start twice.
///
/// Pure: the same inputs always produce the same slots.
pub fn generate_slots(open: &[Span], busy: &[Span], duration: Ms, step: Ms, now: Ms) -> Vec<Span> {
    if duration <= 0 || step <= 0 {
        return Vec::new();
    }

    // Merged busy intervals are disjoint, so their ends ascend with their
    // starts and a binary search finds the only one that can matter.
    let mut busy = busy.to_vec();
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);

    let mut slots = Vec::new();
    for window in open {
        if window.duration_ms() < step {
            continue;
        }
        let mut t = window.start;
        while t + duration <= window.end {
            let candidate = Span::new(t, t + duration);
            if candidate.start >= now && !hits_busy(&busy, &candidate) {
                slots.push(candidate);
            }
            t += step;
        }
    }

    slots.sort_by_key(|s| s.start);
    slots.dedup_by_key(|s| s.start);
    slots
}

fn hits_busy(merged_busy: &[Span], candidate: &Span) -> bool {
    let first_live = merged_busy.partition_point(|b| b.end <= candidate.start);
    merged_busy
        .get(first_live)
        .is_some_and(|b| b.overlaps(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;
    const G: Ms = 30 * M;

    fn starts(slots: &[Span]) -> Vec<Ms> {
        slots.iter().map(|s| s.start).collect()
    }

    #[test]
    fn monday_morning_hour_long_service() {
        let open = [Span::new(9 * H, 12 * H)];
        let slots = generate_slots(&open, &[], 60 * M, G, 0);
        assert_eq!(
            starts(&slots),
            vec![9 * H, 9 * H + 30 * M, 10 * H, 10 * H + 30 * M, 11 * H]
        );
        assert!(slots.iter().all(|s| s.duration_ms() == 60 * M));
    }

    #[test]
    fn booking_removes_every_overlapping_start() {
        let open = [Span::new(9 * H, 12 * H)];
        let busy = [Span::new(9 * H + 30 * M, 10 * H + 30 * M)];
        let slots = generate_slots(&open, &busy, 60 * M, G, 0);
        assert_eq!(starts(&slots), vec![9 * H, 10 * H + 30 * M, 11 * H]);
    }

    #[test]
    fn service_longer_than_window_yields_nothing() {
        let open = [Span::new(9 * H, 10 * H)];
        assert!(generate_slots(&open, &[], 90 * M, G, 0).is_empty());
    }

    #[test]
    fn window_shorter_than_step_yields_nothing() {
        let open = [Span::new(9 * H, 9 * H + 20 * M)];
        assert!(generate_slots(&open, &[], 15 * M, G, 0).is_empty());
    }

    #[test]
    fn past_starts_are_dropped() {
        let open = [Span::new(9 * H, 12 * H)];
        let now = 10 * H + 5 * M;
        let slots = generate_slots(&open, &[], 60 * M, G, now);
        assert_eq!(starts(&slots), vec![10 * H + 30 * M, 11 * H]);
    }

    #[test]
    fn start_equal_to_now_is_kept() {
        let open = [Span::new(9 * H, 11 * H)];
        let slots = generate_slots(&open, &[], 60 * M, G, 10 * H);
        assert_eq!(starts(&slots), vec![10 * H]);
    }

    #[test]
    fn overlapping_windows_emit_each_start_once() {
        let open = [Span::new(9 * H, 11 * H), Span::new(10 * H, 12 * H)];
        let slots = generate_slots(&open, &[], 60 * M, G, 0);
        assert_eq!(
            starts(&slots),
            vec![9 * H, 9 * H + 30 * M, 10 * H, 10 * H + 30 * M, 11 * H]
        );
    }

    #[test]
    fn windows_out_of_order_still_sorted() {
        let open = [Span::new(14 * H, 15 * H), Span::new(9 * H, 10 * H)];
        let slots = generate_slots(&open, &[], 60 * M, G, 0);
        assert_eq!(starts(&slots), vec![9 * H, 14 * H]);
    }

    #[test]
    fn unaligned_window_steps_from_its_own_start() {
        let open = [Span::new(9 * H + 15 * M, 11 * H)];
        let slots = generate_slots(&open, &[], 30 * M, G, 0);
        assert_eq!(
            starts(&slots),
            vec![9 * H + 15 * M, 9 * H + 45 * M, 10 * H + 15 * M]
        );
    }

    #[test]
    fn busy_interval_touching_candidate_does_not_block() {
        let open = [Span::new(9 * H, 11 * H)];
        let busy = [Span::new(8 * H, 9 * H), Span::new(10 * H, 11 * H)];
        let slots = generate_slots(&open, &busy, 60 * M, G, 0);
        assert_eq!(starts(&slots), vec![9 * H]);
    }

    #[test]
    fn busy_crossing_midnight_blocks_early_slots() {
        let open = [Span::new(0, 3 * H)];
        let busy = [Span::new(-H, H)];
        let slots = generate_slots(&open, &busy, 60 * M, G, -10 * H);
        assert_eq!(starts(&slots), vec![H, H + 30 * M, 2 * H]);
    }

    #[test]
    fn slots_are_sound() {
        let open = [Span::new(8 * H, 12 * H), Span::new(13 * H, 18 * H)];
        let busy = [
            Span::new(8 * H + 45 * M, 9 * H + 10 * M),
            Span::new(13 * H, 14 * H),
            Span::new(16 * H + 20 * M, 16 * H + 40 * M),
        ];
        let slots = generate_slots(&open, &busy, 45 * M, G, 0);
        assert!(!slots.is_empty());
        for slot in &slots {
            assert!(open.iter().any(|w| w.contains(slot)), "{slot:?} outside windows");
            assert!(busy.iter().all(|b| !b.overlaps(slot)), "{slot:?} overlaps busy");
        }
    }

    #[test]
    fn slots_are_complete_on_the_grid() {
        // Every grid-aligned start that fits and is free must be emitted.
        let open = [Span::new(8 * H, 12 * H)];
        let busy = [Span::new(9 * H + 10 * M, 9 * H + 50 * M)];
        let duration = 40 * M;
        let slots = generate_slots(&open, &busy, duration, G, 0);
        let mut t = open[0].start;
        while t + duration <= open[0].end {
            let candidate = Span::new(t, t + duration);
            let free = busy.iter().all(|b| !b.overlaps(&candidate));
            assert_eq!(slots.iter().any(|s| s.start == t), free, "start {t}");
            t += G;
        }
    }

    #[test]
    fn degenerate_inputs_yield_nothing() {
        let open = [Span::new(9 * H, 12 * H)];
        assert!(generate_slots(&open, &[], 0, G, 0).is_empty());
        assert!(generate_slots(&open, &[], 60 * M, 0, 0).is_empty());
        assert!(generate_slots(&[], &[], 60 * M, G, 0).is_empty());
    }
}
