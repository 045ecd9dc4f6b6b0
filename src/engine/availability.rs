use crate::model::*;

// ── Free-time algebra ────────────────────────────────────────────

/// Raw free time: open windows minus busy intervals, both in any order.
pub fn free_spans(open: &[Span], busy: &[Span]) -> Vec<Span> {
    let mut open = open.to_vec();
    open.sort_by_key(|s| s.start);
    let open = merge_overlapping(&open);

    let mut busy = busy.to_vec();
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);

    subtract_intervals(&open, &busy)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// Remove `to_remove` from `base`. Both must be sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
