//! Fuzz target for gap reconcile planning.
//!
//! Builds ordered, disjoint gaps from arbitrary spans and checks that every
//! observed id inside a gap lands in exactly one CLOSED gap.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::collections::BTreeSet;
use trigger_replication::gap::plan_reconcile;
use trigger_replication::model::{Gap, GapStatus};

const MAX_WINDOW: i64 = 1_000;

fuzz_target!(|data: (Vec<(u8, u8)>, Vec<u16>)| {
    let (spans, ids) = data;

    let mut gaps = Vec::new();
    let mut cursor: i64 = 0;
    for (skip, len) in spans.into_iter().take(32) {
        let start = cursor + skip as i64 + 1;
        gaps.push(Gap::new(start, start + len as i64).with_create_time(0));
        cursor = start + len as i64;
    }
    gaps.push(Gap::new(cursor + 1, cursor + 1 + MAX_WINDOW).with_create_time(0));

    let observed: BTreeSet<i64> = ids.into_iter().map(i64::from).collect();
    let plan = plan_reconcile(&gaps, &observed, MAX_WINDOW, 0);

    for id in &observed {
        if !gaps.iter().any(|g| g.contains(*id)) {
            continue;
        }
        let hits: Vec<&Gap> = plan.added.iter().filter(|g| g.contains(*id)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].status, GapStatus::Closed);
    }
});
