//! The Locked_Box walkthrough: producers and consumers meeting in a concurrent box
//!
//! Run with: cargo run --example locked_box

use std::collections::BTreeSet;
use std::sync::Arc;

use parasol::{LockedBox, Scheduler, SchedulerConfig};

fn main() -> anyhow::Result<()> {
    println!("═══════════════════════════════════════");
    println!("  Parasol - Locked_Box");
    println!("═══════════════════════════════════════\n");

    let scheduler = Scheduler::new(SchedulerConfig::default());
    let slot = Arc::new(LockedBox::<i64>::empty());

    // Example 1: locked operations never wait
    println!("Example 1: locked operations");
    println!("─────────────────────────────────────");
    println!("set(7) replaced {:?}", slot.set(7));
    println!("content() = {:?}", slot.content());
    println!("remove() = {:?}", slot.remove());
    println!("content() = {:?}\n", slot.content());

    // Example 2: 29 consumers and 70 producers issued concurrently
    println!("Example 2: 29 gets racing 70 puts");
    println!("─────────────────────────────────────");
    let gets: Vec<_> = (0..29)
        .map(|_| {
            let slot = Arc::clone(&slot);
            scheduler.submit(move || Ok(slot.get()))
        })
        .collect();
    let puts: Vec<_> = (30..100)
        .map(|i| {
            let slot = Arc::clone(&slot);
            scheduler.submit(move || {
                slot.put(i);
                Ok(())
            })
        })
        .collect();

    let received = scheduler.join_all(gets)?;
    let mut seen: BTreeSet<i64> = received.iter().copied().collect();
    println!("{} gets completed: {:?}", received.len(), received);
    if seen.len() != received.len() {
        anyhow::bail!("a value was handed to two gets");
    }

    // The remaining producers are waiting for the box to empty; each remove
    // hands the box to the next one.
    let mut leftover = Vec::new();
    while leftover.len() + received.len() < 70 {
        let Some(value) = slot.remove() else {
            std::thread::yield_now();
            continue;
        };
        if !seen.insert(value) {
            anyhow::bail!("value {} observed twice", value);
        }
        leftover.push(value);
    }
    scheduler.join_all(puts)?;
    println!("{} values left for later: {:?}", leftover.len(), leftover);
    println!("content() after draining = {:?}", slot.content());

    let stats = scheduler.stats();
    println!(
        "\nscheduler: {} tasks, {} parks, {} spare workers started",
        stats.tasks_executed, stats.parks, stats.spares_spawned
    );
    println!("✅ every put value was taken exactly once");
    Ok(())
}
