//! `deckhand locks`: inspect and clean run lock records.

use crate::card::CardStore;
use crate::config::Config;
use crate::lifecycle::RunLifecycleCoordinator;
use crate::run::RunStatus;
use anyhow::Result;
use chrono::Utc;
use std::time::Duration;

const STALE_AFTER: Duration = Duration::from_secs(30 * 60);

pub fn cmd_locks(config: &Config, clean: bool) -> Result<()> {
    let lifecycle = RunLifecycleCoordinator::new(CardStore::new(), config.locks_dir.clone());
    let records = lifecycle.load_lock_records()?;
    if records.is_empty() {
        println!("no lock records");
        return Ok(());
    }

    let now = Utc::now();
    let stale_after = chrono::Duration::from_std(STALE_AFTER).unwrap_or(chrono::Duration::minutes(30));
    let mut cleaned = 0usize;

    for record in records {
        let stale = record.age(now) > stale_after;
        println!(
            "{:<10} {:<10} {:>6}s {} {}",
            record.run_id.short(),
            record.flow,
            record.age(now).num_seconds().max(0),
            if stale { "stale" } else { "live " },
            record.card_path.display()
        );
        if clean && stale {
            match lifecycle.mark_finished(
                &record.card_path,
                record.flow,
                RunStatus::Failed,
                "stale lock cleaned",
            ) {
                Ok(()) => cleaned += 1,
                Err(err) => {
                    tracing::warn!(card = %record.card_path.display(), %err, "clean failed");
                    lifecycle.remove_record(&record.card_path)?;
                    cleaned += 1;
                }
            }
        }
    }

    if clean {
        println!("cleaned {cleaned} stale lock record(s)");
    }
    Ok(())
}
