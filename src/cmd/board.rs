//! `deckhand list` and `deckhand status`: read-only board views.

use crate::board::{CardStatus, scan_cards};
use crate::card::CardStore;
use crate::config::Config;
use crate::lifecycle::RunLifecycleCoordinator;
use anyhow::Result;
use chrono::Utc;

pub fn cmd_list(config: &Config) -> Result<()> {
    let cards = scan_cards(&config.board_dir());
    if cards.is_empty() {
        println!("no cards under {}", config.board_dir().display());
        return Ok(());
    }
    for card in cards {
        let phase = card.phase.as_deref().unwrap_or("-");
        println!(
            "{:<8} {:<12} {:<20} {}",
            card.code,
            status_label(card.status),
            phase,
            card.slug
        );
    }
    Ok(())
}

pub fn cmd_status(config: &Config) -> Result<()> {
    let store = CardStore::new();
    let lifecycle = RunLifecycleCoordinator::new(store.clone(), config.locks_dir.clone());
    let cards = scan_cards(&config.board_dir());

    let mut counts = [0usize; 3];
    let mut active = Vec::new();
    for card in &cards {
        counts[card.status as usize] += 1;
        let snapshot = match store.load_snapshot(&card.path) {
            Ok(snapshot) => snapshot,
            Err(err) => {
                println!("{:<8} unreadable: {err}", card.code);
                continue;
            }
        };
        if let Some(status) = snapshot.document.field("agent_status") {
            if status == "queued" || status == "running" {
                active.push((card.code.clone(), status.to_string(), card.slug.clone()));
            }
        }
    }

    println!(
        "{} cards: {} backlog, {} in progress, {} done",
        cards.len(),
        counts[CardStatus::Backlog as usize],
        counts[CardStatus::InProgress as usize],
        counts[CardStatus::Done as usize],
    );

    if !active.is_empty() {
        println!("\nactive agent runs:");
        for (code, status, slug) in active {
            println!("  {code:<8} {status:<8} {slug}");
        }
    }

    let records = lifecycle.load_lock_records()?;
    if !records.is_empty() {
        println!("\nlock records:");
        let now = Utc::now();
        for record in records {
            println!(
                "  {:<10} {:<10} {}s old  {}",
                record.run_id.short(),
                record.flow,
                record.age(now).num_seconds().max(0),
                record.card_path.display()
            );
        }
    }
    Ok(())
}

fn status_label(status: CardStatus) -> &'static str {
    match status {
        CardStatus::Backlog => "backlog",
        CardStatus::InProgress => "in-progress",
        CardStatus::Done => "done",
    }
}
