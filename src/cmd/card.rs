//! `deckhand validate`: parse a card and report what the agent will see.

use crate::board::CardLocation;
use crate::card::{CardStore, KNOWN_FIELDS};
use crate::config::Config;
use anyhow::{Context, Result};
use std::path::PathBuf;

pub fn cmd_validate(_config: &Config, card: PathBuf) -> Result<()> {
    let card = card
        .canonicalize()
        .with_context(|| format!("card not found: {}", card.display()))?;
    let location = CardLocation::parse(&card)?;
    let snapshot = CardStore::new().load_snapshot(&card)?;
    let document = &snapshot.document;

    println!("{} {}", location.code, document.title());
    println!("  status:         {}", location.status);
    if let Some(phase) = &location.phase {
        println!("  phase:          {phase}");
    }
    println!(
        "  parallelizable: {}",
        if document.parallelizable() { "yes" } else { "no" }
    );
    for key in KNOWN_FIELDS {
        // parallelizable already printed above in its yes/no form.
        if key == "parallelizable" {
            continue;
        }
        if let Some(value) = document.field(key) {
            let label = format!("{}:", key.replace('_', " "));
            println!("  {label:<16}{value}");
        }
    }

    let items = document.acceptance_items();
    if !items.is_empty() {
        let done = items.iter().filter(|i| i.complete).count();
        println!("  acceptance:     {done}/{} complete", items.len());
    }
    let history = document.history_entries();
    if let Some(last) = history.last() {
        println!("  last history:   {last}");
    }

    println!("ok");
    Ok(())
}
