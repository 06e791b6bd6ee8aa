//! Operator tool: inspect the reserve ledger and verify book consistency
//!
//! Prints the current strategy state, recomputes each exchange's reserve from
//! the ledger and compares it to the cached balance, then lists the most
//! recent ledger entries and execution records.

use anyhow::Result;

use dcabot::executions::EXECUTIONS_DB;
use dcabot::ledger;
use dcabot::state::STRATEGY_DB;

fn main() -> Result<()> {
    dcabot::paths::ensure_all_directories().map_err(anyhow::Error::msg)?;
    dcabot::logger::init();

    let state = STRATEGY_DB.load_state().map_err(|e| anyhow::anyhow!("{}", e))?;
    println!("Strategy state (version {})", state.version);
    println!("  cdc_enabled:      {}", state.cdc_enabled);
    println!("  last_signal:      {}", state.last_signal);
    println!("  red_epoch_active: {}", state.red_epoch_active);
    match state.last_transition_at {
        Some(at) => println!("  last_transition:  {}", at.to_rfc3339()),
        None => println!("  last_transition:  never"),
    }
    println!();

    println!("Reserve audit (ledger sum vs cached balance)");
    let mut consistent = true;
    for (exchange, ledger_sum, cached) in
        ledger::audit(&STRATEGY_DB).map_err(|e| anyhow::anyhow!("{}", e))?
    {
        let ok = (ledger_sum - cached).abs() < 1e-6;
        consistent &= ok;
        println!(
            "  {:<8} ledger={:>14.2}  cached={:>14.2}  {}",
            exchange.as_str(),
            ledger_sum,
            cached,
            if ok { "OK" } else { "MISMATCH" }
        );
    }
    println!();

    println!("Recent ledger entries");
    for entry in ledger::recent_entries(&STRATEGY_DB, 20).map_err(|e| anyhow::anyhow!("{}", e))? {
        println!(
            "  {} {:<8} {:>+12.2} -> {:>12.2}  {:<16} {}",
            entry.event_time.format("%Y-%m-%d %H:%M:%S"),
            entry.exchange.as_str(),
            entry.delta,
            entry.reserve_after,
            entry.reason,
            entry.note.unwrap_or_default()
        );
    }
    println!();

    println!("Recent execution records");
    for record in EXECUTIONS_DB.recent(20).map_err(|e| anyhow::anyhow!("{}", e))? {
        println!(
            "  {} {:<8} {:<4} {:<10} {:>12.2}  {:<8} {}",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.exchange.as_str(),
            record.side,
            record.symbol,
            record.requested_amount,
            record.status.as_str(),
            record.dedupe_key
        );
    }

    if !consistent {
        anyhow::bail!("ledger/balance mismatch detected");
    }
    Ok(())
}
