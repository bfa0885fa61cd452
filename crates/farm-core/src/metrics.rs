//! Prometheus metrics rendering for pool and batch statistics.
//!
//! Renders a [`PoolStats`] snapshot, and optionally the most recent
//! [`BatchReport`], in Prometheus text exposition format.

use std::fmt::Write;

use crate::orchestrator::BatchReport;
use crate::pool::PoolStats;

/// Render pool statistics (and the last batch, if any) as Prometheus text.
pub fn render_prometheus(pool: &PoolStats, last_batch: Option<&BatchReport>) -> String {
    let mut out = String::with_capacity(1024);

    // ── Pool gauges ─────────────────────────────────────────────

    metric(&mut out, "farm_pool_sessions_active", "Sessions currently in use.", "gauge", pool.active as u64);
    metric(&mut out, "farm_pool_sessions_idle", "Live sessions waiting for reuse.", "gauge", pool.idle as u64);
    metric(&mut out, "farm_pool_sessions_total", "All pooled sessions.", "gauge", pool.total as u64);
    metric(
        &mut out,
        "farm_pool_max_connections",
        "Soft capacity of the pool.",
        "gauge",
        pool.max_connections as u64,
    );
    metric(
        &mut out,
        "farm_pool_session_uses",
        "Acquisitions served by sessions still in the pool. Drops when sessions leave.",
        "gauge",
        pool.total_usage,
    );
    metric(
        &mut out,
        "farm_pool_estimated_memory_bytes",
        "Estimated memory held by pooled sessions.",
        "gauge",
        pool.estimated_memory_bytes,
    );

    // ── Last batch ──────────────────────────────────────────────

    if let Some(b) = last_batch {
        let _ = writeln!(out, "# HELP farm_batch_devices Devices in the last batch by outcome.");
        let _ = writeln!(out, "# TYPE farm_batch_devices gauge");
        for (outcome, n) in [("total", b.total), ("successful", b.successful), ("failed", b.failed)] {
            let _ = writeln!(
                out,
                "farm_batch_devices{{batch=\"{}\",outcome=\"{}\"}} {}",
                b.batch, outcome, n
            );
        }
        metric(
            &mut out,
            "farm_batch_handshake_attempts",
            "Handshakes started in the last batch, retries included.",
            "gauge",
            u64::from(b.attempts),
        );
        metric(
            &mut out,
            "farm_batch_peak_in_flight",
            "Most concurrent handshakes in the last batch.",
            "gauge",
            b.peak_in_flight as u64,
        );
        metric(
            &mut out,
            "farm_batch_concurrency_cap",
            "Concurrency cap selected for the last batch.",
            "gauge",
            b.concurrency_cap as u64,
        );
        metric(
            &mut out,
            "farm_batch_elapsed_ms",
            "Wall time of the last batch in milliseconds.",
            "gauge",
            b.elapsed_ms,
        );
        let _ = writeln!(out, "# HELP farm_batch_profile_info Quality profile of the last batch.");
        let _ = writeln!(out, "# TYPE farm_batch_profile_info gauge");
        let _ = writeln!(
            out,
            "farm_batch_profile_info{{tier=\"{}\",resolution=\"{}\",bitrate_bps=\"{}\",max_fps=\"{}\"}} 1",
            b.profile.tier_label, b.profile.resolution, b.profile.bit_rate_bps, b.profile.max_fps
        );
    }

    out
}

fn metric(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    // Writing to a String cannot fail.
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}
