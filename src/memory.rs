//! Memory sampling for supervised processes.

use std::time::Duration;

use tracing::debug;

use crate::message::{Kind, Message, Sink};

/// Interval between two samples.
pub const MONITOR_INTERVAL: Duration = Duration::from_millis(500);

/// Emits a `Metric` message with the process's proportional set size every interval.
///
/// Ends when sampling fails (the process is gone, or `/proc` is unavailable) or the
/// sink is closed.
pub async fn monitor(pid: u32, source: String, sink: Sink) {
    let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let kb = match pss_kb(pid).await {
            Ok(kb) => kb,
            Err(err) => {
                debug!(task = %source, pid, error = %err, "memory monitor stopped");
                return;
            }
        };
        let sample = Message::new(source.as_str(), Kind::Metric, format!("{} kB", kb));
        if sink.send(sample).await.is_err() {
            return;
        }
    }
}

/// Sums the `Pss:` entries of `/proc/<pid>/smaps`, in kB.
pub async fn pss_kb(pid: u32) -> std::io::Result<u64> {
    let raw = tokio::fs::read_to_string(format!("/proc/{}/smaps", pid)).await?;
    Ok(sum_pss(&raw))
}

fn sum_pss(smaps: &str) -> u64 {
    smaps
        .lines()
        .filter_map(|line| line.strip_prefix("Pss:"))
        .filter_map(|rest| rest.split_whitespace().next()?.parse::<u64>().ok())
        .sum()
}
