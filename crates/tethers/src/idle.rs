use crate::registry::Occupancy;
use std::future::pending;
use std::time::Duration;
use tokio::sync::watch;

/// Resolve once the registry has drained and stayed empty for `grace`.
///
/// The timer arms only after at least one client has left, so a server that
/// nobody has connected to yet keeps waiting. Any registration during the
/// grace window cancels the timer, as does a connection that has been
/// accepted but not yet registered. It re-arms when the registry next drains
/// with no upgrade in flight. A zero `grace` never resolves.
pub async fn wait_for_idle(mut occupancy: watch::Receiver<Occupancy>, grace: Duration) {
    if grace.is_zero() {
        return pending().await;
    }
    loop {
        let drained = occupancy
            .wait_for(|o| o.live == 0 && o.pending == 0 && o.departures > 0)
            .await
            .map(|o| *o);
        let Ok(armed) = drained else {
            return pending().await;
        };
        tracing::debug!(
            grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
            "no clients connected, idle shutdown timer started"
        );

        tokio::select! {
            () = tokio::time::sleep(grace) => {
                let now = *occupancy.borrow();
                if now.live == 0 && now.pending == 0 && now.arrivals == armed.arrivals {
                    return;
                }
            }
            changed = arrival(&mut occupancy, armed.arrivals) => {
                if !changed {
                    return pending().await;
                }
                tracing::debug!("client connected during grace period, idle shutdown cancelled");
            }
        }
    }
}

/// Resolves when a client registers or a new connection is accepted.
async fn arrival(occupancy: &mut watch::Receiver<Occupancy>, seen: u64) -> bool {
    occupancy
        .wait_for(|o| o.arrivals != seen || o.pending > 0)
        .await
        .is_ok()
}
