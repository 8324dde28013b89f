use tokio::sync::broadcast::Receiver;
use tokio_stream::{
    wrappers::{errors::BroadcastStreamRecvError, BroadcastStream},
    StreamExt,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{internals::observer::ObserverEvent, models::row::Row};

/// Task: Log device state changes and appended rows. Rows are logged at
/// trace level only. Can be cancelled.
#[tracing::instrument(skip_all)]
pub async fn task_event_logging(
    token: CancellationToken,
    mut rx_observer: Receiver<ObserverEvent>,
    rx_rows: Receiver<Row>,
) {
    info!("Started.");
    let mut rows = BroadcastStream::new(rx_rows);
    let mut logged_rows: u64 = 0;
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                warn!("Cancelled.");
                break;
            },
            Ok(event) = rx_observer.recv() => {
                info!("Device changed: {}", event);
            },
            Some(row) = rows.next() => {
                match row {
                    Ok(row) => {
                        logged_rows += 1;
                        trace!("Row {}: {}", logged_rows, row);
                    }
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        debug!("Row log lagged behind by {} rows.", skipped);
                    }
                }
            },
        };
    }
}
