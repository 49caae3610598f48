//! Per-session Server-Sent Events and the worker-to-broadcast bridge.

use std::convert::Infallible;
use std::sync::mpsc::Receiver;
use std::thread;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use probescout::session::ScanEvent;

use crate::state::AppState;

/// Forward a session's worker events into its broadcast channel until it completes.
pub fn forward_events(state: AppState, id: String, events: Receiver<ScanEvent>) {
    let tx = state.open_channel(&id);
    thread::spawn(move || {
        for event in events {
            let done = matches!(event, ScanEvent::Completed { .. });
            // No subscribers is fine.
            let _ = tx.send(event);
            if done {
                break;
            }
        }
        debug!(session = %id, "event forwarding finished");
        state.close_channel(&id);
    });
}

fn event_name(event: &ScanEvent) -> &'static str {
    match event {
        ScanEvent::Progress(_) => "progress",
        ScanEvent::Log { .. } => "log",
        ScanEvent::Output { .. } => "output",
        ScanEvent::Completed { .. } => "completed",
    }
}

/// GET /api/scans/{id}/events - snapshot first, then live events until completion.
pub async fn events_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let session = state.registry.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    // Subscribe before the snapshot so nothing falls between them.
    let rx = state.subscribe(&id);
    let snapshot = serde_json::to_string(&session.snapshot())
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let stream = async_stream::stream! {
        yield Ok(Event::default().event("snapshot").data(snapshot));

        let Some(mut rx) = rx else {
            return;
        };
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let done = matches!(event, ScanEvent::Completed { .. });
                    if let Ok(json) = serde_json::to_string(&event) {
                        yield Ok(Event::default().event(event_name(&event)).data(json));
                    }
                    if done {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use probescout::core::goal::default_goal;
    use probescout::io::config::ScoutConfig;
    use probescout::report::RunStatus;

    use super::*;
    use crate::routes::tests::NoopWorker;

    #[test]
    fn forwarder_broadcasts_until_completed() {
        let state = AppState::new(ScoutConfig::default(), Arc::new(NoopWorker));
        let (session, events) = state.registry.create("10.0.0.5", default_goal(), 30);
        let id = session.id().to_string();
        forward_events(state.clone(), id.clone(), events);
        let mut rx = state.subscribe(&id).expect("channel open");

        session.log(1, "port_scan started");
        session.complete(RunStatus::Finished, Some("goal achieved".to_string()), None);

        let first = rx.blocking_recv().expect("log event");
        assert!(matches!(first, ScanEvent::Log { line } if line.ends_with("port_scan started")));
        let second = rx.blocking_recv().expect("completed event");
        assert_eq!(event_name(&second), "completed");
        assert!(rx.blocking_recv().is_err());
        assert!(state.subscribe(&id).is_none());
    }
}
