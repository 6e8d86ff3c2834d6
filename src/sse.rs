//! SSE projections: bootstrap snapshot + live event multiplex.
//!
//! A connecting client first receives authoritative snapshots
//! (`connected`, then current drop/user or queue state), then every bus
//! message on its topics re-emitted verbatim. Dropped bus messages are
//! fine: the next reconnect re-bootstraps. Client disconnect tears the
//! pump task down via the closed channel.

use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use futures::Stream;
use serde_json::json;
use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::bus::{Bus, BusEvent, topics};
use crate::error::{Error, Result};
use crate::objects::drops::Drops;
use crate::objects::queue::QueueAdmission;
use crate::types::{DropId, MAX_RETRIES, Millis, RETRY_DELAY_MS, UserId};

/// Pump-channel depth per client.
const CLIENT_BUFFER: usize = 32;

/// Idempotent snapshot reads retry storage failures with bounded
/// backoff; every other error surfaces immediately.
async fn snapshot_with_retries<T, F, Fut>(mut read: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;
    loop {
        match read().await {
            Err(Error::Store(e)) if attempts < MAX_RETRIES => {
                attempts += 1;
                debug!("snapshot read failed ({e}), retry {attempts}");
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
            }
            other => return other,
        }
    }
}

fn sse_event(name: &str, payload: &serde_json::Value) -> Event {
    Event::default().event(name.to_string()).data(payload.to_string())
}

fn bus_to_sse(message: BusEvent) -> Event {
    sse_event(&message.event, &message.payload)
}

fn channel_stream(
    rx: mpsc::Receiver<Event>,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    })
}

/// Forward the subscribed topics into the client channel until either
/// side goes away. Lagged receivers skip ahead; the client still holds
/// a consistent snapshot from bootstrap.
async fn pump(sources: Vec<broadcast::Receiver<BusEvent>>, tx: mpsc::Sender<Event>) {
    let mut iter = sources.into_iter();
    match (iter.next(), iter.next()) {
        (Some(a), None) => pump_one(a, tx).await,
        (Some(a), Some(b)) => pump_two(a, b, tx).await,
        _ => {}
    }
}

/// Returns false when the pump should stop.
async fn forward(
    received: std::result::Result<BusEvent, broadcast::error::RecvError>,
    tx: &mpsc::Sender<Event>,
) -> bool {
    match received {
        Ok(message) => {
            if tx.send(bus_to_sse(message)).await.is_err() {
                debug!("sse client disconnected");
                return false;
            }
            true
        }
        Err(broadcast::error::RecvError::Lagged(n)) => {
            debug!("sse client lagged {n} messages");
            true
        }
        Err(broadcast::error::RecvError::Closed) => false,
    }
}

async fn pump_one(mut rx: broadcast::Receiver<BusEvent>, tx: mpsc::Sender<Event>) {
    loop {
        let received = rx.recv().await;
        if !forward(received, &tx).await {
            return;
        }
    }
}

async fn pump_two(
    mut a: broadcast::Receiver<BusEvent>,
    mut b: broadcast::Receiver<BusEvent>,
    tx: mpsc::Sender<Event>,
) {
    loop {
        let received = tokio::select! {
            m = a.recv() => m,
            m = b.recv() => m,
        };
        if !forward(received, &tx).await {
            return;
        }
    }
}

pub type EventStream = Sse<KeepAliveStream<Box<dyn Stream<Item = std::result::Result<Event, Infallible>> + Send + Unpin>>>;

fn to_response(rx: mpsc::Receiver<Event>) -> EventStream {
    let stream: Box<dyn Stream<Item = std::result::Result<Event, Infallible>> + Send + Unpin> =
        Box::new(Box::pin(channel_stream(rx)));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// `GET /events/{dropId}/{userId}`: drop state + the user's own view.
pub async fn drop_events(
    bus: &Bus,
    drops: &Drops,
    drop_id: &DropId,
    user_id: &UserId,
) -> Result<EventStream> {
    // authoritative snapshots before any live event
    let drop_state = snapshot_with_retries(|| drops.get_state(drop_id)).await?;
    let participant =
        snapshot_with_retries(|| drops.participants().get_state(drop_id, user_id)).await?;

    let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
    let _ = tx
        .send(sse_event(
            "connected",
            &json!({ "dropId": drop_id, "userId": user_id }),
        ))
        .await;
    let _ = tx
        .send(sse_event(
            "drop",
            &serde_json::to_value(&drop_state).unwrap_or(json!({})),
        ))
        .await;
    let _ = tx.send(sse_event("user", &participant.projection())).await;

    let sources = vec![
        bus.subscribe(&topics::drop_state(drop_id)),
        bus.subscribe(&topics::drop_user(drop_id, user_id)),
    ];
    tokio::spawn(pump(sources, tx));

    Ok(to_response(rx))
}

/// `GET /events/queue/{dropId}/{token}`: queue position updates.
pub async fn queue_events(
    bus: &Bus,
    queue: &QueueAdmission,
    drop_id: &DropId,
    token_id: &str,
    now: Millis,
) -> Result<EventStream> {
    let status = queue.status(drop_id, token_id, now).await?;

    let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
    let _ = tx
        .send(sse_event(
            "connected",
            &serde_json::to_value(&status).unwrap_or(json!({})),
        ))
        .await;

    let sources = vec![bus.subscribe(&topics::queue(drop_id, token_id))];
    tokio::spawn(pump(sources, tx));

    Ok(to_response(rx))
}
