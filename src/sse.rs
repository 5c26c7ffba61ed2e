//! Server-Sent-Events bridge from the log bus to HTTP clients.
//!
//! Event order matches bus subscription order. Named events:
//! `connected` (once), `log` (one per record), `heartbeat`, `limit_reached`
//! (subscriber fell too far behind), and on the terminal transition a
//! `status` event, an `error`/`timeout` event when the task failed, and a
//! final `completed` event with `final=true`.

use std::collections::VecDeque;
use std::convert::Infallible;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, Sse};
use futures_util::Stream;
use serde::Deserialize;

use crate::api::{ApiError, SharedState};
use crate::logbus::{BusEvent, Subscription};
use crate::models::{BuildTask, TaskStatus};

#[derive(Deserialize)]
pub struct StreamQuery {
    /// How many recent records to replay on connect.
    pub replay: Option<usize>,
}

pub async fn stream_task_logs(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    state
        .db
        .call(move |db| db.get_task(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Task {} not found", id)))?;

    let replay = query.replay.unwrap_or(100).min(2_000);
    let subscription = state.bus.subscribe(id, replay);

    let stream = futures_util::stream::unfold(
        StreamCursor {
            state,
            task_id: id,
            subscription,
            pending: VecDeque::new(),
            connected_sent: false,
            done: false,
        },
        |mut cursor| async move {
            let event = cursor.next_event().await?;
            Some((Ok(event), cursor))
        },
    );
    Ok(Sse::new(stream))
}

struct StreamCursor {
    state: SharedState,
    task_id: i64,
    subscription: Subscription,
    pending: VecDeque<(&'static str, String)>,
    connected_sent: bool,
    done: bool,
}

impl StreamCursor {
    async fn next_event(&mut self) -> Option<Event> {
        if !self.connected_sent {
            self.connected_sent = true;
            return Some(named(
                "connected",
                serde_json::json!({"task_id": self.task_id}).to_string(),
            ));
        }
        if let Some((name, data)) = self.pending.pop_front() {
            return Some(named(name, data));
        }
        if self.done {
            return None;
        }

        match self.subscription.next().await? {
            BusEvent::Completed { final_status } => {
                self.done = true;
                let task_id = self.task_id;
                let row = self
                    .state
                    .db
                    .call(move |db| db.get_task(task_id))
                    .await
                    .ok()
                    .flatten();
                self.pending = terminal_events(task_id, final_status, row.as_ref()).into();
                let (name, data) = self.pending.pop_front()?;
                Some(named(name, data))
            }
            event => {
                let (name, data) = translate(self.task_id, &event);
                Some(named(name, data))
            }
        }
    }
}

fn named(name: &'static str, data: String) -> Event {
    Event::default().event(name).data(data)
}

/// Non-terminal bus events map one-to-one.
fn translate(task_id: i64, event: &BusEvent) -> (&'static str, String) {
    match event {
        BusEvent::Record(record) => (
            "log",
            serde_json::to_string(record).unwrap_or_else(|_| "{}".to_string()),
        ),
        BusEvent::Heartbeat { timestamp } => (
            "heartbeat",
            serde_json::json!({"task_id": task_id, "timestamp": timestamp}).to_string(),
        ),
        BusEvent::LimitReached { dropped } => (
            "limit_reached",
            serde_json::json!({"task_id": task_id, "dropped": dropped}).to_string(),
        ),
        BusEvent::Completed { .. } => unreachable!("terminal events are expanded separately"),
    }
}

/// The terminal marker fans out into `status`, optionally `error`/`timeout`,
/// and the final `completed` event.
fn terminal_events(
    task_id: i64,
    final_status: TaskStatus,
    row: Option<&BuildTask>,
) -> Vec<(&'static str, String)> {
    let error_kind = row.and_then(|t| t.error_kind.clone());
    let error_message = row.and_then(|t| t.error_message.clone());

    let mut events = vec![(
        "status",
        serde_json::json!({
            "task_id": task_id,
            "status": final_status,
            "error_kind": error_kind.clone(),
            "error_message": error_message.clone(),
        })
        .to_string(),
    )];

    if final_status == TaskStatus::Failed {
        let name = if error_kind.as_deref() == Some("timeout") {
            "timeout"
        } else {
            "error"
        };
        let payload = serde_json::json!({
            "task_id": task_id,
            "error_kind": error_kind,
            "error_message": error_message,
        })
        .to_string();
        events.push((name, payload));
    }

    events.push((
        "completed",
        serde_json::json!({
            "task_id": task_id,
            "status": final_status,
            "final": true,
        })
        .to_string(),
    ));
    events
}
