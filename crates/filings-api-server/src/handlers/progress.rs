use super::conversations::owned_conversation;
use crate::auth::CurrentUser;
use crate::state::AppState;
use crate::utils::error::ApiError;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use tracing::debug;
use uuid::Uuid;

/// Subscribe to the conversation's ingestion progress as server-sent
/// events. Event names are the bus channel names; payloads are the JSON
/// event bodies. No replay: late subscribers see the next event onward.
pub async fn subscribe_progress(
    State(state): State<AppState>,
    CurrentUser(user_id): CurrentUser,
    Path(conversation_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    owned_conversation(&state, user_id, conversation_id).await?;

    let mut receiver = state.progress_bus.subscribe();

    let stream = async_stream::stream! {
        loop {
            match receiver.recv().await {
                Ok(conversation_event) => {
                    if conversation_event.conversation_id != conversation_id {
                        continue;
                    }
                    let channel = conversation_event.event.channel();
                    match Event::default().event(channel).json_data(&conversation_event.event) {
                        Ok(event) => yield Ok(event),
                        Err(e) => debug!("Failed to serialize progress event: {}", e),
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(
                        "Progress subscriber for {} lagged, {} events dropped",
                        conversation_id, missed
                    );
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
