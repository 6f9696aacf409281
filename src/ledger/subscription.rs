//! Polling log subscription.
//!
//! Each event family gets its own stream. The stream walks forward from a
//! starting block in bounded ranges, sleeps when it has caught up with the
//! chain head, and surfaces fetch failures as items instead of ending.

use super::{LedgerClient, LedgerError, RawLog};
use crate::domain::EventFamily;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

pub type LogStream = BoxStream<'static, Result<RawLog, LedgerError>>;

#[derive(Debug, Clone, Copy)]
pub struct SubscriptionOptions {
    pub poll_interval: Duration,
    /// Largest inclusive block span requested per `fetch_logs` call.
    pub max_block_range: u64,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            max_block_range: 2000,
        }
    }
}

struct PollState {
    client: Arc<dyn LedgerClient>,
    family: EventFamily,
    next_block: u64,
    buffer: VecDeque<RawLog>,
    opts: SubscriptionOptions,
    caught_up: bool,
}

/// Subscribe to one family starting at `from_block` (inclusive).
///
/// The stream never terminates on its own; drop it to unsubscribe.
pub fn subscribe(
    client: Arc<dyn LedgerClient>,
    family: EventFamily,
    from_block: u64,
    opts: SubscriptionOptions,
) -> LogStream {
    let state = PollState {
        client,
        family,
        next_block: from_block,
        buffer: VecDeque::new(),
        opts,
        caught_up: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(log) = state.buffer.pop_front() {
                return Some((Ok(log), state));
            }

            if state.caught_up {
                tokio::time::sleep(state.opts.poll_interval).await;
                state.caught_up = false;
            }

            let latest = match state.client.latest_block().await {
                Ok(latest) => latest,
                Err(e) => {
                    state.caught_up = true;
                    return Some((Err(e), state));
                }
            };
            if latest < state.next_block {
                state.caught_up = true;
                continue;
            }

            let span = state.opts.max_block_range.max(1) - 1;
            let to_block = latest.min(state.next_block.saturating_add(span));
            match state
                .client
                .fetch_logs(state.family, state.next_block, to_block)
                .await
            {
                Ok(logs) => {
                    state.buffer.extend(logs);
                    state.next_block = to_block + 1;
                    if to_block >= latest {
                        state.caught_up = true;
                    }
                }
                Err(e) => {
                    state.caught_up = true;
                    return Some((Err(e), state));
                }
            }
        }
    })
    .boxed()
}
