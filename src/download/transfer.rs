// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Per-item transfer pipeline.
//!
//! One invocation owns an item from dispatch to a terminal slot outcome:
//! it probes the resource, runs a chunked or full-body transfer, and loops
//! through bounded retry with exponential backoff. Cancellation is a race:
//! every attempt runs inside a `select!` against the item's cancellation
//! token, and a cancelled attempt parks the row as `paused` with its
//! resumption cursor intact.

use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{FetchError, StoreError};
use crate::events::{Event, EventBus};
use crate::fetch::{FetchRequest, Fetcher};
use crate::registry::RegistryManager;
use crate::store::Store;
use crate::types::{
    percent, ItemStatus, QueueEntry, RegistryEntry, FALLBACK_MIME_TYPE,
    REASON_INSUFFICIENT_STORAGE, REASON_NETWORK_OFFLINE,
};

use super::types::{HeadProbe, PartialTransfer, TransferOutcome};
use super::types::{content_length_if_identity, parse_mime};

/// Shared handles the pipeline needs; cloned per dispatched item.
#[derive(Clone)]
pub(crate) struct TransferContext {
    pub store: Arc<dyn Store>,
    pub fetcher: Arc<dyn Fetcher>,
    pub registry: Arc<RegistryManager>,
    pub events: Arc<EventBus>,
    pub connectivity: ConnectivityMonitor,
    pub config: Arc<ManagerConfig>,
}

/// Failure classification local to one attempt.
enum AttemptError {
    /// Cooperative cancellation; parks the row, never retried.
    Aborted,
    /// Storage quota refused a write; defers the row, never retried.
    Quota,
    /// Anything else; enters retry/backoff.
    Transport(String),
}

impl From<StoreError> for AttemptError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::QuotaExceeded => AttemptError::Quota,
            other => AttemptError::Transport(other.to_string()),
        }
    }
}

impl From<FetchError> for AttemptError {
    fn from(e: FetchError) -> Self {
        AttemptError::Transport(e.to_string())
    }
}

/// How a non-failing attempt ended.
enum Finish {
    /// Payload stored and `complete` emitted.
    Completed,
    /// The row was deleted out from under the transfer; nothing written.
    Vanished,
}

/// Download body with its resolved MIME type, ready to store.
struct ResolvedPayload {
    payload: Vec<u8>,
    mime_type: String,
}

/// Drive one item until its slot outcome.
///
/// Returns the outcome and, for pauses and deferrals, the chunk buffer to
/// stash for resumption.
pub(crate) async fn run_transfer(
    ctx: TransferContext,
    entry: RegistryEntry,
    mut partial: PartialTransfer,
    cancel: CancellationToken,
) -> (TransferOutcome, Option<PartialTransfer>) {
    loop {
        let mut queue = match ctx.store.queue_get(&entry.id).await {
            Ok(Some(queue)) => queue,
            Ok(None) => {
                debug!(target: "download", id = %entry.id, "queue row gone before attempt; abandoning transfer");
                return (TransferOutcome::Paused, None);
            }
            Err(e) => {
                warn!(target: "download", id = %entry.id, error = %e, "could not read queue row; abandoning transfer");
                return (TransferOutcome::Paused, Some(partial));
            }
        };

        // A persisted cursor is only honored while this process still holds
        // the matching chunk buffer; otherwise the transfer restarts from
        // zero. The stored payload (if any) is untouched by the reset.
        if queue.byte_offset == 0 {
            partial.clear();
        } else if partial.bytes() != queue.byte_offset {
            debug!(
                target: "download",
                id = %entry.id,
                cursor = queue.byte_offset,
                buffered = partial.bytes(),
                "resumption cursor has no matching buffer; restarting from zero"
            );
            queue.byte_offset = 0;
            queue.bytes_downloaded = 0;
            partial.clear();
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(AttemptError::Aborted),
            result = attempt_once(&ctx, &entry, &mut queue, &mut partial) => result,
        };

        match outcome {
            Ok(Finish::Completed) => return (TransferOutcome::Completed, None),
            Ok(Finish::Vanished) => return (TransferOutcome::Paused, None),
            Err(AttemptError::Aborted) => {
                // `byte_offset` already reflects the last persisted chunk for
                // a chunked transfer and stays 0 for a full-body one, so the
                // pause write must not invent a cursor the server cannot
                // honor. The buffer is only worth keeping alongside a real
                // cursor.
                queue.status = ItemStatus::Paused;
                queue.deferred_reason = (!ctx.connectivity.is_online())
                    .then(|| REASON_NETWORK_OFFLINE.to_string());
                if let Err(e) = ctx.registry.write_queue_mirrored(&queue).await {
                    warn!(target: "download", id = %entry.id, error = %e, "failed to persist paused row");
                }
                ctx.events.emit(&Event::Status {
                    id: entry.id.clone(),
                    status: ItemStatus::Paused,
                });
                debug!(target: "download", id = %entry.id, cursor = queue.byte_offset, "transfer paused");
                let resumable = queue.byte_offset > 0;
                return (TransferOutcome::Paused, resumable.then_some(partial));
            }
            Err(AttemptError::Quota) => {
                // Re-read the stored row so a retained payload from a prior
                // version is not clobbered by the deferral write.
                let mut fresh = match ctx.store.queue_get(&entry.id).await {
                    Ok(Some(row)) => row,
                    _ => queue.clone(),
                };
                fresh.status = ItemStatus::Deferred;
                fresh.deferred_reason = Some(REASON_INSUFFICIENT_STORAGE.to_string());
                // Record the learned size so the pre-dispatch storage check
                // can gate the next cycle instead of refetching blindly.
                fresh.total_bytes = fresh.total_bytes.or(queue.total_bytes);
                if let Err(e) = ctx.registry.write_queue_mirrored(&fresh).await {
                    warn!(target: "download", id = %entry.id, error = %e, "failed to persist deferred row");
                }
                ctx.events.emit(&Event::Deferred {
                    id: entry.id.clone(),
                    reason: REASON_INSUFFICIENT_STORAGE.to_string(),
                });
                info!(target: "download", id = %entry.id, "transfer deferred: insufficient storage");
                let resumable = fresh.byte_offset > 0;
                return (TransferOutcome::Deferred, resumable.then_some(partial));
            }
            Err(AttemptError::Transport(message)) => {
                queue.retry_count += 1;
                let retry_count = queue.retry_count;
                queue.error_message = Some(message.clone());

                if retry_count > ctx.config.max_retries {
                    queue.status = ItemStatus::Failed;
                    if let Err(e) = ctx.registry.write_queue_mirrored(&queue).await {
                        warn!(target: "download", id = %entry.id, error = %e, "failed to persist failed row");
                    }
                    ctx.events.emit(&Event::Error {
                        id: entry.id.clone(),
                        error: message.clone(),
                        retry_count,
                        will_retry: Some(false),
                    });
                    warn!(target: "download", id = %entry.id, retry_count, error = %message, "transfer failed; retries exhausted");
                    return (TransferOutcome::Failed, None);
                }

                queue.status = ItemStatus::Pending;
                if let Err(e) = ctx.registry.write_queue_mirrored(&queue).await {
                    warn!(target: "download", id = %entry.id, error = %e, "failed to persist retry state");
                }
                ctx.events.emit(&Event::Error {
                    id: entry.id.clone(),
                    error: message.clone(),
                    retry_count,
                    will_retry: Some(true),
                });

                let delay = ctx.config.backoff_delay(retry_count);
                debug!(target: "download", id = %entry.id, retry_count, delay_ms = delay.as_millis() as u64, error = %message, "transfer attempt failed; backing off");

                // Backoff is interrupted by cancellation only, never by
                // drain-loop wakes.
                tokio::select! {
                    _ = cancel.cancelled() => {
                        queue.status = ItemStatus::Paused;
                        queue.deferred_reason = (!ctx.connectivity.is_online())
                            .then(|| REASON_NETWORK_OFFLINE.to_string());
                        if let Err(e) = ctx.registry.write_queue_mirrored(&queue).await {
                            warn!(target: "download", id = %entry.id, error = %e, "failed to persist paused row");
                        }
                        ctx.events.emit(&Event::Status {
                            id: entry.id.clone(),
                            status: ItemStatus::Paused,
                        });
                        let resumable = queue.byte_offset > 0;
                        return (TransferOutcome::Paused, resumable.then_some(partial));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// One attempt: mark in-progress, probe, transfer, finalize.
async fn attempt_once(
    ctx: &TransferContext,
    entry: &RegistryEntry,
    queue: &mut QueueEntry,
    partial: &mut PartialTransfer,
) -> Result<Finish, AttemptError> {
    queue.status = ItemStatus::InProgress;
    queue.last_attempt_at = Some(Utc::now());
    queue.error_message = None;
    queue.deferred_reason = None;
    match ctx.registry.write_queue_mirrored(queue).await {
        Ok(true) => {}
        Ok(false) => return Ok(Finish::Vanished),
        Err(e) => return Err(e.into()),
    }
    ctx.events.emit(&Event::Status {
        id: entry.id.clone(),
        status: ItemStatus::InProgress,
    });

    let mut mime = entry.mime_type.clone();
    // Resuming a prior chunked transfer implies the server spoke Range.
    let mut supports_range = queue.byte_offset > 0;

    if queue.byte_offset == 0 {
        let probe = match ctx.fetcher.fetch(FetchRequest::head(&entry.download_url)).await {
            Ok(response) if response.is_success() => HeadProbe::from_response(&response),
            Ok(response) => {
                debug!(target: "download", id = %entry.id, status = response.status(), "HEAD probe refused; using full-body GET");
                HeadProbe::unavailable()
            }
            Err(e) => {
                debug!(target: "download", id = %entry.id, error = %e, "HEAD probe failed; using full-body GET");
                HeadProbe::unavailable()
            }
        };
        supports_range = probe.supports_range;
        if probe.total_bytes.is_some() {
            queue.total_bytes = probe.total_bytes;
        }
        if mime.is_none() {
            mime = probe.mime_type;
        }
    }

    let chunked = supports_range
        && queue
            .total_bytes
            .is_some_and(|total| total > ctx.config.chunk_threshold);

    let resolved = if chunked {
        chunked_transfer(ctx, entry, queue, partial, mime).await?
    } else {
        full_transfer(ctx, entry, queue, partial, mime).await?
    };

    finalize(ctx, entry, queue, resolved).await
}

/// Sequential Range GETs of `chunk_size` bytes, persisting the cursor and
/// emitting progress after each chunk.
async fn chunked_transfer(
    ctx: &TransferContext,
    entry: &RegistryEntry,
    queue: &mut QueueEntry,
    partial: &mut PartialTransfer,
    mut mime: Option<String>,
) -> Result<ResolvedPayload, AttemptError> {
    let total = queue
        .total_bytes
        .ok_or_else(|| AttemptError::Transport("chunked transfer without a known size".into()))?;

    while queue.byte_offset < total {
        let start = queue.byte_offset;
        let end = (start + ctx.config.chunk_size).min(total) - 1;

        let response = ctx
            .fetcher
            .fetch(FetchRequest::get_range(&entry.download_url, start, end))
            .await?;
        if response.status() != 206 {
            return Err(AttemptError::Transport(format!(
                "expected 206 for range {}-{}, got {}",
                start,
                end,
                response.status()
            )));
        }
        if mime.is_none() {
            mime = parse_mime(response.header("content-type"));
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Err(AttemptError::Transport(format!(
                "empty body for range {}-{}",
                start, end
            )));
        }

        partial.push(Bytes::from(body));
        if partial.bytes() > total {
            return Err(AttemptError::Transport(format!(
                "server sent {} bytes for a {}-byte resource",
                partial.bytes(),
                total
            )));
        }

        queue.byte_offset = partial.bytes();
        queue.bytes_downloaded = partial.bytes();
        match ctx.registry.write_queue_mirrored(queue).await {
            Ok(true) => {}
            Ok(false) => return Err(AttemptError::Aborted),
            Err(e) => return Err(e.into()),
        }
        ctx.events.emit(&Event::Progress {
            id: entry.id.clone(),
            bytes_downloaded: queue.bytes_downloaded,
            total_bytes: Some(total),
            percent: percent(queue.bytes_downloaded, Some(total)),
        });
    }

    Ok(ResolvedPayload {
        payload: partial.concat(),
        mime_type: mime.unwrap_or_else(|| FALLBACK_MIME_TYPE.to_string()),
    })
}

/// Single streamed GET for servers without Range support or bodies at or
/// under the chunking threshold.
async fn full_transfer(
    ctx: &TransferContext,
    entry: &RegistryEntry,
    queue: &mut QueueEntry,
    partial: &mut PartialTransfer,
    mut mime: Option<String>,
) -> Result<ResolvedPayload, AttemptError> {
    partial.clear();
    queue.byte_offset = 0;
    queue.bytes_downloaded = 0;

    let mut response = ctx
        .fetcher
        .fetch(FetchRequest::get(&entry.download_url))
        .await?;
    if !response.is_success() {
        return Err(AttemptError::Transport(format!(
            "HTTP {} fetching {}",
            response.status(),
            entry.download_url
        )));
    }

    let total = content_length_if_identity(&response);
    if total.is_some() {
        queue.total_bytes = total;
    }
    if mime.is_none() {
        mime = parse_mime(response.header("content-type"));
    }

    while let Some(chunk) = response.next_chunk().await? {
        if chunk.is_empty() {
            continue;
        }
        partial.push(chunk);
        queue.bytes_downloaded = partial.bytes();
        ctx.events.emit(&Event::Progress {
            id: entry.id.clone(),
            bytes_downloaded: queue.bytes_downloaded,
            total_bytes: total,
            percent: percent(queue.bytes_downloaded, total),
        });
    }

    if let Some(total) = total {
        if partial.bytes() != total {
            return Err(AttemptError::Transport(format!(
                "truncated stream: got {} of {} bytes",
                partial.bytes(),
                total
            )));
        }
    }

    if partial.is_empty() {
        ctx.events.emit(&Event::Progress {
            id: entry.id.clone(),
            bytes_downloaded: 0,
            total_bytes: total,
            percent: percent(0, total),
        });
    }

    Ok(ResolvedPayload {
        payload: partial.concat(),
        mime_type: mime.unwrap_or_else(|| FALLBACK_MIME_TYPE.to_string()),
    })
}

/// Write the completed row in one put (payload and status together) and
/// emit `complete`.
async fn finalize(
    ctx: &TransferContext,
    entry: &RegistryEntry,
    queue: &mut QueueEntry,
    resolved: ResolvedPayload,
) -> Result<Finish, AttemptError> {
    let size = resolved.payload.len() as u64;
    let now = Utc::now();

    queue.status = ItemStatus::Complete;
    queue.data = Some(resolved.payload);
    queue.mime_type = Some(resolved.mime_type.clone());
    queue.bytes_downloaded = size;
    queue.byte_offset = size;
    queue.total_bytes = Some(size);
    queue.retry_count = 0;
    queue.completed_at = Some(now);
    queue.expires_at = (entry.ttl_seconds > 0)
        .then(|| now + chrono::Duration::seconds(entry.ttl_seconds as i64));
    queue.error_message = None;
    queue.deferred_reason = None;

    match ctx.registry.write_queue_mirrored(queue).await {
        Ok(true) => {}
        Ok(false) => return Ok(Finish::Vanished),
        Err(e) => return Err(e.into()),
    }

    info!(target: "download", id = %entry.id, bytes = size, mime = %resolved.mime_type, "download complete");
    ctx.events.emit(&Event::Complete {
        id: entry.id.clone(),
        mime_type: resolved.mime_type,
    });
    Ok(Finish::Completed)
}
