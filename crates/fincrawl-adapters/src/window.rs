//! Splitting date ranges and key sets into vendor-sized requests.

use std::collections::VecDeque;

use chrono::{Duration, NaiveDate};
use fincrawl_core::{FetchWindow, SyncCursor};
use thiserror::Error;
use tracing::{debug, error};

use crate::{RawFrame, VendorCallError, VendorClient, VendorRequest};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WindowError {
    #[error("window limit must be at least one day")]
    ZeroLimit,
    #[error("key chunk size must be at least one")]
    ZeroChunk,
    #[error("cell-limited batch requested with no fields")]
    NoFields,
    #[error("{field_count} fields exceed the {cell_limit}-cell limit of one call")]
    FieldsExceedCellLimit {
        field_count: usize,
        cell_limit: usize,
    },
}

/// Lazy partition of `[start, end)` into consecutive windows of at most `limit` days.
#[derive(Debug, Clone)]
pub struct WindowPlan {
    next: NaiveDate,
    end: NaiveDate,
    limit: Duration,
}

pub fn plan_windows(
    start: NaiveDate,
    end: NaiveDate,
    limit_days: u32,
) -> Result<WindowPlan, WindowError> {
    if limit_days == 0 {
        return Err(WindowError::ZeroLimit);
    }
    Ok(WindowPlan {
        next: start,
        end,
        limit: Duration::days(i64::from(limit_days)),
    })
}

impl Iterator for WindowPlan {
    type Item = FetchWindow;

    fn next(&mut self) -> Option<FetchWindow> {
        let stop = (self.next + self.limit).min(self.end);
        let window = FetchWindow::new(self.next, stop)?;
        self.next = stop;
        Some(window)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.end - self.next).num_days().max(0);
        let limit = self.limit.num_days();
        let n = ((remaining + limit - 1) / limit) as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for WindowPlan {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyChunking {
    /// At most `n` keys per call.
    Fixed(usize),
    /// Calls are capped at `cell_limit` cells, one cell per key and field.
    CellLimit {
        cell_limit: usize,
        field_count: usize,
    },
}

impl KeyChunking {
    pub fn chunk_size(&self) -> Result<usize, WindowError> {
        match *self {
            KeyChunking::Fixed(0) => Err(WindowError::ZeroChunk),
            KeyChunking::Fixed(n) => Ok(n),
            KeyChunking::CellLimit { field_count: 0, .. } => Err(WindowError::NoFields),
            KeyChunking::CellLimit {
                cell_limit,
                field_count,
            } if field_count > cell_limit => Err(WindowError::FieldsExceedCellLimit {
                field_count,
                cell_limit,
            }),
            KeyChunking::CellLimit {
                cell_limit,
                field_count,
            } => Ok(cell_limit / field_count),
        }
    }
}

/// Partition `keys` in order into chunks sized by `chunking`.
pub fn chunk_keys<K: Clone>(keys: &[K], chunking: KeyChunking) -> Result<Vec<Vec<K>>, WindowError> {
    let size = chunking.chunk_size()?;
    Ok(keys.chunks(size).map(<[K]>::to_vec).collect())
}

/// Outcome of one vendor call made on behalf of an entity key or key chunk.
#[derive(Debug)]
pub enum FetchEvent {
    Frame {
        key: String,
        window: Option<FetchWindow>,
        frame: RawFrame,
    },
    Failed {
        key: String,
        window: Option<FetchWindow>,
        error: VendorCallError,
    },
}

impl FetchEvent {
    pub fn key(&self) -> &str {
        match self {
            FetchEvent::Frame { key, .. } | FetchEvent::Failed { key, .. } => key,
        }
    }

    pub fn window(&self) -> Option<FetchWindow> {
        match self {
            FetchEvent::Frame { window, .. } | FetchEvent::Failed { window, .. } => *window,
        }
    }
}

fn log_failure(key: &str, window: Option<&FetchWindow>, err: &VendorCallError) {
    match window {
        Some(window) => error!(
            entity = %key,
            %window,
            systemic = err.is_systemic(),
            error = ?err,
            "VendorCallError: stopping fetch for entity"
        ),
        None => error!(
            entity = %key,
            systemic = err.is_systemic(),
            error = ?err,
            "VendorCallError: stopping fetch for entity"
        ),
    }
}

/// Issues bounded vendor calls for a set of entities, one window at a time.
#[derive(Clone, Copy)]
pub struct WindowedFetcher<'a> {
    client: &'a dyn VendorClient,
    limit_days: u32,
}

impl<'a> WindowedFetcher<'a> {
    pub fn new(client: &'a dyn VendorClient, limit_days: u32) -> Result<Self, WindowError> {
        if limit_days == 0 {
            return Err(WindowError::ZeroLimit);
        }
        Ok(Self { client, limit_days })
    }

    pub fn limit_days(&self) -> u32 {
        self.limit_days
    }

    /// Windows for every cursor from its last synced date up to `end` (exclusive).
    pub fn fetch_all<F>(&self, cursors: Vec<SyncCursor>, end: NaiveDate, build: F) -> FetchAll<'a, F>
    where
        F: Fn(&SyncCursor, &FetchWindow) -> VendorRequest,
    {
        FetchAll {
            client: self.client,
            limit_days: self.limit_days,
            pending: cursors.into(),
            current: None,
            end,
            build,
            halted: false,
        }
    }

    /// One call per key chunk; chunks are independent entities.
    pub fn fetch_chunks<F>(&self, chunks: Vec<Vec<String>>, build: F) -> FetchChunks<'a, F>
    where
        F: Fn(&[String]) -> VendorRequest,
    {
        FetchChunks {
            client: self.client,
            pending: chunks.into(),
            build,
            halted: false,
        }
    }
}

/// Pull-based sequence of window fetches across entities.
///
/// Windows of one entity come in increasing date order. A failed call ends that
/// entity; a systemic failure ends the whole sequence after it is reported.
pub struct FetchAll<'a, F> {
    client: &'a dyn VendorClient,
    limit_days: u32,
    pending: VecDeque<SyncCursor>,
    current: Option<(SyncCursor, WindowPlan)>,
    end: NaiveDate,
    build: F,
    halted: bool,
}

impl<'a, F> FetchAll<'a, F>
where
    F: Fn(&SyncCursor, &FetchWindow) -> VendorRequest,
{
    pub async fn next(&mut self) -> Option<FetchEvent> {
        loop {
            if self.halted {
                return None;
            }
            if self.current.is_none() {
                let cursor = self.pending.pop_front()?;
                let plan = plan_windows(cursor.last_synced, self.end, self.limit_days).ok()?;
                debug!(entity = %cursor.key, windows = plan.len(), "planned fetch windows");
                self.current = Some((cursor, plan));
            }
            let Some((cursor, plan)) = self.current.as_mut() else {
                continue;
            };
            let Some(window) = plan.next() else {
                self.current = None;
                continue;
            };

            let request = (self.build)(cursor, &window);
            let key = cursor.key.clone();
            return match self.client.call(&request).await {
                Ok(frame) => Some(FetchEvent::Frame {
                    key,
                    window: Some(window),
                    frame,
                }),
                Err(error) => {
                    log_failure(&key, Some(&window), &error);
                    self.current = None;
                    self.halted = error.is_systemic();
                    Some(FetchEvent::Failed {
                        key,
                        window: Some(window),
                        error,
                    })
                }
            };
        }
    }

    /// Drop the remaining windows of the entity currently being fetched.
    pub fn skip_entity(&mut self) {
        self.current = None;
    }

    pub fn halted(&self) -> bool {
        self.halted
    }
}

/// Pull-based sequence of key-chunk fetches.
pub struct FetchChunks<'a, F> {
    client: &'a dyn VendorClient,
    pending: VecDeque<Vec<String>>,
    build: F,
    halted: bool,
}

impl<'a, F> FetchChunks<'a, F>
where
    F: Fn(&[String]) -> VendorRequest,
{
    pub async fn next(&mut self) -> Option<FetchEvent> {
        if self.halted {
            return None;
        }
        let chunk = self.pending.pop_front()?;
        let key = chunk.join(",");
        let request = (self.build)(&chunk);
        match self.client.call(&request).await {
            Ok(frame) => Some(FetchEvent::Frame {
                key,
                window: None,
                frame,
            }),
            Err(error) => {
                log_failure(&key, None, &error);
                self.halted = error.is_systemic();
                Some(FetchEvent::Failed {
                    key,
                    window: None,
                    error,
                })
            }
        }
    }

    pub fn halted(&self) -> bool {
        self.halted
    }
}
