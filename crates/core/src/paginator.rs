//! Lazy enumeration over cursor-paginated listings.
//!
//! A [`Paginator`] fetches a page only when its buffer runs dry. Each fetch
//! runs through the shared [`ResiliencePipeline`] under the generic pool, so a
//! page request is retried like any other call. Once a fetch fails or the
//! last page has been drained the paginator is finished and yields `None`.

use crate::error::{Error, Result};
use crate::pipeline::{OperationClass, ResiliencePipeline};
use crate::types::{ListCursor, Page};
use futures::future::BoxFuture;
use futures::Stream;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Fetches the page starting at the given cursor (`None` for the first page)
pub type PageFetcher<'a, T> =
    Box<dyn FnMut(Option<ListCursor>) -> BoxFuture<'a, Result<Page<T>>> + Send + 'a>;

enum CursorState {
    Start(Option<ListCursor>),
    Next(ListCursor),
    Done,
}

/// Pull-based iterator over every item of a paginated listing
pub struct Paginator<'a, T> {
    pipeline: Arc<ResiliencePipeline>,
    cancel: CancellationToken,
    fetch: PageFetcher<'a, T>,
    buffer: VecDeque<T>,
    state: CursorState,
    pages_fetched: usize,
}

impl<'a, T: Send + 'a> Paginator<'a, T> {
    pub fn new<F>(pipeline: Arc<ResiliencePipeline>, cancel: CancellationToken, fetch: F) -> Self
    where
        F: FnMut(Option<ListCursor>) -> BoxFuture<'a, Result<Page<T>>> + Send + 'a,
    {
        Self::starting_at(pipeline, cancel, None, fetch)
    }

    /// Paginator whose first request resumes from `cursor`
    pub fn starting_at<F>(
        pipeline: Arc<ResiliencePipeline>,
        cancel: CancellationToken,
        cursor: Option<ListCursor>,
        fetch: F,
    ) -> Self
    where
        F: FnMut(Option<ListCursor>) -> BoxFuture<'a, Result<Page<T>>> + Send + 'a,
    {
        Self {
            pipeline,
            cancel,
            fetch: Box::new(fetch),
            buffer: VecDeque::new(),
            state: CursorState::Start(cursor),
            pages_fetched: 0,
        }
    }

    /// Next item, fetching another page when the buffer is empty
    pub async fn next(&mut self) -> Option<Result<T>> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(Ok(item));
            }

            let cursor = match std::mem::replace(&mut self.state, CursorState::Done) {
                CursorState::Done => return None,
                CursorState::Start(cursor) => cursor,
                CursorState::Next(cursor) => Some(cursor),
            };

            if self.cancel.is_cancelled() {
                return Some(Err(Error::Cancelled));
            }

            let fetch = &mut self.fetch;
            let page = match self
                .pipeline
                .execute(OperationClass::Generic, &self.cancel, || fetch(cursor.clone()))
                .await
            {
                Ok(page) => page,
                Err(err) => return Some(Err(err)),
            };

            self.pages_fetched += 1;
            debug!(
                page = self.pages_fetched,
                items = page.items.len(),
                more = page.next_cursor.is_some(),
                "fetched listing page"
            );

            if let Some(next) = page.next_cursor {
                self.state = CursorState::Next(next);
            }
            self.buffer.extend(page.items);
        }
    }

    /// Pages requested so far
    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Drain every remaining item, stopping at the first error
    pub async fn collect_all(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<T>> + Send + 'a {
        futures::stream::unfold(self, |mut paginator| async move {
            paginator.next().await.map(|item| (item, paginator))
        })
    }
}
