use crate::{
    error::FetchError,
    executor::{CursorExecutor, CursorRequest, CursorResponse},
    retry::classify_executor_error,
};
use engine_core::retry::{Attempted, RetryError, RetryPolicy};
use model::cursor::Cursor;
use std::{collections::BTreeMap, sync::Arc};

/// Fetches cursor batches with automatic retry on transient failures.
pub struct CursorReader {
    executor: Arc<dyn CursorExecutor>,
    retry: RetryPolicy,
    job_id: String,
    batch_size: u32,
    params: BTreeMap<String, String>,
}

impl CursorReader {
    pub fn new(
        executor: Arc<dyn CursorExecutor>,
        retry: RetryPolicy,
        job_id: impl Into<String>,
        batch_size: u32,
        params: BTreeMap<String, String>,
    ) -> Self {
        Self {
            executor,
            retry,
            job_id: job_id.into(),
            batch_size,
            params,
        }
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    /// One logical iteration: the first call plus up to `max_attempts - 1`
    /// retries with the same cursor.
    pub async fn fetch(
        &self,
        cursor: Option<&Cursor>,
    ) -> Result<Attempted<CursorResponse>, FetchError> {
        let request = CursorRequest {
            job_id: self.job_id.clone(),
            cursor: cursor.cloned(),
            batch_size: self.batch_size,
            params: self.params.clone(),
        };

        let result = self
            .retry
            .run(
                || {
                    let executor = self.executor.clone();
                    let request = request.clone();
                    async move { executor.fetch(request).await }
                },
                classify_executor_error,
            )
            .await;

        match result {
            Ok(fetched) => Ok(fetched),
            Err(RetryError::Fatal { error, attempts }) => Err(FetchError::Fatal {
                cursor: cursor.cloned(),
                attempts,
                source: error,
            }),
            Err(RetryError::AttemptsExceeded { error, attempts }) => {
                Err(FetchError::RetriesExhausted {
                    attempts,
                    source: error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExecutorError;
    use async_trait::async_trait;
    use std::{sync::Mutex, time::Duration};

    struct Scripted {
        replies: Mutex<Vec<Result<CursorResponse, ExecutorError>>>,
        seen: Mutex<Vec<Option<Cursor>>>,
    }

    impl Scripted {
        fn new(mut replies: Vec<Result<CursorResponse, ExecutorError>>) -> Arc<Self> {
            replies.reverse();
            Arc::new(Scripted {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CursorExecutor for Scripted {
        async fn fetch(&self, request: CursorRequest) -> Result<CursorResponse, ExecutorError> {
            self.seen.lock().unwrap().push(request.cursor);
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(ExecutorError::Transport("script exhausted".into())))
        }
    }

    fn reader(executor: Arc<Scripted>) -> CursorReader {
        CursorReader::new(
            executor,
            RetryPolicy::fixed(3, Duration::ZERO),
            "job-1",
            10,
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn transient_failures_retry_with_same_cursor() {
        let executor = Scripted::new(vec![
            Err(ExecutorError::Timeout),
            Ok(CursorResponse {
                next_cursor: Some(Cursor::new("c2")),
                items_processed: 10,
                ..Default::default()
            }),
        ]);

        let fetched = reader(executor.clone())
            .fetch(Some(&Cursor::new("c1")))
            .await
            .unwrap();

        assert_eq!(fetched.value.next_cursor, Some(Cursor::new("c2")));
        assert_eq!(fetched.retries(), 1);
        let seen = executor.seen.lock().unwrap();
        assert_eq!(*seen, vec![Some(Cursor::new("c1")), Some(Cursor::new("c1"))]);
    }

    #[tokio::test]
    async fn exhausted_retries_report_attempts() {
        let executor = Scripted::new(vec![
            Err(ExecutorError::Timeout),
            Err(ExecutorError::Timeout),
            Err(ExecutorError::Timeout),
        ]);

        let err = reader(executor).fetch(None).await.unwrap_err();
        assert!(matches!(err, FetchError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let executor = Scripted::new(vec![Err(ExecutorError::Rejected("bad cursor".into()))]);

        let err = reader(executor.clone()).fetch(None).await.unwrap_err();
        assert!(matches!(err, FetchError::Fatal { attempts: 1, .. }));
        assert_eq!(executor.seen.lock().unwrap().len(), 1);
    }
}
