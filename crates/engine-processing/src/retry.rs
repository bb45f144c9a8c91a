use crate::error::ExecutorError;
use engine_core::retry::RetryDisposition;

pub fn classify_executor_error(err: &ExecutorError) -> RetryDisposition {
    match err {
        ExecutorError::Timeout => RetryDisposition::Retry,
        ExecutorError::Connect(_) => RetryDisposition::Retry,
        ExecutorError::Transport(_) => RetryDisposition::Retry,
        ExecutorError::Status { status, .. } => classify_status(*status),
        ExecutorError::Rejected(_) => RetryDisposition::Stop,
        ExecutorError::Decode(_) => RetryDisposition::Stop,
        ExecutorError::NotConfigured(_) => RetryDisposition::Stop,
    }
}

fn classify_status(status: u16) -> RetryDisposition {
    if is_retryable_status(status) {
        RetryDisposition::Retry
    } else {
        RetryDisposition::Stop
    }
}

fn is_retryable_status(status: u16) -> bool {
    // Request timeout, rate limiting and gateway-level failures.
    const RETRYABLE: [u16; 5] = [408, 429, 502, 503, 504];
    RETRYABLE.contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_failures_are_transient() {
        assert_eq!(classify_executor_error(&ExecutorError::Timeout), RetryDisposition::Retry);
        assert_eq!(
            classify_executor_error(&ExecutorError::Connect("refused".into())),
            RetryDisposition::Retry
        );
        assert_eq!(
            classify_executor_error(&ExecutorError::Transport("reset".into())),
            RetryDisposition::Retry
        );
    }

    #[test]
    fn gateway_and_rate_limit_statuses_are_transient() {
        for status in [408, 429, 502, 503, 504] {
            let err = ExecutorError::Status {
                status,
                body: String::new(),
            };
            assert_eq!(classify_executor_error(&err), RetryDisposition::Retry, "{status}");
        }
    }

    #[test]
    fn client_errors_and_bad_payloads_stop() {
        for status in [400, 401, 404, 500] {
            let err = ExecutorError::Status {
                status,
                body: "nope".into(),
            };
            assert_eq!(classify_executor_error(&err), RetryDisposition::Stop, "{status}");
        }
        assert_eq!(
            classify_executor_error(&ExecutorError::Decode("missing field".into())),
            RetryDisposition::Stop
        );
        assert_eq!(
            classify_executor_error(&ExecutorError::Rejected("invalid cursor".into())),
            RetryDisposition::Stop
        );
    }
}
