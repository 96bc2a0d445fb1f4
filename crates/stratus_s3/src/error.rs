use stratus_core::error::TransferError;

use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};

/// How a failed request should be treated, independent of the SDK error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Failure {
    /// The request never got a response: connection, timeout, unreadable response.
    Network,
    Status(u16),
    /// The request could not be built.
    Local,
}

pub(crate) fn failure_of<E>(err: &SdkError<E>) -> Failure {
    match err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            Failure::Network
        }
        SdkError::ServiceError(context) => Failure::Status(context.raw().status().as_u16()),
        _ => Failure::Local,
    }
}

pub(crate) fn classify(
    operation: &'static str,
    key: &str,
    failure: Failure,
    message: String,
) -> TransferError {
    let key = key.to_string();
    match failure {
        Failure::Network => TransferError::Transient {
            operation,
            key,
            message,
        },
        Failure::Status(status) if status >= 500 || status == 429 => TransferError::Transient {
            operation,
            key,
            message,
        },
        Failure::Status(401 | 403) => TransferError::Denied {
            operation,
            key,
            message,
        },
        Failure::Status(_) | Failure::Local => TransferError::Rejected {
            operation,
            key,
            message,
        },
    }
}

pub(crate) fn from_sdk<E>(operation: &'static str, key: &str, err: SdkError<E>) -> TransferError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = err
        .as_service_error()
        .and_then(|e| e.message().map(str::to_string))
        .unwrap_or_else(|| DisplayErrorContext(&err).to_string());
    classify(operation, key, failure_of(&err), message)
}

pub(crate) fn is_not_found<E>(err: &SdkError<E>) -> bool {
    matches!(failure_of(err), Failure::Status(404))
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::operation::get_object::GetObjectError;

    #[test]
    fn permission_failures_are_never_transient() {
        let err = classify("get", "runs/a/workdir.stratus", Failure::Status(403), "AccessDenied".into());
        assert!(matches!(err, TransferError::Denied { .. }));
        assert!(err.to_string().contains("runs/a/workdir.stratus"));
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        for status in [429, 500, 503] {
            assert!(classify("put", "k", Failure::Status(status), String::new()).is_transient());
        }
    }

    #[test]
    fn other_client_errors_are_rejections() {
        let err = classify("put", "k", Failure::Status(400), "InvalidArgument".into());
        assert!(matches!(err, TransferError::Rejected { .. }));
    }

    #[test]
    fn timeouts_are_network_failures() {
        let err: SdkError<GetObjectError> = SdkError::timeout_error("read timed out");
        assert_eq!(failure_of(&err), Failure::Network);
        assert!(from_sdk("get", "k", err).is_transient());
    }
}
