//! Mapping from blob service errors to the generic datastore vocabulary.

use blobds_common::DatastoreError;

use crate::client::{BlobError, ServiceCode};

/// Translate a blob client error for the datastore layer.
///
/// Only `BlobNotFound` has a generic meaning (`DatastoreError::NotFound`);
/// every other error is passed through opaquely as a backend error.
pub fn translate(err: BlobError) -> DatastoreError {
    if is_service_code(&err, &ServiceCode::BlobNotFound) {
        DatastoreError::NotFound
    } else {
        DatastoreError::backend(err)
    }
}

pub fn is_service_code(err: &BlobError, code: &ServiceCode) -> bool {
    err.service_code() == Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(status: u16, code: ServiceCode) -> BlobError {
        BlobError::Service {
            status,
            code,
            message: String::new(),
        }
    }

    #[test]
    fn test_blob_not_found_becomes_not_found() {
        let err = translate(service(404, ServiceCode::BlobNotFound));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_other_codes_stay_opaque() {
        for code in [
            ServiceCode::ContainerNotFound,
            ServiceCode::AuthenticationFailed,
            ServiceCode::Other("ServerBusy".to_string()),
        ] {
            let err = translate(service(503, code.clone()));
            let DatastoreError::Backend(inner) = err else {
                panic!("expected backend error for {}", code);
            };
            let blob = inner.downcast_ref::<BlobError>().unwrap();
            assert_eq!(blob.service_code(), Some(&code));
        }
    }

    #[test]
    fn test_non_service_errors_stay_opaque() {
        let err = translate(BlobError::Protocol("garbled".to_string()));
        assert!(matches!(err, DatastoreError::Backend(_)));
        assert!(!is_service_code(
            &BlobError::Protocol("x".to_string()),
            &ServiceCode::BlobNotFound
        ));
    }
}
