use tessera_core::{FailureClass, FetchError, TesseraError, TileCoord};

#[test]
fn converts_io_error() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let error: TesseraError = io_error.into();

    match error {
        TesseraError::Io(err) => assert_eq!(err.kind(), std::io::ErrorKind::NotFound),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn converts_anyhow_error() {
    let error: TesseraError = anyhow::anyhow!("boom").into();

    match error {
        TesseraError::Other(err) => assert_eq!(err.to_string(), "boom"),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn attaches_context() {
    let err = TesseraError::InvalidFormat("bad record header").with_context("while recovering");

    match err {
        TesseraError::Context { context, source } => {
            assert_eq!(context, "while recovering");
            assert!(matches!(*source, TesseraError::InvalidFormat("bad record header")));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn fetch_errors_map_onto_failure_classes() {
    assert_eq!(
        FetchError::Transient("timeout".into()).class(),
        FailureClass::Retryable
    );
    assert_eq!(FetchError::NotFound("404".into()).class(), FailureClass::Permanent);
    assert_eq!(FetchError::Malformed("html".into()).class(), FailureClass::Permanent);
    assert_eq!(FetchError::Cancelled.class(), FailureClass::Permanent);
    assert_eq!(
        FetchError::Misconfigured("no url".into()).class(),
        FailureClass::Fatal
    );
}

#[test]
fn cancellation_is_found_through_wrappers() {
    assert!(TesseraError::Cancelled.is_cancellation());
    assert!(TesseraError::Fetch(FetchError::Cancelled).is_cancellation());
    assert!(
        TesseraError::Cancelled
            .with_context("map one")
            .is_cancellation()
    );
    let fatal = TesseraError::Fatal {
        coord: TileCoord::new(1, 0, 0),
        source: Box::new(TesseraError::Fetch(FetchError::Cancelled)),
    };
    assert!(fatal.is_cancellation());
    assert!(!TesseraError::Config("bad".into()).is_cancellation());
}

#[test]
fn messages_name_the_offending_values() {
    let too_many = TesseraError::TooManyTiles {
        requested: 120,
        limit: 100,
    };
    assert_eq!(
        too_many.to_string(),
        "atlas requires 120 online tiles, limit is 100"
    );

    let unsupported = TesseraError::UnsupportedSource {
        map: "city".into(),
        source_name: "local".into(),
    };
    assert!(unsupported.to_string().contains("\"local\""));

    let truncated = TesseraError::ArchiveTruncated { offset: 42 };
    assert!(truncated.to_string().contains("42"));
}
