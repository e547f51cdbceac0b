//! Helpers shared by unit tests.

use crate::model::{CheckResult, ErrType, KeptResult, Stream, StreamType};

use axum::Router;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::net::SocketAddr;
use std::time::Duration;

/// Serve `router` on an ephemeral localhost port.
pub async fn serve(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// A localhost address nobody listens on.
pub async fn closed_addr() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn stream(uri: &str, stream_type: StreamType) -> Stream {
    Stream::new(uri, stream_type, "test", "Test", "group")
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// History record `minutes` after [`base_time`].
pub fn kept(stream: &Stream, tid: i64, minutes: i64, err: ErrType) -> KeptResult {
    let mut check = CheckResult::new(&stream.uri, base_time() + ChronoDuration::minutes(minutes));
    check.err_type = err;
    check.elapsed = Duration::from_secs(1);
    KeptResult::from_check(stream, tid, &check)
}
