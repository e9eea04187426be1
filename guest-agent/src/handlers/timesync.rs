use chrono::Utc;
use guestlink_protocol::{Payload, SyncTimeRequest, TimeSyncResponse};
use tracing::info;

use super::{HandlerContext, HandlerResult};

/// Step the guest clock, either to the host-supplied instant or from
/// whatever time source the guest has.
pub async fn sync_time(ctx: &HandlerContext, req: SyncTimeRequest) -> HandlerResult {
    let before = Utc::now();
    let method = ctx.platform.set_clock(req.time).await?;
    let now = Utc::now();
    info!(
        method = %method,
        skew_ms = req.time.map(|t| (t - before).num_milliseconds()),
        "clock synchronized"
    );
    Ok(Payload::TimeSyncResult(TimeSyncResponse { method, time: now }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::test_support::context;

    #[tokio::test]
    async fn test_explicit_time_is_manual() {
        let (ctx, platform) = context();
        let req = SyncTimeRequest {
            time: Some(Utc::now()),
        };
        match sync_time(&ctx, req).await.unwrap() {
            Payload::TimeSyncResult(r) => assert_eq!(r.method, "manual"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(platform.calls(), vec!["clock true"]);
    }

    #[tokio::test]
    async fn test_source_sync_reports_method() {
        let (ctx, _) = context();
        match sync_time(&ctx, SyncTimeRequest::default()).await.unwrap() {
            Payload::TimeSyncResult(r) => assert_eq!(r.method, "chronyc"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
