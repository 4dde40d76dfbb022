use std::sync::Arc;
use tracing::debug;
use wayline_stream::StreamConn;

/// Copies `from → to` until EOF, then signals FIN on `to` and releases
/// `from`'s read half. Used for both directions of a relay so each side
/// finishes independently.
async fn pump(from: Arc<dyn StreamConn>, to: Arc<dyn StreamConn>) -> wayline_stream::Result<()> {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let mut written = 0;
        while written < n {
            written += to.write(&buf[written..n]).await?;
        }
    }
    let close_write = to.close_write().await;
    let close_read = from.close_read().await;
    close_write.and(close_read)
}

/// Bidirectionally relays `a` and `b` (spec §4.5): `a→b` and `b→a` run
/// concurrently, each independently half-closing its destination/source
/// on completion so a peer that finished writing can still read a
/// trailing response. Both connections are fully closed once both
/// directions finish; errors from either direction are joined.
pub async fn bidirectional_relay(a: Arc<dyn StreamConn>, b: Arc<dyn StreamConn>) {
    let (a_to_b, b_to_a) = tokio::join!(pump(a.clone(), b.clone()), pump(b.clone(), a.clone()));

    if let Err(err) = &a_to_b {
        debug!(error = %err, "relay: a->b direction ended with an error");
    }
    if let Err(err) = &b_to_a {
        debug!(error = %err, "relay: b->a direction ended with an error");
    }

    let _ = a.close().await;
    let _ = b.close().await;
}
