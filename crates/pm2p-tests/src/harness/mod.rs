pub mod node;

use anyhow::{Result, bail};
use pm2p_node::observer::NodeEvent;
use std::time::Duration;
use tokio::sync::broadcast;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize tracing for tests (only once per process).
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("pm2p=debug,pm2p_store=debug,pm2p_node=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Receive events until one satisfies `pred`, or time out.
pub async fn wait_for_event(
    events: &mut broadcast::Receiver<NodeEvent>,
    timeout: Duration,
    pred: impl Fn(&NodeEvent) -> bool,
) -> Result<NodeEvent> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(event)) => event,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => bail!("node event stream closed"),
            Err(_) => bail!("timed out waiting for node event"),
        };
        if pred(&event) {
            return Ok(event);
        }
    }
}

/// True for an activity line equal to `line` from `origin`.
pub fn is_activity(event: &NodeEvent, line: &str, origin: Option<&str>) -> bool {
    matches!(
        event,
        NodeEvent::Activity { line: l, origin: o } if l == line && o.as_deref() == origin
    )
}
