use crate::observer::Observer;
use pm2p::protocol::{MIN_PROTOCOL_VERSION, Request, Response};
use pm2p::time::now_secs;
use pm2p_store::MessageStore;
use std::sync::Arc;
use std::time::Duration;

/// Per-node knobs every session shares.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Peers acking below this version are refused.
    pub min_version: u32,
    /// Give up on a connection after this long without a line. `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            min_version: MIN_PROTOCOL_VERSION,
            idle_timeout: None,
        }
    }
}

/// Shared node state accessible by all sessions.
pub struct NodeState {
    pub store: MessageStore,
    pub observer: Arc<dyn Observer>,
    pub settings: SessionSettings,
}

impl NodeState {
    pub fn new(
        store: MessageStore,
        observer: Arc<dyn Observer>,
        settings: SessionSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            observer,
            settings,
        })
    }
}

/// Answer a validated request. `filter` is the joined `SHOW?` payload, if
/// any. `QUIT!` has no response.
pub fn handle_request(state: &NodeState, req: &Request, filter: Option<&str>) -> Option<Response> {
    let resp = match req {
        Request::Help => Response::Help,
        Request::Time => Response::Now(now_secs()),
        Request::Load { hash } => match state.store.get(hash) {
            Some(msg) => Response::Success(Box::new(msg)),
            None => Response::NotFound,
        },
        Request::Show { since, .. } => Response::entries(state.store.filter_since(*since, filter)),
        Request::Quit => return None,
    };
    Some(resp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::EventObserver;
    use pm2p::message::{Headers, Message};

    fn make_test_state() -> Arc<NodeState> {
        NodeState::new(
            MessageStore::in_memory(),
            Arc::new(EventObserver::default()),
            SessionSettings::default(),
        )
    }

    fn stored(state: &NodeState, created: u64, body: &str) -> Message {
        let msg = Message::new(
            created,
            Headers::from_sender("@a").topic("#t"),
            vec![body.to_string()],
        )
        .unwrap();
        state.store.append(msg.clone()).unwrap();
        msg
    }

    #[test]
    fn time_is_current() {
        let state = make_test_state();
        let Some(Response::Now(secs)) = handle_request(&state, &Request::Time, None) else {
            panic!("expected NOW");
        };
        assert!(secs.abs_diff(now_secs()) <= 2);
    }

    #[test]
    fn load_found_and_missing() {
        let state = make_test_state();
        let msg = stored(&state, 1000, "hi");
        let req = Request::Load {
            hash: msg.hash().to_string(),
        };
        assert_eq!(
            handle_request(&state, &req, None),
            Some(Response::Success(Box::new(msg)))
        );
        let req = Request::Load {
            hash: "0".repeat(64),
        };
        assert_eq!(handle_request(&state, &req, None), Some(Response::NotFound));
    }

    #[test]
    fn show_lists_in_store_order() {
        let state = make_test_state();
        let show = |since| Request::Show { since, headers: 0 };
        assert_eq!(
            handle_request(&state, &show(0), None),
            Some(Response::NoEntries)
        );

        let a = stored(&state, 1000, "hi");
        let b = stored(&state, 500, "older but later");
        assert_eq!(
            handle_request(&state, &show(0), None),
            Some(Response::Entries(vec![
                a.hash().to_string(),
                b.hash().to_string()
            ]))
        );
        assert_eq!(
            handle_request(&state, &show(999), None),
            Some(Response::Entries(vec![a.hash().to_string()]))
        );
        assert_eq!(
            handle_request(&state, &show(1001), None),
            Some(Response::NoEntries)
        );
    }

    #[test]
    fn show_applies_content_filter() {
        let state = make_test_state();
        stored(&state, 10, "apples");
        let pears = stored(&state, 10, "pears");
        let req = Request::Show {
            since: 0,
            headers: 1,
        };
        assert_eq!(
            handle_request(&state, &req, Some("pear")),
            Some(Response::Entries(vec![pears.hash().to_string()]))
        );
    }

    #[test]
    fn help_and_quit() {
        let state = make_test_state();
        assert_eq!(
            handle_request(&state, &Request::Help, None),
            Some(Response::Help)
        );
        assert_eq!(handle_request(&state, &Request::Quit, None), None);
    }
}
