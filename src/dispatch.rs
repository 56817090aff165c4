//! Per-adapter event dispatch.
//!
//! Every adapter owns one dispatch thread that consumes its controller's
//! event stream and invokes the registered listeners. This single consumer is
//! what provides the ordering contract: callbacks for one adapter are
//! strictly serialized in event arrival order, while adapters dispatch in
//! parallel to each other.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, trace};

use crate::adapter::AdapterInner;
use crate::hci::ControllerEvent;
use crate::listener::AdapterStatusListener;

/// Out-of-band messages to a dispatch thread.
pub(crate) enum InternalMsg {
    /// Deliver the synthetic initial `adapter_settings_changed` to one newly
    /// attached listener.
    InitialSettings(Arc<dyn AdapterStatusListener>),
    /// Drain pending controller events, then exit.
    Shutdown,
}

pub(crate) struct Dispatcher {
    pub(crate) tx: Sender<InternalMsg>,
    pub(crate) handle: JoinHandle<()>,
}

/// Spawns the dispatch thread for `adapter`.
pub(crate) fn spawn(
    adapter: Arc<AdapterInner>,
    events: Receiver<ControllerEvent>,
) -> Dispatcher {
    let (tx, internal) = crossbeam_channel::unbounded();
    let name = format!("btadapter-{}", adapter.dev_id());
    let handle = std::thread::Builder::new()
        .name(name)
        .spawn(move || run(adapter, events, internal))
        .expect("failed to spawn adapter dispatch thread");
    Dispatcher { tx, handle }
}

fn run(
    adapter: Arc<AdapterInner>,
    events: Receiver<ControllerEvent>,
    internal: Receiver<InternalMsg>,
) {
    debug!(dev_id = adapter.dev_id(), "dispatch thread up");
    loop {
        crossbeam_channel::select! {
            recv(events) -> event => match event {
                Ok(event) => {
                    trace!(dev_id = adapter.dev_id(), ?event, "dispatching");
                    adapter.handle_event(event);
                }
                // Controller dropped its sender; nothing further to deliver.
                Err(_) => break,
            },
            recv(internal) -> msg => match msg {
                Ok(InternalMsg::InitialSettings(listener)) => {
                    adapter.deliver_initial_settings(&listener);
                }
                Ok(InternalMsg::Shutdown) | Err(_) => {
                    // Pending device events precede shutdown completion.
                    for event in events.try_iter() {
                        adapter.handle_event(event);
                    }
                    break;
                }
            },
        }
    }
    debug!(dev_id = adapter.dev_id(), "dispatch thread down");
}
