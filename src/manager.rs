//! The global entry point: tracks the adapter set and fans out hot-plug
//! events.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::Sender;
use tracing::{debug, info};

use crate::adapter::Adapter;
use crate::hci::{HciHost, HotplugEvent};
use crate::listener::ListenerList;
use crate::util::shielded;
use crate::BtMode;

/// Observer of the adapter set of one [`Manager`].
///
/// On attachment, `adapter_added` is replayed immediately for every adapter
/// the manager already knows, so callers need not distinguish initial from
/// runtime additions.
pub trait ChangedAdapterSetListener: Send + Sync {
    /// An adapter appeared (or was already present at attachment time).
    fn adapter_added(&self, adapter: &Adapter);

    /// An adapter disappeared. Fired strictly after any pending device
    /// events of that adapter.
    fn adapter_removed(&self, adapter: &Adapter);
}

struct ManagerInner {
    host: Arc<dyn HciHost>,
    adapters: Mutex<Vec<Adapter>>,
    listeners: ListenerList<dyn ChangedAdapterSetListener>,
    default_bt_mode: Mutex<BtMode>,
    watcher: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

/// The stack's entry point, owning the set of [`Adapter`]s of one
/// [`HciHost`].
///
/// Cloning is cheap and clones refer to the same manager.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Creates a manager: discovers the host's current controllers and
    /// starts watching for hot-plug events.
    pub fn new(host: Arc<dyn HciHost>) -> Manager {
        Manager::with_mode(host, BtMode::Le)
    }

    /// [`Manager::new`] with an explicit default Bluetooth mode for newly
    /// created adapters.
    pub fn with_mode(host: Arc<dyn HciHost>, default_bt_mode: BtMode) -> Manager {
        let adapters = host
            .controllers()
            .into_iter()
            .map(|controller| Adapter::with_mode(controller, default_bt_mode))
            .collect::<Vec<_>>();
        info!(count = adapters.len(), "manager discovered adapters");

        let inner = Arc::new(ManagerInner {
            host: host.clone(),
            adapters: Mutex::new(adapters),
            listeners: ListenerList::new(),
            default_bt_mode: Mutex::new(default_bt_mode),
            watcher: Mutex::new(None),
        });

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let hotplug = host.hotplug_events();
        let watcher_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name("btmanager".into())
            .spawn(move || loop {
                crossbeam_channel::select! {
                    recv(hotplug) -> event => match event {
                        Ok(event) => watcher_inner.handle_hotplug(event),
                        Err(_) => break,
                    },
                    recv(stop_rx) -> _ => break,
                }
            })
            .expect("failed to spawn manager watcher thread");
        *inner.watcher.lock().unwrap() = Some((stop_tx, handle));

        Manager { inner }
    }

    /// The current ordered adapter list.
    pub fn adapters(&self) -> Vec<Adapter> {
        self.inner.adapters.lock().unwrap().clone()
    }

    /// Looks up an adapter by controller index.
    pub fn adapter(&self, dev_id: u16) -> Option<Adapter> {
        self.inner
            .adapters
            .lock()
            .unwrap()
            .iter()
            .find(|a| a.dev_id() == dev_id)
            .cloned()
    }

    /// The default Bluetooth mode applied to subsequently added adapters.
    pub fn default_bt_mode(&self) -> BtMode {
        *self.inner.default_bt_mode.lock().unwrap()
    }

    /// Changes the default Bluetooth mode for subsequently added adapters.
    pub fn set_default_bt_mode(&self, bt_mode: BtMode) {
        *self.inner.default_bt_mode.lock().unwrap() = bt_mode;
    }

    /// Attaches a set listener; identity based, `false` if this instance is
    /// already attached. `adapter_added` is replayed for every currently
    /// known adapter before this method returns.
    pub fn add_changed_adapter_set_listener(
        &self,
        listener: Arc<dyn ChangedAdapterSetListener>,
    ) -> bool {
        if !self.inner.listeners.add(listener.clone()) {
            return false;
        }
        for adapter in self.adapters() {
            shielded("adapter_added", || listener.adapter_added(&adapter));
        }
        true
    }

    /// Detaches a set listener.
    pub fn remove_changed_adapter_set_listener(
        &self,
        listener: &Arc<dyn ChangedAdapterSetListener>,
    ) -> bool {
        self.inner.listeners.remove(listener)
    }

    /// Number of attached set listeners.
    pub fn set_listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Shuts down: closes every adapter and stops the hot-plug watcher.
    pub fn close(&self) {
        let watcher = self.inner.watcher.lock().unwrap().take();
        if let Some((stop_tx, handle)) = watcher {
            let _ = stop_tx.send(());
            let _ = handle.join();
        }
        let adapters = std::mem::take(&mut *self.inner.adapters.lock().unwrap());
        for adapter in adapters {
            adapter.close();
        }
        debug!("manager closed");
    }
}

impl ManagerInner {
    fn handle_hotplug(&self, event: HotplugEvent) {
        match event {
            HotplugEvent::Added(controller) => {
                let dev_id = controller.dev_id();
                {
                    let adapters = self.adapters.lock().unwrap();
                    if adapters.iter().any(|a| a.dev_id() == dev_id) {
                        return;
                    }
                }
                let adapter =
                    Adapter::with_mode(controller, *self.default_bt_mode.lock().unwrap());
                info!(%adapter, "adapter added");
                self.adapters.lock().unwrap().push(adapter.clone());
                for listener in self.listeners.snapshot() {
                    shielded("adapter_added", || listener.adapter_added(&adapter));
                }
            }
            HotplugEvent::Removed(dev_id) => {
                let adapter = {
                    let mut adapters = self.adapters.lock().unwrap();
                    match adapters.iter().position(|a| a.dev_id() == dev_id) {
                        Some(idx) => Some(adapters.remove(idx)),
                        None => None,
                    }
                };
                let Some(adapter) = adapter else { return };
                info!(%adapter, "adapter removed");
                // Draining close: pending device events complete first.
                adapter.close();
                for listener in self.listeners.snapshot() {
                    shielded("adapter_removed", || listener.adapter_removed(&adapter));
                }
            }
        }
    }
}
