//! ---
//! fleet_section: "02-messaging-ipc-data-model"
//! fleet_subsection: "module"
//! fleet_type: "source"
//! fleet_scope: "code"
//! fleet_description: "Module lifecycle and the public send/receive API."
//! fleet_version: "v0.0.0-prealpha"
//! fleet_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::Bus;
use crate::message::Message;
use crate::{MessagingError, Result};

/// A named participant on the bus.
///
/// `start` owns the module's receive loop and should return once
/// `ctx.shutdown` fires or its endpoint closes.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    /// Endpoint name; unique per manager.
    fn name(&self) -> &str;

    /// Disabled modules keep their name reserved but get no endpoint.
    fn enable(&self) -> bool {
        true
    }

    /// Run the module until shutdown.
    async fn start(&self, ctx: ModuleContext);

    /// Hook invoked by [`ModuleManager::shutdown`] after the shutdown signal fires.
    async fn stop(&self) {}
}

/// Handles a running module receives from its manager.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    /// Endpoint name of the module.
    pub name: String,
    /// Shared bus.
    pub bus: Bus,
    /// Fired when the manager shuts down.
    pub shutdown: CancellationToken,
}

impl ModuleContext {
    /// Next message for this module, or `None` once shutdown fires or the
    /// endpoint is closed.
    pub async fn next_message(&self) -> Option<Message> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            next = self.bus.receive(&self.name) => match next {
                Ok(msg) => Some(msg),
                Err(err) => {
                    debug!(module = %self.name, error = %err, "receive loop ending");
                    None
                }
            },
        }
    }
}

#[derive(Default)]
struct Registry {
    enabled: IndexMap<String, Arc<dyn Module>>,
    disabled: IndexMap<String, Arc<dyn Module>>,
    started: HashSet<String>,
}

/// Owns module registration and drives every enabled module's task.
pub struct ModuleManager {
    bus: Bus,
    registry: Mutex<Registry>,
    tasks: Mutex<Vec<(String, JoinHandle<()>)>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("ModuleManager")
            .field("enabled", &registry.enabled.keys().collect::<Vec<_>>())
            .field("disabled", &registry.disabled.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ModuleManager {
    /// Create a manager over `bus`.
    pub fn new(bus: Bus) -> Self {
        Self::with_shutdown(bus, CancellationToken::new())
    }

    /// Create a manager whose modules stop when `shutdown` fires.
    pub fn with_shutdown(bus: Bus, shutdown: CancellationToken) -> Self {
        Self {
            bus,
            registry: Mutex::new(Registry::default()),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// The shared bus.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Cancellation handle observed by every module.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register `module`, creating its endpoint when it is enabled.
    pub fn register(&self, module: Arc<dyn Module>) -> Result<()> {
        let name = module.name().to_owned();
        let enabled = module.enable();
        let mut registry = self.registry.lock();
        if registry.enabled.contains_key(&name) || registry.disabled.contains_key(&name) {
            return Err(MessagingError::AlreadyRegistered(name));
        }
        if enabled {
            self.bus.register(&name)?;
            registry.enabled.insert(name.clone(), module);
        } else {
            registry.disabled.insert(name.clone(), module);
        }
        info!(module = %name, enabled, "module registered");
        Ok(())
    }

    /// Reverse [`ModuleManager::register`]; closes the endpoint of an enabled module.
    pub fn unregister(&self, name: &str) -> Result<()> {
        let mut registry = self.registry.lock();
        if registry.enabled.shift_remove(name).is_some() {
            registry.started.remove(name);
            drop(registry);
            self.bus.unregister(name)?;
        } else if registry.disabled.shift_remove(name).is_none() {
            return Err(MessagingError::NotRegistered(name.to_owned()));
        }
        info!(module = %name, "module unregistered");
        Ok(())
    }

    /// Whether `name` is registered and enabled.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.registry.lock().enabled.contains_key(name)
    }

    /// Whether `name` is registered, enabled or not.
    pub fn contains(&self, name: &str) -> bool {
        let registry = self.registry.lock();
        registry.enabled.contains_key(name) || registry.disabled.contains_key(name)
    }

    /// Spawn one task per enabled module not yet started. Returns how many were launched.
    pub fn start(&self) -> usize {
        let to_start: Vec<Arc<dyn Module>> = {
            let mut registry = self.registry.lock();
            let names: Vec<String> = registry
                .enabled
                .keys()
                .filter(|name| !registry.started.contains(*name))
                .cloned()
                .collect();
            names
                .into_iter()
                .filter_map(|name| {
                    let module = registry.enabled.get(&name).cloned();
                    registry.started.insert(name);
                    module
                })
                .collect()
        };

        let mut tasks = self.tasks.lock();
        for module in &to_start {
            let name = module.name().to_owned();
            let ctx = ModuleContext {
                name: name.clone(),
                bus: self.bus.clone(),
                shutdown: self.shutdown.child_token(),
            };
            let module = module.clone();
            debug!(module = %name, "starting module");
            let handle = tokio::spawn(async move {
                module.start(ctx).await;
            });
            tasks.push((name, handle));
        }
        to_start.len()
    }

    /// Forward to [`Bus::send`].
    pub async fn send_message(&self, msg: Message) -> Result<()> {
        self.bus.send(msg).await
    }

    /// Forward to [`Bus::send_sync`].
    pub async fn send_sync_message(&self, msg: Message, timeout: Duration) -> Result<Message> {
        self.bus.send_sync(msg, timeout).await
    }

    /// Forward to [`Bus::receive`].
    pub async fn receive_message(&self, name: &str) -> Result<Message> {
        self.bus.receive(name).await
    }

    /// Fire the shutdown signal, run every module's `stop` hook, and wait up
    /// to `grace` for module tasks before aborting the rest.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown.cancel();

        let modules: Vec<Arc<dyn Module>> =
            self.registry.lock().enabled.values().cloned().collect();
        for module in modules {
            module.stop().await;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        let deadline = tokio::time::Instant::now() + grace;
        for (name, mut handle) in tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(module = %name, "module stopped"),
                Ok(Err(err)) if err.is_panic() => {
                    error!(module = %name, "module task panicked")
                }
                Ok(Err(_)) => debug!(module = %name, "module task cancelled"),
                Err(_) => {
                    warn!(module = %name, grace = ?grace, "module did not stop within grace period; aborting");
                    handle.abort();
                }
            }
        }
        info!("module manager stopped");
    }
}
