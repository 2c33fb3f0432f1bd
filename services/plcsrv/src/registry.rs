//! Connection registry
//!
//! [`ConnectionRegistry`] is the aggregate root of the service: it owns the
//! configured tags, one [`Channel`] per tag (plus ad hoc maintenance channels),
//! the active pollers and the active reconnect supervisors. Everything else
//! operates through it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn, Level};

use crate::channel::Channel;
use crate::config::PlcConfig;
use crate::error::{PlcError, Result};
use crate::hardware::PlcAccess;
use crate::health::{HealthLatch, HealthReporter, HEALTH_CAT_CHANNEL};
use crate::poller::{Poller, PollerParams, PollerStats};
use crate::reconnect::ReconnectSupervisor;
use crate::recovery::ErrorRecoveryCoordinator;
use crate::store::{connection_status_key, enabled_key, TagValue, ValueStore, OPEN_CHANNEL_NAMES};
use crate::tag::{item_name_of, tag_name_of, Tag};

/// Address used in simulation mode
pub const SIMULATOR_ADDRESS: &str = "vgis";

/// Prefix asking the controller interface for debug output
pub const DEBUG_MARKER: &str = "*";

/// Largest command id before wrapping back to 1
pub const MAX_COMMAND_ID: u32 = 10_000;

#[derive(Debug, Default)]
struct RegistryState {
    connected: bool,
    address: Option<String>,
    simulated: bool,
    tags: HashMap<String, Arc<Tag>>,
    status_tag: Option<String>,
}

// ============================================================================
// Snapshot types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub tag_name: String,
    pub connection: i32,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PollerSnapshot {
    pub tag_name: String,
    pub finished: bool,
    pub tag_read: bool,
    pub stats: PollerStats,
}

/// Point-in-time view of the registry for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub connected: bool,
    pub address: Option<String>,
    pub simulated: bool,
    pub status_tag: Option<String>,
    pub interlocked: bool,
    pub hardware_writes: bool,
    pub open_channels: Vec<String>,
    pub channels: Vec<ChannelSnapshot>,
    pub pollers: Vec<PollerSnapshot>,
    pub supervisors: Vec<String>,
}

// ============================================================================
// Registry
// ============================================================================

pub struct ConnectionRegistry {
    me: Weak<ConnectionRegistry>,
    config: PlcConfig,
    access: Arc<PlcAccess>,
    store: Arc<dyn ValueStore>,
    reporter: Arc<dyn HealthReporter>,
    health: Arc<HealthLatch>,
    state: RwLock<RegistryState>,
    channels: DashMap<String, Arc<Channel>>,
    pollers: DashMap<String, Arc<Poller>>,
    supervisors: DashMap<String, Arc<ReconnectSupervisor>>,
    command_id: AtomicU32,
    interlocked: AtomicBool,
    hardware_writes: AtomicBool,
    open_list: Mutex<()>,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("channels", &self.channels.len())
            .field("pollers", &self.pollers.len())
            .field("supervisors", &self.supervisors.len())
            .field("interlocked", &self.is_interlocked())
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    pub fn new(
        config: PlcConfig,
        access: Arc<PlcAccess>,
        store: Arc<dyn ValueStore>,
        reporter: Arc<dyn HealthReporter>,
    ) -> Arc<Self> {
        let health = Arc::new(HealthLatch::new(HEALTH_CAT_CHANNEL, reporter.clone()));
        let hardware_writes = config.connection.hardware_writes;
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            access,
            store,
            reporter,
            health,
            state: RwLock::new(RegistryState::default()),
            channels: DashMap::new(),
            pollers: DashMap::new(),
            supervisors: DashMap::new(),
            command_id: AtomicU32::new(0),
            interlocked: AtomicBool::new(false),
            hardware_writes: AtomicBool::new(hardware_writes),
            open_list: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &PlcConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ValueStore> {
        &self.store
    }

    pub fn reporter(&self) -> &Arc<dyn HealthReporter> {
        &self.reporter
    }

    pub fn access(&self) -> &Arc<PlcAccess> {
        &self.access
    }

    /// Coordinator bound to this registry
    pub fn recovery(&self) -> ErrorRecoveryCoordinator {
        ErrorRecoveryCoordinator::new(self.me.clone())
    }

    // ------------------------------------------------------------------------
    // Connect / disconnect
    // ------------------------------------------------------------------------

    /// Set up tags and channels for the controller at `addresses[0]`
    pub async fn connect(&self, addresses: &[&str]) -> Result<()> {
        if addresses.len() != 1 {
            return Err(PlcError::invalid_argument(format!(
                "connect expects exactly one address, got {}",
                addresses.len()
            )));
        }
        if self.state.read().connected {
            return Err(PlcError::invalid_state(
                "already connected, disconnect first",
            ));
        }

        let simulated = self.config.connection.simulated;
        let base = if simulated {
            SIMULATOR_ADDRESS.to_string()
        } else {
            format!("cip {}", addresses[0])
        };
        let debug_marker = self.config.connection.plcio_debug
            || tracing::enabled!(target: "plcio", Level::DEBUG);
        let address = if debug_marker {
            format!("{}{}", DEBUG_MARKER, base)
        } else {
            base
        };

        if self.config.tag_list.is_empty() {
            return Err(PlcError::config("tag_list is missing or empty"));
        }

        let mut tags: Vec<Arc<Tag>> = Vec::with_capacity(self.config.tag_list.len());
        for name in &self.config.tag_list {
            if tags.iter().any(|t| t.name() == name) {
                warn!("Tag {} listed twice, ignoring repeat", name);
                continue;
            }
            match self.config.tag(name) {
                Some(meta) => tags.push(Arc::new(Tag::from_config(name, meta)?)),
                None => warn!("Tag {} has no metadata, skipping", name),
            }
        }

        self.interlocked.store(false, Ordering::SeqCst);
        self.command_id.store(0, Ordering::SeqCst);

        let suffix = self.config.connection.status_tag_suffix.as_str();
        let mut status_tag: Option<String> = None;
        let mut tag_map = HashMap::with_capacity(tags.len());
        for tag in tags {
            let name = tag.name().to_string();
            self.channels.insert(
                name.clone(),
                Arc::new(Channel::new(name.clone(), self.access.clone(), self.health.clone())),
            );
            self.store
                .set(&connection_status_key(&name), TagValue::Bool(false));
            if let Some(enabled) = tag.enabled() {
                self.store.set(&enabled_key(&name), TagValue::Bool(enabled));
            }
            if !suffix.is_empty() && name.ends_with(suffix) {
                match &status_tag {
                    None => status_tag = Some(name.clone()),
                    Some(first) => warn!(
                        "Tag {} also matches status suffix '{}', keeping {}",
                        name, suffix, first
                    ),
                }
            }
            tag_map.insert(name, tag);
        }

        if status_tag.is_none() {
            warn!("No tag ends with '{}', hardware status will not be read", suffix);
        }

        info!(
            "Connected to '{}'{}: {} tags, status tag {}",
            address,
            if simulated { " (simulated)" } else { "" },
            tag_map.len(),
            status_tag.as_deref().unwrap_or("-")
        );

        let mut state = self.state.write();
        state.connected = true;
        state.address = Some(address);
        state.simulated = simulated;
        state.tags = tag_map;
        state.status_tag = status_tag;
        Ok(())
    }

    /// Close every channel and return to the pre-connect state
    ///
    /// A failing close does not stop the others; the first failure is returned
    /// once everything is cleared.
    pub async fn disconnect(&self) -> Result<()> {
        let names: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        let mut first_err: Option<PlcError> = None;

        for name in names {
            if let Err(e) = self.release_channel(&name).await {
                warn!("Disconnect: closing {} failed: {}", name, e);
                first_err.get_or_insert(e);
            }
        }

        // Anything left over was not bound to a channel
        let pollers: Vec<Arc<Poller>> = self.pollers.iter().map(|e| e.value().clone()).collect();
        self.pollers.clear();
        join_all(pollers.iter().map(|p| p.stop())).await;
        let supervisors: Vec<Arc<ReconnectSupervisor>> =
            self.supervisors.iter().map(|e| e.value().clone()).collect();
        self.supervisors.clear();
        join_all(supervisors.iter().map(|s| s.stop())).await;

        self.channels.clear();
        {
            let _guard = self.open_list.lock();
            self.store.remove(OPEN_CHANNEL_NAMES);
        }
        *self.state.write() = RegistryState::default();
        self.command_id.store(0, Ordering::SeqCst);
        self.interlocked.store(false, Ordering::SeqCst);
        info!("Disconnected");

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn release_channel(&self, name: &str) -> Result<()> {
        let Some(channel) = self.channels.get(name).map(|e| e.value().clone()) else {
            return Ok(());
        };

        if channel.is_connected() {
            if let Some((_, poller)) = self.pollers.remove(name) {
                poller.stop().await;
            }
            let result = channel.close().await;
            self.update_connection_status(name, false);
            result
        } else {
            if let Some((_, supervisor)) = self.supervisors.remove(name) {
                supervisor.stop().await;
            }
            Ok(())
        }
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    fn require_connected(&self) -> Result<()> {
        if self.state.read().connected {
            Ok(())
        } else {
            Err(PlcError::invalid_state("not connected"))
        }
    }

    /// Resolved controller address, available after connect
    pub fn controller_address(&self) -> Result<String> {
        self.state
            .read()
            .address
            .clone()
            .ok_or_else(|| PlcError::invalid_state("not connected"))
    }

    pub fn tag(&self, name: &str) -> Option<Arc<Tag>> {
        self.state.read().tags.get(name).cloned()
    }

    /// Configured tag names in configuration order
    pub fn tag_names(&self) -> Vec<String> {
        let state = self.state.read();
        let mut names: Vec<String> = Vec::with_capacity(state.tags.len());
        for name in &self.config.tag_list {
            if state.tags.contains_key(name) && !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    pub fn channel(&self, name: &str) -> Result<Arc<Channel>> {
        self.channels
            .get(name)
            .map(|e| e.value().clone())
            .ok_or_else(|| PlcError::unknown_tag(name))
    }

    pub fn poller(&self, name: &str) -> Option<Arc<Poller>> {
        self.pollers.get(name).map(|e| e.value().clone())
    }

    pub fn supervisor(&self, name: &str) -> Option<Arc<ReconnectSupervisor>> {
        self.supervisors.get(name).map(|e| e.value().clone())
    }

    pub fn status_tag_name(&self) -> Option<String> {
        self.state.read().status_tag.clone()
    }

    pub fn is_simulated(&self) -> bool {
        self.state.read().simulated
    }

    pub fn is_valid_tag_name(&self, tag: &str) -> bool {
        self.state.read().tags.contains_key(tag)
    }

    pub fn is_valid_tag_item(&self, tag: &str, item: &str) -> bool {
        self.tag(tag).is_some_and(|t| t.has_item(item))
    }

    pub fn is_read_tag(&self, tag: &str) -> bool {
        self.tag(tag).is_some_and(|t| t.is_read())
    }

    pub fn is_write_tag(&self, tag: &str) -> bool {
        self.tag(tag).is_some_and(|t| t.is_write())
    }

    // ------------------------------------------------------------------------
    // Transient reads and writes
    // ------------------------------------------------------------------------

    /// Open `channel` unless already open; true if this call opened it
    async fn open_transient(&self, channel: &Channel) -> Result<bool> {
        if channel.is_connected() {
            info!("{} already open, reusing it", channel);
            return Ok(false);
        }
        let address = self.controller_address()?;
        channel.open(&address).await?;
        self.update_connection_status(channel.tag_name(), true);
        Ok(true)
    }

    /// Close a transiently opened channel, keeping the operation's error first
    async fn finish_transient(
        &self,
        channel: &Channel,
        opened: bool,
        result: Result<()>,
    ) -> Result<()> {
        if !opened {
            return result;
        }
        let closed = channel.close().await;
        self.update_connection_status(channel.tag_name(), false);
        match (result, closed) {
            (Err(e), Err(close_err)) => {
                warn!(
                    "Closing {} after a failed call also failed: {}",
                    channel.tag_name(),
                    close_err
                );
                Err(e)
            },
            (Err(e), Ok(())) => Err(e),
            (Ok(()), closed) => closed,
        }
    }

    async fn read_one(&self, tag: &Tag) -> Result<()> {
        let channel = self.channel(tag.name())?;
        let opened = self.open_transient(&channel).await?;
        let result = channel.read(tag).await;
        if result.is_ok() {
            tag.publish(self.store.as_ref());
        }
        self.finish_transient(&channel, opened, result).await
    }

    /// Read the tags referenced by `attributes` and return the referenced values
    ///
    /// An attribute is `<tag>:<item>`, or a bare tag name for all of its items.
    /// Each tag is read once, in first-reference order.
    pub async fn read_tag(&self, attributes: &[&str]) -> Result<Vec<(String, TagValue)>> {
        self.require_connected()?;

        let mut order: Vec<Arc<Tag>> = Vec::new();
        for attr in attributes {
            let tag = self
                .tag(tag_name_of(attr))
                .ok_or_else(|| PlcError::unknown_tag(attr))?;
            if let Some(item) = item_name_of(attr) {
                if !tag.has_item(item) {
                    return Err(PlcError::unknown_tag(attr));
                }
            }
            if !order.iter().any(|t| t.name() == tag.name()) {
                order.push(tag);
            }
        }

        for tag in &order {
            self.read_one(tag).await?;
        }

        let mut values = Vec::new();
        for attr in attributes {
            let Some(tag) = order.iter().find(|t| t.name() == tag_name_of(attr)) else {
                continue;
            };
            match item_name_of(attr) {
                Some(item) => {
                    if let Some(value) = tag.value(item) {
                        values.push((attr.to_string(), value));
                    }
                },
                None => values.extend(tag.values()),
            }
        }
        Ok(values)
    }

    /// Write item values of a single tag
    ///
    /// Items the caller omits that have a configured default get that default;
    /// the rest keep their stored value. Values go to the store first, then
    /// the tag is refreshed from the store and, if hardware writes are on,
    /// sent to the controller.
    pub async fn write_tag(&self, values: &[(String, TagValue)]) -> Result<()> {
        self.require_connected()?;

        let Some((first, _)) = values.first() else {
            return Err(PlcError::invalid_argument("write_tag without any values"));
        };
        let tag_name = tag_name_of(first);
        if let Some((other, _)) = values.iter().find(|(a, _)| tag_name_of(a) != tag_name) {
            return Err(PlcError::invalid_argument(format!(
                "write_tag values span more than one tag ('{}' and '{}')",
                tag_name,
                tag_name_of(other)
            )));
        }
        let tag = self
            .tag(tag_name)
            .ok_or_else(|| PlcError::unknown_tag(tag_name))?;

        let mut commit: Vec<(String, TagValue)> = Vec::with_capacity(tag.items().len());
        for (attr, value) in values {
            let item = item_name_of(attr)
                .and_then(|name| tag.item(name))
                .ok_or_else(|| PlcError::unknown_tag(attr))?;
            commit.push((tag.attribute_name(item.name()), item.check_value(value)?));
        }
        for item in tag.items() {
            let attr = tag.attribute_name(item.name());
            if commit.iter().any(|(a, _)| *a == attr) {
                continue;
            }
            if let Some(default) = item.default_value() {
                debug!("write_tag {}: default {} = {}", tag_name, attr, default);
                commit.push((attr, default.clone()));
            }
        }

        self.store.set_all(&commit);
        tag.refresh_from_store(self.store.as_ref())?;

        let channel = self.channel(tag_name)?;
        let opened = self.open_transient(&channel).await?;
        let result = if self.hardware_writes() {
            channel.write(&tag).await
        } else {
            debug!("Hardware writes disabled, {} not sent", tag_name);
            Ok(())
        };
        self.finish_transient(&channel, opened, result).await
    }

    pub fn hardware_writes(&self) -> bool {
        self.hardware_writes.load(Ordering::SeqCst)
    }

    /// Turn the final hardware write of `write_tag` on or off
    pub fn set_hardware_writes(&self, enabled: bool) {
        let was = self.hardware_writes.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!("Hardware writes {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    // ------------------------------------------------------------------------
    // Maintenance channels
    // ------------------------------------------------------------------------

    /// Open the channel called `name`, creating an ad hoc one if it is not a tag
    pub async fn open_plc_connection(&self, name: &str) -> Result<()> {
        let address = self.controller_address()?;
        let configured = self.is_valid_tag_name(name);

        let (channel, created) = match self.channels.entry(name.to_string()) {
            Entry::Occupied(e) => (e.get().clone(), false),
            Entry::Vacant(e) => {
                let channel = Arc::new(Channel::new(name, self.access.clone(), self.health.clone()));
                e.insert(channel.clone());
                (channel, true)
            },
        };

        if channel.is_connected() {
            info!("{} already open, nothing to do", channel);
            return Ok(());
        }

        if let Err(e) = channel.open(&address).await {
            if created && !configured {
                self.channels.remove(name);
            }
            return Err(e);
        }
        self.update_connection_status(name, true);
        info!("Opened {}", channel);
        Ok(())
    }

    /// Close the channel called `name`; ad hoc channels are also forgotten
    pub async fn close_plc_connection(&self, name: &str) -> Result<()> {
        let configured = self.is_valid_tag_name(name);
        let Some(channel) = self.channels.get(name).map(|e| e.value().clone()) else {
            warn!(
                "No channel named {} to close, open channels: [{}]",
                name,
                self.open_channel_names_string()
            );
            return Ok(());
        };

        if !channel.is_connected() {
            warn!(
                "Channel {} is not open, open channels: [{}]",
                name,
                self.open_channel_names_string()
            );
            if !configured {
                self.channels.remove(name);
            }
            return Ok(());
        }

        let result = channel.close().await;
        self.update_connection_status(name, false);
        if !configured {
            self.channels.remove(name);
        }
        info!("Closed channel {}", name);
        result
    }

    // ------------------------------------------------------------------------
    // Connection status
    // ------------------------------------------------------------------------

    /// Record a channel opening or closing in the store
    ///
    /// Maintains the open-channel list `name (connectionNumber)` and, for
    /// configured tags, the tag's connection status flag.
    pub fn update_connection_status(&self, name: &str, connected: bool) {
        let _guard = self.open_list.lock();

        if self.is_valid_tag_name(name) {
            self.store
                .set(&connection_status_key(name), TagValue::Bool(connected));
        }

        let prefix = format!("{} (", name);
        let mut list: Vec<String> = self
            .store
            .get(OPEN_CHANNEL_NAMES)
            .and_then(|v| v.as_list().map(<[String]>::to_vec))
            .unwrap_or_default();
        list.retain(|entry| !entry.starts_with(&prefix));

        if connected {
            let number = self
                .channels
                .get(name)
                .map_or(-1, |c| c.value().connection_number());
            list.push(format!("{} ({})", name, number));
        }

        if list.is_empty() {
            self.store.remove(OPEN_CHANNEL_NAMES);
        } else {
            self.store.set(OPEN_CHANNEL_NAMES, TagValue::TextList(list));
        }
        debug!("Connection status {} -> {}", name, connected);
    }

    pub fn open_channel_names(&self) -> Vec<String> {
        self.store
            .get(OPEN_CHANNEL_NAMES)
            .and_then(|v| v.as_list().map(<[String]>::to_vec))
            .unwrap_or_default()
    }

    pub fn open_channel_names_string(&self) -> String {
        self.open_channel_names().join(",")
    }

    /// True while at least one channel is open
    pub fn is_connected(&self) -> bool {
        !self.open_channel_names().is_empty()
    }

    // ------------------------------------------------------------------------
    // Readers
    // ------------------------------------------------------------------------

    /// Start reading the status tag in the background
    pub fn start_plc_tag_readers(&self) -> Result<()> {
        match self.status_tag_name() {
            Some(status) => self.start_tag_reader(&status),
            None => {
                warn!("No status tag configured, hardware status cannot be read");
                Ok(())
            },
        }
    }

    /// Launch a reconnect supervisor for `tag_name` that starts its poller
    pub fn start_tag_reader(&self, tag_name: &str) -> Result<()> {
        if self.pollers.contains_key(tag_name) {
            warn!("Poller already running for {}, not starting another", tag_name);
            return Ok(());
        }
        let registry = self
            .me
            .upgrade()
            .ok_or_else(|| PlcError::invalid_state("registry is shutting down"))?;
        let tag = self
            .tag(tag_name)
            .ok_or_else(|| PlcError::unknown_tag(tag_name))?;
        let channel = self.channel(tag_name)?;

        let supervisor = match self.supervisors.entry(tag_name.to_string()) {
            Entry::Occupied(_) => {
                warn!(
                    "Reconnect supervisor already running for {}, not starting another",
                    tag_name
                );
                return Ok(());
            },
            Entry::Vacant(e) => {
                let supervisor = ReconnectSupervisor::new(&tag);
                e.insert(supervisor.clone());
                supervisor
            },
        };
        supervisor.start(registry, channel, tag);
        Ok(())
    }

    /// Stop and forget every poller
    pub async fn stop_plc_tag_readers(&self) {
        let names: Vec<String> = self.pollers.iter().map(|e| e.key().clone()).collect();
        let pollers: Vec<Arc<Poller>> = names
            .iter()
            .filter_map(|name| self.pollers.remove(name).map(|(_, p)| p))
            .collect();
        let outcomes = join_all(pollers.iter().map(|p| p.stop())).await;
        for (poller, outcome) in pollers.iter().zip(outcomes) {
            debug!(
                "Stopped poller for {} (confirmed: {})",
                poller.tag_name(),
                outcome.is_confirmed()
            );
        }
    }

    /// Last read result of the status tag poller, false without one
    pub fn is_tag_read_status(&self) -> bool {
        self.status_tag_name()
            .and_then(|name| self.poller(&name))
            .is_some_and(|p| p.is_tag_read())
    }

    /// Parameters for a poller on `tag`, wired to this registry's recovery
    pub(crate) fn poller_params(&self, tag: Arc<Tag>, channel: Arc<Channel>) -> PollerParams {
        let coordinator = self.recovery();
        let tag_name = tag.name().to_string();
        PollerParams {
            channel,
            interval: tag.interval(),
            tag,
            store: self.store.clone(),
            reporter: self.reporter.clone(),
            on_error: Arc::new(move |err: PlcError| {
                coordinator.interrupt(&tag_name, err);
            }),
            on_read: None,
        }
    }

    pub(crate) fn register_poller(&self, poller: Arc<Poller>) {
        if let Some(old) = self.pollers.insert(poller.tag_name().to_string(), poller) {
            warn!("Replacing poller for {}", old.tag_name());
            tokio::spawn(async move {
                old.stop().await;
            });
        }
    }

    pub(crate) fn remove_poller(&self, name: &str) -> Option<Arc<Poller>> {
        self.pollers.remove(name).map(|(_, p)| p)
    }

    /// Drop the supervisor entry for `name` if it is still supervisor `id`
    pub(crate) fn deregister_supervisor(&self, name: &str, id: u64) {
        self.supervisors.remove_if(name, |_, s| s.id() == id);
    }

    // ------------------------------------------------------------------------
    // Interlock and command ids
    // ------------------------------------------------------------------------

    pub fn interlock_raised(&self) {
        self.interlocked.store(true, Ordering::SeqCst);
        info!("Interlock raised");
    }

    pub fn interlock_lowered(&self) {
        self.interlocked.store(false, Ordering::SeqCst);
        info!("Interlock lowered");
    }

    pub fn is_interlocked(&self) -> bool {
        self.interlocked.load(Ordering::SeqCst)
    }

    /// Next command id: 1, 2, ..., 10000, then 1 again
    pub fn next_command_id(&self) -> u32 {
        let step = |id: u32| if id >= MAX_COMMAND_ID { 1 } else { id + 1 };
        let prev = self
            .command_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |id| Some(step(id)))
            .unwrap_or_else(|id| id);
        step(prev)
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let (connected, address, simulated, status_tag) = {
            let state = self.state.read();
            (
                state.connected,
                state.address.clone(),
                state.simulated,
                state.status_tag.clone(),
            )
        };

        let mut channels: Vec<ChannelSnapshot> = self
            .channels
            .iter()
            .map(|e| ChannelSnapshot {
                tag_name: e.key().clone(),
                connection: e.value().connection_number(),
                address: e.value().address(),
            })
            .collect();
        channels.sort_by(|a, b| a.tag_name.cmp(&b.tag_name));

        let mut pollers: Vec<PollerSnapshot> = self
            .pollers
            .iter()
            .map(|e| PollerSnapshot {
                tag_name: e.key().clone(),
                finished: e.value().is_finished(),
                tag_read: e.value().is_tag_read(),
                stats: e.value().stats(),
            })
            .collect();
        pollers.sort_by(|a, b| a.tag_name.cmp(&b.tag_name));

        let mut supervisors: Vec<String> =
            self.supervisors.iter().map(|e| e.key().clone()).collect();
        supervisors.sort();

        RegistrySnapshot {
            connected,
            address,
            simulated,
            status_tag,
            interlocked: self.is_interlocked(),
            hardware_writes: self.hardware_writes(),
            open_channels: self.open_channel_names(),
            channels,
            pollers,
            supervisors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ItemConfig, TagConfig};
    use crate::hardware::SimulatedPlc;
    use crate::health::TracingHealthReporter;
    use crate::store::MemoryStore;
    use tracing_test::traced_test;

    fn registry(tag_names: &[&str], suffix: &str) -> Arc<ConnectionRegistry> {
        let mut config = PlcConfig::default();
        config.connection.simulated = true;
        config.connection.status_tag_suffix = suffix.to_string();
        for name in tag_names {
            config.tag_list.push(name.to_string());
            config.tags.insert(
                name.to_string(),
                TagConfig {
                    byte_length: 2,
                    items: vec![ItemConfig {
                        name: "word".to_string(),
                        kind: "int".to_string(),
                        byte: 0,
                        bit: 0,
                        default: None,
                    }],
                    ..TagConfig::default()
                },
            );
        }
        ConnectionRegistry::new(
            config,
            Arc::new(PlcAccess::new(SimulatedPlc::new())),
            Arc::new(MemoryStore::new()),
            Arc::new(TracingHealthReporter::new()),
        )
    }

    #[tokio::test]
    #[traced_test]
    async fn test_first_status_match_wins() {
        let registry = registry(&["A_CStatus", "B", "C_CStatus"], "CStatus");
        registry.connect(&["10.0.0.1"]).await.unwrap();

        assert_eq!(registry.status_tag_name().as_deref(), Some("A_CStatus"));
        assert!(logs_contain("Tag C_CStatus also matches status suffix"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_missing_status_tag_is_tolerated() {
        let registry = registry(&["A", "B"], "CStatus");
        registry.connect(&["10.0.0.1"]).await.unwrap();

        assert_eq!(registry.status_tag_name(), None);
        assert!(logs_contain("No tag ends with 'CStatus'"));

        registry.start_plc_tag_readers().unwrap();
        assert!(registry.supervisor("A").is_none());
        assert!(!registry.is_tag_read_status());
    }

    #[tokio::test]
    async fn test_unlisted_metadata_and_repeats_are_skipped() {
        let registry = registry(&["A", "A"], "CStatus");
        registry.connect(&["10.0.0.1"]).await.unwrap();
        assert_eq!(registry.tag_names(), vec!["A"]);

        let mut config = registry.config().clone();
        config.tag_list.push("ghost".to_string());
        let registry = ConnectionRegistry::new(
            config,
            Arc::new(PlcAccess::new(SimulatedPlc::new())),
            Arc::new(MemoryStore::new()),
            Arc::new(TracingHealthReporter::new()),
        );
        registry.connect(&["10.0.0.1"]).await.unwrap();
        assert!(!registry.is_valid_tag_name("ghost"));
        assert!(registry.channel("ghost").is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_close_of_closed_channel_lists_open_ones() {
        let registry = registry(&["A", "B"], "CStatus");
        registry.connect(&["10.0.0.1"]).await.unwrap();
        registry.open_plc_connection("A").await.unwrap();

        registry.close_plc_connection("B").await.unwrap();
        assert!(logs_contain("Channel B is not open, open channels: [A (1)]"));
    }

    #[tokio::test]
    async fn test_debug_marker_prefixes_address() {
        let mut config = registry(&["A"], "CStatus").config().clone();
        config.connection.plcio_debug = true;
        let registry = ConnectionRegistry::new(
            config,
            Arc::new(PlcAccess::new(SimulatedPlc::new())),
            Arc::new(MemoryStore::new()),
            Arc::new(TracingHealthReporter::new()),
        );
        registry.connect(&["10.0.0.1"]).await.unwrap();
        assert_eq!(registry.controller_address().unwrap(), "*vgis");
    }

    #[tokio::test]
    async fn test_hardware_address_uses_cip_prefix() {
        let mut config = registry(&["A"], "CStatus").config().clone();
        config.connection.simulated = false;
        let registry = ConnectionRegistry::new(
            config,
            Arc::new(PlcAccess::new(SimulatedPlc::new())),
            Arc::new(MemoryStore::new()),
            Arc::new(TracingHealthReporter::new()),
        );
        registry.connect(&["10.0.0.1"]).await.unwrap();
        assert_eq!(registry.controller_address().unwrap(), "cip 10.0.0.1");
        assert!(!registry.is_simulated());
    }

    #[tokio::test]
    async fn test_snapshot_serializes() {
        let registry = registry(&["A"], "CStatus");
        registry.connect(&["10.0.0.1"]).await.unwrap();
        registry.open_plc_connection("A").await.unwrap();

        let json = serde_json::to_value(registry.snapshot()).unwrap();
        assert_eq!(json["connected"], true);
        assert_eq!(json["open_channels"][0], "A (1)");
        assert_eq!(json["channels"][0]["connection"], 1);
    }
}
