//! GATT command/telemetry service.
//!
//! [`CommandChannel`] sits between the radio stack's event context and the
//! control loop. The event context calls [`CommandChannel::handle_event`],
//! which only appends to the command queue and adds/removes connection
//! handles. The loop only reads the connection set, through
//! [`TelemetrySink::publish`].

use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};
use critical_section::Mutex;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::{
    decode_command, AdvertisingPayload, ProtocolError, Uuid128, MAX_COMMAND_SIZE,
};
use crate::queue::CommandSender;
use crate::telemetry::{NotifyReport, TelemetrySample, TelemetrySink};

pub type ConnHandle = u16;
pub type AttrHandle = u16;

pub const MAX_CONNECTIONS: usize = 4;
pub const MAX_CHARACTERISTICS: usize = 4;

pub const DEFAULT_DEVICE_NAME: &str = "ESP32-Carrinho";
pub const DEFAULT_ADV_INTERVAL_US: u32 = 500_000;

// Nordic UART service layout: RX (write) and TX (notify).
pub const DEFAULT_SERVICE_UUID: Uuid128 = Uuid128::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e_24dc_ca9e);
pub const DEFAULT_COMMAND_UUID: Uuid128 = Uuid128::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e_24dc_ca9e);
pub const DEFAULT_TELEMETRY_UUID: Uuid128 = Uuid128::from_u128(0x6e40_0003_b5a3_f393_e0a9_e50e_24dc_ca9e);

pub type ServiceHandles = Vec<AttrHandle, MAX_CHARACTERISTICS>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CharacteristicProps {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicDef {
    pub uuid: Uuid128,
    pub props: CharacteristicProps,
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceDef<'a> {
    pub uuid: Uuid128,
    pub characteristics: &'a [CharacteristicDef],
}

#[derive(Debug, Clone, Copy)]
pub struct Advertisement<'a> {
    pub interval_us: u32,
    pub adv_data: &'a [u8],
    pub scan_response: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RadioError {
    #[error("connection {0} is not active")]
    NotConnected(ConnHandle),
    #[error("unknown attribute handle {0}")]
    UnknownHandle(AttrHandle),
    #[error("request rejected by the radio stack")]
    Rejected,
    #[error("buffer too small for attribute value")]
    BufferTooSmall,
}

/// GATT server and GAP peripheral operations of a BLE stack.
///
/// All methods take `&self`: the stack handle is shared between the radio
/// event context and the control loop.
pub trait BleRadio {
    /// Registers one service and returns its characteristic value handles in
    /// declaration order.
    ///
    /// # Errors
    ///
    /// [`RadioError::Rejected`] if the stack refuses the attribute table.
    fn register_service(&self, service: &ServiceDef<'_>) -> Result<ServiceHandles, RadioError>;
    /// Copies the local value of `handle` into `buf` and returns its length.
    ///
    /// # Errors
    ///
    /// [`RadioError::UnknownHandle`] or [`RadioError::BufferTooSmall`].
    fn gatts_read(&self, handle: AttrHandle, buf: &mut [u8]) -> Result<usize, RadioError>;
    /// # Errors
    ///
    /// [`RadioError::UnknownHandle`] if `handle` was never registered.
    fn gatts_write(&self, handle: AttrHandle, value: &[u8]) -> Result<(), RadioError>;
    /// Notifies `conn` with the current local value of `handle`.
    ///
    /// # Errors
    ///
    /// [`RadioError::NotConnected`] for a dead link, [`RadioError::Rejected`]
    /// when the peer cannot take the notification now.
    fn gatts_notify(&self, conn: ConnHandle, handle: AttrHandle) -> Result<(), RadioError>;
    /// `None` stops advertising.
    ///
    /// # Errors
    ///
    /// The stack's error if the advertising state could not be changed.
    fn gap_advertise(&self, advertisement: Option<&Advertisement<'_>>) -> Result<(), RadioError>;
}

impl<R: BleRadio + ?Sized> BleRadio for &R {
    fn register_service(&self, service: &ServiceDef<'_>) -> Result<ServiceHandles, RadioError> {
        (**self).register_service(service)
    }

    fn gatts_read(&self, handle: AttrHandle, buf: &mut [u8]) -> Result<usize, RadioError> {
        (**self).gatts_read(handle, buf)
    }

    fn gatts_write(&self, handle: AttrHandle, value: &[u8]) -> Result<(), RadioError> {
        (**self).gatts_write(handle, value)
    }

    fn gatts_notify(&self, conn: ConnHandle, handle: AttrHandle) -> Result<(), RadioError> {
        (**self).gatts_notify(conn, handle)
    }

    fn gap_advertise(&self, advertisement: Option<&Advertisement<'_>>) -> Result<(), RadioError> {
        (**self).gap_advertise(advertisement)
    }
}

impl<R: BleRadio + ?Sized> BleRadio for Arc<R> {
    fn register_service(&self, service: &ServiceDef<'_>) -> Result<ServiceHandles, RadioError> {
        (**self).register_service(service)
    }

    fn gatts_read(&self, handle: AttrHandle, buf: &mut [u8]) -> Result<usize, RadioError> {
        (**self).gatts_read(handle, buf)
    }

    fn gatts_write(&self, handle: AttrHandle, value: &[u8]) -> Result<(), RadioError> {
        (**self).gatts_write(handle, value)
    }

    fn gatts_notify(&self, conn: ConnHandle, handle: AttrHandle) -> Result<(), RadioError> {
        (**self).gatts_notify(conn, handle)
    }

    fn gap_advertise(&self, advertisement: Option<&Advertisement<'_>>) -> Result<(), RadioError> {
        (**self).gap_advertise(advertisement)
    }
}

/// Events raised by the radio stack, delivered in the callback context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioEvent {
    CentralConnect { conn: ConnHandle },
    CentralDisconnect { conn: ConnHandle },
    GattsWrite { conn: ConnHandle, value_handle: AttrHandle },
}

/// Active peer handles.
///
/// A handle leaves the set only through [`ConnectionSet::remove`], which the
/// channel calls on a disconnect event. Failed notifications never evict.
pub struct ConnectionSet {
    inner: Mutex<RefCell<Vec<ConnHandle, MAX_CONNECTIONS>>>,
}

impl ConnectionSet {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Vec::new())),
        }
    }

    fn with_critical_section<T>(&self, f: impl FnOnce(&mut Vec<ConnHandle, MAX_CONNECTIONS>) -> T) -> T {
        critical_section::with(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }

    /// Returns `false` when the set is already full. Re-inserting a present handle is a no-op.
    pub fn insert(&self, conn: ConnHandle) -> bool {
        self.with_critical_section(|set| set.contains(&conn) || set.push(conn).is_ok())
    }

    pub fn remove(&self, conn: ConnHandle) -> bool {
        self.with_critical_section(|set| match set.iter().position(|c| *c == conn) {
            Some(index) => {
                set.swap_remove(index);
                true
            }
            None => false,
        })
    }

    #[must_use]
    pub fn contains(&self, conn: ConnHandle) -> bool {
        self.with_critical_section(|set| set.contains(&conn))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.with_critical_section(|set| set.len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the current handles, so callers can notify outside the critical section.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ConnHandle, MAX_CONNECTIONS> {
        self.with_critical_section(|set| set.clone())
    }
}

impl Default for ConnectionSet {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSettings {
    pub name: String,
    pub service: Uuid128,
    pub command: Uuid128,
    pub telemetry: Uuid128,
    pub advertise_interval_us: u32,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_DEVICE_NAME.to_string(),
            service: DEFAULT_SERVICE_UUID,
            command: DEFAULT_COMMAND_UUID,
            telemetry: DEFAULT_TELEMETRY_UUID,
            advertise_interval_us: DEFAULT_ADV_INTERVAL_US,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("service registration failed: {0}")]
    Registration(RadioError),
    #[error("radio returned {0} handles, expected 2")]
    MissingHandles(usize),
    #[error("advertising failed: {0}")]
    Advertising(RadioError),
    #[error(transparent)]
    Payload(#[from] ProtocolError),
}

#[derive(Debug, Default)]
struct ChannelCounters {
    commands_queued: AtomicU32,
    commands_dropped: AtomicU32,
    decode_failures: AtomicU32,
    connects: AtomicU32,
    disconnects: AtomicU32,
    notifications_delivered: AtomicU32,
    notifications_failed: AtomicU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelStats {
    pub commands_queued: u32,
    pub commands_dropped: u32,
    pub decode_failures: u32,
    pub connects: u32,
    pub disconnects: u32,
    pub notifications_delivered: u32,
    pub notifications_failed: u32,
}

pub struct CommandChannel<'q, R: BleRadio> {
    radio: R,
    command_handle: AttrHandle,
    telemetry_handle: AttrHandle,
    connections: ConnectionSet,
    sender: Mutex<RefCell<CommandSender<'q>>>,
    payload: AdvertisingPayload,
    advertise_interval_us: u32,
    counters: ChannelCounters,
}

impl<'q, R: BleRadio> CommandChannel<'q, R> {
    /// Registers the service, builds the advertising payload and starts advertising.
    ///
    /// # Errors
    ///
    /// Any failure here means the radio is not usable: an invalid device name,
    /// a rejected registration or a failed advertising start.
    pub fn start(radio: R, settings: &ChannelSettings, sender: CommandSender<'q>) -> Result<Self, ChannelError> {
        let payload = AdvertisingPayload::build(&settings.name, settings.service)?;

        let characteristics = [
            CharacteristicDef {
                uuid: settings.command,
                props: CharacteristicProps {
                    write: true,
                    ..CharacteristicProps::default()
                },
            },
            CharacteristicDef {
                uuid: settings.telemetry,
                props: CharacteristicProps {
                    read: true,
                    notify: true,
                    ..CharacteristicProps::default()
                },
            },
        ];
        let handles = radio
            .register_service(&ServiceDef {
                uuid: settings.service,
                characteristics: &characteristics,
            })
            .map_err(ChannelError::Registration)?;
        let (command_handle, telemetry_handle) = match handles.as_slice() {
            [command, telemetry, ..] => (*command, *telemetry),
            other => return Err(ChannelError::MissingHandles(other.len())),
        };

        let channel = Self {
            radio,
            command_handle,
            telemetry_handle,
            connections: ConnectionSet::new(),
            sender: Mutex::new(RefCell::new(sender)),
            payload,
            advertise_interval_us: settings.advertise_interval_us,
            counters: ChannelCounters::default(),
        };
        channel.advertise().map_err(ChannelError::Advertising)?;

        info!(
            name = %settings.name,
            service = %settings.service,
            command_handle,
            telemetry_handle,
            "command channel advertising"
        );
        Ok(channel)
    }

    /// Radio event callback. Never fails; problems are logged and counted.
    pub fn handle_event(&self, event: RadioEvent) {
        match event {
            RadioEvent::CentralConnect { conn } => {
                if !self.connections.insert(conn) {
                    warn!(conn, "connection table full, peer not tracked");
                }
                self.counters.connects.fetch_add(1, Ordering::Relaxed);
                info!(conn, "central connected");
                if let Err(e) = self.radio.gap_advertise(None) {
                    warn!(error = %e, "failed to stop advertising");
                }
            }
            RadioEvent::CentralDisconnect { conn } => {
                self.connections.remove(conn);
                self.counters.disconnects.fetch_add(1, Ordering::Relaxed);
                info!(conn, "central disconnected");
                if let Err(e) = self.advertise() {
                    warn!(error = %e, "failed to resume advertising");
                }
            }
            RadioEvent::GattsWrite { conn, value_handle } => {
                if value_handle == self.command_handle {
                    self.on_command_write(conn);
                } else {
                    debug!(conn, value_handle, "ignoring write to non-command attribute");
                }
            }
        }
    }

    fn on_command_write(&self, conn: ConnHandle) {
        let mut buf = [0u8; MAX_COMMAND_SIZE];
        let len = match self.radio.gatts_read(self.command_handle, &mut buf) {
            Ok(len) => len,
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(conn, error = %e, "failed to read command value");
                return;
            }
        };

        let token = match decode_command(&buf[..len]) {
            Ok(token) => token,
            Err(e) => {
                self.counters.decode_failures.fetch_add(1, Ordering::Relaxed);
                warn!(conn, error = %e, "dropping undecodable command");
                return;
            }
        };

        let pushed = critical_section::with(|cs| self.sender.borrow_ref_mut(cs).push(token));
        match pushed {
            Ok(()) => {
                self.counters.commands_queued.fetch_add(1, Ordering::Relaxed);
                debug!(conn, command = %token, "command queued");
            }
            Err(e) => {
                self.counters.commands_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(conn, command = %token, error = %e, "dropping command");
            }
        }
    }

    /// Stops advertising. Existing connections are left to the radio stack.
    ///
    /// # Errors
    ///
    /// Returns the radio's error if advertising could not be stopped.
    pub fn stop(&self) -> Result<(), RadioError> {
        self.radio.gap_advertise(None)?;
        info!("command channel stopped");
        Ok(())
    }

    fn advertise(&self) -> Result<(), RadioError> {
        self.radio.gap_advertise(Some(&Advertisement {
            interval_us: self.advertise_interval_us,
            adv_data: self.payload.adv_data(),
            scan_response: self.payload.scan_response(),
        }))
    }

    #[must_use]
    pub fn command_handle(&self) -> AttrHandle {
        self.command_handle
    }

    #[must_use]
    pub fn telemetry_handle(&self) -> AttrHandle {
        self.telemetry_handle
    }

    #[must_use]
    pub fn connections(&self) -> &ConnectionSet {
        &self.connections
    }

    #[must_use]
    pub fn payload(&self) -> &AdvertisingPayload {
        &self.payload
    }

    #[must_use]
    pub fn radio(&self) -> &R {
        &self.radio
    }

    #[must_use]
    pub fn stats(&self) -> ChannelStats {
        let c = &self.counters;
        ChannelStats {
            commands_queued: c.commands_queued.load(Ordering::Relaxed),
            commands_dropped: c.commands_dropped.load(Ordering::Relaxed),
            decode_failures: c.decode_failures.load(Ordering::Relaxed),
            connects: c.connects.load(Ordering::Relaxed),
            disconnects: c.disconnects.load(Ordering::Relaxed),
            notifications_delivered: c.notifications_delivered.load(Ordering::Relaxed),
            notifications_failed: c.notifications_failed.load(Ordering::Relaxed),
        }
    }
}

impl<R: BleRadio> TelemetrySink for CommandChannel<'_, R> {
    /// Updates the telemetry value and notifies every tracked peer independently.
    fn publish(&self, sample: &TelemetrySample) -> NotifyReport {
        let encoded = sample.encode();
        let mut report = NotifyReport::default();

        if let Err(e) = self.radio.gatts_write(self.telemetry_handle, encoded.as_bytes()) {
            warn!(error = %e, "failed to update telemetry value");
            return report;
        }

        for conn in self.connections.snapshot() {
            match self.radio.gatts_notify(conn, self.telemetry_handle) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    debug!(conn, error = %e, "notify failed");
                }
            }
        }

        self.counters
            .notifications_delivered
            .fetch_add(u32::from(report.delivered), Ordering::Relaxed);
        self.counters
            .notifications_failed
            .fetch_add(u32::from(report.failed), Ordering::Relaxed);
        report
    }
}
