//! Optional console capabilities and the JRPC2 probe.
//!
//! Every XBDM console supports debugging and notifications. Consoles
//! running the JRPC2 plugin additionally answer `consolefeatures` queries.
//! Probing for it is risky: a console without the plugin may answer in a
//! way that desynchronises the reply stream. The first time that happens
//! the probe is switched off for the rest of the process through the
//! [`ProbeRegistry`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use super::{BusyToken, Connection};
use crate::error::{ConnectionError, Result};
use crate::protocol::ResponseType;

/// Benign JRPC2 query (CPU temperature); a capable console answers with a
/// hex number on a `200` line.
const JRPC2_PROBE: &str = r#"consolefeatures ver=2 type=15 params="A\0\A\1\1\0\""#;

static GLOBAL_PROBES: LazyLock<Arc<ProbeRegistry>> =
    LazyLock::new(|| Arc::new(ProbeRegistry::new()));

/// Process-wide record of probes that proved unsafe.
///
/// Flags are set once and never cleared. Connections share
/// [`ProbeRegistry::global`] unless a registry is injected through
/// [`Connection::connect_with`].
#[derive(Debug, Default)]
pub struct ProbeRegistry {
    jrpc2_disabled: AtomicBool,
}

impl ProbeRegistry {
    /// A fresh registry with every probe enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry shared by default connections.
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL_PROBES)
    }

    /// Whether the JRPC2 probe has been switched off.
    pub fn is_jrpc2_disabled(&self) -> bool {
        self.jrpc2_disabled.load(Ordering::Acquire)
    }

    /// Switch the JRPC2 probe off permanently.
    pub fn disable_jrpc2(&self) {
        if !self.jrpc2_disabled.swap(true, Ordering::AcqRel) {
            log::warn!("[xbdm-probe] JRPC2 detection disabled for this process");
        }
    }
}

/// An optional feature a console may offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Freeze, resume, breakpoints and thread inspection.
    Debugging,
    /// Asynchronous notifications over a second connection.
    Notifications,
    /// The JRPC2 `consolefeatures` plugin.
    Jrpc2,
}

impl Capability {
    const ALL: [Self; 3] = [Self::Debugging, Self::Notifications, Self::Jrpc2];

    fn bit(self) -> u8 {
        match self {
            Self::Debugging => 1,
            Self::Notifications => 1 << 1,
            Self::Jrpc2 => 1 << 2,
        }
    }
}

/// Set of [`Capability`] values.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilitySet {
    bits: u8,
}

impl CapabilitySet {
    /// Capabilities every XBDM console has.
    pub fn baseline() -> Self {
        let mut set = Self::default();
        set.insert(Capability::Debugging);
        set.insert(Capability::Notifications);
        set
    }

    /// Add a capability.
    pub fn insert(&mut self, capability: Capability) {
        self.bits |= capability.bit();
    }

    /// Whether `capability` is present.
    pub fn contains(&self, capability: Capability) -> bool {
        self.bits & capability.bit() != 0
    }

    /// Present capabilities in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// JRPC2 temperature sensors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemperatureSensor {
    /// CPU die.
    Cpu = 0,
    /// GPU die.
    Gpu = 1,
    /// eDRAM.
    Edram = 2,
    /// Motherboard.
    Motherboard = 3,
}

impl BusyToken<'_> {
    /// Probe for optional capabilities and record the result on the
    /// connection.
    ///
    /// A reply that is not a single-line status corrupts the stream: the
    /// connection is closed, the probe is disabled process-wide and
    /// [`ConnectionError::ProbeCorrupted`] tells the user to reconnect.
    /// Once disabled, later calls fail with [`ConnectionError::ProbeDisabled`]
    /// without touching the wire.
    pub async fn detect_features(&self) -> Result<CapabilitySet> {
        if self.conn.probes().is_jrpc2_disabled() {
            return Err(ConnectionError::ProbeDisabled);
        }

        let response = self.send_command(JRPC2_PROBE).await?;
        if response.kind != ResponseType::SingleResponse {
            log::warn!(
                "[xbdm-probe] probe answered {} ({:?}); closing connection",
                response.kind,
                response.raw
            );
            self.conn.probes().disable_jrpc2();
            self.conn.close_for("JRPC2 probe corrupted the reply stream");
            return Err(ConnectionError::ProbeCorrupted);
        }

        let mut capabilities = CapabilitySet::baseline();
        if u32::from_str_radix(response.message.trim(), 16).is_ok() {
            capabilities.insert(Capability::Jrpc2);
        }
        log::debug!("[xbdm-probe] detected {capabilities:?}");
        self.conn.set_capabilities(capabilities);
        Ok(capabilities)
    }

    /// Temperature reported by a JRPC2 sensor.
    pub async fn temperature(&self, sensor: TemperatureSensor) -> Result<u32> {
        if !self.conn.capabilities().contains(Capability::Jrpc2) {
            return Err(ConnectionError::Unsupported(Capability::Jrpc2));
        }
        let command = format!(
            r#"consolefeatures ver=2 type=15 params="A\0\A\1\1\{}\""#,
            sensor as u8
        );
        let response = self
            .send_command_expect(&command, ResponseType::SingleResponse)
            .await?;
        u32::from_str_radix(response.message.trim(), 16)
            .map_err(|_bad| ConnectionError::MalformedResponse(response.raw))
    }
}

impl Connection {
    /// Probe for optional capabilities under one busy-token hold.
    pub async fn detect_features(&self) -> Result<CapabilitySet> {
        self.busy().await?.detect_features().await
    }
}
