//! Heterogeneous collections of devices, configured in parallel

use super::{
    AlignmentChipSet,
    Carrier,
    Device,
    HasDeviceAddress,
    HasLeasedConnection,
    TriggerProcessor,
    WriteReport,
};
use crate::{
    config::{
        ConfigTree,
        Settings,
    },
    core::Endianness,
    error::{
        Error,
        Result,
    },
    manager::ConnectionManager,
    protocol::RetryPolicy,
    transport::{
        Connector,
        DeviceStatus,
    },
};
use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    panic,
    thread,
};
use tracing::{
    error,
    info,
    warn,
};

/// Any of the supported device types, selected by the `Type` key of a configuration tree
#[derive(Debug)]
pub enum AnyDevice<'m, C: Connector> {
    TriggerProcessor(TriggerProcessor<'m, C>),
    Carrier(Carrier<'m, C>),
    AlignmentChipSet(AlignmentChipSet<'m, C>),
}

macro_rules! dispatch {
    ($self:ident, $dev:ident => $body:expr) => {
        match $self {
            AnyDevice::TriggerProcessor($dev) => $body,
            AnyDevice::Carrier($dev) => $body,
            AnyDevice::AlignmentChipSet($dev) => $body,
        }
    };
}

impl<'m, C: Connector> AnyDevice<'m, C> {
    /// # Errors
    /// Returns an error if `Type` is missing or unknown, or the device rejects its configuration
    pub fn from_config(
        manager: &'m ConnectionManager<C>,
        config: &ConfigTree,
        settings: &Settings,
    ) -> Result<Self> {
        let kind: String = config.get("Type")?;
        Ok(match kind.as_str() {
            "TriggerProcessor" => Self::TriggerProcessor(TriggerProcessor::new(manager, config, settings)?),
            "Carrier" => Self::Carrier(Carrier::new(manager, config, settings)?),
            "AlignmentChipSet" => Self::AlignmentChipSet(AlignmentChipSet::new(manager, config, settings)?),
            _ => return Err(Error::config("Type", format!("unknown device type {kind:?}"))),
        })
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TriggerProcessor(_) => "TriggerProcessor",
            Self::Carrier(_) => "Carrier",
            Self::AlignmentChipSet(_) => "AlignmentChipSet",
        }
    }
}

impl<C: Connector> HasDeviceAddress for AnyDevice<'_, C> {
    fn server_address(&self) -> &str {
        dispatch!(self, dev => dev.server_address())
    }

    fn device_address(&self) -> &str {
        dispatch!(self, dev => dev.device_address())
    }
}

impl<C: Connector> HasLeasedConnection for AnyDevice<'_, C> {
    type Connector = C;

    fn manager(&self) -> &ConnectionManager<C> {
        dispatch!(self, dev => dev.manager())
    }
}

impl<C: Connector> Device for AnyDevice<'_, C> {
    fn skip_set(&self) -> &BTreeSet<u32> {
        dispatch!(self, dev => dev.skip_set())
    }

    fn retry_policy(&self) -> &RetryPolicy {
        dispatch!(self, dev => dev.retry_policy())
    }

    fn bus(&self) -> &str {
        dispatch!(self, dev => dev.bus())
    }

    fn byte_order(&self) -> Endianness {
        dispatch!(self, dev => dev.byte_order())
    }

    fn write_configuration(&self) -> Result<WriteReport> {
        dispatch!(self, dev => dev.write_configuration())
    }

    fn read_configuration(&self) -> Result<BTreeMap<u32, u32>> {
        dispatch!(self, dev => dev.read_configuration())
    }
}

/// Outcome of configuring one device of a fleet
#[derive(Debug)]
pub struct DeviceOutcome {
    pub name: String,
    pub result: Result<WriteReport>,
}

impl DeviceOutcome {
    /// Whether the device was configured without any failed register
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.result.as_ref().is_ok_and(WriteReport::is_complete)
    }
}

#[derive(Debug, Default)]
pub struct FleetReport {
    pub outcomes: Vec<DeviceOutcome>,
}

impl FleetReport {
    /// Names of the devices that errored or left registers unwritten
    #[must_use]
    pub fn failed(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| o.name.as_str())
            .collect()
    }

    /// Share of devices that failed, zero for an empty fleet
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn fraction_failed(&self) -> f64 {
        if self.outcomes.is_empty() {
            0.0
        } else {
            self.failed().len() as f64 / self.outcomes.len() as f64
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(DeviceOutcome::succeeded)
    }
}

#[derive(Debug)]
pub struct DeviceFleet<'m, C: Connector> {
    devices: Vec<AnyDevice<'m, C>>,
}

impl<C: Connector> Default for DeviceFleet<'_, C> {
    fn default() -> Self {
        Self {
            devices: Vec::new(),
        }
    }
}

impl<'m, C: Connector> DeviceFleet<'m, C> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, device: AnyDevice<'m, C>) {
        self.devices.push(device);
    }

    /// Build one device per configuration tree
    /// # Errors
    /// Returns the first configuration error
    pub fn from_configs<'a, I>(
        manager: &'m ConnectionManager<C>,
        configs: I,
        settings: &Settings,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = &'a ConfigTree>,
    {
        let devices = configs
            .into_iter()
            .map(|config| AnyDevice::from_config(manager, config, settings))
            .collect::<Result<_>>()?;
        Ok(Self { devices })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AnyDevice<'m, C>> {
        self.devices.iter()
    }

    /// Write the configuration of every device, one thread per device. Failures are logged and
    /// reported, they never stop the other devices.
    pub fn configure(&self) -> FleetReport {
        info!(devices = self.devices.len(), "Configuring fleet");
        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .devices
                .iter()
                .map(|device| scope.spawn(move || device.write_configuration()))
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap_or_else(|payload| panic::resume_unwind(payload)))
                .collect()
        });
        let outcomes: Vec<_> = self
            .devices
            .iter()
            .zip(results)
            .map(|(device, result)| {
                let name = device.name();
                match &result {
                    Err(e) => error!(device = %name, kind = device.kind(), error = %e, "Configuration failed"),
                    Ok(report) if !report.is_complete() => warn!(
                        device = %name,
                        failed = report.failed.len(),
                        "Configuration incomplete"
                    ),
                    Ok(_) => {}
                }
                DeviceOutcome { name, result }
            })
            .collect();
        let report = FleetReport { outcomes };
        info!(
            failed = report.failed().len(),
            fraction_failed = report.fraction_failed(),
            "Fleet configured"
        );
        report
    }

    /// Reachability of every device
    #[must_use]
    pub fn probe(&self) -> Vec<(String, DeviceStatus)> {
        self.devices
            .iter()
            .map(|device| {
                let status = device
                    .manager()
                    .probe(device.server_address(), device.device_address());
                (device.name(), status)
            })
            .collect()
    }
}
