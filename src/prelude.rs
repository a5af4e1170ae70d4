//! Prelude (helpful reexports) for this package

pub use crate::{
    alignment::{
        AlignmentOutcome,
        ChannelScan,
        DeskewSolution,
        ResetAlignment,
    },
    config::{
        AlignmentSettings,
        ConfigTree,
        ManagerSettings,
        Settings,
    },
    devices::{
        AlignmentChipSet,
        AnyDevice,
        Carrier,
        Device,
        DeviceFleet,
        FleetReport,
        HasDeviceAddress,
        HasLeasedConnection,
        TriggerProcessor,
        WriteReport,
    },
    error::{
        Error,
        Result,
    },
    manager::{
        ConnectionManager,
        Lease,
    },
    protocol::RetryPolicy,
    telemetry::init_logging,
    transport::{
        Connector,
        DeviceStatus,
        Transport,
    },
};
