//! Model-specific behaviour layered on a ready channel
//!
//! A [`MachineInstance`] is created when a channel reports `Ready` and
//! dropped on close. It owns no transport; every call goes through the
//! channel it is handed.

use crate::channel::Channel;
use crate::sacp::messages::CrosshairOffset;
use crate::text::gcode;
use async_trait::async_trait;
use fablink_core::{MachineModel, Result};
use parking_lot::Mutex;

/// Startup and teardown hooks for one machine model
#[async_trait]
pub trait MachineInstance: Send + Sync {
    /// Model this instance was created for
    fn model(&self) -> MachineModel;

    /// Run once after the channel became ready
    async fn on_startup(&self, channel: &dyn Channel) -> Result<()>;

    /// Run before the channel closes
    async fn on_close(&self, _channel: &dyn Channel) -> Result<()> {
        Ok(())
    }
}

/// Pick the instance for `model`
pub fn create_machine_instance(model: MachineModel) -> Box<dyn MachineInstance> {
    match model {
        MachineModel::Artisan | MachineModel::J1 => Box::new(DualExtruderMachine { model }),
        MachineModel::Ray => Box::new(LaserMachine::new(model)),
        _ => Box::new(SingleToolMachine { model }),
    }
}

/// A-series and unidentified machines
#[derive(Debug)]
pub struct SingleToolMachine {
    model: MachineModel,
}

#[async_trait]
impl MachineInstance for SingleToolMachine {
    fn model(&self) -> MachineModel {
        self.model
    }

    async fn on_startup(&self, _channel: &dyn Channel) -> Result<()> {
        Ok(())
    }
}

/// Two-nozzle printers
///
/// Startup selects extruder 0 so host and firmware agree on the active
/// nozzle.
#[derive(Debug)]
pub struct DualExtruderMachine {
    model: MachineModel,
}

#[async_trait]
impl MachineInstance for DualExtruderMachine {
    fn model(&self) -> MachineModel {
        self.model
    }

    async fn on_startup(&self, channel: &dyn Channel) -> Result<()> {
        if let Some(printer) = channel.printer() {
            return printer.switch_extruder(0).await;
        }
        if let Some(gcode_channel) = channel.gcode() {
            gcode_channel
                .execute_gcode(&gcode::switch_extruder(0))
                .await?;
        }
        Ok(())
    }
}

/// Laser machines; startup reads the head calibration
#[derive(Debug)]
pub struct LaserMachine {
    model: MachineModel,
    crosshair_offset: Mutex<Option<CrosshairOffset>>,
    fire_sensor_sensitivity: Mutex<Option<u16>>,
}

impl LaserMachine {
    fn new(model: MachineModel) -> Self {
        Self {
            model,
            crosshair_offset: Mutex::new(None),
            fire_sensor_sensitivity: Mutex::new(None),
        }
    }

    /// Crosshair offset read at startup
    pub fn crosshair_offset(&self) -> Option<CrosshairOffset> {
        *self.crosshair_offset.lock()
    }

    /// Fire sensor sensitivity read at startup
    pub fn fire_sensor_sensitivity(&self) -> Option<u16> {
        *self.fire_sensor_sensitivity.lock()
    }
}

#[async_trait]
impl MachineInstance for LaserMachine {
    fn model(&self) -> MachineModel {
        self.model
    }

    async fn on_startup(&self, channel: &dyn Channel) -> Result<()> {
        let Some(laser) = channel.laser() else {
            tracing::debug!("{} without laser capability, skipping calibration read", self.model);
            return Ok(());
        };
        let offset = laser.get_crosshair_offset().await?;
        let sensitivity = laser.get_fire_sensor_sensitivity().await?;
        tracing::info!(
            "Laser calibration: crosshair ({}, {}), fire sensor {}",
            offset.x,
            offset.y,
            sensitivity
        );
        *self.crosshair_offset.lock() = Some(offset);
        *self.fire_sensor_sensitivity.lock() = Some(sensitivity);
        Ok(())
    }
}
