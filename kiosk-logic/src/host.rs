//! Measurement host
//!
//! The measurement application a secondary or robot instance drives. The
//! orchestration layer only sequences these calls; what they do is up to
//! the host.

use std::collections::HashSet;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("No template open")]
    NoTemplate,

    #[error("Sensor not initialized")]
    SensorNotReady,

    #[error("{operation} rejected: {reason}")]
    Rejected { operation: String, reason: String },
}

pub trait MeasurementHost {
    fn open_template(&mut self, name: &str) -> Result<(), HostError>;
    fn close_template(&mut self) -> Result<(), HostError>;
    fn init_sensor(&mut self) -> Result<(), HostError>;
    fn deinit_sensor(&mut self) -> Result<(), HostError>;
    fn calibrate(&mut self) -> Result<(), HostError>;

    /// Run one measurement series, returning the name of the result
    fn measure(&mut self, series: &str) -> Result<String, HostError>;

    fn compute(&mut self) -> Result<(), HostError>;
    fn export(&mut self, target: &str) -> Result<(), HostError>;
    fn move_to(&mut self, position: &str) -> Result<(), HostError>;
    fn move_home(&mut self) -> Result<(), HostError>;

    /// Stop whatever is running; never fails
    fn abort(&mut self);
}

/// Host without hardware: tracks template/sensor state, logs every call and
/// can be told to reject selected operations.
#[derive(Debug, Default)]
pub struct SimulatedHost {
    template: Option<String>,
    sensor_ready: bool,
    measurements: u32,
    reject: HashSet<String>,
    /// Every successful call, in order
    pub calls: Vec<String>,
}

impl SimulatedHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `operation` fail from now on
    pub fn reject(mut self, operation: &str) -> Self {
        self.reject.insert(operation.to_string());
        self
    }

    pub fn template(&self) -> Option<&str> {
        self.template.as_deref()
    }

    pub fn sensor_ready(&self) -> bool {
        self.sensor_ready
    }

    fn enter(&mut self, operation: &str, detail: &str) -> Result<(), HostError> {
        if self.reject.contains(operation) {
            return Err(HostError::Rejected {
                operation: operation.to_string(),
                reason: "simulated failure".to_string(),
            });
        }
        info!(operation, detail, "Host call");
        self.calls.push(if detail.is_empty() {
            operation.to_string()
        } else {
            format!("{} {}", operation, detail)
        });
        Ok(())
    }

    fn require_template(&self) -> Result<(), HostError> {
        match self.template {
            Some(_) => Ok(()),
            None => Err(HostError::NoTemplate),
        }
    }
}

impl MeasurementHost for SimulatedHost {
    fn open_template(&mut self, name: &str) -> Result<(), HostError> {
        self.enter("open_template", name)?;
        self.template = Some(name.to_string());
        Ok(())
    }

    fn close_template(&mut self) -> Result<(), HostError> {
        self.require_template()?;
        self.enter("close_template", "")?;
        self.template = None;
        self.sensor_ready = false;
        Ok(())
    }

    fn init_sensor(&mut self) -> Result<(), HostError> {
        self.require_template()?;
        self.enter("init_sensor", "")?;
        self.sensor_ready = true;
        Ok(())
    }

    fn deinit_sensor(&mut self) -> Result<(), HostError> {
        self.enter("deinit_sensor", "")?;
        self.sensor_ready = false;
        Ok(())
    }

    fn calibrate(&mut self) -> Result<(), HostError> {
        if !self.sensor_ready {
            return Err(HostError::SensorNotReady);
        }
        self.enter("calibrate", "")
    }

    fn measure(&mut self, series: &str) -> Result<String, HostError> {
        self.require_template()?;
        self.enter("measure", series)?;
        self.measurements += 1;
        Ok(format!("{}_{:03}", series, self.measurements))
    }

    fn compute(&mut self) -> Result<(), HostError> {
        self.require_template()?;
        self.enter("compute", "")
    }

    fn export(&mut self, target: &str) -> Result<(), HostError> {
        self.require_template()?;
        self.enter("export", target)
    }

    fn move_to(&mut self, position: &str) -> Result<(), HostError> {
        self.enter("move_to", position)
    }

    fn move_home(&mut self) -> Result<(), HostError> {
        self.enter("move_home", "")
    }

    fn abort(&mut self) {
        info!("Host abort");
        self.calls.push("abort".to_string());
        self.sensor_ready = false;
    }
}
