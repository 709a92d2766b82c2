//! ECU identity and firmware file naming.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The ECUs of the vehicle network, monitor node included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EcuId {
    /// Monitoring and diagnostics node (mesh root).
    Monitor,
    /// Acceleration control node.
    AccelerationControl,
    /// Steering control node.
    SteeringControl,
    /// Motor control node.
    MotorControl,
    /// Brake control node.
    BrakeControl,
}

impl EcuId {
    /// All ECUs, in the canonical configuration order.
    pub const ALL: [EcuId; 5] = [
        EcuId::Monitor,
        EcuId::AccelerationControl,
        EcuId::SteeringControl,
        EcuId::MotorControl,
        EcuId::BrakeControl,
    ];

    /// Canonical node identifier, as used on the mesh and in filenames.
    pub fn as_str(&self) -> &'static str {
        match self {
            EcuId::Monitor => "monitor_ecu",
            EcuId::AccelerationControl => "acceleration_control_ecu",
            EcuId::SteeringControl => "steering_control_ecu",
            EcuId::MotorControl => "motor_control_ecu",
            EcuId::BrakeControl => "brake_control_ecu",
        }
    }

    /// Parse a canonical node identifier.
    pub fn parse(id: &str) -> Result<Self, ConfigError> {
        match id {
            "monitor_ecu" => Ok(EcuId::Monitor),
            "acceleration_control_ecu" => Ok(EcuId::AccelerationControl),
            "steering_control_ecu" => Ok(EcuId::SteeringControl),
            "motor_control_ecu" => Ok(EcuId::MotorControl),
            "brake_control_ecu" => Ok(EcuId::BrakeControl),
            other => Err(ConfigError::UnknownEcu(other.to_string())),
        }
    }

    /// Canonical on-SD firmware filename for a given version.
    pub fn firmware_filename(&self, version: u32) -> String {
        format!("firmware_{}_v{}.bin", self.as_str(), version)
    }

    /// Default update topic for this ECU.
    pub fn default_topic(&self) -> String {
        format!("canmesh/firmware/update/{}", self.as_str())
    }
}

impl std::fmt::Display for EcuId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips_every_ecu() {
        for ecu in EcuId::ALL {
            assert_eq!(EcuId::parse(ecu.as_str()).unwrap(), ecu);
        }
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!(EcuId::parse("body_control_ecu").is_err());
    }

    #[test]
    fn firmware_filename_is_canonical() {
        assert_eq!(
            EcuId::Monitor.firmware_filename(2),
            "firmware_monitor_ecu_v2.bin"
        );
        assert_eq!(
            EcuId::BrakeControl.firmware_filename(17),
            "firmware_brake_control_ecu_v17.bin"
        );
    }
}
