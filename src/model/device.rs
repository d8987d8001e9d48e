use serde::{Serialize, Deserialize};
use tracing::debug;

/// Where tensors of a run live. All tensors of one step share a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Cuda,
    Mps,
    Cpu,
}

impl Device {
    /// Preference order used by [`Device::select`].
    pub const PRIORITY: [Device; 3] = [Device::Cuda, Device::Mps, Device::Cpu];

    /// Whether this build can execute on the device. The matrix core runs on
    /// the host only.
    pub fn is_available(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    /// First device in [`Device::PRIORITY`] accepted by `available`; falls
    /// back to `Cpu` silently.
    pub fn select_with<F>(available: F) -> Device
    where
        F: Fn(Device) -> bool,
    {
        for device in Device::PRIORITY {
            if available(device) {
                return device;
            }
            debug!(?device, "device unavailable, trying next");
        }
        Device::Cpu
    }

    pub fn select() -> Device {
        Device::select_with(|d| d.is_available())
    }

    /// Mixed-precision gradient scaling is only worth it on CUDA.
    pub fn wants_grad_scaling(&self) -> bool {
        matches!(self, Device::Cuda)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_through_priority_list() {
        assert_eq!(Device::select_with(|d| d == Device::Mps), Device::Mps);
        assert_eq!(Device::select_with(|_| false), Device::Cpu);
        assert_eq!(Device::select(), Device::Cpu);
    }
}
