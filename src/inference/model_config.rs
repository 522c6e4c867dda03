use anyhow::{bail, Result};
use candle_core::{DType, Device};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, ValueEnum, Debug, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Auto,
    Cpu,
    Cuda,
    Metal,
}

#[derive(Deserialize, Debug, Copy, Clone)]
pub struct InferenceConfig {
    pub device: DeviceKind,
    pub max_length: usize,
    pub hub_fallback: bool,
}

impl Default for InferenceConfig {
    #[tracing::instrument(level = "trace", skip())]
    fn default() -> Self {
        Self {
            device: DeviceKind::Auto,
            max_length: 512,
            hub_fallback: false,
        }
    }
}

impl InferenceConfig {
    /// Picks the device and the matching precision, half precision on accelerators.
    pub fn select_device(&self) -> Result<(Device, DType)> {
        let device = match self.device {
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::Cuda => {
                if !candle_core::utils::cuda_is_available() {
                    bail!("CUDA was requested but this build has no CUDA support");
                }
                Device::new_cuda(0)?
            }
            DeviceKind::Metal => {
                if !candle_core::utils::metal_is_available() {
                    bail!("Metal was requested but this build has no Metal support");
                }
                Device::new_metal(0)?
            }
            DeviceKind::Auto => {
                if candle_core::utils::cuda_is_available() {
                    Device::new_cuda(0)?
                } else if candle_core::utils::metal_is_available() {
                    Device::new_metal(0)?
                } else {
                    Device::Cpu
                }
            }
        };
        let dtype = if device.is_cpu() {
            DType::F32
        } else {
            DType::F16
        };
        Ok((device, dtype))
    }
}

pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}
