//! Runtime configuration.
//!
//! The configuration is parsed once, resolved into a [`RuntimeConfig`] and then passed by
//! reference to every component. Strategy strings follow the `"<device> <precision>"` format,
//! e.g. `"cpu fp32"`, `"cuda fp16"` or `"cuda:1 bf16i8"`, where the `i8` suffix requests 8-bit
//! quantization of the large projection matrices at load time.
//!
//! ```rust
//! use candle_rwkv7::config::{Config, DeviceSpec, Precision, Strategy};
//! # fn main() -> candle_rwkv7::Result<()> {
//! let strategy: Strategy = "cpu bf16i8".parse()?;
//! assert_eq!(strategy.device, DeviceSpec::Cpu);
//! assert_eq!(strategy.precision, Precision::Bf16);
//! assert!(strategy.quantize);
//!
//! let cfg = Config::new(strategy).build()?;
//! assert_eq!(cfg.dtype(), candle::DType::BF16);
//! # Ok(()) }
//! ```
use crate::kernels::KernelSet;
use crate::{Error, Result};
use candle::{DType, Device};

/// The token id whose positions receive externally supplied embeddings.
pub const DEFAULT_PLACEHOLDER_TOKEN: u32 = 65532;

/// Working numeric precision for activations and float weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    Fp16,
    Bf16,
    Fp32,
}

impl Precision {
    pub fn dtype(&self) -> DType {
        match self {
            Self::Fp16 => DType::F16,
            Self::Bf16 => DType::BF16,
            Self::Fp32 => DType::F32,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fp16 => "fp16",
            Self::Bf16 => "bf16",
            Self::Fp32 => "fp32",
        }
    }
}

impl std::str::FromStr for Precision {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fp16" | "f16" => Ok(Self::Fp16),
            "bf16" => Ok(Self::Bf16),
            "fp32" | "f32" => Ok(Self::Fp32),
            _ => Err(Error::UnsupportedPrecision(s.to_string())),
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Device placement, resolved to a candle [`Device`] by [`DeviceSpec::device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSpec {
    pub fn device(&self) -> Result<Device> {
        let device = match *self {
            Self::Cpu => Device::Cpu,
            Self::Cuda(ordinal) => Device::new_cuda(ordinal)?,
            Self::Metal(ordinal) => Device::new_metal(ordinal)?,
        };
        Ok(device)
    }
}

impl std::str::FromStr for DeviceSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, ordinal) = match s.split_once(':') {
            None => (s, 0),
            Some((name, ordinal)) => match ordinal.parse::<usize>() {
                Ok(ordinal) => (name, ordinal),
                Err(_) => return Err(Error::UnsupportedDevice(s.to_string())),
            },
        };
        match name {
            "cpu" if ordinal == 0 => Ok(Self::Cpu),
            "cuda" => Ok(Self::Cuda(ordinal)),
            "metal" | "mps" => Ok(Self::Metal(ordinal)),
            _ => Err(Error::UnsupportedDevice(s.to_string())),
        }
    }
}

/// A parsed `"<device> <precision>[i8]"` strategy string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(try_from = "String")]
pub struct Strategy {
    pub device: DeviceSpec,
    pub precision: Precision,
    /// Store the projection matrices as 8-bit affine-quantized weights.
    pub quantize: bool,
}

impl std::str::FromStr for Strategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split_whitespace();
        let (device, precision) = match (parts.next(), parts.next(), parts.next()) {
            (Some(device), Some(precision), None) => (device, precision),
            _ => return Err(Error::InvalidStrategy(s.to_string())),
        };
        let device = device.parse()?;
        let (precision, quantize) = match precision.strip_suffix("i8") {
            Some(precision) => (precision, true),
            None => (precision, false),
        };
        Ok(Self {
            device,
            precision: precision.parse()?,
            quantize,
        })
    }
}

impl TryFrom<String> for Strategy {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

/// User facing configuration, typically deserialized from json.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct Config {
    pub strategy: Strategy,
    /// Use the fused kernels when they are available for the target device.
    #[serde(default)]
    pub fused_kernels: bool,
    #[serde(default = "default_placeholder_token")]
    pub placeholder_token: u32,
}

fn default_placeholder_token() -> u32 {
    DEFAULT_PLACEHOLDER_TOKEN
}

impl Config {
    pub fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            fused_kernels: false,
            placeholder_token: DEFAULT_PLACEHOLDER_TOKEN,
        }
    }

    pub fn with_fused_kernels(mut self, fused_kernels: bool) -> Self {
        self.fused_kernels = fused_kernels;
        self
    }

    pub fn with_placeholder_token(mut self, placeholder_token: u32) -> Self {
        self.placeholder_token = placeholder_token;
        self
    }

    /// Resolves the device and selects the kernels. This is the only place where kernel
    /// availability is checked.
    pub fn build(&self) -> Result<RuntimeConfig> {
        let device = self.strategy.device.device()?;
        let precision = self.strategy.precision;
        let kernels = KernelSet::select(&device, precision.dtype(), self.fused_kernels);
        Ok(RuntimeConfig {
            device,
            precision,
            quantize: self.strategy.quantize,
            placeholder_token: self.placeholder_token,
            kernels,
        })
    }
}

/// Immutable configuration shared by every component of a loaded model.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub device: Device,
    pub precision: Precision,
    pub quantize: bool,
    pub placeholder_token: u32,
    pub kernels: KernelSet,
}

impl RuntimeConfig {
    pub fn dtype(&self) -> DType {
        self.precision.dtype()
    }

    /// A cpu configuration with the given precision, mostly useful for tests.
    pub fn cpu(precision: Precision, fused_kernels: bool) -> Self {
        let device = Device::Cpu;
        let kernels = KernelSet::select(&device, precision.dtype(), fused_kernels);
        Self {
            device,
            precision,
            quantize: false,
            placeholder_token: DEFAULT_PLACEHOLDER_TOKEN,
            kernels,
        }
    }

    pub fn with_quantize(mut self, quantize: bool) -> Self {
        self.quantize = quantize;
        self
    }
}
