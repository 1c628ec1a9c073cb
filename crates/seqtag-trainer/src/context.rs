//! Explicit run state threaded through the engine: device placement, the
//! shuffling RNG and the epoch/step counters.

use candle_core::Device;
use oorandom::Rand64;
use seqtag_core::{ConfigError, Result};
use tracing::{debug, warn};

/// Resolve an `engine.device` name. `"gpu"` and `"cuda"` fall back to the
/// CPU with a warning when no CUDA device is present.
pub fn resolve_device(name: &str) -> Result<Device> {
    match name.to_ascii_lowercase().as_str() {
        "cpu" => Ok(Device::Cpu),
        "gpu" | "cuda" => {
            let device = Device::cuda_if_available(0)?;
            if device.is_cpu() {
                warn!(requested = name, "no CUDA device available, using CPU");
            }
            Ok(device)
        }
        other => Err(ConfigError::invalid(
            "engine.device",
            format!("unknown device `{other}`, expected `cpu` or `gpu`"),
        )
        .into()),
    }
}

/// Counters are monotone over a run. `epoch` counts completed epochs,
/// `global_step` counts every training batch seen (including skipped ones)
/// and `optimizer_step` counts applied parameter updates.
#[derive(Debug)]
pub struct TrainingContext {
    device: Device,
    seed: u64,
    rng: Rand64,
    pub epoch: usize,
    pub global_step: usize,
    pub optimizer_step: usize,
}

impl TrainingContext {
    /// `seed` always fixes the shuffling order. It also seeds the device RNG
    /// behind dropout masks, but only on accelerators: candle's CPU backend
    /// draws from a thread-local generator that cannot be seeded, so CPU runs
    /// with dropout are not bit-for-bit reproducible.
    pub fn new(device: Device, seed: u64) -> Result<Self> {
        let device_seeded = !device.is_cpu();
        if device_seeded {
            device.set_seed(seed)?;
        }
        debug!(seed, ?device, device_seeded, "training context initialised");
        Ok(Self {
            device,
            seed,
            rng: Rand64::new(u128::from(seed)),
            epoch: 0,
            global_step: 0,
            optimizer_step: 0,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Restore counters from a checkpoint. The RNG is re-derived from the
    /// seed and epoch so shuffling does not replay epoch 0's order.
    pub fn restore(&mut self, epoch: usize, global_step: usize, optimizer_step: usize) {
        self.epoch = epoch;
        self.global_step = global_step;
        self.optimizer_step = optimizer_step;
        self.rng = Rand64::new(u128::from(self.seed) ^ ((epoch as u128) << 64));
    }

    /// In-place Fisher-Yates shuffle.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.rng.rand_range(0..(i as u64 + 1)) as usize;
            items.swap(i, j);
        }
    }
}
