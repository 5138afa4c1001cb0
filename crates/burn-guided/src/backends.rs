//! Backend selection
//!
//! Guidance differentiates through the denoiser and the classifier, so every
//! backend is wrapped in [`Autodiff`]. Enable one via feature flags:
//!
//! - `ndarray`: CPU backend using ndarray (default)
//! - `tch`: PyTorch backend via libtorch (CUDA, MPS)
//! - `wgpu`: WebGPU backend (cross-platform GPU)
//!
//! ```toml
//! [dependencies]
//! burn-guided = { version = "0.1", default-features = false, features = ["wgpu"] }
//! ```

pub use burn::backend::Autodiff;

#[cfg(feature = "ndarray")]
pub use burn_ndarray::{NdArray, NdArrayDevice};

#[cfg(feature = "tch")]
pub use burn_tch::{LibTorch, LibTorchDevice};

#[cfg(feature = "wgpu")]
pub use burn_wgpu::{Wgpu, WgpuDevice};

/// Default backend when the ndarray feature is enabled
#[cfg(feature = "ndarray")]
pub type DefaultBackend = Autodiff<NdArray<f32>>;

/// Default backend when the tch feature is enabled
#[cfg(all(feature = "tch", not(feature = "ndarray")))]
pub type DefaultBackend = Autodiff<LibTorch<f32>>;

/// Default backend when the wgpu feature is enabled
#[cfg(all(feature = "wgpu", not(any(feature = "ndarray", feature = "tch"))))]
pub type DefaultBackend = Autodiff<Wgpu>;

/// Default device for the enabled backend
#[cfg(feature = "ndarray")]
pub fn default_device() -> NdArrayDevice {
    NdArrayDevice::default()
}

/// Default device for the enabled backend
#[cfg(all(feature = "tch", not(feature = "ndarray")))]
pub fn default_device() -> LibTorchDevice {
    if burn_tch::is_cuda_available() {
        LibTorchDevice::Cuda(0)
    } else {
        LibTorchDevice::Cpu
    }
}

/// Default device for the enabled backend
#[cfg(all(feature = "wgpu", not(any(feature = "ndarray", feature = "tch"))))]
pub fn default_device() -> WgpuDevice {
    WgpuDevice::default()
}

/// Name of the enabled backend, for logs
pub fn backend_name() -> &'static str {
    if cfg!(feature = "ndarray") {
        "ndarray"
    } else if cfg!(feature = "tch") {
        "tch"
    } else if cfg!(feature = "wgpu") {
        "wgpu"
    } else {
        "none"
    }
}
