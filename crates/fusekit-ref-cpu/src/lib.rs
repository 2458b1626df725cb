//! Host reference executor for kernels lowered by `fusekit`.
//!
//! Interprets the kernel tree directly instead of compiling the generated
//! source, which makes it suitable for checking lowering results in tests.

pub mod exec;

pub use exec::{run_kernel, HostTensor, KernelArg, LaunchConfig};
