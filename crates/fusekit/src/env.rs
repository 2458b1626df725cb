use std::env;
use std::sync::OnceLock;

static FUSEKIT_KERNEL_NAME: OnceLock<String> = OnceLock::new();
static FUSEKIT_DUMP_KERNEL: OnceLock<bool> = OnceLock::new();

pub const DEFAULT_KERNEL_NAME: &str = "CUDAGeneratedKernel";

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

pub(crate) fn kernel_name() -> &'static str {
    FUSEKIT_KERNEL_NAME.get_or_init(|| match env::var("FUSEKIT_KERNEL_NAME") {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => DEFAULT_KERNEL_NAME.to_string(),
    })
}

pub(crate) fn dump_kernel() -> bool {
    *FUSEKIT_DUMP_KERNEL.get_or_init(|| match env::var("FUSEKIT_DUMP_KERNEL") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}
