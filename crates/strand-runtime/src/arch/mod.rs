//! Architecture-specific context switching
//!
//! Each backend exposes the same three items:
//! - `SavedRegs` - callee-saved register file of a suspended context
//! - `init_context` - prepare a fresh context that enters `entry(arg)`
//! - `switch_context` - save the running context, load another

/// Entry point a new context jumps into; it must never return
pub type ContextEntry = extern "C" fn(usize) -> !;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub mod x86_64;
        pub use self::x86_64::{init_context, switch_context, SavedRegs};
    } else if #[cfg(target_arch = "aarch64")] {
        pub mod aarch64;
        pub use self::aarch64::{init_context, switch_context, SavedRegs};
    } else {
        compile_error!("Unsupported architecture");
    }
}
