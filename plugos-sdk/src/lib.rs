//! plugos-sdk: SDK for writing PlugOS plugs in Rust
//!
//! Each plug function compiles to its own `wasm32-unknown-unknown` module.
//! The SDK provides the exports the host expects and wrappers for the
//! host imports.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use plugos_sdk::prelude::*;
//!
//! fn greet(args: Vec<Value>) -> PlugResult {
//!     let name = args.first().and_then(Value::as_str).unwrap_or("World");
//!     info(&format!("greeting {}", name));
//!     syscall("echo", vec![Value::from(format!("Hello, {}!", name))])
//! }
//!
//! // Generate plug_run, plug_alloc and plug_dealloc
//! export_function!(greet);
//! ```

use plugos_api::{CallOutcome, LogLevel, SyscallCall};
use std::alloc::{alloc, dealloc, Layout};

// Re-export everything from plugos-api
pub use plugos_api::*;

/// Return type of a plug function: a value or an error message
pub type PlugResult = Result<Value, String>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{debug, error, export_function, info, memory, syscall, warn, PlugResult};
    pub use plugos_api::Value;
}

/// Call a host syscall
///
/// The call blocks until the host answers. Permission failures and handler
/// errors come back as `Err` with the host's message.
pub fn syscall(name: &str, args: Vec<Value>) -> PlugResult {
    let request = rmp_serde::to_vec_named(&SyscallCall {
        name: name.to_string(),
        args,
    })
    .map_err(|e| e.to_string())?;

    host::syscall(&request)?.into_result()
}

/// Log a message through the host at the given level
pub fn log(level: LogLevel, message: &str) {
    host::log(level.as_i32(), message.as_bytes());
}

pub fn debug(message: &str) {
    log(LogLevel::Debug, message);
}

pub fn info(message: &str) {
    log(LogLevel::Info, message);
}

pub fn warn(message: &str) {
    log(LogLevel::Warn, message);
}

pub fn error(message: &str) {
    log(LogLevel::Error, message);
}

#[cfg(target_arch = "wasm32")]
mod host {
    use super::CallOutcome;

    mod imports {
        #[link(wasm_import_module = "plugos")]
        extern "C" {
            pub fn syscall(ptr: i32, len: i32) -> i64;
            pub fn log(level: i32, ptr: i32, len: i32);
        }
    }

    pub fn syscall(request: &[u8]) -> Result<CallOutcome, String> {
        let packed = unsafe { imports::syscall(request.as_ptr() as i32, request.len() as i32) };
        let (ptr, len) = plugos_api::unpack_ptr_len(packed);
        unsafe { crate::memory::take_from_ptr(ptr, len) }
            .ok_or_else(|| "Malformed syscall response".to_string())
    }

    pub fn log(level: i32, message: &[u8]) {
        unsafe { imports::log(level, message.as_ptr() as i32, message.len() as i32) }
    }
}

#[cfg(not(target_arch = "wasm32"))]
mod host {
    use super::CallOutcome;

    pub fn syscall(_request: &[u8]) -> Result<CallOutcome, String> {
        Err("Syscalls are only available inside an execution unit".to_string())
    }

    pub fn log(_level: i32, _message: &[u8]) {}
}

/// Memory utilities for the guest side of the call ABI
pub mod memory {
    use super::*;

    /// Allocate memory in the Wasm linear memory
    #[inline]
    pub fn plug_alloc(size: i32) -> i32 {
        if size <= 0 {
            return 0;
        }
        match Layout::from_size_align(size as usize, 1) {
            Ok(layout) => unsafe { alloc(layout) as i32 },
            Err(_) => 0,
        }
    }

    /// Deallocate memory in the Wasm linear memory
    ///
    /// # Safety
    /// The ptr must have been allocated by `plug_alloc` with the same size.
    #[inline]
    pub fn plug_dealloc(ptr: i32, size: i32) {
        if ptr == 0 || size <= 0 {
            return;
        }
        if let Ok(layout) = Layout::from_size_align(size as usize, 1) {
            unsafe { dealloc(ptr as *mut u8, layout) }
        }
    }

    /// Serialize data into a fresh allocation and return it packed
    ///
    /// The host reads the buffer and releases it through `plug_dealloc`.
    pub fn serialize_and_return<T: serde::Serialize>(data: &T) -> i64 {
        let bytes = rmp_serde::to_vec_named(data).unwrap_or_default();
        let len = bytes.len() as i32;
        let ptr = plug_alloc(len);

        if ptr != 0 && len > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, len as usize);
            }
        }

        plugos_api::pack_ptr_len(ptr, len)
    }

    /// Deserialize data from a raw pointer and length
    ///
    /// # Safety
    /// The pointer must be valid and point to `len` bytes of valid MessagePack data.
    pub unsafe fn deserialize_from_ptr<T: serde::de::DeserializeOwned>(
        ptr: i32,
        len: i32,
    ) -> Option<T> {
        if ptr == 0 || len <= 0 {
            return None;
        }
        let slice = std::slice::from_raw_parts(ptr as *const u8, len as usize);
        rmp_serde::from_slice(slice).ok()
    }

    /// Deserialize a host-allocated buffer and release it
    ///
    /// # Safety
    /// Same as [`deserialize_from_ptr`]; the buffer must come from `plug_alloc`.
    pub unsafe fn take_from_ptr<T: serde::de::DeserializeOwned>(ptr: i32, len: i32) -> Option<T> {
        let value = deserialize_from_ptr(ptr, len);
        plug_dealloc(ptr, len);
        value
    }
}

/// Macro to export a plug function
///
/// Generates `plug_run`, `plug_alloc` and `plug_dealloc` for a function
/// of type `fn(Vec<Value>) -> PlugResult`.
///
/// # Example
///
/// ```rust,ignore
/// fn double(args: Vec<Value>) -> PlugResult {
///     let n = args.first().and_then(Value::as_i64).ok_or("expected a number")?;
///     Ok(Value::from(n * 2))
/// }
///
/// export_function!(double);
/// ```
#[macro_export]
macro_rules! export_function {
    ($func:path) => {
        #[no_mangle]
        pub extern "C" fn plug_run(args_ptr: i32, args_len: i32) -> i64 {
            let args: Vec<$crate::Value> = unsafe {
                $crate::memory::deserialize_from_ptr(args_ptr, args_len).unwrap_or_default()
            };
            let outcome = $crate::CallOutcome::from($func(args));
            $crate::memory::serialize_and_return(&outcome)
        }

        #[no_mangle]
        pub extern "C" fn plug_alloc(size: i32) -> i32 {
            $crate::memory::plug_alloc(size)
        }

        #[no_mangle]
        pub extern "C" fn plug_dealloc(ptr: i32, size: i32) {
            $crate::memory::plug_dealloc(ptr, size)
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_edge_cases() {
        assert_eq!(memory::plug_alloc(0), 0);
        assert_eq!(memory::plug_alloc(-1), 0);
    }

    #[test]
    fn test_syscall_outside_unit() {
        let err = syscall("echo", vec![Value::from("hi")]).unwrap_err();
        assert!(err.contains("only available inside"));
    }

    #[test]
    fn test_outcome_from_result() {
        let ok: PlugResult = Ok(Value::from(2));
        assert_eq!(CallOutcome::from(ok).result, Some(Value::from(2)));

        let err: PlugResult = Err("nope".into());
        assert_eq!(CallOutcome::from(err).error.as_deref(), Some("nope"));
    }
}
