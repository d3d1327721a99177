//! Test fixtures
//!
//! Hand-written WebAssembly text modules that follow the plug call ABI, so
//! the runtime can be exercised without a wasm toolchain. Payloads are
//! MessagePack produced on the host side and embedded as data segments.

pub mod wat {
    use plugos_api::{pack_ptr_len, CallOutcome, LogLevel, SyscallCall, Value};

    const DATA_OFFSET: usize = 16;

    /// `{"result": ...}` map header, followed by the encoded value
    const RESULT_PREFIX: [u8; 8] = [0x81, 0xa6, b'r', b'e', b's', b'u', b'l', b't'];

    fn escape(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("\\{:02x}", b)).collect()
    }

    fn packed(offset: usize, len: usize) -> i64 {
        pack_ptr_len(offset as i32, len as i32)
    }

    fn module(extra_fields: &str, data: &[u8], body: &str) -> String {
        let heap = ((DATA_OFFSET + data.len() + 7) & !7).max(1024);
        format!(
            r#"(module
  (import "plugos" "syscall" (func $syscall (param i32 i32) (result i64)))
  (import "plugos" "log" (func $log (param i32 i32 i32)))
  {extra_fields}
  (memory (export "memory") 2)
  (global $heap (mut i32) (i32.const {heap}))
  (data (i32.const {DATA_OFFSET}) "{data}")
  (func $alloc (export "plug_alloc") (param $size i32) (result i32)
    (local $ptr i32)
    (local.set $ptr (global.get $heap))
    (global.set $heap (i32.add (global.get $heap) (local.get $size)))
    (local.get $ptr))
  (func (export "plug_run") (param $ptr i32) (param $len i32) (result i64)
    {body}))"#,
            data = escape(data),
        )
    }

    fn outcome(outcome: &CallOutcome) -> String {
        let data = rmp_serde::to_vec_named(outcome).unwrap_or_default();
        let body = format!("(i64.const {})", packed(DATA_OFFSET, data.len()));
        module("", &data, &body)
    }

    /// Function returning a fixed value
    pub fn returns(value: &Value) -> String {
        outcome(&CallOutcome::ok(value.clone()))
    }

    /// Function failing with a fixed error message
    pub fn fails(message: &str) -> String {
        outcome(&CallOutcome::err(message))
    }

    /// Function returning its argument array
    pub fn echo_args() -> String {
        let body = format!(
            "(local $out i32)
    (local.set $out (call $alloc (i32.add (local.get $len) (i32.const 8))))
    (memory.copy (local.get $out) (i32.const {DATA_OFFSET}) (i32.const 8))
    (memory.copy (i32.add (local.get $out) (i32.const 8)) (local.get $ptr) (local.get $len))
    (i64.or
      (i64.shl (i64.extend_i32_u (local.get $out)) (i64.const 32))
      (i64.extend_i32_u (i32.add (local.get $len) (i32.const 8))))"
        );
        module("", &RESULT_PREFIX, &body)
    }

    /// Function making one syscall and returning its outcome unchanged
    pub fn calls_syscall(name: &str, args: &[Value]) -> String {
        let call = SyscallCall {
            name: name.to_string(),
            args: args.to_vec(),
        };
        let data = rmp_serde::to_vec_named(&call).unwrap_or_default();
        let body = format!(
            "(call $syscall (i32.const {DATA_OFFSET}) (i32.const {}))",
            data.len()
        );
        module("", &data, &body)
    }

    /// Function logging a message, then returning null
    pub fn logs(level: LogLevel, message: &str) -> String {
        let mut data = message.as_bytes().to_vec();
        data.push(0x80); // empty map: null outcome
        let body = format!(
            "(call $log (i32.const {}) (i32.const {DATA_OFFSET}) (i32.const {}))
    (i64.const {})",
            level.as_i32(),
            message.len(),
            packed(DATA_OFFSET + message.len(), 1)
        );
        module("", &data, &body)
    }

    /// Function counting `plug_dealloc` calls
    ///
    /// Traps when given a non-empty argument array, otherwise returns how
    /// many buffers the host has released so far (0..=127).
    pub fn counts_releases() -> String {
        let fields = r#"(global $released (mut i32) (i32.const 0))
  (func (export "plug_dealloc") (param i32 i32)
    (global.set $released (i32.add (global.get $released) (i32.const 1))))"#;
        let mut data = RESULT_PREFIX.to_vec();
        data.push(0);
        let body = format!(
            "(if (i32.gt_u (local.get $len) (i32.const 1)) (then unreachable))
    (i32.store8 (i32.const {}) (global.get $released))
    (i64.const {})",
            DATA_OFFSET + RESULT_PREFIX.len(),
            packed(DATA_OFFSET, data.len())
        );
        module(fields, &data, &body)
    }

    /// Function trapping with `unreachable`
    pub fn traps() -> String {
        module("", &[], "unreachable")
    }

    /// Function that never returns
    pub fn spins() -> String {
        module("", &[], "(loop $spin (br $spin))\n    (i64.const 0)")
    }

    /// Dependency module exporting `export() -> i32` returning `value` (0..=127)
    pub fn dependency(export: &str, value: u8) -> String {
        format!(
            r#"(module (func (export "{export}") (result i32) (i32.const {})))"#,
            value.min(127)
        )
    }

    /// Function returning the small integer produced by a dependency export
    pub fn calls_dependency(dependency: &str, export: &str) -> String {
        let import = format!(r#"(import "{dependency}" "{export}" (func $dep (result i32)))"#);
        let mut data = RESULT_PREFIX.to_vec();
        data.push(0);
        let body = format!(
            "(i32.store8 (i32.const {}) (call $dep))
    (i64.const {})",
            DATA_OFFSET + RESULT_PREFIX.len(),
            packed(DATA_OFFSET, data.len())
        );
        module(&import, &data, &body)
    }

}
