//! Guest memory access for the call ABI
//!
//! Buffers handed to the guest are allocated through its `plug_alloc`
//! export; buffers handed back are released through `plug_dealloc` when
//! the guest exports one.

use super::UnitState;
use anyhow::{anyhow, bail, Context as _};
use plugos_api::{ALLOC_EXPORT, DEALLOC_EXPORT, MEMORY_EXPORT};
use wasmtime::{AsContext, AsContextMut, Caller, Extern, Instance, Memory, StoreContextMut, TypedFunc};

/// Memory and allocator exports of one guest instance
pub(super) struct GuestExports {
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    dealloc: Option<TypedFunc<(i32, i32), ()>>,
}

impl GuestExports {
    /// Resolve the exports of a function instance
    pub(super) fn of_instance(
        cx: &mut StoreContextMut<'_, UnitState>,
        instance: Instance,
    ) -> anyhow::Result<Self> {
        let memory = instance.get_export(&mut *cx, MEMORY_EXPORT);
        let alloc = instance.get_export(&mut *cx, ALLOC_EXPORT);
        let dealloc = instance.get_export(&mut *cx, DEALLOC_EXPORT);
        Self::from_externs(&*cx, memory, alloc, dealloc)
    }

    /// Resolve the exports of the instance calling a host import
    pub(super) fn of_caller(caller: &mut Caller<'_, UnitState>) -> anyhow::Result<Self> {
        let memory = caller.get_export(MEMORY_EXPORT);
        let alloc = caller.get_export(ALLOC_EXPORT);
        let dealloc = caller.get_export(DEALLOC_EXPORT);
        Self::from_externs(&*caller, memory, alloc, dealloc)
    }

    fn from_externs(
        store: impl AsContext,
        memory: Option<Extern>,
        alloc: Option<Extern>,
        dealloc: Option<Extern>,
    ) -> anyhow::Result<Self> {
        let memory = memory
            .and_then(Extern::into_memory)
            .ok_or_else(|| anyhow!("Guest does not export `{}`", MEMORY_EXPORT))?;

        let alloc = alloc
            .and_then(Extern::into_func)
            .ok_or_else(|| anyhow!("Guest does not export `{}`", ALLOC_EXPORT))?
            .typed::<i32, i32>(&store)
            .with_context(|| format!("`{}` has the wrong signature", ALLOC_EXPORT))?;

        let dealloc = match dealloc.and_then(Extern::into_func) {
            Some(func) => Some(
                func.typed::<(i32, i32), ()>(&store)
                    .with_context(|| format!("`{}` has the wrong signature", DEALLOC_EXPORT))?,
            ),
            None => None,
        };

        Ok(Self {
            memory,
            alloc,
            dealloc,
        })
    }

    /// Copy bytes into a fresh guest allocation
    pub(super) fn write(&self, mut store: impl AsContextMut, bytes: &[u8]) -> anyhow::Result<(i32, i32)> {
        let len = i32::try_from(bytes.len()).context("Buffer too large for guest memory")?;
        let ptr = self.alloc.call(&mut store, len)?;
        if len > 0 {
            self.memory
                .write(&mut store, ptr as u32 as usize, bytes)
                .context("Failed to write guest memory")?;
        }
        Ok((ptr, len))
    }

    /// Copy bytes out of guest memory
    pub(super) fn read(&self, store: impl AsContext, ptr: i32, len: i32) -> anyhow::Result<Vec<u8>> {
        read_memory(&self.memory, store, ptr, len)
    }

    /// Hand a buffer back to the guest allocator, if it has one
    pub(super) fn release(&self, mut store: impl AsContextMut, ptr: i32, len: i32) {
        if let Some(dealloc) = &self.dealloc {
            if ptr != 0 && len > 0 {
                dealloc.call(&mut store, (ptr, len)).ok();
            }
        }
    }
}

/// Read `len` bytes at `ptr`, bounds checked
pub(super) fn read_memory(
    memory: &Memory,
    store: impl AsContext,
    ptr: i32,
    len: i32,
) -> anyhow::Result<Vec<u8>> {
    if len < 0 {
        bail!("Negative buffer length: {}", len);
    }
    let mut buf = vec![0u8; len as usize];
    memory
        .read(&store, ptr as u32 as usize, &mut buf)
        .map_err(|_| {
            anyhow!(
                "Out of bounds: ptr={}, len={}, memory_size={}",
                ptr,
                len,
                memory.data_size(&store)
            )
        })?;
    Ok(buf)
}
