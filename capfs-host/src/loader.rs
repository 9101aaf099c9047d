//! Guest loader using wasmtime
//!
//! Compiles a module, links the filesystem imports against a [`WasiFsCtx`],
//! and runs exported functions under a fuel budget.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        GuestLoader Flow                           │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  1. GuestLoader::new                                              │
//! │     ├─ Engine with fuel metering and a bounded wasm stack         │
//! │     └─ Linker with wasi_snapshot_preview1 filesystem imports      │
//! │                                                                   │
//! │  2. instantiate(module bytes or WAT, WasiFsCtx)                   │
//! │     ├─ Compile module                                             │
//! │     ├─ Store owns GuestState { fs }                               │
//! │     └─ Instantiate, look up "memory"                              │
//! │                                                                   │
//! │  3. call_i32 / run                                                │
//! │     └─ Traps: out of fuel, guest memory fault, other              │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Dropping a [`GuestInstance`] drops its store and with it the context,
//! which closes every file the guest left open.

use crate::fs::{add_to_linker, GuestFault, WasiFsCtx};
use thiserror::Error;
use wasmtime::*;

/// Errors that can occur while loading or running a guest
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Engine creation failed: {0}")]
    EngineCreation(#[source] anyhow::Error),

    #[error("Failed to link filesystem imports: {0}")]
    Linking(#[source] anyhow::Error),

    #[error("Module compilation failed: {0}")]
    ModuleCompilation(#[source] anyhow::Error),

    #[error("Store configuration failed: {0}")]
    StoreConfig(#[source] anyhow::Error),

    #[error("Instantiation failed: {0}")]
    Instantiation(#[source] anyhow::Error),

    #[error("Function not found: {0}")]
    FunctionNotFound(String),

    #[error("Function call failed: {function} - {source}")]
    FunctionCall {
        function: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Guest memory fault in {function}: {source}")]
    GuestMemoryFault {
        function: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Memory access error: {0}")]
    MemoryAccess(String),

    #[error("Fuel exhausted (CPU limit exceeded)")]
    FuelExhausted,
}

impl LoaderError {
    fn from_call(function: &str, source: anyhow::Error) -> Self {
        if source
            .downcast_ref::<Trap>()
            .is_some_and(|t| *t == Trap::OutOfFuel)
        {
            Self::FuelExhausted
        } else if source.downcast_ref::<GuestFault>().is_some() {
            Self::GuestMemoryFault {
                function: function.to_string(),
                source,
            }
        } else {
            Self::FunctionCall {
                function: function.to_string(),
                source,
            }
        }
    }
}

/// Configuration for the guest loader
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Fuel limit per instance (CPU limit)
    pub fuel_limit: u64,

    /// Maximum WASM stack size in bytes
    pub max_stack_size: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            fuel_limit: 10_000_000,
            max_stack_size: 1024 * 1024, // 1MB
        }
    }
}

/// Store data for a guest instance
pub struct GuestState {
    pub fs: WasiFsCtx,
}

fn fs_of(state: &mut GuestState) -> &mut WasiFsCtx {
    &mut state.fs
}

/// Loader with a shared engine and linker
pub struct GuestLoader {
    engine: Engine,
    linker: Linker<GuestState>,
    config: LoaderConfig,
}

impl GuestLoader {
    pub fn new(config: LoaderConfig) -> Result<Self, LoaderError> {
        let mut engine_config = Config::new();
        engine_config.consume_fuel(true);
        engine_config.max_wasm_stack(config.max_stack_size);
        engine_config.wasm_memory64(false);

        let engine = Engine::new(&engine_config).map_err(LoaderError::EngineCreation)?;

        let mut linker = Linker::new(&engine);
        add_to_linker(&mut linker, fs_of).map_err(LoaderError::Linking)?;

        Ok(Self {
            engine,
            linker,
            config,
        })
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Compile and instantiate a guest bound to `fs`
    ///
    /// Accepts a binary module or WAT text.
    pub fn instantiate(&self, module: &[u8], fs: WasiFsCtx) -> Result<GuestInstance, LoaderError> {
        let module = Module::new(&self.engine, module).map_err(LoaderError::ModuleCompilation)?;

        let mut store = Store::new(&self.engine, GuestState { fs });
        store
            .set_fuel(self.config.fuel_limit)
            .map_err(LoaderError::StoreConfig)?;

        let instance = self
            .linker
            .instantiate(&mut store, &module)
            .map_err(LoaderError::Instantiation)?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| LoaderError::FunctionNotFound("memory".to_string()))?;

        tracing::debug!(
            instance = store.data().fs.instance_name(),
            memory_bytes = memory.data_size(&store),
            "instantiated guest"
        );

        Ok(GuestInstance {
            store,
            instance,
            memory,
        })
    }
}

/// An instantiated guest
pub struct GuestInstance {
    store: Store<GuestState>,
    instance: Instance,
    memory: Memory,
}

impl GuestInstance {
    /// Call an exported `() -> i32` function
    pub fn call_i32(&mut self, name: &str) -> Result<i32, LoaderError> {
        let func = self
            .instance
            .get_typed_func::<(), i32>(&mut self.store, name)
            .map_err(|_| LoaderError::FunctionNotFound(name.to_string()))?;
        func.call(&mut self.store, ())
            .map_err(|e| LoaderError::from_call(name, e))
    }

    /// Call the `_start` command entry point
    pub fn run(&mut self) -> Result<(), LoaderError> {
        let func = self
            .instance
            .get_typed_func::<(), ()>(&mut self.store, "_start")
            .map_err(|_| LoaderError::FunctionNotFound("_start".to_string()))?;
        func.call(&mut self.store, ())
            .map_err(|e| LoaderError::from_call("_start", e))
    }

    /// Copy bytes out of guest memory
    pub fn read_memory(&self, ptr: usize, len: usize) -> Result<Vec<u8>, LoaderError> {
        let data = self.memory.data(&self.store);
        let end = ptr.checked_add(len).ok_or_else(|| {
            LoaderError::MemoryAccess(format!("Integer overflow: ptr={}, len={}", ptr, len))
        })?;
        if end > data.len() {
            return Err(LoaderError::MemoryAccess(format!(
                "Out of bounds: ptr={}, len={}, memory_size={}",
                ptr,
                len,
                data.len()
            )));
        }
        Ok(data[ptr..end].to_vec())
    }

    pub fn remaining_fuel(&self) -> Option<u64> {
        self.store.get_fuel().ok()
    }

    pub fn fs(&self) -> &WasiFsCtx {
        &self.store.data().fs
    }

    pub fn fs_mut(&mut self) -> &mut WasiFsCtx {
        &mut self.store.data_mut().fs
    }
}
