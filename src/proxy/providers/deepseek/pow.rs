//! DeepSeek proof-of-work solver.
//!
//! The hash lives in an opaque WASM artifact shipped next to the binary;
//! the export ABI below must be reproduced bit-exactly:
//!
//! - `__wbindgen_add_to_stack_pointer(delta) -> ptr` reserves the 16-byte
//!   return region (call with -16, restore with +16),
//! - `__wbindgen_export_0(size, align) -> ptr` allocates input buffers,
//! - `wasm_solve(ret_ptr, challenge_ptr, challenge_len, prefix_ptr,
//!   prefix_len, difficulty)` writes a little-endian i32 status at
//!   `ret_ptr` and a little-endian f64 value at `ret_ptr + 8`.
//!
//! Status 0 means no solution; otherwise the answer is `trunc(value)`.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::json;
use wasmtime::{Engine, Instance, Module, Store};

use crate::error::{AppError, AppResult};

pub const POW_ALGORITHM: &str = "DeepSeekHashV1";
const DEFAULT_DIFFICULTY: u64 = 144_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PowChallenge {
    pub algorithm: String,
    pub challenge: String,
    pub salt: String,
    #[serde(default = "default_difficulty")]
    pub difficulty: u64,
    pub expire_at: i64,
    pub signature: String,
    pub target_path: String,
}

fn default_difficulty() -> u64 {
    DEFAULT_DIFFICULTY
}

impl PowChallenge {
    /// The hash prefix is `{salt}_{expire_at}_` including the trailing
    /// underscore.
    pub fn prefix(&self) -> String {
        format!("{}_{}_", self.salt, self.expire_at)
    }
}

pub struct PowSolver {
    engine: Engine,
    module: Module,
}

impl PowSolver {
    pub fn load(path: &Path) -> AppResult<Self> {
        let engine = Engine::default();
        let module = Module::from_file(&engine, path)
            .map_err(|e| AppError::Pow(format!("failed to load wasm module {}: {}", path.display(), e)))?;
        Ok(Self { engine, module })
    }

    /// Runs the solver once. `Ok(None)` means the module reported failure
    /// (status 0).
    pub fn solve(&self, challenge: &str, prefix: &str, difficulty: u64) -> AppResult<Option<i64>> {
        let mut store = Store::new(&self.engine, ());
        let instance = Instance::new(&mut store, &self.module, &[])
            .map_err(|e| AppError::Pow(format!("wasm instantiation failed: {}", e)))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| AppError::Pow("wasm module has no exported memory".to_string()))?;
        let add_to_stack = instance
            .get_typed_func::<i32, i32>(&mut store, "__wbindgen_add_to_stack_pointer")
            .map_err(|e| AppError::Pow(format!("missing __wbindgen_add_to_stack_pointer: {}", e)))?;
        let alloc = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, "__wbindgen_export_0")
            .map_err(|e| AppError::Pow(format!("missing __wbindgen_export_0: {}", e)))?;
        let wasm_solve = instance
            .get_typed_func::<(i32, i32, i32, i32, i32, f64), ()>(&mut store, "wasm_solve")
            .map_err(|e| AppError::Pow(format!("missing wasm_solve: {}", e)))?;

        let ret_ptr = add_to_stack
            .call(&mut store, -16)
            .map_err(|e| AppError::Pow(format!("stack reserve failed: {}", e)))?;

        let write_string = |store: &mut Store<()>, text: &str| -> AppResult<(i32, i32)> {
            let bytes = text.as_bytes();
            let ptr = alloc
                .call(&mut *store, (bytes.len() as i32, 1))
                .map_err(|e| AppError::Pow(format!("wasm alloc failed: {}", e)))?;
            memory
                .write(&mut *store, ptr as usize, bytes)
                .map_err(|e| AppError::Pow(format!("wasm memory write failed: {}", e)))?;
            Ok((ptr, bytes.len() as i32))
        };

        let (challenge_ptr, challenge_len) = write_string(&mut store, challenge)?;
        let (prefix_ptr, prefix_len) = write_string(&mut store, prefix)?;

        let solve_result = wasm_solve.call(
            &mut store,
            (
                ret_ptr,
                challenge_ptr,
                challenge_len,
                prefix_ptr,
                prefix_len,
                difficulty as f64,
            ),
        );

        let mut out = [0u8; 16];
        let read_result = memory.read(&store, ret_ptr as usize, &mut out);

        // The reserved region is restored regardless of solve outcome.
        let _ = add_to_stack.call(&mut store, 16);

        solve_result.map_err(|e| AppError::Pow(format!("wasm_solve trapped: {}", e)))?;
        read_result.map_err(|e| AppError::Pow(format!("wasm memory read failed: {}", e)))?;

        let status = i32::from_le_bytes(out[0..4].try_into().expect("4-byte status"));
        if status == 0 {
            return Ok(None);
        }
        let value = f64::from_le_bytes(out[8..16].try_into().expect("8-byte value"));
        Ok(Some(value.trunc() as i64))
    }
}

/// Encodes the solved challenge for the `x-ds-pow-response` header.
pub fn pow_response_header(challenge: &PowChallenge, answer: i64) -> String {
    let payload = json!({
        "algorithm": challenge.algorithm,
        "challenge": challenge.challenge,
        "salt": challenge.salt,
        "answer": answer,
        "signature": challenge.signature,
        "target_path": challenge.target_path,
    });
    BASE64.encode(payload.to_string())
}
