//! The `extbox` import module: every capability a script has.
//!
//! Pointers and lengths address the guest's exported `memory`. Negative
//! return values are [`AbiStatus`] codes; host-side failures are returned as
//! values and only `fail` traps.

use crate::fetch::FetchRequest;
use crate::isolate::IsolateState;
use serde_json::Value;
use std::fmt;
use tracing::debug;
use wasmtime::{Caller, Linker};

/// Import module name scripts link against.
pub const IMPORT_MODULE: &str = "extbox";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum AbiStatus {
    InvalidArgument = -1,
    NetworkDenied = -2,
    RateLimited = -3,
    BodyTooLarge = -4,
    NetworkTimeout = -5,
    TransportFailure = -6,
    StorageFailure = -7,
    LimitExceeded = -8,
    NotFound = -9,
}

impl AbiStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Raised by the `fail` import; surfaces as a runtime error.
#[derive(Debug)]
pub struct ScriptFailure(pub String);

impl fmt::Display for ScriptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "script failed: {}", self.0)
    }
}

impl std::error::Error for ScriptFailure {}

type HostCaller<'a> = Caller<'a, IsolateState>;

fn read_guest(caller: &mut HostCaller<'_>, ptr: i32, len: i32) -> Result<Vec<u8>, AbiStatus> {
    let (Ok(ptr), Ok(len)) = (usize::try_from(ptr), usize::try_from(len)) else {
        return Err(AbiStatus::InvalidArgument);
    };
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or(AbiStatus::InvalidArgument)?;
    // Bounds-checked against guest memory before the host allocates anything.
    let end = ptr.checked_add(len).ok_or(AbiStatus::InvalidArgument)?;
    memory
        .data(&*caller)
        .get(ptr..end)
        .map(<[u8]>::to_vec)
        .ok_or(AbiStatus::InvalidArgument)
}

fn read_guest_str(caller: &mut HostCaller<'_>, ptr: i32, len: i32) -> Result<String, AbiStatus> {
    String::from_utf8(read_guest(caller, ptr, len)?).map_err(|_| AbiStatus::InvalidArgument)
}

/// Copies up to `cap` bytes of `data` into guest memory; returns bytes copied.
fn write_guest(caller: &mut HostCaller<'_>, ptr: i32, cap: i32, data: &[u8]) -> i32 {
    let (Ok(ptr), Ok(cap)) = (usize::try_from(ptr), usize::try_from(cap)) else {
        return AbiStatus::InvalidArgument.code();
    };
    let Some(memory) = caller.get_export("memory").and_then(|e| e.into_memory()) else {
        return AbiStatus::InvalidArgument.code();
    };
    let n = data.len().min(cap);
    match memory.write(&mut *caller, ptr, &data[..n]) {
        Ok(()) => n as i32,
        Err(_) => AbiStatus::InvalidArgument.code(),
    }
}

/// Fixes the output type of async host futures.
fn status(code: i32) -> wasmtime::Result<i32> {
    Ok(code)
}

fn len_i32(len: usize) -> i32 {
    i32::try_from(len).unwrap_or(i32::MAX)
}

/// Registers every `extbox` import on `linker`.
pub fn add_to_linker(linker: &mut Linker<IsolateState>) -> wasmtime::Result<()> {
    add_context_fns(linker)?;
    add_output_fns(linker)?;
    add_fetch_fns(linker)?;
    add_storage_fns(linker)?;
    Ok(())
}

fn add_context_fns(linker: &mut Linker<IsolateState>) -> wasmtime::Result<()> {
    linker.func_wrap(IMPORT_MODULE, "context_len", |caller: HostCaller<'_>| -> i32 {
        len_i32(caller.data().context_json.len())
    })?;

    linker.func_wrap(
        IMPORT_MODULE,
        "context_read",
        |mut caller: HostCaller<'_>, ptr: i32, cap: i32| -> i32 {
            let data = std::mem::take(&mut caller.data_mut().context_json);
            let n = write_guest(&mut caller, ptr, cap, &data);
            caller.data_mut().context_json = data;
            n
        },
    )?;

    linker.func_wrap(IMPORT_MODULE, "last_len", |caller: HostCaller<'_>| -> i32 {
        len_i32(caller.data().last_result.len())
    })?;

    linker.func_wrap(
        IMPORT_MODULE,
        "last_read",
        |mut caller: HostCaller<'_>, ptr: i32, cap: i32| -> i32 {
            let data = std::mem::take(&mut caller.data_mut().last_result);
            let n = write_guest(&mut caller, ptr, cap, &data);
            caller.data_mut().last_result = data;
            n
        },
    )?;

    Ok(())
}

fn add_output_fns(linker: &mut Linker<IsolateState>) -> wasmtime::Result<()> {
    linker.func_wrap(
        IMPORT_MODULE,
        "log",
        |mut caller: HostCaller<'_>, ptr: i32, len: i32| {
            if caller.data().log_budget == 0 {
                return;
            }
            caller.data_mut().log_budget -= 1;
            if let Ok(bytes) = read_guest(&mut caller, ptr, len) {
                let descriptor = &caller.data().descriptor;
                debug!(
                    tenant_id = %descriptor.tenant_id,
                    extension_id = %descriptor.extension_id,
                    line = %String::from_utf8_lossy(&bytes),
                    "Extension log"
                );
            }
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "reply",
        |mut caller: HostCaller<'_>, ptr: i32, len: i32| -> i32 {
            let text = match read_guest_str(&mut caller, ptr, len) {
                Ok(text) => text,
                Err(s) => return s.code(),
            };
            let state = caller.data_mut();
            if state.output_bytes + text.len() > state.max_output_bytes {
                return AbiStatus::LimitExceeded.code();
            }
            state.output_bytes += text.len();
            state.replies.push(text);
            0
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "fail",
        |mut caller: HostCaller<'_>, ptr: i32, len: i32| -> wasmtime::Result<()> {
            let message = read_guest(&mut caller, ptr, len)
                .map(|b| String::from_utf8_lossy(&b).into_owned())
                .unwrap_or_else(|_| "<unreadable message>".to_string());
            Err(wasmtime::Error::new(ScriptFailure(message)))
        },
    )?;

    Ok(())
}

fn add_fetch_fns(linker: &mut Linker<IsolateState>) -> wasmtime::Result<()> {
    linker.func_wrap_async(
        IMPORT_MODULE,
        "fetch",
        |mut caller: HostCaller<'_>, (ptr, len): (i32, i32)| {
            Box::new(async move {
                let raw = match read_guest(&mut caller, ptr, len) {
                    Ok(raw) => raw,
                    Err(s) => return status(s.code()),
                };
                let fetch = caller.data().fetch.clone();
                let descriptor = caller.data().descriptor.clone();

                let outcome = match FetchRequest::from_script_bytes(&raw) {
                    Ok(request) => fetch.fetch(&descriptor, request).await,
                    Err(e) => Err(e),
                };
                let state = caller.data_mut();
                status(match outcome {
                    Ok(resp) => {
                        state.last_result = resp.body;
                        i32::from(resp.status)
                    }
                    Err(e) => {
                        debug!(
                            extension_id = %descriptor.extension_id,
                            kind = e.kind(),
                            error = %e,
                            "Mediated fetch refused"
                        );
                        state.last_result = e.to_script_json().to_string().into_bytes();
                        e.abi_status().code()
                    }
                })
            })
        },
    )?;
    Ok(())
}

fn add_storage_fns(linker: &mut Linker<IsolateState>) -> wasmtime::Result<()> {
    linker.func_wrap_async(
        IMPORT_MODULE,
        "storage_get",
        |mut caller: HostCaller<'_>, (kptr, klen): (i32, i32)| {
            Box::new(async move {
                let key = match read_guest_str(&mut caller, kptr, klen) {
                    Ok(key) => key,
                    Err(s) => return status(s.code()),
                };
                let storage = caller.data().storage.clone();
                status(match storage.get(&key).await {
                    Ok(Some(value)) => {
                        let bytes = match value {
                            Value::String(s) => s.into_bytes(),
                            other => other.to_string().into_bytes(),
                        };
                        let len = len_i32(bytes.len());
                        caller.data_mut().last_result = bytes;
                        len
                    }
                    Ok(None) => AbiStatus::NotFound.code(),
                    Err(e) => e.abi_status().code(),
                })
            })
        },
    )?;

    linker.func_wrap_async(
        IMPORT_MODULE,
        "storage_write",
        |mut caller: HostCaller<'_>, (kptr, klen, vptr, vlen): (i32, i32, i32, i32)| {
            Box::new(async move {
                let key = match read_guest_str(&mut caller, kptr, klen) {
                    Ok(key) => key,
                    Err(s) => return status(s.code()),
                };
                let value = match read_guest_str(&mut caller, vptr, vlen) {
                    Ok(value) => value,
                    Err(s) => return status(s.code()),
                };
                let storage = caller.data().storage.clone();
                status(match storage.write(&key, Value::String(value)).await {
                    Ok(()) => 0,
                    Err(e) => e.abi_status().code(),
                })
            })
        },
    )?;

    linker.func_wrap_async(
        IMPORT_MODULE,
        "storage_delete",
        |mut caller: HostCaller<'_>, (kptr, klen): (i32, i32)| {
            Box::new(async move {
                let key = match read_guest_str(&mut caller, kptr, klen) {
                    Ok(key) => key,
                    Err(s) => return status(s.code()),
                };
                let storage = caller.data().storage.clone();
                status(match storage.delete(&key).await {
                    Ok(removed) => i32::from(removed),
                    Err(e) => e.abi_status().code(),
                })
            })
        },
    )?;

    linker.func_wrap_async(
        IMPORT_MODULE,
        "storage_clear",
        |caller: HostCaller<'_>, (): ()| {
            Box::new(async move {
                let storage = caller.data().storage.clone();
                status(match storage.clear().await {
                    Ok(n) => i32::try_from(n).unwrap_or(i32::MAX),
                    Err(e) => e.abi_status().code(),
                })
            })
        },
    )?;

    Ok(())
}
