// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! HCCL raw point-to-point transport.
//!
//! The vendor library is opened at runtime and the `HcclRaw*` entry points
//! are resolved into a function table, so the crate builds and links without
//! the vendor SDK installed.

use std::ffi::c_void;
use std::path::Path;

use libloading::Library;

use super::{
    Completion, ConnHandle, Envelope, MemHandle, MessageHandle, RequestHandle, SendBuffer,
    Transport, TransportAddr, TransportError,
};
use crate::cache::MemRegion;

pub const HCCL_SUCCESS: i32 = 0;
pub const HCCL_E_AGAIN: i32 = 20;

const HCCL_DATA_TYPE_INT8: i32 = 0;
const HCCL_MEM_TYPE_HOST: i32 = 1;
const DEFAULT_LIBRARY: &str = "libhccl.so";

type HcclResult = i32;
type RawConn = *mut c_void;
type RawRequest = *mut c_void;
type RawMessage = *mut c_void;

#[repr(C)]
#[derive(Default)]
struct HcclAddr {
    ip: u32,
    port: u16,
    reserved: u16,
}

impl From<TransportAddr> for HcclAddr {
    fn from(addr: TransportAddr) -> Self {
        Self {
            ip: u32::from(addr.ip),
            port: addr.port,
            reserved: 0,
        }
    }
}

#[repr(C)]
#[derive(Default, Clone, Copy)]
#[allow(dead_code)]
struct HcclStatus {
    src_rank: i32,
    tag: i32,
    error: i32,
    cancelled: i32,
    count: u64,
}

#[repr(C)]
struct HcclMem {
    mem_type: i32,
    addr: *mut c_void,
    size: u64,
}

type OpenFn = unsafe extern "C" fn(*mut RawConn) -> HcclResult;
type CloseFn = unsafe extern "C" fn(RawConn) -> HcclResult;
type BindFn = unsafe extern "C" fn(RawConn, *const HcclAddr) -> HcclResult;
type ListenFn = unsafe extern "C" fn(RawConn, i32) -> HcclResult;
type AcceptFn = unsafe extern "C" fn(RawConn, *mut HcclAddr, *mut RawConn) -> HcclResult;
type IsendFn =
    unsafe extern "C" fn(*const c_void, u64, i32, RawConn, *mut RawRequest) -> HcclResult;
type ImprobeFn =
    unsafe extern "C" fn(RawConn, *mut i32, *mut RawMessage, *mut HcclStatus) -> HcclResult;
type GetCountFn = unsafe extern "C" fn(*const HcclStatus, i32, *mut i32) -> HcclResult;
type ImrecvFn =
    unsafe extern "C" fn(*mut c_void, u64, i32, *mut RawMessage, *mut RawRequest) -> HcclResult;
type ImrecvScatterFn = unsafe extern "C" fn(
    *mut *mut c_void,
    *const u64,
    i32,
    i32,
    *mut RawMessage,
    *mut RawRequest,
) -> HcclResult;
type TestSomeFn =
    unsafe extern "C" fn(i32, *mut RawRequest, *mut i32, *mut i32, *mut HcclStatus) -> HcclResult;
type RegisterFn = unsafe extern "C" fn(*const HcclMem, *mut *mut c_void) -> HcclResult;
type UnregisterFn = unsafe extern "C" fn(*mut c_void) -> HcclResult;

struct HcclApi {
    open: OpenFn,
    close: CloseFn,
    force_close: CloseFn,
    bind: BindFn,
    listen: ListenFn,
    accept: AcceptFn,
    connect: BindFn,
    isend: IsendFn,
    improbe: ImprobeFn,
    get_count: GetCountFn,
    imrecv: ImrecvFn,
    imrecv_scatter: ImrecvScatterFn,
    test_some: TestSomeFn,
    register_mem: RegisterFn,
    unregister_mem: UnregisterFn,
}

fn symbol<T: Copy>(lib: &Library, name: &str) -> Result<T, TransportError> {
    let mut cname = name.as_bytes().to_vec();
    cname.push(0);
    // SAFETY: the type parameter matches the vendor header for `name`.
    unsafe {
        lib.get::<T>(&cname)
            .map(|sym| *sym)
            .map_err(|e| TransportError::Unavailable(format!("{name}: {e}")))
    }
}

impl HcclApi {
    fn load(lib: &Library) -> Result<Self, TransportError> {
        Ok(Self {
            open: symbol(lib, "HcclRawOpen")?,
            close: symbol(lib, "HcclRawClose")?,
            force_close: symbol(lib, "HcclRawForceClose")?,
            bind: symbol(lib, "HcclRawBind")?,
            listen: symbol(lib, "HcclRawListen")?,
            accept: symbol(lib, "HcclRawAccept")?,
            connect: symbol(lib, "HcclRawConnect")?,
            isend: symbol(lib, "HcclRawIsend")?,
            improbe: symbol(lib, "HcclRawImprobe")?,
            get_count: symbol(lib, "HcclRawGetCount")?,
            imrecv: symbol(lib, "HcclRawImrecv")?,
            imrecv_scatter: symbol(lib, "HcclRawImrecvScatter")?,
            test_some: symbol(lib, "HcclRawTestSome")?,
            register_mem: symbol(lib, "HcclRegisterGlobalMem")?,
            unregister_mem: symbol(lib, "HcclUnregisterGlobalMem")?,
        })
    }
}

fn check(op: &'static str, code: HcclResult) -> Result<(), TransportError> {
    match code {
        HCCL_SUCCESS => Ok(()),
        HCCL_E_AGAIN => Err(TransportError::Again),
        code => Err(TransportError::Failed { op, code }),
    }
}

fn raw<T>(handle: u64) -> *mut T {
    handle as usize as *mut T
}

fn region_ptr(region: &MemRegion) -> *mut c_void {
    // SAFETY: offset is inside the buffer, checked when the region was built.
    unsafe { region.buffer().as_mut_ptr().add(region.offset()) as *mut c_void }
}

pub struct HcclTransport {
    api: HcclApi,
    _lib: Library,
}

impl HcclTransport {
    /// Opens the vendor library from the loader search path.
    pub fn load() -> Result<Self, TransportError> {
        Self::load_from(DEFAULT_LIBRARY)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref();
        // SAFETY: runs the library initialisers.
        let lib = unsafe { Library::new(path) }
            .map_err(|e| TransportError::Unavailable(format!("{}: {e}", path.display())))?;
        let api = HcclApi::load(&lib)?;
        tracing::info!(library = %path.display(), "loaded hccl raw transport");
        Ok(Self { api, _lib: lib })
    }
}

impl Transport for HcclTransport {
    fn open(&self) -> Result<ConnHandle, TransportError> {
        let mut conn: RawConn = std::ptr::null_mut();
        check("HcclRawOpen", unsafe { (self.api.open)(&mut conn) })?;
        Ok(ConnHandle(conn as usize as u64))
    }

    fn close(&self, conn: ConnHandle) -> Result<(), TransportError> {
        check("HcclRawClose", unsafe { (self.api.close)(raw(conn.0)) })
    }

    fn force_close(&self, conn: ConnHandle) -> Result<(), TransportError> {
        check("HcclRawForceClose", unsafe {
            (self.api.force_close)(raw(conn.0))
        })
    }

    fn bind(
        &self,
        conn: ConnHandle,
        addr: TransportAddr,
    ) -> Result<TransportAddr, TransportError> {
        let raw_addr = HcclAddr::from(addr);
        check("HcclRawBind", unsafe {
            (self.api.bind)(raw(conn.0), &raw_addr)
        })?;
        Ok(addr)
    }

    fn listen(&self, conn: ConnHandle, backlog: u32) -> Result<(), TransportError> {
        let backlog = i32::try_from(backlog).unwrap_or(i32::MAX);
        check("HcclRawListen", unsafe {
            (self.api.listen)(raw(conn.0), backlog)
        })
    }

    fn connect(&self, conn: ConnHandle, addr: TransportAddr) -> Result<(), TransportError> {
        let addr = HcclAddr::from(addr);
        check("HcclRawConnect", unsafe {
            (self.api.connect)(raw(conn.0), &addr)
        })
    }

    fn accept(
        &self,
        listener: ConnHandle,
    ) -> Result<Option<(ConnHandle, TransportAddr)>, TransportError> {
        let mut addr = HcclAddr::default();
        let mut conn: RawConn = std::ptr::null_mut();
        match check("HcclRawAccept", unsafe {
            (self.api.accept)(raw(listener.0), &mut addr, &mut conn)
        }) {
            Ok(()) if !conn.is_null() => Ok(Some((
                ConnHandle(conn as usize as u64),
                TransportAddr::new(addr.ip.into(), addr.port),
            ))),
            Ok(()) | Err(TransportError::Again) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn isend(&self, conn: ConnHandle, buf: &SendBuffer) -> Result<RequestHandle, TransportError> {
        let (ptr, len) = match buf {
            SendBuffer::Bytes(b) => (b.as_ptr() as *const c_void, b.len()),
            SendBuffer::Region(r) => (region_ptr(r) as *const c_void, r.len()),
        };
        let mut req: RawRequest = std::ptr::null_mut();
        check("HcclRawIsend", unsafe {
            (self.api.isend)(
                ptr,
                len as u64,
                HCCL_DATA_TYPE_INT8,
                raw(conn.0),
                &mut req,
            )
        })?;
        Ok(RequestHandle(req as usize as u64))
    }

    fn improbe(&self, conn: ConnHandle) -> Result<Option<Envelope>, TransportError> {
        let mut flag = 0i32;
        let mut msg: RawMessage = std::ptr::null_mut();
        let mut status = HcclStatus::default();
        check("HcclRawImprobe", unsafe {
            (self.api.improbe)(raw(conn.0), &mut flag, &mut msg, &mut status)
        })?;
        if flag == 0 {
            return Ok(None);
        }
        let mut count = 0i32;
        check("HcclRawGetCount", unsafe {
            (self.api.get_count)(&status, HCCL_DATA_TYPE_INT8, &mut count)
        })?;
        Ok(Some(Envelope {
            message: MessageHandle(msg as usize as u64),
            count: count.max(0) as usize,
        }))
    }

    fn imrecv(&self, envelope: Envelope, dst: &MemRegion) -> Result<RequestHandle, TransportError> {
        let mut msg: RawMessage = raw(envelope.message.0);
        let mut req: RawRequest = std::ptr::null_mut();
        check("HcclRawImrecv", unsafe {
            (self.api.imrecv)(
                region_ptr(dst),
                dst.len() as u64,
                HCCL_DATA_TYPE_INT8,
                &mut msg,
                &mut req,
            )
        })?;
        Ok(RequestHandle(req as usize as u64))
    }

    fn imrecv_scatter(
        &self,
        envelope: Envelope,
        dsts: &[MemRegion],
    ) -> Result<RequestHandle, TransportError> {
        let mut ptrs: Vec<*mut c_void> = dsts.iter().map(region_ptr).collect();
        let counts: Vec<u64> = dsts.iter().map(|d| d.len() as u64).collect();
        let mut msg: RawMessage = raw(envelope.message.0);
        let mut req: RawRequest = std::ptr::null_mut();
        check("HcclRawImrecvScatter", unsafe {
            (self.api.imrecv_scatter)(
                ptrs.as_mut_ptr(),
                counts.as_ptr(),
                dsts.len() as i32,
                HCCL_DATA_TYPE_INT8,
                &mut msg,
                &mut req,
            )
        })?;
        Ok(RequestHandle(req as usize as u64))
    }

    fn test_some(&self, requests: &[RequestHandle]) -> Result<Vec<Completion>, TransportError> {
        let mut reqs: Vec<RawRequest> = requests.iter().map(|r| raw(r.0)).collect();
        let mut indices = vec![0i32; requests.len()];
        let mut statuses = vec![HcclStatus::default(); requests.len()];
        let mut completed = 0i32;
        check("HcclRawTestSome", unsafe {
            (self.api.test_some)(
                reqs.len() as i32,
                reqs.as_mut_ptr(),
                &mut completed,
                indices.as_mut_ptr(),
                statuses.as_mut_ptr(),
            )
        })?;
        Ok((0..completed.max(0) as usize)
            .map(|i| Completion {
                index: indices[i] as usize,
                error: statuses[i].error,
            })
            .collect())
    }

    fn register_memory(&self, addr: u64, len: usize) -> Result<MemHandle, TransportError> {
        let mem = HcclMem {
            mem_type: HCCL_MEM_TYPE_HOST,
            addr: raw(addr),
            size: len as u64,
        };
        let mut handle: *mut c_void = std::ptr::null_mut();
        check("HcclRegisterGlobalMem", unsafe {
            (self.api.register_mem)(&mem, &mut handle)
        })
        .map_err(|e| match e {
            TransportError::Again => TransportError::Failed {
                op: "HcclRegisterGlobalMem",
                code: HCCL_E_AGAIN,
            },
            e => e,
        })?;
        Ok(MemHandle(handle as usize as u64))
    }

    fn unregister_memory(&self, handle: MemHandle) -> Result<(), TransportError> {
        check("HcclUnregisterGlobalMem", unsafe {
            (self.api.unregister_mem)(raw(handle.0))
        })
    }
}
