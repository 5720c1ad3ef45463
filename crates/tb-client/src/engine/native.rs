//! Engine backed by the `tb_client` C library
//!
//! The library owns the packet pool and the completion thread. The request id
//! travels in the packet's `user_data` word; the submission is parked in a map
//! keyed by packet address until its completion has been dispatched, which
//! keeps the request bytes alive while the library may read them.

#![allow(non_camel_case_types)]

use crate::config::ClientConfig;
use crate::correlation::RequestId;
use crate::engine::{AcquireError, Completion, CompletionSink, Engine, Packet, Submission};
use crate::error::InitError;
use crate::operation::{Operation, PacketStatus};
use dashmap::DashMap;
use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

// =============================================================================
// C ABI
// =============================================================================

type tb_client_t = *mut c_void;

#[repr(C)]
struct tb_packet_t {
    next: *mut tb_packet_t,
    user_data: *mut c_void,
    operation: u8,
    status: u8,
    data_size: u32,
    data: *mut c_void,
    batch_next: *mut tb_packet_t,
    batch_tail: *mut tb_packet_t,
    batch_size: u32,
    reserved: [u8; 8],
}

type on_completion_fn =
    extern "C" fn(context: usize, client: tb_client_t, packet: *mut tb_packet_t, result: *const u8, result_len: u32);

const PACKET_ACQUIRE_OK: u32 = 0;
const PACKET_ACQUIRE_CONCURRENCY_MAX_EXCEEDED: u32 = 1;

#[link(name = "tb_client")]
#[allow(improper_ctypes)]
extern "C" {
    fn tb_client_init(
        out_client: *mut tb_client_t,
        cluster_id: u128,
        address_ptr: *const u8,
        address_len: u32,
        packets_count: u32,
        on_completion_ctx: usize,
        on_completion: on_completion_fn,
    ) -> u32;

    fn tb_client_acquire_packet(client: tb_client_t, out_packet: *mut *mut tb_packet_t) -> u32;

    fn tb_client_release_packet(client: tb_client_t, packet: *mut tb_packet_t);

    fn tb_client_submit(client: tb_client_t, packet: *mut tb_packet_t);

    fn tb_client_deinit(client: tb_client_t);
}

// =============================================================================
// Engine
// =============================================================================

/// State shared with the completion callback through the context word
struct CallbackContext {
    sink: Arc<dyn CompletionSink>,
    in_flight: DashMap<usize, Submission>,
}

/// No options beyond [`ClientConfig`]
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeOptions;

/// Engine driving the native client library
pub struct NativeEngine {
    client: tb_client_t,
    context: *mut CallbackContext,
    closed: AtomicBool,
}

// The library serializes access to its client internally; the context is only
// read through shared references.
unsafe impl Send for NativeEngine {}
unsafe impl Sync for NativeEngine {}

impl NativeEngine {
    fn context(&self) -> &CallbackContext {
        // Valid from init until drop.
        unsafe { &*self.context }
    }
}

impl Engine for NativeEngine {
    type Options = NativeOptions;

    fn init(
        config: &ClientConfig,
        _options: NativeOptions,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<Self, InitError> {
        let addresses = config.address_list();
        let address_len = u32::try_from(addresses.len()).map_err(|_| InitError::AddressLimitExceeded)?;

        let context = Box::into_raw(Box::new(CallbackContext {
            sink,
            in_flight: DashMap::with_capacity(config.concurrency_max as usize),
        }));

        let mut client: tb_client_t = ptr::null_mut();
        let status = unsafe {
            tb_client_init(
                &mut client,
                config.cluster_id,
                addresses.as_ptr(),
                address_len,
                config.concurrency_max,
                context as usize,
                on_completion,
            )
        };

        if let Some(error) = InitError::from_status(status) {
            // Never handed to a live client.
            drop(unsafe { Box::from_raw(context) });
            tracing::error!(%error, addresses = %addresses, "tb_client_init failed");
            return Err(error);
        }

        tracing::info!(
            cluster_id = %config.cluster_id,
            addresses = %addresses,
            concurrency_max = config.concurrency_max,
            "native engine initialized"
        );

        Ok(Self {
            client,
            context,
            closed: AtomicBool::new(false),
        })
    }

    fn acquire_packet(&self) -> Result<Packet, AcquireError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AcquireError::Shutdown);
        }
        let mut packet: *mut tb_packet_t = ptr::null_mut();
        match unsafe { tb_client_acquire_packet(self.client, &mut packet) } {
            PACKET_ACQUIRE_OK if !packet.is_null() => Ok(Packet::from_raw(packet as usize)),
            PACKET_ACQUIRE_CONCURRENCY_MAX_EXCEEDED => Err(AcquireError::ConcurrencyExceeded),
            _ => Err(AcquireError::Shutdown),
        }
    }

    fn release_packet(&self, packet: Packet) {
        // After deinit the pool is gone with the client.
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        unsafe { tb_client_release_packet(self.client, packet.raw() as *mut tb_packet_t) }
    }

    fn submit(&self, packet: Packet, submission: Submission) {
        let raw = packet.raw() as *mut tb_packet_t;
        let Ok(data_size) = u32::try_from(submission.data.len()) else {
            // The library cannot carry it; answer here so the caller never hangs.
            tracing::error!(request_id = %submission.request_id, "request body exceeds u32");
            self.context().sink.on_completion(Completion {
                packet,
                request_id: submission.request_id,
                operation: submission.operation,
                status: PacketStatus::TooMuchData,
                request_len: submission.data.len(),
                result: &[],
            });
            return;
        };

        unsafe {
            (*raw).next = ptr::null_mut();
            (*raw).user_data = submission.request_id.raw() as usize as *mut c_void;
            (*raw).operation = submission.operation.code();
            (*raw).status = PacketStatus::Ok.to_raw();
            (*raw).data_size = data_size;
            (*raw).data = submission.data.as_ptr() as *mut c_void;
        }

        // Parked before submit: the completion may fire before submit returns.
        self.context().in_flight.insert(packet.raw(), submission);
        unsafe { tb_client_submit(self.client, raw) }
    }

    fn deinit(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        unsafe { tb_client_deinit(self.client) }
        tracing::info!("native engine deinitialized");
    }
}

impl Drop for NativeEngine {
    fn drop(&mut self) {
        self.deinit();
        // No callbacks after deinit returns.
        drop(unsafe { Box::from_raw(self.context) });
    }
}

extern "C" fn on_completion(
    context: usize,
    _client: tb_client_t,
    packet: *mut tb_packet_t,
    result: *const u8,
    result_len: u32,
) {
    let outcome = catch_unwind(AssertUnwindSafe(|| unsafe {
        complete(context, packet, result, result_len)
    }));
    if outcome.is_err() {
        // Unwinding into the library's thread is undefined behaviour.
        tracing::error!("panic in completion callback");
        std::process::abort();
    }
}

unsafe fn complete(context: usize, packet: *mut tb_packet_t, result: *const u8, result_len: u32) {
    let context = &*(context as *const CallbackContext);
    let header = &*packet;

    let submission = context.in_flight.remove(&(packet as usize)).map(|(_, s)| s);
    let result = if result.is_null() || result_len == 0 {
        &[][..]
    } else {
        std::slice::from_raw_parts(result, result_len as usize)
    };

    context.sink.on_completion(Completion {
        packet: Packet::from_raw(packet as usize),
        request_id: RequestId::from_raw(header.user_data as usize as u64),
        operation: Operation::from_raw(header.operation),
        status: PacketStatus::from_raw(header.status),
        request_len: header.data_size as usize,
        result,
    });

    drop(submission);
}
