//! LV2 Worker extension support.
//!
//! Provides the `worker:schedule` feature so plugins can offload
//! non-realtime work. The plugin's `run()` calls `schedule_work`, which
//! frames the payload into a request ring; a dedicated thread drains the
//! ring, calls the plugin's `work()`, and responses travel back through a
//! second ring to be delivered from the process cycle via
//! `work_response()`.
//!
//! Two-phase construction: [`WorkerLink::new`] creates the rings and the
//! schedule feature before instantiation; [`WorkerLink::activate`] starts
//! the thread once the plugin's worker interface is known.

use std::ffi::{c_void, CStr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use lv2_raw::core::LV2Feature;

use crate::ring::RingBuffer;

pub const LV2_WORKER_SCHEDULE_URI: &CStr = c"http://lv2plug.in/ns/ext/worker#schedule";
pub const LV2_WORKER_INTERFACE_URI: &str = "http://lv2plug.in/ns/ext/worker#interface";

/// Capacity of each of the request and response rings.
pub const WORKER_RING_SIZE: usize = 8192;

const LENGTH_PREFIX: usize = std::mem::size_of::<u32>();
const POLL_INTERVAL: Duration = Duration::from_millis(1);
const DISCARD_CHUNK: usize = 256;

pub type Lv2WorkerStatus = u32;
pub const LV2_WORKER_SUCCESS: Lv2WorkerStatus = 0;
pub const LV2_WORKER_ERR_UNKNOWN: Lv2WorkerStatus = 1;
pub const LV2_WORKER_ERR_NO_SPACE: Lv2WorkerStatus = 2;

pub type Lv2WorkerRespondHandle = *mut c_void;
pub type Lv2WorkerRespondFunction = unsafe extern "C" fn(
    handle: Lv2WorkerRespondHandle,
    size: u32,
    data: *const c_void,
) -> Lv2WorkerStatus;

/// Host-provided feature struct, as in lv2/worker/worker.h.
#[repr(C)]
pub struct Lv2WorkerSchedule {
    pub handle: *mut c_void,
    pub schedule_work: unsafe extern "C" fn(
        handle: *mut c_void,
        size: u32,
        data: *const c_void,
    ) -> Lv2WorkerStatus,
}

/// Plugin-provided interface retrieved via `extension_data`.
#[repr(C)]
pub struct Lv2WorkerInterface {
    pub work: unsafe extern "C" fn(
        instance: *mut c_void,
        respond: Lv2WorkerRespondFunction,
        handle: Lv2WorkerRespondHandle,
        size: u32,
        data: *const c_void,
    ) -> Lv2WorkerStatus,
    pub work_response: unsafe extern "C" fn(
        instance: *mut c_void,
        size: u32,
        body: *const c_void,
    ) -> Lv2WorkerStatus,
    pub end_run: Option<unsafe extern "C" fn(instance: *mut c_void) -> Lv2WorkerStatus>,
}

struct WorkerShared {
    requests: RingBuffer,
    responses: RingBuffer,
    running: AtomicBool,
    no_space: AtomicU32,
}

/// Pre-instantiation half: rings plus the schedule feature. Exists for
/// every instance, whether or not the plugin turns out to have a worker
/// interface, because the feature must be on the table before
/// `instantiate`.
pub struct WorkerLink {
    shared: Arc<WorkerShared>,
    schedule: Box<Lv2WorkerSchedule>,
}

impl WorkerLink {
    pub fn new() -> Self {
        let shared = Arc::new(WorkerShared {
            requests: RingBuffer::new(WORKER_RING_SIZE),
            responses: RingBuffer::new(WORKER_RING_SIZE),
            running: AtomicBool::new(false),
            no_space: AtomicU32::new(0),
        });
        let schedule = Box::new(Lv2WorkerSchedule {
            handle: Arc::as_ptr(&shared) as *mut c_void,
            schedule_work: schedule_work_callback,
        });
        Self { shared, schedule }
    }

    /// The `worker:schedule` feature to put on the feature table.
    pub fn schedule_feature(&self) -> LV2Feature {
        LV2Feature {
            uri: LV2_WORKER_SCHEDULE_URI.as_ptr(),
            data: (&*self.schedule as *const Lv2WorkerSchedule)
                .cast_mut()
                .cast::<c_void>(),
        }
    }

    /// Requests dropped because the request ring was full.
    pub fn no_space_count(&self) -> u32 {
        self.shared.no_space.load(Ordering::Relaxed)
    }

    /// Start the worker thread for a plugin that exposes
    /// `worker:interface`.
    ///
    /// # Safety
    /// `lv2_handle` and `iface` must stay valid until the returned
    /// [`Worker`] is stopped (the owning instance joins it before freeing
    /// the plugin).
    pub unsafe fn activate(
        &self,
        lv2_handle: *mut c_void,
        iface: *const Lv2WorkerInterface,
    ) -> Worker {
        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        // Raw pointers cross the thread boundary as integers; the safety
        // contract above keeps them alive.
        let thread_handle = lv2_handle as usize;
        let thread_iface = iface as usize;
        let thread = thread::Builder::new()
            .name("pedalgrid-worker".to_string())
            .spawn(move || {
                worker_thread_main(
                    shared,
                    thread_handle as *mut c_void,
                    thread_iface as *const Lv2WorkerInterface,
                );
            })
            .expect("failed to spawn LV2 worker thread");

        Worker {
            shared: Arc::clone(&self.shared),
            lv2_handle,
            iface,
            scratch: vec![0u8; WORKER_RING_SIZE],
            thread: Some(thread),
        }
    }
}

impl Default for WorkerLink {
    fn default() -> Self {
        Self::new()
    }
}

// The schedule handle is only dereferenced by the plugin's RT thread while
// the owning instance (and therefore the Arc) is alive.
unsafe impl Send for WorkerLink {}

/// Active worker thread for one plugin instance.
pub struct Worker {
    shared: Arc<WorkerShared>,
    lv2_handle: *mut c_void,
    iface: *const Lv2WorkerInterface,
    scratch: Vec<u8>,
    thread: Option<thread::JoinHandle<()>>,
}

// lv2_handle and iface are only used from the thread that calls process()
// and from the worker thread, both of which the owning instance outlives.
unsafe impl Send for Worker {}

impl Worker {
    /// Deliver pending responses to the plugin. Called from the process
    /// thread after `run()`; never blocks and never allocates.
    ///
    /// A response larger than the scratch buffer is read and discarded in
    /// bounded chunks; the ring cannot be rewound.
    ///
    /// # Safety
    /// Must be called from the same thread that calls the plugin's
    /// `run()`, while the instance is alive.
    pub unsafe fn drain_responses(&mut self) {
        let iface = unsafe { &*self.iface };
        let mut size_buf = [0u8; LENGTH_PREFIX];
        loop {
            if self.shared.responses.read_space() < LENGTH_PREFIX {
                break;
            }
            self.shared.responses.peek(&mut size_buf);
            let size = u32::from_ne_bytes(size_buf) as usize;
            if self.shared.responses.read_space() < LENGTH_PREFIX + size {
                break;
            }
            self.shared.responses.skip(LENGTH_PREFIX);

            if size <= self.scratch.len() {
                self.shared.responses.read(&mut self.scratch[..size]);
                unsafe {
                    (iface.work_response)(
                        self.lv2_handle,
                        size as u32,
                        self.scratch.as_ptr().cast::<c_void>(),
                    );
                }
            } else {
                let mut remaining = size;
                let mut chunk = [0u8; DISCARD_CHUNK];
                while remaining > 0 {
                    let n = remaining.min(DISCARD_CHUNK);
                    self.shared.responses.read(&mut chunk[..n]);
                    remaining -= n;
                }
            }
        }
        if let Some(end_run) = iface.end_run {
            unsafe {
                end_run(self.lv2_handle);
            }
        }
    }

    /// Signal the thread and join it. The thread observes the flag within
    /// one poll period.
    pub fn stop(&mut self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Called by the plugin from inside `run()`. Writes one length-prefixed
/// frame; never blocks, never allocates.
unsafe extern "C" fn schedule_work_callback(
    handle: *mut c_void,
    size: u32,
    data: *const c_void,
) -> Lv2WorkerStatus {
    if handle.is_null() || (size > 0 && data.is_null()) {
        return LV2_WORKER_ERR_UNKNOWN;
    }
    let shared = unsafe { &*(handle as *const WorkerShared) };
    let total = LENGTH_PREFIX + size as usize;
    if shared.requests.write_space() < total {
        shared.no_space.fetch_add(1, Ordering::Relaxed);
        return LV2_WORKER_ERR_NO_SPACE;
    }
    shared.requests.write(&size.to_ne_bytes());
    if size > 0 {
        let payload = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), size as usize) };
        shared.requests.write(payload);
    }
    LV2_WORKER_SUCCESS
}

struct RespondContext<'a> {
    responses: &'a RingBuffer,
}

/// Passed to the plugin's `work()` so it can queue a response for the
/// next process cycle.
unsafe extern "C" fn respond_callback(
    handle: Lv2WorkerRespondHandle,
    size: u32,
    data: *const c_void,
) -> Lv2WorkerStatus {
    if handle.is_null() || (size > 0 && data.is_null()) {
        return LV2_WORKER_ERR_UNKNOWN;
    }
    let ctx = unsafe { &*(handle as *const RespondContext) };
    let total = LENGTH_PREFIX + size as usize;
    if ctx.responses.write_space() < total {
        return LV2_WORKER_ERR_NO_SPACE;
    }
    ctx.responses.write(&size.to_ne_bytes());
    if size > 0 {
        let payload = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), size as usize) };
        ctx.responses.write(payload);
    }
    LV2_WORKER_SUCCESS
}

fn worker_thread_main(
    shared: Arc<WorkerShared>,
    lv2_handle: *mut c_void,
    iface: *const Lv2WorkerInterface,
) {
    let mut payload = vec![0u8; WORKER_RING_SIZE];
    let mut size_buf = [0u8; LENGTH_PREFIX];

    while shared.running.load(Ordering::Acquire) {
        if shared.requests.read_space() < LENGTH_PREFIX {
            thread::sleep(POLL_INTERVAL);
            continue;
        }
        shared.requests.peek(&mut size_buf);
        let size = u32::from_ne_bytes(size_buf) as usize;
        if shared.requests.read_space() < LENGTH_PREFIX + size {
            // The producer is mid-frame; the tail arrives momentarily.
            continue;
        }
        shared.requests.skip(LENGTH_PREFIX);
        shared.requests.read(&mut payload[..size]);

        let ctx = RespondContext {
            responses: &shared.responses,
        };
        unsafe {
            ((*iface).work)(
                lv2_handle,
                respond_callback,
                (&ctx as *const RespondContext).cast_mut().cast::<c_void>(),
                size as u32,
                if size == 0 {
                    std::ptr::null()
                } else {
                    payload.as_ptr().cast::<c_void>()
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Stand-in for a plugin with a worker interface: `work` echoes the
    /// payload back through `respond`, `work_response` records it.
    struct EchoSink {
        responses: Mutex<Vec<Vec<u8>>>,
        end_runs: AtomicU32,
    }

    unsafe extern "C" fn echo_work(
        _instance: *mut c_void,
        respond: Lv2WorkerRespondFunction,
        handle: Lv2WorkerRespondHandle,
        size: u32,
        data: *const c_void,
    ) -> Lv2WorkerStatus {
        unsafe { respond(handle, size, data) }
    }

    unsafe extern "C" fn echo_work_response(
        instance: *mut c_void,
        size: u32,
        body: *const c_void,
    ) -> Lv2WorkerStatus {
        let sink = unsafe { &*(instance as *const EchoSink) };
        let bytes = unsafe { std::slice::from_raw_parts(body.cast::<u8>(), size as usize) };
        sink.responses.lock().unwrap().push(bytes.to_vec());
        LV2_WORKER_SUCCESS
    }

    unsafe extern "C" fn echo_end_run(instance: *mut c_void) -> Lv2WorkerStatus {
        let sink = unsafe { &*(instance as *const EchoSink) };
        sink.end_runs.fetch_add(1, Ordering::Relaxed);
        LV2_WORKER_SUCCESS
    }

    const ECHO_IFACE: Lv2WorkerInterface = Lv2WorkerInterface {
        work: echo_work,
        work_response: echo_work_response,
        end_run: Some(echo_end_run),
    };

    fn schedule(link: &WorkerLink, payload: &[u8]) -> Lv2WorkerStatus {
        let feature = link.schedule_feature();
        let schedule = feature.data as *const Lv2WorkerSchedule;
        unsafe {
            ((*schedule).schedule_work)(
                (*schedule).handle,
                payload.len() as u32,
                payload.as_ptr().cast::<c_void>(),
            )
        }
    }

    #[test]
    fn work_request_roundtrips_to_response() {
        let sink = Box::new(EchoSink {
            responses: Mutex::new(Vec::new()),
            end_runs: AtomicU32::new(0),
        });
        let link = WorkerLink::new();
        assert_eq!(schedule(&link, &[1, 2, 3, 4]), LV2_WORKER_SUCCESS);

        let mut worker =
            unsafe { link.activate((&*sink as *const EchoSink) as *mut c_void, &ECHO_IFACE) };

        // Wait for the worker thread to move the request to the response
        // ring, then drain like a process cycle would.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            unsafe { worker.drain_responses() };
            if !sink.responses.lock().unwrap().is_empty() {
                break;
            }
            assert!(Instant::now() < deadline, "worker never responded");
            thread::sleep(Duration::from_millis(1));
        }

        assert_eq!(sink.responses.lock().unwrap()[0], vec![1, 2, 3, 4]);
        assert!(sink.end_runs.load(Ordering::Relaxed) > 0);
        worker.stop();
    }

    #[test]
    fn saturated_request_ring_reports_no_space() {
        let link = WorkerLink::new();
        // No worker thread draining, so the ring fills up.
        let payload = [0u8; 1024];
        let mut saw_no_space = false;
        for _ in 0..20 {
            if schedule(&link, &payload) == LV2_WORKER_ERR_NO_SPACE {
                saw_no_space = true;
                break;
            }
        }
        assert!(saw_no_space);
        assert!(link.no_space_count() > 0);
        // Subsequent attempts keep failing without blocking.
        assert_eq!(schedule(&link, &payload), LV2_WORKER_ERR_NO_SPACE);
    }

    #[test]
    fn stop_joins_within_poll_period() {
        let sink = Box::new(EchoSink {
            responses: Mutex::new(Vec::new()),
            end_runs: AtomicU32::new(0),
        });
        let link = WorkerLink::new();
        let mut worker =
            unsafe { link.activate((&*sink as *const EchoSink) as *mut c_void, &ECHO_IFACE) };
        let start = Instant::now();
        worker.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
        // Idempotent.
        worker.stop();
    }

    #[test]
    fn oversized_response_is_discarded_not_delivered() {
        let sink = Box::new(EchoSink {
            responses: Mutex::new(Vec::new()),
            end_runs: AtomicU32::new(0),
        });
        let link = WorkerLink::new();
        // Shrink the scratch below the frame size to exercise the
        // discard path.
        link.shared.responses.write(&6u32.to_ne_bytes());
        link.shared.responses.write(&[7u8; 6]);
        let mut worker =
            unsafe { link.activate((&*sink as *const EchoSink) as *mut c_void, &ECHO_IFACE) };
        worker.scratch = vec![0u8; 4];
        unsafe { worker.drain_responses() };
        assert!(sink.responses.lock().unwrap().is_empty());
        assert_eq!(link.shared.responses.read_space(), 0);
        worker.stop();
    }
}
