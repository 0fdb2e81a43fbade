#![allow(unsafe_code)]
//! In-process MQTT5-style client engine.
//!
//! The engine is a loopback broker: published messages are delivered back
//! to the client's own matching subscriptions. What matters for callers
//! is the *shape* of the surface, which follows the real transport
//! libraries this crate stands in for:
//!
//! - construction is synchronous and can fail synchronously;
//! - `connect` resolves asynchronously on an engine thread, success or
//!   failure, via the connection-complete callback;
//! - `publish` captures the payload **pointer**, not the bytes; the
//!   memory must stay valid until the operation-complete callback fires;
//! - `release` drops the caller's reference, and — only if the client was
//!   ever connected — the shutdown callback fires later from an engine
//!   thread. A client whose connect attempt failed gets no shutdown
//!   callback.
//!
//! Endpoints ending in `.invalid`, or containing whitespace, simulate
//! unreachable hosts: `connect` reports `ERROR_CONNECTION_FAILED`.

use std::ffi::{CStr, c_char, c_void};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::{
    ERROR_CONNECTION_FAILED, ERROR_INVALID_ARGUMENT, ERROR_NOT_CONNECTED,
    ERROR_OPERATION_INTERRUPTED, OK, raise_error,
};
use crate::{mem, runtime};

// ---------------------------------------------------------------------------
// Callback types
// ---------------------------------------------------------------------------

/// Resolution of a connect attempt. `error_code` is `0` on success.
pub type OnConnectionComplete = unsafe extern "C" fn(error_code: i32, user_data: *mut c_void);

/// Completion of a publish or unsubscribe.
pub type OnOperationComplete = unsafe extern "C" fn(error_code: i32, user_data: *mut c_void);

/// Completion of a subscribe. `granted_qos` is only valid during the call.
pub type OnSubackComplete = unsafe extern "C" fn(
    error_code: i32,
    granted_qos: *const i32,
    granted_len: usize,
    user_data: *mut c_void,
);

/// An inbound message. `topic` and `payload` are only valid during the call.
pub type OnMessageReceived = unsafe extern "C" fn(
    topic: *const c_char,
    payload: *const u8,
    payload_len: usize,
    qos: i32,
    user_data: *mut c_void,
);

/// Terminal shutdown notification. Fires at most once, after the client
/// has been released, and only if it was ever connected.
pub type OnClientShutdown = unsafe extern "C" fn(user_data: *mut c_void);

// ---------------------------------------------------------------------------
// Options and opaque handle
// ---------------------------------------------------------------------------

/// Construction options for [`tether_mqtt_client_new`].
#[repr(C)]
#[derive(Debug)]
pub struct MqttClientOptions {
    /// Endpoint to "connect" to. Must be a non-empty C string.
    pub endpoint: *const c_char,
    /// Client identifier. May be null (engine assigns nothing).
    pub client_id: *const c_char,
    /// Keep-alive interval in seconds. Stored, not enforced.
    pub keep_alive_secs: u16,
    /// Inbound-message callback.
    pub on_message: Option<OnMessageReceived>,
    /// Terminal shutdown callback.
    pub on_shutdown: Option<OnClientShutdown>,
    /// Opaque pointer passed to client-level callbacks.
    pub user_data: *mut c_void,
}

/// Opaque MQTT client handle.
#[derive(Debug)]
pub struct MqttClient {
    inner: Arc<ClientInner>,
}

#[derive(Debug)]
struct ClientInner {
    endpoint: String,
    #[allow(dead_code)]
    client_id: Option<String>,
    #[allow(dead_code)]
    keep_alive_secs: u16,
    on_message: Option<OnMessageReceived>,
    on_shutdown: Option<OnClientShutdown>,
    user_data: usize,
    state: Mutex<ClientState>,
}

#[derive(Debug, Default)]
struct ClientState {
    phase: Phase,
    subscriptions: Vec<String>,
    ever_connected: bool,
    released: bool,
    shutdown_fired: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Phase {
    #[default]
    Idle,
    Connecting,
    Connected,
    Failed,
    Stopped,
}

impl ClientInner {
    fn state(&self) -> std::sync::MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn footprint(&self) -> u64 {
        (size_of::<Self>() + self.endpoint.len()) as u64
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        mem::on_free(std::ptr::from_ref(self) as usize, self.footprint());
    }
}

fn unreachable_endpoint(endpoint: &str) -> bool {
    endpoint.ends_with(".invalid") || endpoint.chars().any(char::is_whitespace)
}

/// MQTT topic-filter match: `+` matches one level, a trailing `#` matches
/// the remainder.
fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (None, None) => return true,
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            _ => return false,
        }
    }
}

/// Fire the shutdown callback if the client is both released and was ever
/// connected. Idempotent.
fn maybe_fire_shutdown(inner: &Arc<ClientInner>) {
    let fire = {
        let mut state = inner.state();
        if state.released && state.ever_connected && !state.shutdown_fired {
            state.shutdown_fired = true;
            true
        } else {
            false
        }
    };
    if !fire {
        return;
    }
    let inner = Arc::clone(inner);
    runtime::spawn_after(Duration::from_millis(10), move || {
        if let Some(cb) = inner.on_shutdown {
            unsafe { cb(inner.user_data as *mut c_void) };
        }
    });
}

unsafe fn required_str<'a>(p: *const c_char) -> Result<&'a str, i32> {
    if p.is_null() {
        return Err(ERROR_INVALID_ARGUMENT);
    }
    unsafe { CStr::from_ptr(p) }
        .to_str()
        .map_err(|_| ERROR_INVALID_ARGUMENT)
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Create a client. Synchronous; writes the handle to `out` on success.
///
/// # Safety
/// `options` must point at a valid [`MqttClientOptions`] and `out` at a
/// writable pointer slot. String fields must be valid C strings for the
/// duration of the call (the engine copies them).
pub unsafe extern "C" fn tether_mqtt_client_new(
    options: *const MqttClientOptions,
    out: *mut *mut MqttClient,
) -> i32 {
    if options.is_null() || out.is_null() {
        return raise_error(ERROR_INVALID_ARGUMENT);
    }
    let options = unsafe { &*options };
    let endpoint = match unsafe { required_str(options.endpoint) } {
        Ok(s) if !s.is_empty() => s.to_owned(),
        _ => return raise_error(ERROR_INVALID_ARGUMENT),
    };
    let client_id = if options.client_id.is_null() {
        None
    } else {
        match unsafe { required_str(options.client_id) } {
            Ok(s) => Some(s.to_owned()),
            Err(code) => return raise_error(code),
        }
    };

    let inner = Arc::new(ClientInner {
        endpoint,
        client_id,
        keep_alive_secs: options.keep_alive_secs,
        on_message: options.on_message,
        on_shutdown: options.on_shutdown,
        user_data: options.user_data as usize,
        state: Mutex::new(ClientState::default()),
    });
    mem::on_alloc(Arc::as_ptr(&inner) as usize, inner.footprint());
    unsafe { *out = Box::into_raw(Box::new(MqttClient { inner })) };
    OK
}

/// Begin an asynchronous connect attempt. The completion callback fires
/// on an engine thread.
///
/// # Safety
/// `client` must be a live handle from [`tether_mqtt_client_new`].
pub unsafe extern "C" fn tether_mqtt_client_connect(
    client: *mut MqttClient,
    on_complete: Option<OnConnectionComplete>,
    connect_user_data: *mut c_void,
) -> i32 {
    if client.is_null() {
        return raise_error(ERROR_INVALID_ARGUMENT);
    }
    let inner = Arc::clone(&unsafe { &*client }.inner);
    {
        let mut state = inner.state();
        if state.phase != Phase::Idle {
            return raise_error(ERROR_INVALID_ARGUMENT);
        }
        state.phase = Phase::Connecting;
    }

    let user_data = connect_user_data as usize;
    runtime::spawn_after(Duration::from_millis(15), move || {
        let code = {
            let mut state = inner.state();
            if state.phase == Phase::Stopped {
                ERROR_OPERATION_INTERRUPTED
            } else if unreachable_endpoint(&inner.endpoint) {
                state.phase = Phase::Failed;
                ERROR_CONNECTION_FAILED
            } else {
                state.phase = Phase::Connected;
                state.ever_connected = true;
                OK
            }
        };
        if let Some(cb) = on_complete {
            unsafe { cb(code, user_data as *mut c_void) };
        }
        if code == OK {
            // Covers a release that raced the connect attempt.
            maybe_fire_shutdown(&inner);
        }
    });
    OK
}

/// Publish `payload` to `topic`. The payload pointer must remain valid
/// until the completion callback fires; the engine reads it on the
/// delivery thread, not during this call.
///
/// # Safety
/// `client` must be live; `topic` must be a valid C string; `payload`
/// must point at `payload_len` readable bytes until completion (it may be
/// null only when `payload_len` is zero).
pub unsafe extern "C" fn tether_mqtt_client_publish(
    client: *mut MqttClient,
    topic: *const c_char,
    payload: *const u8,
    payload_len: usize,
    qos: i32,
    on_complete: Option<OnOperationComplete>,
    op_user_data: *mut c_void,
) -> i32 {
    if client.is_null() || (payload.is_null() && payload_len != 0) {
        return raise_error(ERROR_INVALID_ARGUMENT);
    }
    let topic = match unsafe { required_str(topic) } {
        Ok(s) => s.to_owned(),
        Err(code) => return raise_error(code),
    };
    let inner = Arc::clone(&unsafe { &*client }.inner);
    if inner.state().phase != Phase::Connected {
        return raise_error(ERROR_NOT_CONNECTED);
    }

    let payload_addr = payload as usize;
    let user_data = op_user_data as usize;
    runtime::spawn_after(Duration::from_millis(8), move || {
        let (code, deliver) = {
            let state = inner.state();
            if state.phase == Phase::Connected {
                let deliver = state
                    .subscriptions
                    .iter()
                    .any(|f| topic_matches(f, &topic));
                (OK, deliver)
            } else {
                (ERROR_OPERATION_INTERRUPTED, false)
            }
        };
        if deliver {
            if let Some(cb) = inner.on_message {
                // The payload is read here, on the delivery thread.
                // Submitters must have kept it alive.
                let bytes: &[u8] = if payload_len == 0 {
                    &[]
                } else {
                    unsafe { std::slice::from_raw_parts(payload_addr as *const u8, payload_len) }
                };
                let c_topic = std::ffi::CString::new(topic.clone()).unwrap_or_default();
                unsafe {
                    cb(
                        c_topic.as_ptr(),
                        bytes.as_ptr(),
                        bytes.len(),
                        qos,
                        inner.user_data as *mut c_void,
                    );
                }
            }
        }
        if let Some(cb) = on_complete {
            unsafe { cb(code, user_data as *mut c_void) };
        }
    });
    OK
}

/// Subscribe to `filter`. The filter takes effect immediately; the suback
/// callback fires later on an engine thread.
///
/// # Safety
/// `client` must be live; `filter` must be a valid C string.
pub unsafe extern "C" fn tether_mqtt_client_subscribe(
    client: *mut MqttClient,
    filter: *const c_char,
    qos: i32,
    on_suback: Option<OnSubackComplete>,
    op_user_data: *mut c_void,
) -> i32 {
    if client.is_null() {
        return raise_error(ERROR_INVALID_ARGUMENT);
    }
    let filter = match unsafe { required_str(filter) } {
        Ok(s) => s.to_owned(),
        Err(code) => return raise_error(code),
    };
    let inner = Arc::clone(&unsafe { &*client }.inner);
    {
        let mut state = inner.state();
        if state.phase != Phase::Connected {
            return raise_error(ERROR_NOT_CONNECTED);
        }
        if !state.subscriptions.contains(&filter) {
            state.subscriptions.push(filter);
        }
    }

    let user_data = op_user_data as usize;
    runtime::spawn_after(Duration::from_millis(5), move || {
        let code = if inner.state().phase == Phase::Connected {
            OK
        } else {
            ERROR_OPERATION_INTERRUPTED
        };
        if let Some(cb) = on_suback {
            let granted = [qos];
            unsafe { cb(code, granted.as_ptr(), granted.len(), user_data as *mut c_void) };
        }
    });
    OK
}

/// Unsubscribe from `filter`.
///
/// # Safety
/// `client` must be live; `filter` must be a valid C string.
pub unsafe extern "C" fn tether_mqtt_client_unsubscribe(
    client: *mut MqttClient,
    filter: *const c_char,
    on_complete: Option<OnOperationComplete>,
    op_user_data: *mut c_void,
) -> i32 {
    if client.is_null() {
        return raise_error(ERROR_INVALID_ARGUMENT);
    }
    let filter = match unsafe { required_str(filter) } {
        Ok(s) => s.to_owned(),
        Err(code) => return raise_error(code),
    };
    let inner = Arc::clone(&unsafe { &*client }.inner);
    {
        let mut state = inner.state();
        if state.phase != Phase::Connected {
            return raise_error(ERROR_NOT_CONNECTED);
        }
        state.subscriptions.retain(|f| f != &filter);
    }

    let user_data = op_user_data as usize;
    runtime::spawn_after(Duration::from_millis(5), move || {
        let code = if inner.state().phase == Phase::Connected {
            OK
        } else {
            ERROR_OPERATION_INTERRUPTED
        };
        if let Some(cb) = on_complete {
            unsafe { cb(code, user_data as *mut c_void) };
        }
    });
    OK
}

/// Stop the client. In-flight operations complete with
/// `ERROR_OPERATION_INTERRUPTED`; the client cannot be reconnected.
///
/// # Safety
/// `client` must be a live handle.
pub unsafe extern "C" fn tether_mqtt_client_stop(client: *mut MqttClient) -> i32 {
    if client.is_null() {
        return raise_error(ERROR_INVALID_ARGUMENT);
    }
    let inner = &unsafe { &*client }.inner;
    let mut state = inner.state();
    if matches!(state.phase, Phase::Connecting | Phase::Connected) {
        state.phase = Phase::Stopped;
    }
    OK
}

/// Release the caller's reference. The handle pointer is invalid after
/// this call. If the client was ever connected, the shutdown callback
/// will fire later on an engine thread.
///
/// # Safety
/// `client` must be a live handle; it must not be used afterwards.
pub unsafe extern "C" fn tether_mqtt_client_release(client: *mut MqttClient) {
    if client.is_null() {
        return;
    }
    let boxed = unsafe { Box::from_raw(client) };
    boxed.inner.state().released = true;
    maybe_fire_shutdown(&boxed.inner);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;
    use std::sync::mpsc;

    fn make_client(endpoint: &str) -> *mut MqttClient {
        let c_endpoint = std::ffi::CString::new(endpoint).expect("endpoint");
        let options = MqttClientOptions {
            endpoint: c_endpoint.as_ptr(),
            client_id: ptr::null(),
            keep_alive_secs: 30,
            on_message: None,
            on_shutdown: None,
            user_data: ptr::null_mut(),
        };
        let mut out: *mut MqttClient = ptr::null_mut();
        assert_eq!(unsafe { tether_mqtt_client_new(&options, &mut out) }, OK);
        out
    }

    unsafe extern "C" fn send_code(code: i32, user_data: *mut c_void) {
        let tx = unsafe { &*user_data.cast::<mpsc::Sender<i32>>() };
        let _ = tx.send(code);
    }

    #[test]
    fn topic_filters() {
        assert!(topic_matches("a/b", "a/b"));
        assert!(topic_matches("a/+", "a/b"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(!topic_matches("a/b", "a/c"));
    }

    #[test]
    fn connect_succeeds_on_reachable_endpoint() {
        let client = make_client("broker.example:8883");
        let (tx, rx) = mpsc::channel::<i32>();
        let tx = Box::into_raw(Box::new(tx));
        let rc = unsafe {
            tether_mqtt_client_connect(client, Some(send_code), tx.cast())
        };
        assert_eq!(rc, OK);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(OK));
        drop(unsafe { Box::from_raw(tx) });
        unsafe { tether_mqtt_client_release(client) };
    }

    #[test]
    fn connect_fails_on_unreachable_endpoint() {
        let client = make_client("broker.invalid");
        let (tx, rx) = mpsc::channel::<i32>();
        let tx = Box::into_raw(Box::new(tx));
        let rc = unsafe {
            tether_mqtt_client_connect(client, Some(send_code), tx.cast())
        };
        assert_eq!(rc, OK);
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)),
            Ok(ERROR_CONNECTION_FAILED)
        );
        drop(unsafe { Box::from_raw(tx) });
        unsafe { tether_mqtt_client_release(client) };
    }

    #[test]
    fn publish_requires_connection() {
        let client = make_client("broker.example:8883");
        let topic = std::ffi::CString::new("t").expect("topic");
        let rc = unsafe {
            tether_mqtt_client_publish(client, topic.as_ptr(), ptr::null(), 0, 0, None, ptr::null_mut())
        };
        assert_eq!(rc, crate::error::OP_ERR);
        assert_eq!(crate::error::last_error(), ERROR_NOT_CONNECTED);
        unsafe { tether_mqtt_client_release(client) };
    }
}
