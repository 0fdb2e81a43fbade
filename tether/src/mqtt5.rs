#![allow(unsafe_code)]
//! MQTT5 client binding.
//!
//! The user-facing [`Mqtt5Client`] owns a capsule whose pointer is the
//! shared binding record, not the native client; the record holds the
//! native pointer, the reference set the callbacks need, and the
//! release/shutdown gate. The record is freed by whichever terminal
//! event — handle destruction or native shutdown callback — happens
//! last.
//!
//! Callback threading: every trampoline enters the host lock and returns
//! silently once the runtime is tearing down. Event handlers run under
//! the host lock, so they must not call back into binding surfaces or
//! drop the client from inside the callback.

use std::ffi::{CStr, CString, c_void};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tether_core::mqtt as native;

use crate::capsule::{Bound, Capsule, native_of};
use crate::error::{self, Error, Result};
use crate::handshake::{self, HandshakeTransform};
use crate::headers::Request;
use crate::lifecycle::{self, SharedState};
use crate::lock::HostRuntime;
use crate::refs::{CompletionToken, Observed, PendingCallback};

/// Capsule tag for MQTT5 client bindings.
pub const MQTT5_CLIENT_TAG: &str = "Mqtt5Client";

/// Quality-of-service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Qos {
    /// Fire and forget.
    AtMostOnce = 0,
    /// Acknowledged delivery.
    AtLeastOnce = 1,
    /// Exactly-once delivery.
    ExactlyOnce = 2,
}

impl Qos {
    /// Convert from the wire `i32`. Returns `None` for unknown values.
    #[must_use]
    pub fn from_raw(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::AtMostOnce),
            1 => Some(Self::AtLeastOnce),
            2 => Some(Self::ExactlyOnce),
            _ => None,
        }
    }
}

/// An inbound publish, borrowed for the duration of the event call.
#[derive(Debug)]
pub struct PublishReceived<'a> {
    /// Topic the message arrived on.
    pub topic: &'a str,
    /// Payload bytes.
    pub payload: &'a [u8],
    /// Delivery QoS.
    pub qos: Qos,
}

/// Liveness events dispatched to the user's wrapper object.
///
/// The binding observes the wrapper weakly: a collected wrapper silently
/// stops receiving events without keeping itself alive. Handlers run
/// under the host lock — do not call binding surfaces or drop handles
/// from inside them. Errors are routed to the unraisable sink.
pub trait Mqtt5Events: Send + Sync {
    /// A message arrived on a subscribed topic.
    fn on_message(&self, publish: &PublishReceived<'_>) -> Result<()>;
}

/// Construction options for [`Mqtt5Client::new`].
pub struct Mqtt5Options {
    /// Endpoint to connect to.
    pub endpoint: String,
    /// Client identifier.
    pub client_id: Option<String>,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u16,
    /// Optional transform run over the upgrade handshake request before
    /// each connect attempt.
    pub handshake_transform: Option<HandshakeTransform>,
}

impl std::fmt::Debug for Mqtt5Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mqtt5Options")
            .field("endpoint", &self.endpoint)
            .field("client_id", &self.client_id)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("has_transform", &self.handshake_transform.is_some())
            .finish()
    }
}

impl Mqtt5Options {
    /// Options for `endpoint` with defaults elsewhere.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client_id: None,
            keep_alive_secs: 60,
            handshake_transform: None,
        }
    }
}

/// Binding record body shared between the capsule destructor and the
/// native shutdown callback.
struct ClientBody {
    /// Native client; null during partial construction and after the
    /// record has handed the pointer back to the engine.
    native: AtomicPtr<native::MqttClient>,
    /// Bracketing dependency: the runtime must out-live the record.
    host: Arc<HostRuntime>,
    endpoint: String,
    /// Strong until terminal; dispatched exactly once.
    on_shutdown: PendingCallback<()>,
    /// Strong from submission to single dispatch.
    connect_pending: PendingCallback<i32>,
    /// Strong until terminal.
    transform: Mutex<Option<HandshakeTransform>>,
    /// The user's wrapper, observed weakly.
    events: Observed<dyn Mqtt5Events>,
}

impl std::fmt::Debug for ClientBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBody")
            .field("endpoint", &self.endpoint)
            .field("connected_pending", &self.connect_pending.is_pending())
            .finish()
    }
}

type ClientRecord = SharedState<ClientBody>;

/// An MQTT5 client bound to the native engine.
#[derive(Debug)]
pub struct Mqtt5Client {
    capsule: Capsule,
    host: Arc<HostRuntime>,
}

impl Bound for Mqtt5Client {
    fn binding(&self) -> Option<&Capsule> {
        Some(&self.capsule)
    }
}

fn to_c_string(s: &str) -> Result<CString> {
    CString::new(s).map_err(|_| Error::InvalidArgument("string contains NUL".into()))
}

impl Mqtt5Client {
    /// Create a client. The native resource is constructed synchronously;
    /// connecting is a separate, asynchronous step.
    ///
    /// `events` is observed weakly — dropping the wrapper stops event
    /// dispatch without leaking the client. `on_shutdown` is held
    /// strongly until the terminal shutdown callback and runs exactly
    /// once, only for clients that connected.
    pub fn new(
        host: &Arc<HostRuntime>,
        options: Mqtt5Options,
        events: &Arc<dyn Mqtt5Events>,
        on_shutdown: impl FnOnce() + Send + 'static,
    ) -> Result<Self> {
        let _guard = host.enter().ok_or(Error::HostDown)?;

        let c_endpoint = to_c_string(&options.endpoint)?;
        let c_client_id = options.client_id.as_deref().map(to_c_string).transpose()?;

        let raw = SharedState::into_shared(ClientBody {
            native: AtomicPtr::new(ptr::null_mut()),
            host: Arc::clone(host),
            endpoint: options.endpoint,
            on_shutdown: PendingCallback::new(move |()| on_shutdown()),
            connect_pending: PendingCallback::empty(),
            transform: Mutex::new(options.handshake_transform),
            events: Observed::new(events),
        });

        let native_options = native::MqttClientOptions {
            endpoint: c_endpoint.as_ptr(),
            client_id: c_client_id.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
            keep_alive_secs: options.keep_alive_secs,
            on_message: Some(message_trampoline),
            on_shutdown: Some(shutdown_trampoline),
            user_data: raw.cast::<c_void>(),
        };

        let mut native_out: *mut native::MqttClient = ptr::null_mut();
        let rc = unsafe { native::tether_mqtt_client_new(&native_options, &raw mut native_out) };
        if rc != tether_core::OK {
            // Synchronous construction failure: no callbacks were or will
            // be registered, the record is still solely ours.
            drop(unsafe { Box::from_raw(raw) });
            return Err(error::last_native_error());
        }
        unsafe { &*raw }.body.native.store(native_out, Ordering::Release);

        match unsafe { Capsule::wrap(raw.cast::<c_void>(), MQTT5_CLIENT_TAG, Some(record_dtor)) } {
            Ok(capsule) => Ok(Self {
                capsule,
                host: Arc::clone(host),
            }),
            Err(err) => {
                // Wrapping failed after native setup: release drives the
                // engine through its normal teardown. A never-connected
                // client gets no shutdown callback, so the record goes now.
                unsafe { native::tether_mqtt_client_release(native_out) };
                drop(unsafe { Box::from_raw(raw) });
                Err(err)
            }
        }
    }

    fn record(&self) -> Result<&ClientRecord> {
        let raw: *mut ClientRecord = native_of(self, MQTT5_CLIENT_TAG)?;
        Ok(unsafe { &*raw })
    }

    fn native_ptr(body: &ClientBody) -> Result<*mut native::MqttClient> {
        let native = body.native.load(Ordering::Acquire);
        if native.is_null() {
            return Err(Error::NullNative(MQTT5_CLIENT_TAG));
        }
        Ok(native)
    }

    /// Begin an asynchronous connect attempt.
    ///
    /// `on_complete` receives the native error code (0 = success) exactly
    /// once, from an engine thread. A failing handshake transform
    /// completes the attempt with the callback-exception code and the
    /// client delivers no further callbacks.
    pub fn connect(&self, on_complete: impl FnOnce(i32) + Send + 'static) -> Result<()> {
        let record = self.record()?;
        let body = &record.body;
        let host = Arc::clone(&body.host);
        let _guard = host.enter().ok_or(Error::HostDown)?;
        let native_client = Self::native_ptr(body)?;

        if body.connect_pending.is_pending() {
            return Err(Error::InvalidArgument(
                "a connect attempt is already pending".into(),
            ));
        }
        body.connect_pending.arm(on_complete);

        let transform_failed = {
            let mut slot = body
                .transform
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match slot.as_mut() {
                Some(transform) => {
                    let mut request = upgrade_request(&body.endpoint);
                    let code = handshake::apply_transform(&host, &mut request, transform);
                    (code != tether_core::OK).then_some(code)
                }
                None => None,
            }
        };
        if let Some(code) = transform_failed {
            body.connect_pending.complete(code);
            let raw: *mut ClientRecord = native_of(self, MQTT5_CLIENT_TAG)?;
            unsafe { settle_setup_failure(raw) };
            return Ok(());
        }

        let rc = unsafe {
            native::tether_mqtt_client_connect(
                native_client,
                Some(connect_trampoline),
                (std::ptr::from_ref(record) as *mut ClientRecord).cast::<c_void>(),
            )
        };
        if rc != tether_core::OK {
            // Synchronous submission failure: the pending reference is
            // released on the error path.
            body.connect_pending.cancel();
            return Err(error::last_native_error());
        }
        Ok(())
    }

    /// Publish `payload` to `topic`.
    ///
    /// The payload is copied into a completion token that owns it until
    /// `on_complete` fires; the caller's buffer may die immediately.
    /// Zero-length payloads are legal and delivered empty.
    pub fn publish(
        &self,
        topic: &str,
        payload: &[u8],
        qos: Qos,
        on_complete: impl FnOnce(i32) + Send + 'static,
    ) -> Result<()> {
        let record = self.record()?;
        let body = &record.body;
        let _guard = body.host.enter().ok_or(Error::HostDown)?;
        let native_client = Self::native_ptr(body)?;
        let c_topic = to_c_string(topic)?;

        let mut token = CompletionToken::new(Some("publish"), on_complete);
        let (payload_ptr, payload_len) = token.hold(payload.to_vec());
        let token_ptr = Box::into_raw(Box::new(OpToken {
            host: Arc::clone(&body.host),
            token,
        }));

        let rc = unsafe {
            native::tether_mqtt_client_publish(
                native_client,
                c_topic.as_ptr(),
                payload_ptr,
                payload_len,
                qos as i32,
                Some(op_complete_trampoline),
                token_ptr.cast::<c_void>(),
            )
        };
        if rc != tether_core::OK {
            // Reclaim the token to avoid a leak on error.
            drop(unsafe { Box::from_raw(token_ptr) });
            return Err(error::last_native_error());
        }
        Ok(())
    }

    /// Subscribe to `filter`. `on_suback` receives the native error code
    /// and the granted QoS levels.
    pub fn subscribe(
        &self,
        filter: &str,
        qos: Qos,
        on_suback: impl FnOnce(i32, Vec<Qos>) + Send + 'static,
    ) -> Result<()> {
        let record = self.record()?;
        let body = &record.body;
        let _guard = body.host.enter().ok_or(Error::HostDown)?;
        let native_client = Self::native_ptr(body)?;
        let c_filter = to_c_string(filter)?;

        let token_ptr = Box::into_raw(Box::new(SubToken {
            host: Arc::clone(&body.host),
            token: CompletionToken::new(Some("subscribe"), move |(code, granted)| {
                on_suback(code, granted);
            }),
        }));

        let rc = unsafe {
            native::tether_mqtt_client_subscribe(
                native_client,
                c_filter.as_ptr(),
                qos as i32,
                Some(suback_trampoline),
                token_ptr.cast::<c_void>(),
            )
        };
        if rc != tether_core::OK {
            drop(unsafe { Box::from_raw(token_ptr) });
            return Err(error::last_native_error());
        }
        Ok(())
    }

    /// Unsubscribe from `filter`.
    pub fn unsubscribe(
        &self,
        filter: &str,
        on_complete: impl FnOnce(i32) + Send + 'static,
    ) -> Result<()> {
        let record = self.record()?;
        let body = &record.body;
        let _guard = body.host.enter().ok_or(Error::HostDown)?;
        let native_client = Self::native_ptr(body)?;
        let c_filter = to_c_string(filter)?;

        let token_ptr = Box::into_raw(Box::new(OpToken {
            host: Arc::clone(&body.host),
            token: CompletionToken::new(Some("unsubscribe"), on_complete),
        }));

        let rc = unsafe {
            native::tether_mqtt_client_unsubscribe(
                native_client,
                c_filter.as_ptr(),
                Some(op_complete_trampoline),
                token_ptr.cast::<c_void>(),
            )
        };
        if rc != tether_core::OK {
            drop(unsafe { Box::from_raw(token_ptr) });
            return Err(error::last_native_error());
        }
        Ok(())
    }

    /// Stop the client. This is the only cancellation surface: in-flight
    /// operations complete with the interruption code.
    pub fn stop(&self) -> Result<()> {
        let record = self.record()?;
        let body = &record.body;
        let _guard = body.host.enter().ok_or(Error::HostDown)?;
        let native_client = Self::native_ptr(body)?;
        error::check(unsafe { native::tether_mqtt_client_stop(native_client) })
    }

    /// The host runtime this client is bound to.
    #[must_use]
    pub fn host(&self) -> &Arc<HostRuntime> {
        &self.host
    }
}

fn upgrade_request(endpoint: &str) -> Request {
    let mut request = Request::new("GET", "/mqtt");
    request.headers.append("Host", endpoint);
    request.headers.append("Upgrade", "websocket");
    request.headers.append("Connection", "Upgrade");
    request
}

// ---------------------------------------------------------------------------
// Trampolines and terminal paths
// ---------------------------------------------------------------------------

struct OpToken {
    host: Arc<HostRuntime>,
    token: CompletionToken<i32>,
}

struct SubToken {
    host: Arc<HostRuntime>,
    token: CompletionToken<(i32, Vec<Qos>)>,
}

/// Capsule destructor: the release side of the record's terminal gate.
unsafe fn record_dtor(ptr: *mut c_void) {
    let raw = ptr.cast::<ClientRecord>();
    let host = Arc::clone(&unsafe { &*raw }.body.host);
    let Some(guard) = host.enter() else {
        // Teardown: the handle is inert. Native resource and record are
        // abandoned rather than touched after the runtime is gone.
        return;
    };
    let native_client = unsafe { &*raw }
        .body
        .native
        .swap(ptr::null_mut(), Ordering::AcqRel);
    if !native_client.is_null() {
        unsafe { native::tether_mqtt_client_release(native_client) };
    }
    drop(guard);
    if let Some(record) = unsafe { lifecycle::arm_release(raw) } {
        drop(record);
    }
}

/// Setup failed: release every strong reference now; there will be no
/// native shutdown callback, so the shutdown side of the gate is armed
/// here instead.
unsafe fn settle_setup_failure(raw: *mut ClientRecord) {
    let body = &unsafe { &*raw }.body;
    let native_client = body.native.swap(ptr::null_mut(), Ordering::AcqRel);
    if !native_client.is_null() {
        unsafe { native::tether_mqtt_client_release(native_client) };
    }
    body.on_shutdown.cancel();
    body.connect_pending.cancel();
    *body
        .transform
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = None;
    if let Some(record) = unsafe { lifecycle::arm_shutdown(raw) } {
        drop(record);
    }
}

unsafe extern "C" fn connect_trampoline(error_code: i32, user_data: *mut c_void) {
    let raw = user_data.cast::<ClientRecord>();
    if raw.is_null() {
        return;
    }
    let host = Arc::clone(&unsafe { &*raw }.body.host);
    let Some(guard) = host.enter() else {
        return;
    };
    unsafe { &*raw }.body.connect_pending.complete(error_code);
    drop(guard);
    if error_code != tether_core::OK {
        unsafe { settle_setup_failure(raw) };
    }
}

unsafe extern "C" fn message_trampoline(
    topic: *const std::ffi::c_char,
    payload: *const u8,
    payload_len: usize,
    qos: i32,
    user_data: *mut c_void,
) {
    let raw = user_data.cast::<ClientRecord>();
    if raw.is_null() || topic.is_null() {
        return;
    }
    let body = &unsafe { &*raw }.body;
    let host = Arc::clone(&body.host);
    let Some(_guard) = host.enter() else {
        return;
    };
    let Ok(topic) = unsafe { CStr::from_ptr(topic) }.to_str() else {
        return;
    };
    let payload: &[u8] = if payload_len == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(payload, payload_len) }
    };
    let publish = PublishReceived {
        topic,
        payload,
        qos: Qos::from_raw(qos).unwrap_or(Qos::AtMostOnce),
    };
    // Dead wrapper: the event is silently dropped.
    if let Some(Err(err)) = body.events.with(|e| e.on_message(&publish)) {
        host.unraisable(&err);
    }
}

unsafe extern "C" fn shutdown_trampoline(user_data: *mut c_void) {
    let raw = user_data.cast::<ClientRecord>();
    if raw.is_null() {
        return;
    }
    let host = Arc::clone(&unsafe { &*raw }.body.host);
    let Some(guard) = host.enter() else {
        // Teardown: no dispatch, and the record stays abandoned.
        return;
    };
    {
        let body = &unsafe { &*raw }.body;
        body.connect_pending.cancel();
        *body
            .transform
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        body.on_shutdown.complete(());
    }
    drop(guard);
    if let Some(record) = unsafe { lifecycle::arm_shutdown(raw) } {
        drop(record);
    }
}

unsafe extern "C" fn op_complete_trampoline(error_code: i32, user_data: *mut c_void) {
    if user_data.is_null() {
        return;
    }
    let op = unsafe { Box::from_raw(user_data.cast::<OpToken>()) };
    let Some(_guard) = op.host.enter() else {
        // Teardown: the token (callable and buffers) is dropped without
        // dispatch.
        return;
    };
    op.token.complete(error_code);
}

unsafe extern "C" fn suback_trampoline(
    error_code: i32,
    granted_qos: *const i32,
    granted_len: usize,
    user_data: *mut c_void,
) {
    if user_data.is_null() {
        return;
    }
    let op = unsafe { Box::from_raw(user_data.cast::<SubToken>()) };
    let Some(_guard) = op.host.enter() else {
        return;
    };
    let granted = if granted_qos.is_null() || granted_len == 0 {
        Vec::new()
    } else {
        unsafe { std::slice::from_raw_parts(granted_qos, granted_len) }
            .iter()
            .filter_map(|v| Qos::from_raw(*v))
            .collect()
    };
    op.token.complete((error_code, granted));
}
