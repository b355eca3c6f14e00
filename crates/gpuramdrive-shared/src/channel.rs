//! Shared memory channel between the ImDisk driver and the proxy server
//!
//! One channel is four named objects scoped by the service name:
//! - `<name>` - section holding the protocol header and the data buffer
//! - `<name>_Server` - mutex held by the server for its whole lifetime
//! - `<name>_Request` - auto-reset event, driver -> server
//! - `<name>_Response` - auto-reset event, server -> driver
//!
//! Access to the section is turn-based: the driver writes a request and sets
//! `_Request`, the server answers in place and sets `_Response`.

use crate::proxy::{InfoResponse, ProxyRequest, RequestCode, TransferResponse};
use crate::{GLOBAL_PREFIX, PROXY_HEADER_SIZE, REQUEST_BUFFER_SIZE, SHARED_MEMORY_SIZE};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors raised while creating, opening or using a channel
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Section or server mutex already exists under this name
    #[error("a service named '{0}' is already running or is still being used by ImDisk")]
    AlreadyRunning(String),

    /// Section could not be created or mapped
    #[error("unable to create file mapping '{name}': error {code}")]
    Mapping {
        /// Object name
        name: String,
        /// OS error code
        code: u32,
    },

    /// Mutex or event could not be created
    #[error("unable to create {kind} object '{name}': error {code}")]
    SyncObject {
        /// "mutex" or "event"
        kind: &'static str,
        /// Object name
        name: String,
        /// OS error code
        code: u32,
    },

    /// Opening a channel that no server has created
    #[error("no object named '{0}' exists")]
    NotFound(String),

    /// Waiting on an event failed
    #[error("wait on '{name}' failed: error {code}")]
    Wait {
        /// Object name
        name: String,
        /// OS error code
        code: u32,
    },

    /// Waiting on an event timed out
    #[error("timed out waiting on '{0}'")]
    Timeout(String),

    /// Setting an event failed
    #[error("unable to signal '{name}': error {code}")]
    Signal {
        /// Object name
        name: String,
        /// OS error code
        code: u32,
    },

    /// Channel was already closed
    #[error("channel is closed")]
    Closed,
}

/// Names of the four objects making up a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectNames {
    /// Shared section
    pub mapping: String,
    /// Single-server guard
    pub server_mutex: String,
    /// Driver -> server event
    pub request: String,
    /// Server -> driver event
    pub response: String,
}

impl ObjectNames {
    /// Derive the object names for a service
    pub fn new(service_name: &str) -> Self {
        let base = format!("{GLOBAL_PREFIX}{service_name}");
        Self {
            server_mutex: format!("{base}_Server"),
            request: format!("{base}_Request"),
            response: format!("{base}_Response"),
            mapping: base,
        }
    }
}

/// A mapped view of a named section
///
/// Dropping it unmaps the view and closes the section handle.
pub trait SharedMapping: Send {
    /// Start of the mapped view
    fn base(&self) -> *mut u8;

    /// Length of the mapped view in bytes
    fn len(&self) -> usize;
}

/// Held single-server mutex, released on drop
pub trait ServerLock: Send {}

/// Named auto-reset event
pub trait Signal: Send + Sync {
    /// Block until the event is set, then reset it; `None` waits forever
    fn wait(&self, timeout: Option<Duration>) -> Result<(), ChannelError>;

    /// Set the event, waking one waiter
    fn set(&self) -> Result<(), ChannelError>;
}

/// Where named channel objects are created and opened
pub trait Namespace: Send + Sync {
    /// Create a section of `size` bytes and map it.
    /// Fails with [`ChannelError::AlreadyRunning`] if the name exists.
    fn create_mapping(&self, name: &str, size: usize)
    -> Result<Box<dyn SharedMapping>, ChannelError>;

    /// Create the server mutex and acquire it without blocking.
    /// Fails with [`ChannelError::AlreadyRunning`] if another owner holds it.
    fn create_server_lock(&self, name: &str) -> Result<Box<dyn ServerLock>, ChannelError>;

    /// Create (or open, if it exists) an auto-reset event
    fn create_signal(&self, name: &str) -> Result<Arc<dyn Signal>, ChannelError>;

    /// Open and map an existing section
    fn open_mapping(&self, name: &str) -> Result<Box<dyn SharedMapping>, ChannelError>;

    /// Open an existing event
    fn open_signal(&self, name: &str) -> Result<Arc<dyn Signal>, ChannelError>;
}

/// Server side of the channel (creates and owns every object)
pub struct ProxyChannel {
    service_name: String,
    mapping: Option<Box<dyn SharedMapping>>,
    server_lock: Option<Box<dyn ServerLock>>,
    request: Option<Arc<dyn Signal>>,
    response: Option<Arc<dyn Signal>>,
    buffer_size: usize,
}

impl ProxyChannel {
    /// Create the section, server mutex and both events for `service_name`.
    ///
    /// Each step aborts setup on failure; whatever was created before the
    /// failing step is released before the error is returned.
    pub fn setup(namespace: &dyn Namespace, service_name: &str) -> Result<Self, ChannelError> {
        let names = ObjectNames::new(service_name);
        let mut channel = Self {
            service_name: service_name.to_string(),
            mapping: None,
            server_lock: None,
            request: None,
            response: None,
            buffer_size: REQUEST_BUFFER_SIZE,
        };

        let mapping = namespace.create_mapping(&names.mapping, SHARED_MEMORY_SIZE)?;
        if mapping.len() < SHARED_MEMORY_SIZE {
            return Err(ChannelError::Mapping {
                name: names.mapping,
                code: 0,
            });
        }
        channel.mapping = Some(mapping);

        // The section check alone is not enough: the mutex name is an
        // independent race point.
        channel.server_lock = Some(namespace.create_server_lock(&names.server_mutex)?);
        channel.request = Some(namespace.create_signal(&names.request)?);
        channel.response = Some(namespace.create_signal(&names.response)?);

        debug!(service = service_name, "proxy channel ready");
        Ok(channel)
    }

    /// Service name the channel was created for
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Capacity of the data buffer in bytes
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Whether the section is currently mapped
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    /// Header region and data buffer of the mapped section
    pub fn regions(&mut self) -> Result<(&mut [u8], &mut [u8]), ChannelError> {
        let mapping = self.mapping.as_ref().ok_or(ChannelError::Closed)?;
        // SAFETY: the view is at least SHARED_MEMORY_SIZE bytes (checked in
        // setup) and stays mapped while `self` is borrowed. The driver only
        // touches it between our response and its next request.
        unsafe {
            let base = mapping.base();
            let header = std::slice::from_raw_parts_mut(base, PROXY_HEADER_SIZE);
            let buffer =
                std::slice::from_raw_parts_mut(base.add(PROXY_HEADER_SIZE), self.buffer_size);
            Ok((header, buffer))
        }
    }

    /// Block until the driver posts a request
    pub fn wait_request(&self) -> Result<(), ChannelError> {
        self.request.as_ref().ok_or(ChannelError::Closed)?.wait(None)
    }

    /// Tell the driver the response is ready
    pub fn signal_response(&self) -> Result<(), ChannelError> {
        self.response.as_ref().ok_or(ChannelError::Closed)?.set()
    }

    /// Shared handle to the request event, used to wake the server loop
    pub fn request_signal(&self) -> Option<Arc<dyn Signal>> {
        self.request.clone()
    }

    /// Unmap the view and close every handle. Safe to call more than once.
    pub fn close(&mut self) {
        let was_open = self.mapping.is_some();
        self.mapping = None;
        self.server_lock = None;
        self.request = None;
        self.response = None;
        if was_open {
            debug!(service = %self.service_name, "proxy channel closed");
        }
    }
}

impl Drop for ProxyChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Driver side of the channel (opens existing objects)
///
/// Speaks the same protocol as the ImDisk driver; used for diagnostics and
/// for exercising a server without the kernel driver.
pub struct ProxyClient {
    mapping: Box<dyn SharedMapping>,
    request: Arc<dyn Signal>,
    response: Arc<dyn Signal>,
    timeout: Option<Duration>,
}

impl ProxyClient {
    /// Default time to wait for a response
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Open the channel of a running server
    pub fn open(namespace: &dyn Namespace, service_name: &str) -> Result<Self, ChannelError> {
        let names = ObjectNames::new(service_name);
        let mapping = namespace.open_mapping(&names.mapping)?;
        let request = namespace.open_signal(&names.request)?;
        let response = namespace.open_signal(&names.response)?;
        Ok(Self {
            mapping,
            request,
            response,
            timeout: Some(Self::DEFAULT_TIMEOUT),
        })
    }

    /// Change how long to wait for each response (`None` waits forever)
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn header(&mut self) -> &mut [u8] {
        // SAFETY: the server only writes the header after we set the request
        // event and before it sets the response event.
        unsafe { std::slice::from_raw_parts_mut(self.mapping.base(), PROXY_HEADER_SIZE) }
    }

    fn buffer(&mut self) -> &mut [u8] {
        let len = self.mapping.len().saturating_sub(PROXY_HEADER_SIZE);
        // SAFETY: see `header`
        unsafe {
            std::slice::from_raw_parts_mut(self.mapping.base().add(PROXY_HEADER_SIZE), len)
        }
    }

    /// Post a raw request record and wait for the server's answer.
    /// Returns a copy of the header's first 24 bytes after the response.
    pub fn send(&mut self, request: ProxyRequest) -> Result<[u8; 24], ChannelError> {
        request.write_to(self.header());
        self.request.set()?;
        self.response.wait(self.timeout)?;
        let mut out = [0u8; 24];
        out.copy_from_slice(&self.header()[..24]);
        Ok(out)
    }

    /// Query disk size and alignment
    pub fn info(&mut self) -> Result<InfoResponse, ChannelError> {
        let raw = self.send(ProxyRequest::new(RequestCode::Info, 0, 0))?;
        InfoResponse::from_bytes(&raw).ok_or(ChannelError::Closed)
    }

    /// Read up to `length` bytes at `offset`; the result holds what the
    /// server actually transferred
    pub fn read(&mut self, offset: u64, length: u64) -> Result<Vec<u8>, ChannelError> {
        let raw = self.send(ProxyRequest::new(RequestCode::Read, offset, length))?;
        let resp = TransferResponse::from_bytes(&raw).ok_or(ChannelError::Closed)?;
        let buffer = self.buffer();
        let len = (resp.length as usize).min(buffer.len());
        Ok(buffer[..len].to_vec())
    }

    /// Write `data` at `offset`, returning the length the server reported
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<u64, ChannelError> {
        let buffer = self.buffer();
        let len = data.len().min(buffer.len());
        buffer[..len].copy_from_slice(&data[..len]);
        let raw = self.send(ProxyRequest::new(
            RequestCode::Write,
            offset,
            data.len() as u64,
        ))?;
        let resp = TransferResponse::from_bytes(&raw).ok_or(ChannelError::Closed)?;
        Ok(resp.length)
    }

    /// Tell the server the device is gone. The server does not answer.
    pub fn close(&mut self) -> Result<(), ChannelError> {
        ProxyRequest::new(RequestCode::Close, 0, 0).write_to(self.header());
        self.request.set()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalNamespace;
    use crate::proxy::ENODEV;

    /// Generate a unique service name for each test to avoid conflicts
    fn unique_service() -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!("ChannelTest{}", COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    #[test]
    fn test_object_names() {
        let names = ObjectNames::new("GpuRamDrive");
        assert_eq!(names.mapping, "Global\\GpuRamDrive");
        assert_eq!(names.server_mutex, "Global\\GpuRamDrive_Server");
        assert_eq!(names.request, "Global\\GpuRamDrive_Request");
        assert_eq!(names.response, "Global\\GpuRamDrive_Response");
    }

    #[test]
    fn test_setup_layout() {
        let service = unique_service();
        let mut channel = ProxyChannel::setup(&LocalNamespace, &service).unwrap();
        assert!(channel.is_mapped());
        assert_eq!(channel.buffer_size(), REQUEST_BUFFER_SIZE);

        let (header, buffer) = channel.regions().unwrap();
        assert_eq!(header.len(), PROXY_HEADER_SIZE);
        assert_eq!(buffer.len(), REQUEST_BUFFER_SIZE);
        assert_eq!(header.len() + buffer.len(), SHARED_MEMORY_SIZE);
    }

    #[test]
    fn test_second_setup_already_running() {
        let service = unique_service();
        let first = ProxyChannel::setup(&LocalNamespace, &service).unwrap();

        let second = ProxyChannel::setup(&LocalNamespace, &service);
        assert!(matches!(second, Err(ChannelError::AlreadyRunning(_))));

        drop(first);
        let third = ProxyChannel::setup(&LocalNamespace, &service);
        assert!(third.is_ok());
    }

    #[test]
    fn test_mutex_guards_independently_of_mapping() {
        let service = unique_service();
        let names = ObjectNames::new(&service);
        let _lock = LocalNamespace.create_server_lock(&names.server_mutex).unwrap();

        let result = ProxyChannel::setup(&LocalNamespace, &service);
        assert!(matches!(result, Err(ChannelError::AlreadyRunning(_))));

        // the section created before the mutex check was released again
        assert!(matches!(
            LocalNamespace.open_mapping(&names.mapping),
            Err(ChannelError::NotFound(_))
        ));
    }

    #[test]
    fn test_close_twice() {
        let service = unique_service();
        let mut channel = ProxyChannel::setup(&LocalNamespace, &service).unwrap();
        channel.close();
        channel.close();
        assert!(!channel.is_mapped());
        assert!(matches!(channel.regions(), Err(ChannelError::Closed)));
        assert!(matches!(channel.wait_request(), Err(ChannelError::Closed)));
    }

    #[test]
    fn test_client_open_fails_without_server() {
        let service = unique_service();
        assert!(ProxyClient::open(&LocalNamespace, &service).is_err());
    }

    #[tokio::test]
    async fn test_client_open() {
        let service = unique_service();
        let channel = ProxyChannel::setup(&LocalNamespace, &service).unwrap();
        let client = ProxyClient::open(&LocalNamespace, &service).unwrap();
        drop(client);
        drop(channel);
    }

    #[test]
    fn test_client_round_trip() {
        let service = unique_service();
        let mut channel = ProxyChannel::setup(&LocalNamespace, &service).unwrap();
        let mut client = ProxyClient::open(&LocalNamespace, &service).unwrap();

        let server = std::thread::spawn(move || {
            // answer one request with a fixed pattern, then reject the next
            channel.wait_request().unwrap();
            {
                let (header, buffer) = channel.regions().unwrap();
                let req = ProxyRequest::from_bytes(header).unwrap();
                assert_eq!(req.request_code(), Some(RequestCode::Read));
                buffer[..req.length as usize].fill(0x5A);
                TransferResponse::ok(req.length).write_to(header);
            }
            channel.signal_response().unwrap();

            channel.wait_request().unwrap();
            crate::proxy::reject_request(channel.regions().unwrap().0);
            channel.signal_response().unwrap();
        });

        let data = client.read(0, 16).unwrap();
        assert_eq!(data, vec![0x5A; 16]);

        let raw = client
            .send(ProxyRequest {
                code: 77,
                offset: 0,
                length: 0,
            })
            .unwrap();
        assert_eq!(ProxyRequest::from_bytes(&raw).unwrap().code, ENODEV);

        server.join().unwrap();
    }

    #[test]
    fn test_client_times_out_without_server_loop() {
        let service = unique_service();
        let _channel = ProxyChannel::setup(&LocalNamespace, &service).unwrap();
        let mut client = ProxyClient::open(&LocalNamespace, &service).unwrap();
        client.set_timeout(Some(Duration::from_millis(20)));

        assert!(matches!(client.info(), Err(ChannelError::Timeout(_))));
    }
}
