//! Proxy protocol handler
//!
//! Runs on the drive worker thread. Each request is handled to completion
//! before the next wait, so the backend and the shared view need no locking.

use crate::backend::MemoryBackend;
use gpuramdrive_shared::{
    ChannelError, InfoResponse, ProxyChannel, ProxyRequest, RequestCode, TransferResponse,
    reject_request,
};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace, warn};

/// What the loop does after a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Signal the response and wait for the next request
    Continue,
    /// Driver closed the device; leave without responding
    Close,
}

/// Why the serve loop returned
#[derive(Debug)]
pub enum ServeExit {
    /// Driver sent CLOSE
    Closed,
    /// Stop flag was raised by the controller
    Stopped,
    /// Waiting for a request failed (driver side gone)
    WaitFailed(ChannelError),
    /// Signalling a response failed (driver side gone)
    SignalFailed(ChannelError),
    /// The channel's objects were already released
    ChannelClosed,
}

/// Number of bytes a READ/WRITE may move: the requested length capped by
/// the data buffer and by what is left of the backend past `offset`
pub fn transfer_len(offset: u64, length: u64, buffer_len: usize, backend_size: u64) -> usize {
    let remaining = backend_size.saturating_sub(offset);
    length.min(buffer_len as u64).min(remaining) as usize
}

/// Handle the request currently in `header`, answering in place
pub fn handle_request(
    header: &mut [u8],
    buffer: &mut [u8],
    backend: &mut dyn MemoryBackend,
) -> Flow {
    let Some(request) = ProxyRequest::from_bytes(header) else {
        reject_request(header);
        return Flow::Continue;
    };

    match request.request_code() {
        Some(RequestCode::Info) => {
            trace!(size = backend.size(), "INFO");
            InfoResponse::for_size(backend.size()).write_to(header);
        }
        Some(RequestCode::Read) => {
            let len = transfer_len(request.offset, request.length, buffer.len(), backend.size());
            let done = if len > 0 {
                backend.read(request.offset, &mut buffer[..len])
            } else {
                0
            };
            if done < request.length as usize {
                debug!(
                    offset = request.offset,
                    requested = request.length,
                    done,
                    "short read"
                );
            }
            TransferResponse::ok(done as u64).write_to(header);
        }
        Some(RequestCode::Write) => {
            let len = transfer_len(request.offset, request.length, buffer.len(), backend.size());
            let done = if len > 0 {
                backend.write(request.offset, &buffer[..len])
            } else {
                0
            };
            if done < request.length as usize {
                debug!(
                    offset = request.offset,
                    requested = request.length,
                    done,
                    "short write"
                );
            }
            TransferResponse::ok(done as u64).write_to(header);
        }
        Some(RequestCode::Close) => return Flow::Close,
        _ => {
            warn!(code = request.code, "rejecting unsupported proxy request");
            reject_request(header);
        }
    }

    Flow::Continue
}

/// Serve requests until the driver closes, the channel fails, or `stop` is
/// raised. The stop flag is checked after every wake-up, so it only takes
/// effect between requests.
pub fn serve(
    channel: &mut ProxyChannel,
    backend: &mut dyn MemoryBackend,
    stop: &AtomicBool,
) -> ServeExit {
    debug!(service = channel.service_name(), "serving proxy requests");

    loop {
        match channel.wait_request() {
            Ok(()) => {}
            Err(ChannelError::Closed) => return ServeExit::ChannelClosed,
            Err(e) => return ServeExit::WaitFailed(e),
        }
        if stop.load(Ordering::SeqCst) {
            return ServeExit::Stopped;
        }

        let flow = match channel.regions() {
            Ok((header, buffer)) => handle_request(header, buffer, backend),
            Err(_) => return ServeExit::ChannelClosed,
        };
        if flow == Flow::Close {
            return ServeExit::Closed;
        }

        match channel.signal_response() {
            Ok(()) => {}
            Err(ChannelError::Closed) => return ServeExit::ChannelClosed,
            Err(e) => return ServeExit::SignalFailed(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use gpuramdrive_shared::{ENODEV, LocalNamespace, PROXY_HEADER_SIZE, ProxyClient};
    use std::sync::Arc;

    fn unique_service() -> String {
        use std::sync::atomic::AtomicU32;
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!("ServerTest{}", COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    fn run(
        request: ProxyRequest,
        buffer: &mut [u8],
        backend: &mut dyn MemoryBackend,
    ) -> ([u8; PROXY_HEADER_SIZE], Flow) {
        let mut header = [0u8; PROXY_HEADER_SIZE];
        request.write_to(&mut header);
        let flow = handle_request(&mut header, buffer, backend);
        (header, flow)
    }

    #[test]
    fn test_transfer_len() {
        assert_eq!(transfer_len(0, 512, 4096, 1 << 20), 512);
        assert_eq!(transfer_len(0, 8192, 4096, 1 << 20), 4096);
        assert_eq!(transfer_len(1000, 512, 4096, 1024), 24);
        assert_eq!(transfer_len(2048, 512, 4096, 1024), 0);
        assert_eq!(transfer_len(u64::MAX, u64::MAX, 4096, 1024), 0);
    }

    #[test]
    fn test_info() {
        let mut backend = HostBackend::allocate(16 << 20).unwrap();
        let mut buffer = vec![0u8; 1024];
        let (header, flow) = run(
            ProxyRequest::new(RequestCode::Info, 0, 0),
            &mut buffer,
            &mut backend,
        );
        assert_eq!(flow, Flow::Continue);
        assert_eq!(
            InfoResponse::from_bytes(&header),
            Some(InfoResponse {
                file_size: 16 << 20,
                req_alignment: 1,
                flags: 0,
            })
        );
    }

    #[test]
    fn test_oversized_length_clamped_to_buffer() {
        let mut backend = HostBackend::allocate(8192).unwrap();
        let mut buffer = vec![0xC3u8; 1024];
        let buffer_len = buffer.len() as u64;

        let (at_limit, _) = run(
            ProxyRequest::new(RequestCode::Write, 0, buffer_len),
            &mut buffer,
            &mut backend,
        );
        let (past_limit, _) = run(
            ProxyRequest::new(RequestCode::Write, 0, buffer_len + 1),
            &mut buffer,
            &mut backend,
        );
        assert_eq!(
            TransferResponse::from_bytes(&at_limit),
            TransferResponse::from_bytes(&past_limit)
        );
        assert_eq!(TransferResponse::from_bytes(&past_limit).unwrap().length, 1024);

        // nothing past the buffer reached the backend
        let mut tail = [0xFFu8; 1];
        backend.read(1024, &mut tail);
        assert_eq!(tail, [0]);

        buffer.fill(0);
        let (read, _) = run(
            ProxyRequest::new(RequestCode::Read, 0, buffer_len + 1),
            &mut buffer,
            &mut backend,
        );
        assert_eq!(TransferResponse::from_bytes(&read).unwrap().length, 1024);
        assert!(buffer.iter().all(|&b| b == 0xC3));
    }

    #[test]
    fn test_request_past_end_of_disk() {
        let mut backend = HostBackend::allocate(1024).unwrap();
        let mut buffer = vec![0u8; 4096];

        let (header, _) = run(
            ProxyRequest::new(RequestCode::Read, 1000, 512),
            &mut buffer,
            &mut backend,
        );
        assert_eq!(TransferResponse::from_bytes(&header).unwrap().length, 24);

        let (header, _) = run(
            ProxyRequest::new(RequestCode::Write, 4096, 512),
            &mut buffer,
            &mut backend,
        );
        assert_eq!(
            TransferResponse::from_bytes(&header),
            Some(TransferResponse::ok(0))
        );
    }

    #[test]
    fn test_close_and_unknown_codes() {
        let mut backend = HostBackend::allocate(1024).unwrap();
        let mut buffer = vec![0u8; 64];

        let (_, flow) = run(
            ProxyRequest::new(RequestCode::Close, 0, 0),
            &mut buffer,
            &mut backend,
        );
        assert_eq!(flow, Flow::Close);

        for code in [RequestCode::Null as u64, RequestCode::Zero as u64, 42] {
            let (header, flow) = run(
                ProxyRequest {
                    code,
                    offset: 0,
                    length: 0,
                },
                &mut buffer,
                &mut backend,
            );
            assert_eq!(flow, Flow::Continue);
            assert_eq!(ProxyRequest::from_bytes(&header).unwrap().code, ENODEV);
        }
    }

    #[test]
    fn test_serve_until_close() {
        let service = unique_service();
        let mut channel = ProxyChannel::setup(&LocalNamespace, &service).unwrap();
        let mut client = ProxyClient::open(&LocalNamespace, &service).unwrap();

        let server = std::thread::spawn(move || {
            let mut backend = HostBackend::allocate(1 << 20).unwrap();
            let stop = AtomicBool::new(false);
            serve(&mut channel, &mut backend, &stop)
        });

        assert_eq!(client.info().unwrap().file_size, 1 << 20);
        assert_eq!(client.write(4096, &[7u8; 300]).unwrap(), 300);
        assert_eq!(client.read(4096, 300).unwrap(), vec![7u8; 300]);
        client.close().unwrap();

        assert!(matches!(server.join().unwrap(), ServeExit::Closed));
    }

    #[test]
    fn test_serve_stops_between_requests() {
        let service = unique_service();
        let mut channel = ProxyChannel::setup(&LocalNamespace, &service).unwrap();
        let request = channel.request_signal().unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let server_stop = Arc::clone(&stop);
        let server = std::thread::spawn(move || {
            let mut backend = HostBackend::allocate(4096).unwrap();
            serve(&mut channel, &mut backend, &server_stop)
        });

        stop.store(true, Ordering::SeqCst);
        request.set().unwrap();

        assert!(matches!(server.join().unwrap(), ServeExit::Stopped));
    }

    #[test]
    fn test_serve_on_closed_channel() {
        let service = unique_service();
        let mut channel = ProxyChannel::setup(&LocalNamespace, &service).unwrap();
        channel.close();

        let mut backend = HostBackend::allocate(4096).unwrap();
        let stop = AtomicBool::new(false);
        assert!(matches!(
            serve(&mut channel, &mut backend, &stop),
            ServeExit::ChannelClosed
        ));
    }
}
