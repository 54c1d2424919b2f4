//! Server assembly and lifecycle.
//!
//! Wires the buffer arena, admission limiter, business executor, worker
//! event loops, and acceptors together, and owns the shutdown sequence:
//! stop accepting, stop the event loops (closing channels and releasing
//! buffers), then stop the executor. The arena outlives all of them.

use crate::admission::ConnectionLimiter;
use crate::buffer::BufferArena;
use crate::config::Config;
use crate::executor::BusinessExecutor;
use crate::handler::HashHandler;
use crate::reactor::{Acceptor, EventLoop, FrameHandler, LoopHandle};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::info;

const BACKLOG: i32 = 1024;
const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;
const EXECUTOR_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A running server instance.
pub struct Server {
    local_addr: SocketAddr,
    loop_handles: Vec<Arc<LoopHandle>>,
    worker_threads: Vec<JoinHandle<()>>,
    acceptor_threads: Vec<JoinHandle<()>>,
    acceptor_shutdown: Arc<AtomicBool>,
    executor: Arc<BusinessExecutor>,
    #[allow(dead_code)]
    arena: Arc<BufferArena>,
}

impl Server {
    /// Bind the listen address and start every thread.
    pub fn start(config: &Config) -> io::Result<Server> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let workers = config.workers.unwrap_or_else(num_cpus).max(1);
        let business_threads = config.business_threads.unwrap_or_else(num_cpus);
        let acceptors = config.acceptors.max(1);

        let arena = Arc::new(BufferArena::new(
            config.max_connections,
            config.max_connections,
        ));
        let admission = Arc::new(ConnectionLimiter::new(config.max_connections));
        let executor = Arc::new(BusinessExecutor::new(
            business_threads,
            config.business_queue,
        )?);
        let handler: Arc<dyn FrameHandler> = Arc::new(HashHandler::new(
            Arc::clone(&executor),
            Arc::clone(&arena),
        ));
        let next_channel_id = Arc::new(AtomicU64::new(0));

        let mut loop_handles = Vec::with_capacity(workers);
        let mut worker_threads = Vec::with_capacity(workers);
        for id in 0..workers {
            let mut event_loop = EventLoop::new(
                id,
                Arc::clone(&arena),
                Arc::clone(&admission),
                Arc::clone(&handler),
                Arc::clone(&next_channel_id),
            )?;
            loop_handles.push(event_loop.handle());
            let handle = thread::Builder::new()
                .name(format!("event-loop-{id}"))
                .spawn(move || event_loop.run())?;
            worker_threads.push(handle);
        }

        // The first listener fixes the port (the configured one, or an
        // ephemeral pick); the rest share it via SO_REUSEPORT.
        let first = build_listener(addr)?;
        let local_addr = first.local_addr()?;
        let mut listeners = vec![first];
        for _ in 1..acceptors {
            listeners.push(build_listener(local_addr)?);
        }

        let acceptor_shutdown = Arc::new(AtomicBool::new(false));
        let mut acceptor_threads = Vec::with_capacity(acceptors);
        for (id, listener) in listeners.into_iter().enumerate() {
            let mut acceptor = Acceptor::new(
                id,
                listener,
                loop_handles.clone(),
                Arc::clone(&admission),
                Arc::clone(&acceptor_shutdown),
            )?;
            let handle = thread::Builder::new()
                .name(format!("acceptor-{id}"))
                .spawn(move || acceptor.run())?;
            acceptor_threads.push(handle);
        }

        info!(
            addr = %local_addr,
            workers,
            acceptors,
            business_threads,
            max_connections = config.max_connections,
            "server started"
        );

        Ok(Server {
            local_addr,
            loop_handles,
            worker_threads,
            acceptor_threads,
            acceptor_shutdown,
            executor,
            arena,
        })
    }

    /// The bound address; useful when the configured port was 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting, stop the event loops, then stop the executor.
    pub fn shutdown(mut self) {
        info!("server shutdown initiated");

        self.acceptor_shutdown.store(true, Ordering::Release);
        for handle in self.acceptor_threads.drain(..) {
            let _ = handle.join();
        }

        for loop_handle in &self.loop_handles {
            loop_handle.initiate_shutdown();
        }
        for handle in self.worker_threads.drain(..) {
            let _ = handle.join();
        }

        self.executor.shutdown(EXECUTOR_SHUTDOWN_TIMEOUT);
        info!("server shutdown complete");
    }
}

/// Create a listening socket with SO_REUSEPORT so multiple acceptors can
/// share one port, plus an enlarged receive buffer.
fn build_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_recv_buffer_size(RECEIVE_BUFFER_SIZE)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::HEADER_SIZE;
    use crate::handler::{HASH_RESULT_SIZE, RESPONSE_PAYLOAD_SIZE};
    use sha2::{Digest, Sha256};
    use std::io::{Read, Write};
    use std::net::TcpStream;

    fn test_config(max_connections: usize) -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            acceptors: 1,
            workers: Some(2),
            max_connections,
            business_threads: Some(2),
            business_queue: 64,
            log_level: "info".to_string(),
        }
    }

    fn hash_request(request_id: u64, iterations: u32, data: &[u8]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&request_id.to_be_bytes());
        payload.extend_from_slice(&iterations.to_be_bytes());
        payload.extend_from_slice(&(data.len() as u32).to_be_bytes());
        payload.extend_from_slice(data);

        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&1u16.to_be_bytes());
        frame.extend_from_slice(&payload);
        frame
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        stream.set_nodelay(true).unwrap();
        stream
    }

    /// Read one HASH_RESPONSE frame: (request_id, iterations, hash).
    fn read_response(stream: &mut TcpStream) -> (u64, u32, Vec<u8>) {
        let mut frame = vec![0u8; HEADER_SIZE + RESPONSE_PAYLOAD_SIZE];
        stream.read_exact(&mut frame).unwrap();

        let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        let frame_type = u16::from_be_bytes([frame[4], frame[5]]);
        assert_eq!(length, RESPONSE_PAYLOAD_SIZE);
        assert_eq!(frame_type, 2);

        let payload = &frame[HEADER_SIZE..];
        let request_id = u64::from_be_bytes(payload[..8].try_into().unwrap());
        let iterations = u32::from_be_bytes(payload[8..12].try_into().unwrap());
        let hash_len = u32::from_be_bytes(payload[12..16].try_into().unwrap()) as usize;
        assert_eq!(hash_len, HASH_RESULT_SIZE);

        (request_id, iterations, payload[16..].to_vec())
    }

    fn expect_eof(stream: &mut TcpStream) {
        let mut byte = [0u8; 1];
        match stream.read(&mut byte) {
            Ok(0) => {}
            other => panic!("expected EOF, got {other:?}"),
        }
    }

    #[test]
    fn test_single_request_single_response() {
        let server = Server::start(&test_config(64)).unwrap();
        let mut client = connect(server.local_addr());

        client.write_all(&hash_request(1, 1, b"abc")).unwrap();

        let (request_id, iterations, hash) = read_response(&mut client);
        assert_eq!(request_id, 1);
        assert_eq!(iterations, 1);
        let expected: [u8; 32] = Sha256::digest(b"abc").into();
        assert_eq!(hash, expected);

        drop(client);
        server.shutdown();
    }

    #[test]
    fn test_request_split_across_writes() {
        let server = Server::start(&test_config(64)).unwrap();
        let mut client = connect(server.local_addr());

        let frame = hash_request(1, 1, b"abc");
        client.write_all(&frame[..4]).unwrap();
        thread::sleep(Duration::from_millis(40));
        client.write_all(&frame[4..11]).unwrap();
        thread::sleep(Duration::from_millis(40));
        client.write_all(&frame[11..]).unwrap();

        let (request_id, iterations, hash) = read_response(&mut client);
        assert_eq!(request_id, 1);
        assert_eq!(iterations, 1);
        let expected: [u8; 32] = Sha256::digest(b"abc").into();
        assert_eq!(hash, expected);

        drop(client);
        server.shutdown();
    }

    #[test]
    fn test_oversized_frame_closes_connection() {
        let server = Server::start(&test_config(64)).unwrap();
        let mut client = connect(server.local_addr());

        let mut frame = Vec::new();
        frame.extend_from_slice(&9999u32.to_be_bytes());
        frame.extend_from_slice(&1u16.to_be_bytes());
        client.write_all(&frame).unwrap();

        expect_eof(&mut client);
        server.shutdown();
    }

    #[test]
    fn test_unknown_frame_type_closes_connection() {
        let server = Server::start(&test_config(64)).unwrap();
        let mut client = connect(server.local_addr());

        let mut frame = Vec::new();
        frame.extend_from_slice(&0u32.to_be_bytes());
        frame.extend_from_slice(&7u16.to_be_bytes());
        client.write_all(&frame).unwrap();

        expect_eof(&mut client);
        server.shutdown();
    }

    #[test]
    fn test_response_frame_from_client_is_ignored() {
        let server = Server::start(&test_config(64)).unwrap();
        let mut client = connect(server.local_addr());

        // A response-typed frame in the client-to-server direction is
        // dropped without closing the connection
        let mut frame = Vec::new();
        frame.extend_from_slice(&4u32.to_be_bytes());
        frame.extend_from_slice(&2u16.to_be_bytes());
        frame.extend_from_slice(b"junk");
        client.write_all(&frame).unwrap();

        // The same connection still serves a real request
        client.write_all(&hash_request(3, 1, b"abc")).unwrap();
        let (request_id, iterations, hash) = read_response(&mut client);
        assert_eq!(request_id, 3);
        assert_eq!(iterations, 1);
        let expected: [u8; 32] = Sha256::digest(b"abc").into();
        assert_eq!(hash, expected);

        drop(client);
        server.shutdown();
    }

    #[test]
    fn test_admission_ceiling_rejects_excess_connections() {
        let server = Server::start(&test_config(2)).unwrap();
        let addr = server.local_addr();

        // Two held connections, each verified live with a request
        let mut held = Vec::new();
        for id in 0..2u64 {
            let mut client = connect(addr);
            client.write_all(&hash_request(id, 1, b"hold")).unwrap();
            let (request_id, _, _) = read_response(&mut client);
            assert_eq!(request_id, id);
            held.push(client);
        }

        // The third connection is accepted and immediately closed
        let mut rejected = connect(addr);
        expect_eof(&mut rejected);

        // Releasing one slot lets a new connection in
        drop(held.pop());
        let mut admitted = None;
        for _ in 0..50 {
            thread::sleep(Duration::from_millis(20));
            let mut client = connect(addr);
            if client.write_all(&hash_request(9, 1, b"again")).is_err() {
                continue;
            }
            let mut frame = vec![0u8; HEADER_SIZE + RESPONSE_PAYLOAD_SIZE];
            if client.read_exact(&mut frame).is_ok() {
                admitted = Some(frame);
                break;
            }
        }
        assert!(admitted.is_some(), "no connection admitted after release");

        server.shutdown();
    }

    #[test]
    fn test_pipelined_requests_answered_in_order() {
        // A single business thread makes completion order deterministic;
        // responses on one channel are written in enqueue order.
        let mut config = test_config(64);
        config.business_threads = Some(1);
        let server = Server::start(&config).unwrap();
        let mut client = connect(server.local_addr());

        let mut batch = hash_request(1, 1, b"first");
        batch.extend_from_slice(&hash_request(2, 1, b"second"));
        client.write_all(&batch).unwrap();

        let (id_a, _, hash_a) = read_response(&mut client);
        let (id_b, _, hash_b) = read_response(&mut client);
        assert_eq!(id_a, 1);
        assert_eq!(id_b, 2);

        let expected_a: [u8; 32] = Sha256::digest(b"first").into();
        let expected_b: [u8; 32] = Sha256::digest(b"second").into();
        assert_eq!(hash_a, expected_a);
        assert_eq!(hash_b, expected_b);

        drop(client);
        server.shutdown();
    }

    #[test]
    fn test_iterated_digest_over_the_wire() {
        let server = Server::start(&test_config(64)).unwrap();
        let mut client = connect(server.local_addr());

        client.write_all(&hash_request(5, 3, b"data")).unwrap();
        let (request_id, iterations, hash) = read_response(&mut client);
        assert_eq!(request_id, 5);
        assert_eq!(iterations, 3);

        let once: [u8; 32] = Sha256::digest(b"data").into();
        let twice: [u8; 32] = Sha256::digest(once).into();
        let thrice: [u8; 32] = Sha256::digest(twice).into();
        assert_eq!(hash, thrice);

        drop(client);
        server.shutdown();
    }

    #[test]
    fn test_invalid_request_parameters_close_connection() {
        let server = Server::start(&test_config(64)).unwrap();
        let mut client = connect(server.local_addr());

        // iterations = 0 is outside the valid range
        client.write_all(&hash_request(1, 0, b"abc")).unwrap();
        expect_eof(&mut client);

        server.shutdown();
    }
}
